use crate::device::{BlockDevice, DevNumbers, ScopedDeviceNodes};
use crate::error::{Error, Result};
use crate::mounts::{parse_mount_table, MountEntry};
use crate::system::{Invocation, ToolRunner};
use std::fmt;
use std::fs;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Where the mount table comes from
#[derive(Debug, Clone)]
pub enum MountSource {
    /// A procfs-style file such as `/proc/self/mounts`
    File(PathBuf),
    /// A mount-reporting utility printing fstab rows (`mount -p`)
    Command(Invocation),
}

/// Trailing partition designator stripped from a partition device name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionDesignator {
    /// Partition (or slice) number
    pub number: u32,
    /// BSD label letter inside a slice, e.g. the `a` of `da0s1a`
    pub label: Option<char>,
}

impl fmt::Display for PartitionDesignator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number)?;
        if let Some(label) = self.label {
            write!(f, "{}", label)?;
        }
        Ok(())
    }
}

/// Split a partition device path into its whole-disk path and designator
///
/// Handles `sda1`, `nvme0n1p2` / `mmcblk0p1` / `ada0p2` and the FreeBSD
/// slice form `da0s1a`.
pub fn split_partition_designator(path: &str) -> Option<(String, PartitionDesignator)> {
    let (label, rest) = match path.chars().last()? {
        c @ 'a'..='h' => (Some(c), &path[..path.len() - 1]),
        _ => (None, path),
    };

    let digits_at = rest.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    if digits_at == rest.len() {
        return None;
    }
    let number: u32 = rest[digits_at..].parse().ok()?;
    let head = &rest[..digits_at];

    // `p`/`s` separate the partition number when the disk name ends in a digit
    let separated = |sep: char| {
        head.strip_suffix(sep)
            .filter(|disk| disk.ends_with(|c: char| c.is_ascii_digit()))
    };

    let disk = match label {
        Some(_) => separated('s')?,
        None => separated('p').or_else(|| separated('s')).unwrap_or(head),
    };

    let name_start = disk.rfind('/').map(|i| i + 1).unwrap_or(0);
    if disk.len() == name_start {
        return None;
    }

    Some((disk.to_string(), PartitionDesignator { number, label }))
}

/// The located root: its partition, the disk holding it, and how it is mounted
#[derive(Debug)]
pub struct RootLocation {
    /// Device field of the mount table row
    pub source: String,
    pub partition: BlockDevice,
    pub disk: BlockDevice,
    pub designator: PartitionDesignator,
    pub fstype: String,
    pub mount_point: PathBuf,
    nodes: Option<ScopedDeviceNodes>,
}

impl RootLocation {
    pub fn new(
        source: impl Into<String>,
        partition: BlockDevice,
        disk: BlockDevice,
        designator: PartitionDesignator,
        fstype: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            partition,
            disk,
            designator,
            fstype: fstype.into(),
            mount_point: PathBuf::from("/"),
            nodes: None,
        }
    }

    /// Address disk and partition through private device nodes from now on
    pub fn attach_nodes(&mut self, nodes: ScopedDeviceNodes) {
        self.disk = self.disk.with_path(nodes.disk());
        self.partition = self.partition.with_path(nodes.partition());
        self.nodes = Some(nodes);
    }

    pub fn uses_private_nodes(&self) -> bool {
        self.nodes.is_some()
    }
}

/// Finds the block device and partition backing "/"
#[derive(Debug, Clone)]
pub struct RootLocator {
    pub mounts: MountSource,
    /// sysfs mount point, `None` where the OS has none
    pub sysfs: Option<PathBuf>,
    /// Directory whose filesystem is the root, stat'ed when the mount table
    /// names a device that cannot be resolved (e.g. `/dev/root`)
    pub root: PathBuf,
}

impl RootLocator {
    pub fn linux() -> Self {
        Self {
            mounts: MountSource::File(PathBuf::from("/proc/self/mounts")),
            sysfs: Some(PathBuf::from("/sys")),
            root: PathBuf::from("/"),
        }
    }

    pub fn freebsd() -> Self {
        Self {
            mounts: MountSource::Command(Invocation::new("mount").arg("-p")),
            sysfs: None,
            root: PathBuf::from("/"),
        }
    }

    pub fn locate(&self, tools: &dyn ToolRunner) -> Result<RootLocation> {
        let (origin, table) = match &self.mounts {
            MountSource::File(path) => (path.display().to_string(), fs::read_to_string(path)?),
            MountSource::Command(invocation) => (
                invocation.to_string(),
                tools.run_checked(invocation)?.stdout,
            ),
        };

        let entry = find_root_entry(&parse_mount_table(&table), &origin)?;
        debug!("root mount entry: {:?}", entry);

        let (partition_path, partition_numbers) = self.resolve_partition(&entry)?;
        let partition_str = partition_path.display().to_string();

        // A whole-disk root has no `partition` attribute in sysfs
        let sysfs_number = match partition_numbers {
            Some(numbers) if self.sysfs.is_some() => Some(
                self.sysfs_partition_number(numbers)
                    .ok_or_else(|| Error::Discovery {
                        device: partition_str.clone(),
                        reason: "root is not on a partition".to_string(),
                    })?,
            ),
            _ => None,
        };

        let (disk_path, mut designator) =
            split_partition_designator(&partition_str).ok_or_else(|| Error::Discovery {
                device: partition_str.clone(),
                reason: "device name carries no partition designator".to_string(),
            })?;

        if let Some(number) = sysfs_number {
            if number != designator.number {
                debug!(
                    "sysfs reports partition {} for {}, name says {}",
                    number, partition_str, designator.number
                );
                designator.number = number;
            }
        }

        let disk_numbers = match partition_numbers {
            Some(numbers) if self.sysfs.is_some() => Some(
                self.disk_numbers(numbers, Path::new(&disk_path))
                    .ok_or_else(|| Error::Discovery {
                        device: disk_path.clone(),
                        reason: format!("cannot find parent disk of {}", numbers),
                    })?,
            ),
            // Without sysfs the disk is addressed by name alone
            _ => self.node_numbers(Path::new(&disk_path)),
        };

        let location = RootLocation::new(
            entry.device.clone(),
            BlockDevice::new(&partition_path, partition_numbers),
            BlockDevice::new(&disk_path, disk_numbers),
            designator,
            entry.fstype.clone(),
        );
        info!(
            "root filesystem ({}) is partition {} of {}",
            location.fstype, location.designator, location.disk
        );
        Ok(location)
    }

    /// Canonical path and device numbers of the root partition
    ///
    /// Without sysfs the numbers are only known when the node exists.
    fn resolve_partition(&self, entry: &MountEntry) -> Result<(PathBuf, Option<DevNumbers>)> {
        let canonical = resolve_device_path(Path::new(&entry.device));

        if let Some(numbers) = self.node_numbers(&canonical) {
            return Ok((canonical, Some(numbers)));
        }
        if self.sysfs.is_none() {
            return Ok((canonical, None));
        }

        // The mount table may name a device that does not exist as a node
        // (`/dev/root`); fall back to the device of the root directory itself
        let st_dev = fs::metadata(&self.root)?.dev();
        let numbers = DevNumbers::from_raw(st_dev);
        let name = self
            .sysfs_name(numbers)
            .ok_or_else(|| Error::Discovery {
                device: entry.device.clone(),
                reason: format!("no device node or sysfs entry for {}", numbers),
            })?;
        debug!("{} resolved through {} to {}", entry.device, numbers, name);
        Ok((PathBuf::from("/dev").join(name), Some(numbers)))
    }

    /// Device numbers of a node, or of the sysfs block entry with its name
    fn node_numbers(&self, path: &Path) -> Option<DevNumbers> {
        if let Ok(meta) = fs::metadata(path) {
            let file_type = meta.file_type();
            if file_type.is_block_device() || file_type.is_char_device() {
                return Some(DevNumbers::from_raw(meta.rdev()));
            }
        }

        let sysfs = self.sysfs.as_ref()?;
        let name = path.file_name()?;
        read_dev_file(&sysfs.join("class/block").join(name).join("dev"))
    }

    fn sysfs_name(&self, numbers: DevNumbers) -> Option<String> {
        let sysfs = self.sysfs.as_ref()?;
        let link = fs::read_link(sysfs.join("dev/block").join(numbers.to_string())).ok()?;
        Some(link.file_name()?.to_string_lossy().to_string())
    }

    fn sysfs_partition_number(&self, numbers: DevNumbers) -> Option<u32> {
        let sysfs = self.sysfs.as_ref()?;
        let path = sysfs
            .join("dev/block")
            .join(numbers.to_string())
            .join("partition");
        fs::read_to_string(path).ok()?.trim().parse().ok()
    }

    /// The parent directory of a partition in sysfs is its disk
    fn disk_numbers(&self, partition: DevNumbers, disk_path: &Path) -> Option<DevNumbers> {
        if let Some(sysfs) = &self.sysfs {
            let partition_dir = sysfs.join("dev/block").join(partition.to_string());
            if let Ok(real) = fs::canonicalize(&partition_dir) {
                if let Some(numbers) = real.parent().and_then(|d| read_dev_file(&d.join("dev"))) {
                    return Some(numbers);
                }
            }
        }
        self.node_numbers(disk_path)
    }
}

/// Select the single device-backed row mounted exactly at "/"
pub fn find_root_entry(entries: &[MountEntry], origin: &str) -> Result<MountEntry> {
    let mut found: Option<(PathBuf, &MountEntry)> = None;

    for entry in entries
        .iter()
        .filter(|e| e.mount_point == "/" && e.is_device_backed())
    {
        let canonical = resolve_device_path(Path::new(&entry.device));
        match &found {
            Some((existing, _)) if *existing != canonical => {
                return Err(Error::AmbiguousMount(
                    existing.display().to_string(),
                    canonical.display().to_string(),
                ));
            }
            Some(_) => {}
            None => found = Some((canonical, entry)),
        }
    }

    found
        .map(|(_, entry)| entry.clone())
        .ok_or_else(|| Error::RootNotFound(origin.to_string()))
}

/// Resolve a device path to its canonical form
///
/// This handles symlinks (e.g., /dev/disk/by-uuid/... -> /dev/sda1)
fn resolve_device_path(path: &Path) -> PathBuf {
    // If canonicalize fails (e.g., path doesn't exist), keep the original
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

fn read_dev_file(path: &Path) -> Option<DevNumbers> {
    DevNumbers::parse(&fs::read_to_string(path).ok()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::testing::FakeTools;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    fn designator(number: u32, label: Option<char>) -> PartitionDesignator {
        PartitionDesignator { number, label }
    }

    #[test]
    fn test_split_plain_numeric_suffix() {
        assert_eq!(
            split_partition_designator("/dev/sda1"),
            Some(("/dev/sda".to_string(), designator(1, None)))
        );
        assert_eq!(
            split_partition_designator("/dev/xvda12"),
            Some(("/dev/xvda".to_string(), designator(12, None)))
        );
    }

    #[test]
    fn test_split_p_separated() {
        assert_eq!(
            split_partition_designator("/dev/nvme0n1p2"),
            Some(("/dev/nvme0n1".to_string(), designator(2, None)))
        );
        assert_eq!(
            split_partition_designator("/dev/mmcblk0p1"),
            Some(("/dev/mmcblk0".to_string(), designator(1, None)))
        );
        assert_eq!(
            split_partition_designator("/dev/ada0p2"),
            Some(("/dev/ada0".to_string(), designator(2, None)))
        );
        // `p` as last letter of a disk name is not a separator
        assert_eq!(
            split_partition_designator("/dev/sdp3"),
            Some(("/dev/sdp".to_string(), designator(3, None)))
        );
    }

    #[test]
    fn test_split_freebsd_slice() {
        assert_eq!(
            split_partition_designator("/dev/da0s1a"),
            Some(("/dev/da0".to_string(), designator(1, Some('a'))))
        );
        assert_eq!(
            split_partition_designator("/dev/da0s1"),
            Some(("/dev/da0".to_string(), designator(1, None)))
        );
    }

    #[test]
    fn test_split_without_designator() {
        assert_eq!(split_partition_designator("/dev/sda"), None);
        assert_eq!(split_partition_designator("/dev/12"), None);
        assert_eq!(split_partition_designator(""), None);
    }

    fn entry(device: &str, mount_point: &str) -> MountEntry {
        MountEntry {
            device: device.to_string(),
            mount_point: mount_point.to_string(),
            fstype: "ext4".to_string(),
            options: "rw".to_string(),
        }
    }

    #[test]
    fn test_find_root_entry_skips_pseudo_filesystems() {
        let entries = vec![
            entry("rootfs", "/"),
            entry("/dev/vdb1", "/data"),
            entry("/dev/vda1", "/"),
        ];
        let root = find_root_entry(&entries, "mounts").unwrap();
        assert_eq!(root.device, "/dev/vda1");
    }

    #[test]
    fn test_find_root_entry_not_found() {
        let entries = vec![entry("tmpfs", "/"), entry("/dev/vdb1", "/data")];
        let err = find_root_entry(&entries, "mounts").unwrap_err();
        assert!(matches!(err, Error::RootNotFound(_)));
    }

    #[test]
    fn test_find_root_entry_ambiguous() {
        let entries = vec![entry("/dev/vda1", "/"), entry("/dev/vdb1", "/")];
        let err = find_root_entry(&entries, "mounts").unwrap_err();
        assert!(matches!(err, Error::AmbiguousMount(..)));
    }

    #[test]
    fn test_find_root_entry_repeated_same_device() {
        let entries = vec![entry("/dev/vda1", "/"), entry("/dev/vda1", "/")];
        assert!(find_root_entry(&entries, "mounts").is_ok());
    }

    /// Build a minimal sysfs tree: rgdisk (250:0) holding rgdisk1 (250:1).
    /// The names are chosen so no real node under /dev shadows them.
    fn fake_sysfs() -> TempDir {
        let dir = TempDir::new().unwrap();
        let sys = dir.path();
        let disk_dir = sys.join("devices/virtual/block/rgdisk");
        let part_dir = disk_dir.join("rgdisk1");
        fs::create_dir_all(&part_dir).unwrap();
        fs::write(disk_dir.join("dev"), "250:0\n").unwrap();
        fs::write(part_dir.join("dev"), "250:1\n").unwrap();
        fs::write(part_dir.join("partition"), "1\n").unwrap();

        fs::create_dir_all(sys.join("class/block")).unwrap();
        symlink(&disk_dir, sys.join("class/block/rgdisk")).unwrap();
        symlink(&part_dir, sys.join("class/block/rgdisk1")).unwrap();
        fs::create_dir_all(sys.join("dev/block")).unwrap();
        symlink(&disk_dir, sys.join("dev/block/250:0")).unwrap();
        symlink(&part_dir, sys.join("dev/block/250:1")).unwrap();
        dir
    }

    #[test]
    fn test_locate_through_sysfs() {
        let sysfs = fake_sysfs();
        let mounts = sysfs.path().join("mounts");
        fs::write(
            &mounts,
            "proc /proc proc rw 0 0\n/dev/rgdisk1 / ext4 rw,relatime 0 0\n",
        )
        .unwrap();

        let locator = RootLocator {
            mounts: MountSource::File(mounts),
            sysfs: Some(sysfs.path().to_path_buf()),
            root: PathBuf::from("/"),
        };
        let location = locator.locate(&FakeTools::default()).unwrap();

        assert_eq!(location.partition.path, PathBuf::from("/dev/rgdisk1"));
        assert_eq!(location.partition.numbers(), Some(DevNumbers::new(250, 1)));
        assert_eq!(location.disk.path, PathBuf::from("/dev/rgdisk"));
        assert_eq!(location.disk.numbers(), Some(DevNumbers::new(250, 0)));
        assert_eq!(location.designator.number, 1);
        assert_eq!(location.fstype, "ext4");
        assert!(!location.uses_private_nodes());
    }

    #[test]
    fn test_locate_from_mount_command() {
        let tools = FakeTools::default().with(
            "mount",
            0,
            "/dev/da0s1a\t/\tufs\trw\t1 1\ndevfs\t/dev\tdevfs\trw\t0 0\n",
        );
        let locator = RootLocator {
            mounts: MountSource::Command(Invocation::new("mount").arg("-p")),
            sysfs: None,
            root: PathBuf::from("/"),
        };
        let location = locator.locate(&tools).unwrap();
        assert_eq!(tools.programs(), vec!["mount".to_string()]);
        assert_eq!(location.partition.path, PathBuf::from("/dev/da0s1a"));
        assert_eq!(location.disk.path, PathBuf::from("/dev/da0"));
        assert_eq!(location.designator, designator(1, Some('a')));
        assert_eq!(location.fstype, "ufs");
        // No such nodes on the test host
        assert_eq!(location.disk.numbers(), None);
    }

    #[test]
    fn test_locate_rejects_whole_disk_root() {
        // rgvd0 (250:16) is a disk in its own right: no `partition` file
        let sysfs = fake_sysfs();
        let sys = sysfs.path();
        let disk_dir = sys.join("devices/virtual/block/rgvd0");
        fs::create_dir_all(&disk_dir).unwrap();
        fs::write(disk_dir.join("dev"), "250:16\n").unwrap();
        symlink(&disk_dir, sys.join("class/block/rgvd0")).unwrap();
        symlink(&disk_dir, sys.join("dev/block/250:16")).unwrap();

        let mounts = sys.join("mounts");
        fs::write(&mounts, "/dev/rgvd0 / ext4 rw 0 0\n").unwrap();
        let locator = RootLocator {
            mounts: MountSource::File(mounts),
            sysfs: Some(sys.to_path_buf()),
            root: PathBuf::from("/"),
        };

        match locator.locate(&FakeTools::default()).unwrap_err() {
            Error::Discovery { device, reason } => {
                assert_eq!(device, "/dev/rgvd0");
                assert_eq!(reason, "root is not on a partition");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_locate_missing_root() {
        let dir = TempDir::new().unwrap();
        let mounts = dir.path().join("mounts");
        fs::write(&mounts, "proc /proc proc rw 0 0\n").unwrap();
        let locator = RootLocator {
            mounts: MountSource::File(mounts),
            sysfs: None,
            root: PathBuf::from("/"),
        };
        let err = locator.locate(&FakeTools::default()).unwrap_err();
        assert!(matches!(err, Error::RootNotFound(_)));
    }
}
