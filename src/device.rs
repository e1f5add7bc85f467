use crate::error::{Error, Result};
use std::ffi::CString;
use std::fmt;
use std::fs::File;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::debug;

/// Major/minor pair identifying a device independent of its node path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevNumbers {
    pub major: u32,
    pub minor: u32,
}

impl DevNumbers {
    pub fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Split a raw `dev_t` as returned by `stat`
    pub fn from_raw(dev: u64) -> Self {
        let dev = dev as libc::dev_t;
        Self {
            major: libc::major(dev) as u32,
            minor: libc::minor(dev) as u32,
        }
    }

    pub fn to_raw(self) -> libc::dev_t {
        libc::makedev(self.major as _, self.minor as _)
    }

    /// Parse the `MAJOR:MINOR` form used by sysfs `dev` files
    pub fn parse(s: &str) -> Option<Self> {
        let (major, minor) = s.trim().split_once(':')?;
        Some(Self {
            major: major.parse().ok()?,
            minor: minor.parse().ok()?,
        })
    }
}

impl fmt::Display for DevNumbers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

/// A device node, derived once per run
///
/// Device numbers are known wherever sysfs or a device node was consulted;
/// GEOM disks on FreeBSD are addressed by name alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDevice {
    pub path: PathBuf,
    pub numbers: Option<DevNumbers>,
}

impl BlockDevice {
    pub fn new(path: impl Into<PathBuf>, numbers: impl Into<Option<DevNumbers>>) -> Self {
        Self {
            path: path.into(),
            numbers: numbers.into(),
        }
    }

    pub fn numbers(&self) -> Option<DevNumbers> {
        self.numbers
    }

    pub fn path_str(&self) -> String {
        self.path.display().to_string()
    }

    /// Same device numbers, addressed through a different node
    pub fn with_path(&self, path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            numbers: self.numbers,
        }
    }
}

impl fmt::Display for BlockDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.numbers {
            Some(numbers) => write!(f, "{} ({})", self.path.display(), numbers),
            None => write!(f, "{}", self.path.display()),
        }
    }
}

/// Private device nodes for the disk and root partition
///
/// The nodes live in a fresh temporary directory and are removed together
/// with it when the guard is dropped, on success and failure alike. Tools
/// pointed at them see `<dir>/disk` and name its partitions `<dir>/disk<N>`.
#[derive(Debug)]
pub struct ScopedDeviceNodes {
    dir: TempDir,
    disk: PathBuf,
    partition: PathBuf,
}

impl ScopedDeviceNodes {
    /// Where the node directory is created. devtmpfs never carries `nodev`,
    /// unlike the tmpfs usually mounted on `/tmp`.
    pub const DEFAULT_PARENT: &'static str = "/dev";

    pub fn create(disk: DevNumbers, partition: DevNumbers) -> Result<Self> {
        Self::create_in(Path::new(Self::DEFAULT_PARENT), disk, partition)
    }

    /// Create the nodes below `parent` and check the disk node can be opened
    pub fn create_in(parent: &Path, disk: DevNumbers, partition: DevNumbers) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("rootgrow-")
            .tempdir_in(parent)
            .map_err(|e| Error::Discovery {
                device: disk.to_string(),
                reason: format!("cannot create node directory in {}: {}", parent.display(), e),
            })?;
        let disk_path = dir.path().join("disk");
        let partition_path = dir.path().join("part");

        make_block_node(&disk_path, disk)?;
        make_block_node(&partition_path, partition)?;

        // mknod succeeds on a nodev mount, only opening the node fails
        File::open(&disk_path).map_err(|e| Error::Discovery {
            device: disk.to_string(),
            reason: format!("private node {} is unusable: {}", disk_path.display(), e),
        })?;
        debug!(
            "created device nodes {} ({}) and {} ({})",
            disk_path.display(),
            disk,
            partition_path.display(),
            partition
        );

        Ok(Self {
            dir,
            disk: disk_path,
            partition: partition_path,
        })
    }

    pub fn disk(&self) -> &Path {
        &self.disk
    }

    pub fn partition(&self) -> &Path {
        &self.partition
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }
}

fn make_block_node(path: &Path, numbers: DevNumbers) -> Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| Error::Discovery {
        device: path.display().to_string(),
        reason: "path contains a NUL byte".to_string(),
    })?;

    let rc = unsafe { libc::mknod(c_path.as_ptr(), libc::S_IFBLK | 0o600, numbers.to_raw()) };
    if rc == -1 {
        return Err(Error::Discovery {
            device: numbers.to_string(),
            reason: format!(
                "mknod {} failed: {}",
                path.display(),
                std::io::Error::last_os_error()
            ),
        });
    }
    Ok(())
}
