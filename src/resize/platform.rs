//! Per-platform implementations of the five resize stages

use crate::device::ScopedDeviceNodes;
use crate::error::{Error, Result};
use crate::resize::expander::{FdiskEditor, GpartEditor, PartitionEditor, SfdiskEditor};
use crate::resize::grower::grow_invocation;
use crate::resize::inspector::{inspect, DiskLabel, ListingFormat, PartitionTable};
use crate::resize::locator::{MountSource, RootLocation, RootLocator};
use crate::resize::reread::{
    BlkRrPart, GeomRetaste, KernelNotifier, KernelRereadNotifier, RereadOutcome, RereadTool,
    LINUX_REREAD_TOOLS,
};
use crate::system::{get_block_device_size, Invocation, SystemTools, ToolRunner};
use std::path::PathBuf;
use tracing::{debug, warn};

/// One way of growing the root filesystem in place
///
/// The orchestrator drives these stages in order and owns the plan/apply
/// step, using the editor chosen here for the table's label.
pub trait RootResizer {
    fn name(&self) -> &'static str;

    fn tools(&self) -> &dyn ToolRunner;

    fn locate(&self) -> Result<RootLocation>;

    fn inspect(&self, location: &RootLocation) -> Result<PartitionTable>;

    fn editor(
        &self,
        location: &RootLocation,
        table: &PartitionTable,
    ) -> Result<Box<dyn PartitionEditor>>;

    /// Best effort, never fails
    fn reread(&self, location: &RootLocation) -> RereadOutcome;

    fn grow_invocation(&self, location: &RootLocation) -> Result<Invocation>;
}

/// Operating system the process runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Linux,
    FreeBsd,
    Other(&'static str),
}

impl Platform {
    pub fn detect() -> Self {
        match std::env::consts::OS {
            "linux" => Platform::Linux,
            "freebsd" => Platform::FreeBsd,
            other => Platform::Other(other),
        }
    }
}

/// Knobs shared by the platform variants
#[derive(Debug, Clone)]
pub struct PlatformConfig {
    /// Address disk and partition through private device nodes
    pub device_nodes: bool,
    pub mount_table: Option<PathBuf>,
    pub sysfs: Option<PathBuf>,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            device_nodes: true,
            mount_table: None,
            sysfs: None,
        }
    }
}

/// Pick the resizer for the running platform
pub fn select_resizer(config: &PlatformConfig) -> Result<Box<dyn RootResizer>> {
    match Platform::detect() {
        Platform::Linux => {
            let mut locator = RootLocator::linux();
            if let Some(mount_table) = &config.mount_table {
                locator.mounts = MountSource::File(mount_table.clone());
            }
            if let Some(sysfs) = &config.sysfs {
                locator.sysfs = Some(sysfs.clone());
            }
            Ok(Box::new(LinuxResizer {
                tools: SystemTools,
                kernel: BlkRrPart,
                locator,
                device_nodes: config.device_nodes,
                fallbacks: LINUX_REREAD_TOOLS,
            }))
        }
        Platform::FreeBsd => Ok(Box::new(FreeBsdResizer {
            tools: SystemTools,
            kernel: GeomRetaste,
            locator: RootLocator::freebsd(),
        })),
        Platform::Other(os) => Err(Error::Discovery {
            device: "/".to_string(),
            reason: format!("operating system '{}' is not supported", os),
        }),
    }
}

/// Linux: fdisk listing, fdisk (dos) or sfdisk (gpt) edits, BLKRRPART with
/// partx/partprobe/kpartx fallbacks
pub struct LinuxResizer<T: ToolRunner, K: KernelNotifier> {
    pub tools: T,
    pub kernel: K,
    pub locator: RootLocator,
    pub device_nodes: bool,
    pub fallbacks: &'static [RereadTool],
}

impl<T: ToolRunner, K: KernelNotifier> RootResizer for LinuxResizer<T, K> {
    fn name(&self) -> &'static str {
        "linux"
    }

    fn tools(&self) -> &dyn ToolRunner {
        &self.tools
    }

    fn locate(&self) -> Result<RootLocation> {
        let mut location = self.locator.locate(&self.tools)?;
        if self.device_nodes {
            match private_nodes(&location) {
                Ok(nodes) => location.attach_nodes(nodes),
                Err(e) => warn!(
                    "{}; using {} and {} directly",
                    e,
                    location.disk.path_str(),
                    location.partition.path_str()
                ),
            }
        }
        Ok(location)
    }

    fn inspect(&self, location: &RootLocation) -> Result<PartitionTable> {
        let mut table = inspect(&self.tools, &location.disk, ListingFormat::Fdisk)?;
        if table.disk_sectors.is_none() {
            match get_block_device_size(&location.disk.path) {
                Ok(bytes) => table.disk_sectors = Some(bytes / 512),
                Err(e) => debug!("disk size unknown: {}", e),
            }
        }
        Ok(table)
    }

    fn editor(
        &self,
        _location: &RootLocation,
        table: &PartitionTable,
    ) -> Result<Box<dyn PartitionEditor>> {
        match &table.label {
            DiskLabel::Dos => Ok(Box::new(FdiskEditor)),
            DiskLabel::Gpt => Ok(Box::new(SfdiskEditor)),
            DiskLabel::Other(name) => Err(Error::UnsupportedLabel(name.clone())),
        }
    }

    fn reread(&self, location: &RootLocation) -> RereadOutcome {
        KernelRereadNotifier::new(&self.kernel, &self.tools, self.fallbacks).reread(&location.disk)
    }

    fn grow_invocation(&self, location: &RootLocation) -> Result<Invocation> {
        grow_invocation(
            &location.fstype,
            &location.mount_point,
            &location.partition.path,
        )
    }
}

fn private_nodes(location: &RootLocation) -> Result<ScopedDeviceNodes> {
    match (location.disk.numbers(), location.partition.numbers()) {
        (Some(disk), Some(partition)) => ScopedDeviceNodes::create(disk, partition),
        _ => Err(Error::Discovery {
            device: location.disk.path_str(),
            reason: "device numbers unknown, cannot create private nodes".to_string(),
        }),
    }
}

/// FreeBSD: `gpart show` listing, `gpart resize` edits, GEOM retaste
pub struct FreeBsdResizer<T: ToolRunner, K: KernelNotifier> {
    pub tools: T,
    pub kernel: K,
    pub locator: RootLocator,
}

impl<T: ToolRunner, K: KernelNotifier> RootResizer for FreeBsdResizer<T, K> {
    fn name(&self) -> &'static str {
        "freebsd"
    }

    fn tools(&self) -> &dyn ToolRunner {
        &self.tools
    }

    fn locate(&self) -> Result<RootLocation> {
        self.locator.locate(&self.tools)
    }

    fn inspect(&self, location: &RootLocation) -> Result<PartitionTable> {
        inspect(&self.tools, &location.disk, ListingFormat::Gpart)
    }

    fn editor(
        &self,
        location: &RootLocation,
        table: &PartitionTable,
    ) -> Result<Box<dyn PartitionEditor>> {
        match &table.label {
            DiskLabel::Dos | DiskLabel::Gpt => Ok(Box::new(GpartEditor {
                inner_label: location.designator.label,
            })),
            DiskLabel::Other(name) => Err(Error::UnsupportedLabel(name.clone())),
        }
    }

    fn reread(&self, location: &RootLocation) -> RereadOutcome {
        KernelRereadNotifier::new(&self.kernel, &self.tools, &[]).reread(&location.disk)
    }

    fn grow_invocation(&self, location: &RootLocation) -> Result<Invocation> {
        grow_invocation(
            &location.fstype,
            &location.mount_point,
            &location.partition.path,
        )
    }
}
