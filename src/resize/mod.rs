//! Online growth of the root filesystem: locate the root partition, read the
//! disk's partition table, rewrite the root entry to reach the end of the
//! disk, get the kernel to reread the table and grow the filesystem.

pub mod executor;
pub mod expander;
pub mod grower;
pub mod inspector;
pub mod locator;
pub mod platform;
pub mod reread;

pub use executor::*;
pub use expander::{
    apply, plan, FdiskEditor, GpartEditor, PartitionEditor, ResizePlan, SfdiskEditor,
};
pub use grower::{grow, grow_invocation, GrowTarget};
pub use inspector::{
    inspect, parse_fdisk_listing, parse_gpart_show, DiskLabel, ListingFormat, PartitionRecord,
    PartitionTable,
};
pub use locator::{
    find_root_entry, split_partition_designator, MountSource, PartitionDesignator, RootLocation,
    RootLocator,
};
pub use platform::{select_resizer, FreeBsdResizer, LinuxResizer, Platform, PlatformConfig, RootResizer};
pub use reread::{
    BlkRrPart, GeomRetaste, KernelNotifier, KernelRereadNotifier, RereadOutcome, RereadTool,
    LINUX_REREAD_TOOLS,
};
