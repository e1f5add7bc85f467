use crate::error::{Error, Result};
use crate::system::{Invocation, ToolRunner};
use std::path::{Path, PathBuf};
use tracing::info;

/// What the grow tool is pointed at
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrowTarget {
    MountPoint(PathBuf),
    Device(PathBuf),
}

impl GrowTarget {
    pub fn path(&self) -> &Path {
        match self {
            GrowTarget::MountPoint(path) | GrowTarget::Device(path) => path,
        }
    }
}

/// Online grow command for the filesystem type mounted at `mount_point`
pub fn grow_invocation(fstype: &str, mount_point: &Path, partition: &Path) -> Result<Invocation> {
    let (program, args, target) = match fstype {
        "ext2" | "ext3" | "ext4" => ("resize2fs", vec![], GrowTarget::Device(partition.into())),
        "xfs" => ("xfs_growfs", vec![], GrowTarget::MountPoint(mount_point.into())),
        "btrfs" => (
            "btrfs",
            vec!["filesystem", "resize", "max"],
            GrowTarget::MountPoint(mount_point.into()),
        ),
        "ufs" => ("growfs", vec!["-y"], GrowTarget::MountPoint(mount_point.into())),
        other => return Err(Error::UnsupportedFilesystem(other.to_string())),
    };

    Ok(Invocation::new(program)
        .args(args)
        .arg(target.path().display().to_string()))
}

/// Run the grow command; a nonzero exit is fatal, with the tool's output
pub fn grow(tools: &dyn ToolRunner, invocation: &Invocation) -> Result<()> {
    info!("resize filesystem via {}", invocation);

    let grow_error = |status: String, output: String| Error::Grow {
        tool: invocation.to_string(),
        status,
        output,
    };

    if !tools.is_available(&invocation.program) {
        return Err(grow_error("not installed".to_string(), String::new()));
    }

    let output = tools.run(invocation)?;
    if !output.success() {
        return Err(grow_error(output.status(), output.combined()));
    }
    info!("{}", output.combined());
    Ok(())
}
