use crate::device::BlockDevice;
use crate::error::{Error, Result};
use crate::system::{Invocation, ToolRunner};
use std::fmt;
use std::path::Path;
use tracing::{info, warn};

/// How the kernel came to see the new table, if it did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RereadOutcome {
    /// The direct kernel notification succeeded
    Kernel,
    /// The kernel call failed and this fallback tool was run
    Fallback { tool: String, succeeded: bool },
    /// Nothing could notify the kernel; its view of the table may be stale
    None,
}

impl fmt::Display for RereadOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RereadOutcome::Kernel => write!(f, "kernel reread"),
            RereadOutcome::Fallback { tool, succeeded } => write!(
                f,
                "{} ({})",
                tool,
                if *succeeded { "succeeded" } else { "failed" }
            ),
            RereadOutcome::None => write!(f, "none (kernel table may be stale)"),
        }
    }
}

/// Direct request for the kernel to reload a disk's partition table
pub trait KernelNotifier {
    fn notify(&self, disk: &Path) -> Result<()>;
}

/// Linux `BLKRRPART` ioctl on the whole-disk device, opened write-only
///
/// Expected to fail with `EBUSY` while a partition of the disk is mounted.
#[derive(Debug, Default, Clone, Copy)]
pub struct BlkRrPart;

impl KernelNotifier for BlkRrPart {
    #[cfg(target_os = "linux")]
    fn notify(&self, disk: &Path) -> Result<()> {
        use std::fs::OpenOptions;
        use std::os::unix::io::AsRawFd;

        // BLKRRPART = _IO(0x12, 95)
        const BLKRRPART: libc::Ioctl = 0x125f as libc::Ioctl;

        let file = OpenOptions::new().write(true).open(disk)?;
        let result = unsafe { libc::ioctl(file.as_raw_fd(), BLKRRPART) };
        if result == -1 {
            return Err(Error::Reread {
                disk: disk.display().to_string(),
                reason: std::io::Error::last_os_error().to_string(),
            });
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn notify(&self, disk: &Path) -> Result<()> {
        Err(Error::Reread {
            disk: disk.display().to_string(),
            reason: "BLKRRPART is only available on Linux".to_string(),
        })
    }
}

/// FreeBSD: closing a provider opened for writing makes GEOM retaste it
#[derive(Debug, Default, Clone, Copy)]
pub struct GeomRetaste;

impl KernelNotifier for GeomRetaste {
    fn notify(&self, disk: &Path) -> Result<()> {
        std::fs::OpenOptions::new()
            .write(true)
            .open(disk)
            .map(drop)
            .map_err(|e| Error::Reread {
                disk: disk.display().to_string(),
                reason: e.to_string(),
            })
    }
}

/// External program that can make the kernel pick up a new table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RereadTool {
    pub program: &'static str,
    pub args: &'static [&'static str],
}

impl RereadTool {
    pub fn invocation(&self, disk: &BlockDevice) -> Invocation {
        Invocation::new(self.program)
            .args(self.args.iter().copied())
            .arg(disk.path_str())
    }
}

/// Fallbacks in priority order: partition table refresher, generic probe,
/// device-mapper partition refresher
pub const LINUX_REREAD_TOOLS: &[RereadTool] = &[
    RereadTool {
        program: "partx",
        args: &["-u"],
    },
    RereadTool {
        program: "partprobe",
        args: &[],
    },
    RereadTool {
        program: "kpartx",
        args: &["-u"],
    },
];

/// Kernel notification with a ranked fallback chain; never fails
pub struct KernelRereadNotifier<'a> {
    kernel: &'a dyn KernelNotifier,
    tools: &'a dyn ToolRunner,
    fallbacks: &'a [RereadTool],
}

impl<'a> KernelRereadNotifier<'a> {
    pub fn new(
        kernel: &'a dyn KernelNotifier,
        tools: &'a dyn ToolRunner,
        fallbacks: &'a [RereadTool],
    ) -> Self {
        Self {
            kernel,
            tools,
            fallbacks,
        }
    }

    /// Try the kernel call, then the first fallback tool present on the
    /// system. The first present tool ends the search whether or not it
    /// succeeds.
    pub fn reread(&self, disk: &BlockDevice) -> RereadOutcome {
        let kernel_error = match self.kernel.notify(&disk.path) {
            Ok(()) => {
                info!("kernel reread the partition table of {}", disk.path_str());
                return RereadOutcome::Kernel;
            }
            Err(e) => e,
        };
        warn!("{}", kernel_error);

        let Some(tool) = self
            .fallbacks
            .iter()
            .find(|t| self.tools.is_available(t.program))
        else {
            warn!(
                "no partition table reread tool available for {}; continuing with a possibly stale kernel view",
                disk.path_str()
            );
            return RereadOutcome::None;
        };

        let invocation = tool.invocation(disk);
        info!("updating partition table via {}", invocation);
        let succeeded = match self.tools.run(&invocation) {
            Ok(output) if output.success() => true,
            Ok(output) => {
                warn!("{} failed ({}): {}", invocation, output.status(), output.combined());
                false
            }
            Err(e) => {
                warn!("{} could not be run: {}", invocation, e);
                false
            }
        };

        RereadOutcome::Fallback {
            tool: tool.program.to_string(),
            succeeded,
        }
    }
}
