use crate::error::{Error, Result};
use std::fmt;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::debug;

/// A single external program invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    /// Text piped to the program's standard input
    pub stdin: Option<String>,
}

impl Invocation {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            stdin: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.args.push(arg.as_ref().to_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_string()));
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Captured result of a finished invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    /// Exit code, `None` when killed by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Stdout followed by stderr, for diagnostics
    pub fn combined(&self) -> String {
        let mut out = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&self.stderr);
        }
        out.trim_end().to_string()
    }

    pub fn status(&self) -> String {
        match self.code {
            Some(code) => format!("exit status {}", code),
            None => "terminated by signal".to_string(),
        }
    }
}

/// Seam between the resize stages and the external programs they drive
pub trait ToolRunner {
    /// Whether `program` can be found on this system
    fn is_available(&self, program: &str) -> bool;

    /// Run to completion and capture its output. A nonzero exit is not an
    /// error at this level; callers decide what a failure means.
    fn run(&self, invocation: &Invocation) -> Result<ToolOutput>;

    /// Run and turn a missing program or nonzero exit into `ToolInvocation`
    fn run_checked(&self, invocation: &Invocation) -> Result<ToolOutput> {
        if !self.is_available(&invocation.program) {
            return Err(Error::ToolMissing(invocation.program.clone()));
        }
        let output = self.run(invocation)?;
        if !output.success() {
            return Err(Error::ToolInvocation {
                tool: invocation.to_string(),
                status: output.status(),
                output: output.combined(),
            });
        }
        Ok(output)
    }
}

/// Runs programs from `PATH` with a C locale
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTools;

impl ToolRunner for SystemTools {
    fn is_available(&self, program: &str) -> bool {
        which::which(program).is_ok()
    }

    fn run(&self, invocation: &Invocation) -> Result<ToolOutput> {
        debug!("running {}", invocation);

        let mut child = Command::new(&invocation.program)
            .args(&invocation.args)
            .env("LC_ALL", "C")
            .stdin(if invocation.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Error::ToolMissing(invocation.program.clone())
                } else {
                    Error::Io(e)
                }
            })?;

        if let Some(input) = &invocation.stdin {
            // Dropping the handle closes the pipe so the tool sees EOF
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(input.as_bytes())?;
            }
        }

        let output = child.wait_with_output()?;
        let result = ToolOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        };
        debug!("{} finished with {}", invocation.program, result.status());
        Ok(result)
    }
}

/// Check if running as root (required for block device access)
pub fn check_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Get the size of a block device in bytes
#[cfg(target_os = "linux")]
pub fn get_block_device_size(path: impl AsRef<Path>) -> Result<u64> {
    use std::fs::File;
    use std::os::unix::io::AsRawFd;

    let path = path.as_ref();
    let file = File::open(path).map_err(|e| Error::Discovery {
        device: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let fd = file.as_raw_fd();

    let mut size: u64 = 0;

    // BLKGETSIZE64 = 0x80081272
    // Cast to Ioctl type (i32 on musl, u64 on glibc)
    #[allow(overflowing_literals)]
    const BLKGETSIZE64: libc::Ioctl = 0x80081272u32 as libc::Ioctl;

    let result = unsafe { libc::ioctl(fd, BLKGETSIZE64, &mut size) };

    if result == -1 {
        // Not a block device (image file), fall back to seek
        use std::io::{Seek, SeekFrom};
        let mut file = file;
        let size = file.seek(SeekFrom::End(0))?;
        Ok(size)
    } else {
        Ok(size)
    }
}

#[cfg(not(target_os = "linux"))]
pub fn get_block_device_size(path: impl AsRef<Path>) -> Result<u64> {
    use std::fs::File;
    use std::io::{Seek, SeekFrom};

    let path = path.as_ref();
    let mut file = File::open(path).map_err(|e| Error::Discovery {
        device: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let size = file.seek(SeekFrom::End(0))?;
    Ok(size)
}


#[cfg(test)]
mod tests {
    use super::testing::FakeTools;
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_get_block_device_size_file() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), vec![0u8; 4096]).unwrap();

        let size = get_block_device_size(file.path()).unwrap();
        assert_eq!(size, 4096);
    }

    #[test]
    fn test_invocation_display() {
        let inv = Invocation::new("partx").args(["-u", "/dev/sda"]);
        assert_eq!(inv.to_string(), "partx -u /dev/sda");
    }

    #[test]
    fn test_combined_output() {
        let out = ToolOutput {
            code: Some(1),
            stdout: "line one".to_string(),
            stderr: "oops\n".to_string(),
        };
        assert_eq!(out.combined(), "line one\noops");
        assert_eq!(out.status(), "exit status 1");
        assert!(!out.success());
    }

    #[test]
    fn test_run_checked_missing_tool() {
        let tools = FakeTools::default();
        let err = tools.run_checked(&Invocation::new("fdisk")).unwrap_err();
        assert!(matches!(err, Error::ToolMissing(ref t) if t == "fdisk"));
        assert!(tools.calls.borrow().is_empty());
    }

    #[test]
    fn test_run_checked_nonzero_exit() {
        let tools = FakeTools::default().with("resize2fs", 1, "bad superblock");
        let err = tools
            .run_checked(&Invocation::new("resize2fs").arg("/dev/sda1"))
            .unwrap_err();
        match err {
            Error::ToolInvocation { tool, output, .. } => {
                assert_eq!(tool, "resize2fs /dev/sda1");
                assert_eq!(output, "bad superblock");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_system_tools_runs_with_stdin() {
        let out = SystemTools
            .run(&Invocation::new("cat").stdin("d\nw\n"))
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout, "d\nw\n");
    }
}
