use thiserror::Error;

/// All errors that can occur while growing the root filesystem
#[derive(Debug, Error)]
pub enum Error {
    #[error("No filesystem mounted at '/' found in {0}")]
    RootNotFound(String),

    #[error("Root mount is ambiguous: both '{0}' and '{1}' are mounted at '/'")]
    AmbiguousMount(String, String),

    #[error("Cannot identify block device '{device}': {reason}")]
    Discovery { device: String, reason: String },

    #[error("Partition listing for '{disk}' could not be parsed: {reason}")]
    Parse { disk: String, reason: String },

    #[error("Partition listing for '{0}' contains no partition rows")]
    NoPartitions(String),

    #[error("Partition {number} not found on '{disk}'")]
    PartitionNotFound { disk: String, number: u32 },

    #[error("Partition {number} on '{disk}' is followed by partition {next} and cannot grow to the end of the disk")]
    NotLastPartition { disk: String, number: u32, next: u32 },

    #[error("Partition {number} appears more than once on '{disk}'")]
    DuplicatePartition { disk: String, number: u32 },

    #[error("Disk label '{0}' is not supported")]
    UnsupportedLabel(String),

    #[error("Required tool '{0}' is not installed")]
    ToolMissing(String),

    #[error("'{tool}' failed ({status}): {output}")]
    ToolInvocation {
        tool: String,
        status: String,
        output: String,
    },

    #[error("Kernel partition table reread of '{disk}' failed: {reason}")]
    Reread { disk: String, reason: String },

    #[error("Filesystem grow via '{tool}' failed ({status}): {output}")]
    Grow {
        tool: String,
        status: String,
        output: String,
    },

    #[error("Filesystem type '{0}' cannot be grown online")]
    UnsupportedFilesystem(String),

    #[error("Account operation for '{user}' failed: {reason}")]
    Account { user: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of [`Error`] values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Root mount or its block device could not be identified
    Discovery,
    /// Partition listing did not have the expected shape
    Parse,
    /// An external tool was missing or failed while editing the table
    ToolInvocation,
    /// Kernel did not adopt the new table (never fatal)
    Reread,
    /// The filesystem grow tool failed
    Grow,
    /// User or SSH key provisioning failed
    Account,
    Io,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::RootNotFound(_)
            | Error::AmbiguousMount(..)
            | Error::Discovery { .. }
            | Error::PartitionNotFound { .. }
            | Error::NotLastPartition { .. } => ErrorKind::Discovery,
            Error::Parse { .. }
            | Error::NoPartitions(_)
            | Error::DuplicatePartition { .. }
            | Error::UnsupportedLabel(_) => ErrorKind::Parse,
            Error::ToolMissing(_) | Error::ToolInvocation { .. } => ErrorKind::ToolInvocation,
            Error::Reread { .. } => ErrorKind::Reread,
            Error::Grow { .. } | Error::UnsupportedFilesystem(_) => ErrorKind::Grow,
            Error::Account { .. } => ErrorKind::Account,
            Error::Io(_) => ErrorKind::Io,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
