pub mod accounts;
pub mod device;
pub mod error;
pub mod logging;
pub mod mounts;
pub mod resize;
pub mod system;

pub use device::{BlockDevice, DevNumbers, ScopedDeviceNodes};
pub use error::{Error, ErrorKind, Result};
pub use resize::{
    inspect_root, resize_root, ResizeFailure, ResizeOptions, ResizeReport, ResizeRun, ResizeState,
};
pub use system::{check_root, get_block_device_size, Invocation, SystemTools, ToolOutput, ToolRunner};
