//! Device channel: the transport used to drive a handset.
//!
//! Implementations have no internal locking. Callers must not issue two calls against the same
//! device at the same time.

pub mod device;
pub mod runner;

use std::path::Path;
use std::sync::Arc;

use crate::app::error::HarnessError;

pub use device::AdbDevice;
pub use runner::CommandOutput;

pub trait Device: Send + Sync {
    /// Identifier used in output filenames.
    fn id(&self) -> &str;

    /// Runs `command` in a device shell and returns both streams.
    fn exec_shell(&self, command: &str) -> Result<CommandOutput, HarnessError>;

    fn shell(&self, command: &str) -> Result<String, HarnessError> {
        Ok(self.exec_shell(command)?.stdout)
    }

    fn push(&self, local: &Path, remote: &str) -> Result<(), HarnessError>;

    fn pull(&self, remote: &str, local_dir: &Path) -> Result<(), HarnessError>;

    fn launch_package(&self, package: &str) -> Result<(), HarnessError>;

    fn force_stop(&self, package: &str) -> Result<(), HarnessError>;

    /// Current contents of the device log buffer.
    fn logcat_dump(&self) -> Result<String, HarnessError>;

    /// Empties every log buffer, so later dumps only hold lines written after this call.
    fn clear_logcat(&self) -> Result<(), HarnessError>;
}

pub type DeviceHandle = Arc<dyn Device>;
