use std::path::Path;
use std::time::Duration;

use tracing::debug;

use crate::app::adb::runner::{run_command_with_timeout, CommandOutput};
use crate::app::adb::Device;
use crate::app::error::HarnessError;

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(300);

pub fn normalize_command_path(value: &str) -> String {
    let trimmed = value.trim();
    for quote in ['"', '\''] {
        if let Some(inner) = trimmed
            .strip_prefix(quote)
            .and_then(|candidate| candidate.strip_suffix(quote))
        {
            return inner.trim().to_string();
        }
    }
    trimmed.to_string()
}

pub fn resolve_adb_program(configured: &str) -> String {
    let normalized = normalize_command_path(configured);
    if normalized.is_empty() {
        "adb".to_string()
    } else {
        normalized
    }
}

/// A handset reached through the `adb` command line client.
#[derive(Debug, Clone)]
pub struct AdbDevice {
    serial: String,
    program: String,
    command_timeout: Duration,
}

impl AdbDevice {
    pub fn new(serial: impl Into<String>, adb_path: &str) -> Self {
        Self {
            serial: serial.into(),
            program: resolve_adb_program(adb_path),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    fn args(&self, rest: &[&str]) -> Vec<String> {
        let mut args = vec!["-s".to_string(), self.serial.clone()];
        args.extend(rest.iter().map(|value| value.to_string()));
        args
    }

    fn run(&self, rest: &[&str], timeout: Duration) -> Result<CommandOutput, HarnessError> {
        let args = self.args(rest);
        debug!(device = %self.serial, args = ?rest, "adb");
        run_command_with_timeout(&self.program, &args, timeout, "").map_err(|err| {
            HarnessError::device(
                format!("adb {} failed: {}", rest.join(" "), err.error),
                err.trace_id,
            )
        })
    }

    fn run_checked(&self, rest: &[&str], timeout: Duration) -> Result<CommandOutput, HarnessError> {
        let output = self.run(rest, timeout)?;
        if !output.success() {
            return Err(HarnessError::device(
                format!(
                    "adb {} exited with {:?}: {}",
                    rest.join(" "),
                    output.exit_code,
                    output.stderr.trim()
                ),
                "",
            ));
        }
        Ok(output)
    }
}

impl Device for AdbDevice {
    fn id(&self) -> &str {
        &self.serial
    }

    fn exec_shell(&self, command: &str) -> Result<CommandOutput, HarnessError> {
        self.run(&["shell", command], self.command_timeout)
    }

    fn push(&self, local: &Path, remote: &str) -> Result<(), HarnessError> {
        let local = local.to_string_lossy();
        self.run_checked(&["push", local.as_ref(), remote], TRANSFER_TIMEOUT)
            .map(|_| ())
    }

    fn pull(&self, remote: &str, local_dir: &Path) -> Result<(), HarnessError> {
        let local = local_dir.to_string_lossy();
        self.run_checked(&["pull", remote, local.as_ref()], TRANSFER_TIMEOUT)
            .map(|_| ())
    }

    fn launch_package(&self, package: &str) -> Result<(), HarnessError> {
        let command = format!("monkey -p {package} -c android.intent.category.LAUNCHER 1");
        self.run_checked(&["shell", &command], self.command_timeout)
            .map(|_| ())
    }

    fn force_stop(&self, package: &str) -> Result<(), HarnessError> {
        let command = format!("am force-stop {package}");
        self.run_checked(&["shell", &command], self.command_timeout)
            .map(|_| ())
    }

    fn logcat_dump(&self) -> Result<String, HarnessError> {
        Ok(self.run(&["logcat", "-d"], self.command_timeout)?.stdout)
    }

    fn clear_logcat(&self) -> Result<(), HarnessError> {
        self.run_checked(&["logcat", "-b", "all", "-c"], self.command_timeout)
            .map(|_| ())
    }
}
