//! Scripted device used by unit tests.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::app::adb::{CommandOutput, Device, DeviceHandle};
use crate::app::error::HarnessError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Shell(String),
    Push(PathBuf, String),
    Pull(String, PathBuf),
    Launch(String),
    ForceStop(String),
    Logcat,
    ClearLogcat,
}

#[derive(Default)]
struct Responses {
    queued: HashMap<String, VecDeque<CommandOutput>>,
    fallback: Option<CommandOutput>,
    logcat: VecDeque<String>,
    stale_logcat: String,
    pulled_files: HashMap<String, String>,
}

#[derive(Default)]
pub struct FakeDevice {
    id: String,
    calls: Mutex<Vec<Call>>,
    responses: Mutex<Responses>,
}

impl FakeDevice {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            ..Self::default()
        })
    }

    pub fn handle(self: &Arc<Self>) -> DeviceHandle {
        Arc::clone(self) as DeviceHandle
    }

    /// Queues stdout for the next call of `command`.
    pub fn on_shell(&self, command: &str, stdout: &str) {
        self.on_shell_output(
            command,
            CommandOutput {
                stdout: stdout.to_string(),
                stderr: String::new(),
                exit_code: Some(0),
            },
        );
    }

    pub fn on_shell_output(&self, command: &str, output: CommandOutput) {
        let mut responses = self.responses.lock().expect("fake device");
        responses
            .queued
            .entry(command.to_string())
            .or_default()
            .push_back(output);
    }

    /// Output for any shell command without a queued response.
    pub fn on_any_shell(&self, stdout: &str) {
        self.responses.lock().expect("fake device").fallback = Some(CommandOutput {
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_code: Some(0),
        });
    }

    /// Lines already in the log buffer; they show in every dump until the buffer is cleared.
    pub fn on_stale_logcat(&self, lines: &str) {
        self.responses.lock().expect("fake device").stale_logcat = lines.to_string();
    }

    /// Queues a dump of the lines written since the buffer was last cleared.
    pub fn on_logcat(&self, dump: &str) {
        self.responses
            .lock()
            .expect("fake device")
            .logcat
            .push_back(dump.to_string());
    }

    /// Content written into the local directory when `remote` is pulled.
    pub fn on_pull(&self, remote: &str, content: &str) {
        self.responses
            .lock()
            .expect("fake device")
            .pulled_files
            .insert(remote.to_string(), content.to_string());
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().expect("fake device").clone()
    }

    pub fn shell_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Shell(command) => Some(command),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().expect("fake device").push(call);
    }
}

impl Device for FakeDevice {
    fn id(&self) -> &str {
        &self.id
    }

    fn exec_shell(&self, command: &str) -> Result<CommandOutput, HarnessError> {
        self.record(Call::Shell(command.to_string()));
        let mut responses = self.responses.lock().expect("fake device");
        if let Some(output) = responses
            .queued
            .get_mut(command)
            .and_then(|queue| queue.pop_front())
        {
            return Ok(output);
        }
        Ok(responses.fallback.clone().unwrap_or_default())
    }

    fn push(&self, local: &Path, remote: &str) -> Result<(), HarnessError> {
        self.record(Call::Push(local.to_path_buf(), remote.to_string()));
        Ok(())
    }

    fn pull(&self, remote: &str, local_dir: &Path) -> Result<(), HarnessError> {
        self.record(Call::Pull(remote.to_string(), local_dir.to_path_buf()));
        let content = self
            .responses
            .lock()
            .expect("fake device")
            .pulled_files
            .get(remote)
            .cloned();
        if let Some(content) = content {
            let name = remote.rsplit('/').next().unwrap_or(remote);
            std::fs::write(local_dir.join(name), content)
                .map_err(|err| HarnessError::device(err.to_string(), ""))?;
        }
        Ok(())
    }

    fn launch_package(&self, package: &str) -> Result<(), HarnessError> {
        self.record(Call::Launch(package.to_string()));
        Ok(())
    }

    fn force_stop(&self, package: &str) -> Result<(), HarnessError> {
        self.record(Call::ForceStop(package.to_string()));
        Ok(())
    }

    fn logcat_dump(&self) -> Result<String, HarnessError> {
        self.record(Call::Logcat);
        let mut responses = self.responses.lock().expect("fake device");
        let fresh = if responses.logcat.len() > 1 {
            responses.logcat.pop_front().unwrap_or_default()
        } else {
            responses.logcat.front().cloned().unwrap_or_default()
        };
        Ok(format!("{}{fresh}", responses.stale_logcat))
    }

    fn clear_logcat(&self) -> Result<(), HarnessError> {
        self.record(Call::ClearLogcat);
        self.responses.lock().expect("fake device").stale_logcat.clear();
        Ok(())
    }
}
