use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::app::error::HarnessError;

/// How long a process group's pipes may stay open after its leader exited and the group was
/// killed. Only a member that left the group can hold them that long.
const GROUP_OUTPUT_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// A spawned child whose stdout/stderr are drained on background threads.
///
/// A chatty child blocks once its pipe buffer fills, so the pipes are always read, whether the
/// caller ends up waiting for the child or killing it. A child spawned with [`spawn_group`]
/// leads its own process group, and every member of the group is killed with it.
///
/// [`spawn_group`]: DrainedChild::spawn_group
pub struct DrainedChild {
    child: Child,
    stdout: Option<Drain>,
    stderr: Option<Drain>,
    group: bool,
}

impl DrainedChild {
    pub fn spawn(command: Command, trace_id: &str) -> Result<Self, HarnessError> {
        Self::spawn_inner(command, false, trace_id)
    }

    /// Spawns `command` as the leader of a new process group.
    pub fn spawn_group(mut command: Command, trace_id: &str) -> Result<Self, HarnessError> {
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        Self::spawn_inner(command, cfg!(unix), trace_id)
    }

    fn spawn_inner(mut command: Command, group: bool, trace_id: &str) -> Result<Self, HarnessError> {
        let program = command.get_program().to_string_lossy().to_string();
        let mut child = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| {
                HarnessError::system(format!("Failed to spawn {program}: {err}"), trace_id)
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HarnessError::system("Failed to capture stdout", trace_id))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| HarnessError::system("Failed to capture stderr", trace_id))?;

        Ok(Self {
            child,
            stdout: Some(Drain::start(stdout)),
            stderr: Some(Drain::start(stderr)),
            group,
        })
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Returns the collected output once the child has exited, `None` while it is still running.
    ///
    /// For a group leader, whatever the child left running in its group is killed first so the
    /// pipes close.
    pub fn try_finish(&mut self, trace_id: &str) -> Result<Option<CommandOutput>, HarnessError> {
        let status = self.child.try_wait().map_err(|err| {
            HarnessError::system(format!("Failed to poll command: {err}"), trace_id)
        })?;
        let Some(status) = status else {
            return Ok(None);
        };
        if self.group {
            kill_group(self.child.id());
        }
        Ok(Some(self.collect(status)))
    }

    /// Kills the child (and its group) and reaps it. Reader threads are detached: a process that
    /// inherited the pipes may keep them open after the child is gone.
    pub fn kill(mut self) {
        if self.group {
            kill_group(self.child.id());
        }
        let _ = self.child.kill();
        let _ = self.child.wait();
    }

    fn collect(&mut self, status: ExitStatus) -> CommandOutput {
        let grace = self.group.then_some(GROUP_OUTPUT_GRACE);
        let stdout = self
            .stdout
            .take()
            .map(|drain| drain.finish(grace))
            .unwrap_or_default();
        let stderr = self
            .stderr
            .take()
            .map(|drain| drain.finish(grace))
            .unwrap_or_default();
        CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).to_string(),
            stderr: String::from_utf8_lossy(&stderr).to_string(),
            exit_code: status.code(),
        }
    }
}

#[cfg(unix)]
fn kill_group(pgid: u32) {
    if let Ok(pgid) = libc::pid_t::try_from(pgid) {
        // SAFETY: killpg only sends a signal; an empty group yields ESRCH, which is ignored.
        unsafe {
            libc::killpg(pgid, libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: u32) {}

/// Bytes read so far from one pipe, plus a signal for end of stream.
struct Drain {
    buffer: Arc<Mutex<Vec<u8>>>,
    done: Receiver<()>,
}

impl Drain {
    fn start<R: Read + Send + 'static>(mut reader: R) -> Self {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let (tx, done) = mpsc::channel();
        let sink = Arc::clone(&buffer);
        std::thread::spawn(move || {
            let mut temp = [0u8; 4096];
            loop {
                match reader.read(&mut temp) {
                    Ok(0) => break,
                    Ok(count) => lock(&sink).extend_from_slice(&temp[..count]),
                    Err(_) => break,
                }
            }
            let _ = tx.send(());
        });
        Self { buffer, done }
    }

    /// Waits for end of stream, at most `grace` when given, and takes what was read.
    fn finish(self, grace: Option<Duration>) -> Vec<u8> {
        match grace {
            Some(grace) => {
                let _ = self.done.recv_timeout(grace);
            }
            None => {
                let _ = self.done.recv();
            }
        }
        std::mem::take(&mut *lock(&self.buffer))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub fn run_command_with_timeout(
    program: &str,
    args: &[String],
    timeout: Duration,
    trace_id: &str,
) -> Result<CommandOutput, HarnessError> {
    let mut command = Command::new(program);
    command.args(args);
    let mut child = DrainedChild::spawn(command, trace_id)?;

    let start = Instant::now();
    loop {
        if let Some(output) = child.try_finish(trace_id)? {
            return Ok(output);
        }
        if start.elapsed() > timeout {
            child.kill();
            return Err(HarnessError::system(
                format!("Command timed out: {program} {}", args.join(" ")),
                trace_id,
            ));
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}
