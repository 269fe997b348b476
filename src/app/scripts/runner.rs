use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use regex::Regex;
use tracing::{debug, info, warn};

use crate::app::adb::runner::{CommandOutput, DrainedChild};
use crate::app::adb::DeviceHandle;
use crate::app::cancel::CancelToken;
use crate::app::logging::new_trace_id;
use crate::app::scripts::{Script, ScriptContext, ScriptFailure, ScriptOutcome};

/// First signal to reach the runner decides the outcome.
enum Signal {
    Exited(CommandOutput),
    Broken(ScriptFailure),
    Pattern,
}

/// Runs one script at a time under its deadline and logcat watch.
#[derive(Debug, Clone)]
pub struct ScriptRunner {
    logcat_poll: Duration,
    exit_poll: Duration,
}

impl Default for ScriptRunner {
    fn default() -> Self {
        Self {
            logcat_poll: Duration::from_secs(1),
            exit_poll: Duration::from_millis(50),
        }
    }
}

impl ScriptRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_logcat_poll(mut self, interval: Duration) -> Self {
        self.logcat_poll = interval;
        self
    }

    /// Executes `script` against `device`. Never fails: every way a run can end is an outcome.
    ///
    /// The script process, the deadline and the logcat watcher race; whichever fires first wins,
    /// and the script's whole process group and the watcher are stopped before this returns.
    pub fn run(
        &self,
        script: &Script,
        device: &DeviceHandle,
        context: &ScriptContext,
    ) -> ScriptOutcome {
        let trace_id = new_trace_id();
        let started = Instant::now();
        info!(
            trace_id = %trace_id,
            script = %script.name(),
            device = %device.id(),
            timeout_s = script.timeout().map(|t| t.as_secs()).unwrap_or(0),
            "running script"
        );

        if script.logcat_pattern().is_some() {
            // Only lines written during this run may match.
            if let Err(err) = device.clear_logcat() {
                warn!(trace_id = %trace_id, device = %device.id(), error = %err, "failed to clear logcat");
            }
        }

        let child = match DrainedChild::spawn_group(script.command(device.id(), context), &trace_id) {
            Ok(child) => child,
            Err(err) => {
                warn!(trace_id = %trace_id, error = %err, "failed to start script");
                return ScriptOutcome::Failed(ScriptFailure::new("SpawnError", err.error));
            }
        };

        let stop = CancelToken::new();
        let (tx, rx) = mpsc::channel::<Signal>();
        let exit_watch = watch_exit(child, tx.clone(), Arc::clone(&stop), self.exit_poll, &trace_id);
        let logcat_watch = script.logcat_pattern().map(|pattern| {
            watch_logcat(
                Arc::clone(device),
                pattern.clone(),
                tx.clone(),
                Arc::clone(&stop),
                self.logcat_poll,
                &trace_id,
            )
        });
        drop(tx);

        let received = match script.timeout() {
            Some(timeout) => rx.recv_timeout(timeout),
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        stop.cancel();
        let _ = exit_watch.join();
        if let Some(handle) = logcat_watch {
            let _ = handle.join();
        }

        let outcome = match received {
            Ok(Signal::Exited(output)) => classify_exit(output),
            Ok(Signal::Broken(failure)) => ScriptOutcome::Failed(failure),
            Ok(Signal::Pattern) => ScriptOutcome::PatternMatched,
            Err(RecvTimeoutError::Timeout) => ScriptOutcome::TimedOut,
            Err(RecvTimeoutError::Disconnected) => ScriptOutcome::Failed(ScriptFailure::new(
                "RunnerError",
                "script watchers exited without a result",
            )),
        };
        info!(
            trace_id = %trace_id,
            script = %script.name(),
            outcome = outcome.label(),
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "script finished"
        );
        outcome
    }
}

fn watch_exit(
    mut child: DrainedChild,
    tx: Sender<Signal>,
    stop: Arc<CancelToken>,
    poll: Duration,
    trace_id: &str,
) -> JoinHandle<()> {
    let trace_id = trace_id.to_string();
    thread::spawn(move || loop {
        if stop.is_cancelled() {
            debug!(trace_id = %trace_id, pid = child.id(), "terminating script process");
            child.kill();
            return;
        }
        match child.try_finish(&trace_id) {
            Ok(Some(output)) => {
                let _ = tx.send(Signal::Exited(output));
                return;
            }
            Ok(None) => {}
            Err(err) => {
                let _ = tx.send(Signal::Broken(ScriptFailure::new("RunnerError", err.error)));
                child.kill();
                return;
            }
        }
        if stop.wait_timeout(poll) {
            debug!(trace_id = %trace_id, pid = child.id(), "terminating script process");
            child.kill();
            return;
        }
    })
}

fn watch_logcat(
    device: DeviceHandle,
    pattern: Regex,
    tx: Sender<Signal>,
    stop: Arc<CancelToken>,
    poll: Duration,
    trace_id: &str,
) -> JoinHandle<()> {
    let trace_id = trace_id.to_string();
    thread::spawn(move || loop {
        if stop.is_cancelled() {
            return;
        }
        match device.logcat_dump() {
            Ok(dump) if pattern.is_match(&dump) => {
                debug!(trace_id = %trace_id, pattern = %pattern, "logcat pattern matched");
                let _ = tx.send(Signal::Pattern);
                return;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(trace_id = %trace_id, error = %err, "failed to read logcat");
            }
        }
        if stop.wait_timeout(poll) {
            return;
        }
    })
}

fn classify_exit(output: CommandOutput) -> ScriptOutcome {
    if output.success() {
        return ScriptOutcome::Completed(output.stdout.trim().to_string());
    }
    ScriptOutcome::Failed(failure_from_exit(&output))
}

/// Reads the raised error from the last stderr line, `Name: message` or a bare `Name`.
fn failure_from_exit(output: &CommandOutput) -> ScriptFailure {
    let status = output
        .exit_code
        .map(|code| code.to_string())
        .unwrap_or_else(|| "signal".to_string());
    let last_line = output
        .stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("");

    if let Some(caps) = error_line_regex().captures(last_line) {
        let kind = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let message = caps.get(2).map(|m| m.as_str().trim()).unwrap_or_default();
        return ScriptFailure::new(kind, format!("{message} (exit status {status})").trim_start());
    }
    ScriptFailure::new("ScriptExit", format!("exit status {status}: {last_line}"))
}

fn error_line_regex() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([A-Za-z_][\w.]*(?:Error|Exception|Interrupt|Exit|Warning))(?::\s*(.*))?$")
            .expect("valid error line regex")
    })
}
