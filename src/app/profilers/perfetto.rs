//! System tracing through the on-device `perfetto` binary.
//!
//! The tracer runs detached on the device; only its pid is kept on the host.

use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use tracing::{debug, info};

use crate::app::adb::DeviceHandle;
use crate::app::aggregate::{FinalRow, SubjectRow};
use crate::app::config::ProfilerConfig;
use crate::app::error::HarnessError;
use crate::app::logging::new_trace_id;
use crate::app::profilers::{Lifecycle, Profiler, ProfilerState, StartOptions};

pub const NAME: &str = "perfetto";
pub const CONFIG_DEVICE_PATH: &str = "/data/misc/perfetto-configs/";
pub const TRACES_DEVICE_PATH: &str = "/data/misc/perfetto-traces/";
pub const PID_QUERY: &str = "ps -A | grep perfetto | awk '{print $2}'";

fn local_now() -> NaiveDateTime {
    chrono::Local::now().naive_local()
}

pub struct PerfettoTracer {
    lifecycle: Lifecycle,
    config_file: PathBuf,
    text_config: bool,
    config_device_path: String,
    trace_device_path: String,
    device_pid: Option<String>,
    output_dir: PathBuf,
    clock: fn() -> NaiveDateTime,
}

impl PerfettoTracer {
    pub fn new(config: &ProfilerConfig) -> Result<Self, HarnessError> {
        let config_file = config.config_file.clone().ok_or_else(|| {
            HarnessError::config("Perfetto profiler requires config_file", "")
        })?;
        let text_config = match config.config_file_format.as_deref().unwrap_or("text") {
            "text" => true,
            "binary" => false,
            other => {
                return Err(HarnessError::config(
                    format!("Unknown config_file_format: {other} (expected text or binary)"),
                    "",
                ))
            }
        };
        Ok(Self {
            lifecycle: Lifecycle::new(NAME),
            config_file,
            text_config,
            config_device_path: String::new(),
            trace_device_path: String::new(),
            device_pid: None,
            output_dir: PathBuf::new(),
            clock: local_now,
        })
    }

    pub fn with_clock(mut self, clock: fn() -> NaiveDateTime) -> Self {
        self.clock = clock;
        self
    }

    pub fn device_pid(&self) -> Option<&str> {
        self.device_pid.as_deref()
    }

    pub fn trace_device_path(&self) -> &str {
        &self.trace_device_path
    }

    pub fn config_device_path(&self) -> &str {
        &self.config_device_path
    }

    fn launch_command(&self) -> String {
        let format_flag = if self.text_config { " --txt" } else { "" };
        format!(
            "cat {} | perfetto --background{format_flag} -c - -o {}",
            self.config_device_path, self.trace_device_path
        )
    }
}

/// The single pid in `output`. None or several matches make the target ambiguous.
pub fn single_pid(output: &str) -> Result<String, HarnessError> {
    let pids: Vec<&str> = output.split_whitespace().collect();
    match pids.as_slice() {
        [pid] => Ok(pid.to_string()),
        [] => Err(HarnessError::profiler(
            "Perfetto: no running perfetto process found",
            "",
        )),
        _ => Err(HarnessError::profiler(
            format!("Perfetto: expected one perfetto process, found {}: {}", pids.len(), pids.join(" ")),
            "",
        )),
    }
}

impl Profiler for PerfettoTracer {
    fn name(&self) -> &'static str {
        NAME
    }

    fn state(&self) -> ProfilerState {
        self.lifecycle.state()
    }

    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    fn load(&mut self, device: &DeviceHandle) -> Result<(), HarnessError> {
        self.lifecycle.check("load", &[ProfilerState::Unloaded])?;
        if !self.config_file.is_file() {
            return Err(HarnessError::config(
                format!(
                    "Config file not found on host. Is {} the correct path?",
                    self.config_file.display()
                ),
                "",
            ));
        }
        let file_name = self
            .config_file
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        self.config_device_path = format!("{CONFIG_DEVICE_PATH}{file_name}");
        device.push(&self.config_file, &self.config_device_path)?;
        self.lifecycle.load()
    }

    fn set_output(&mut self, dir: &Path) {
        self.output_dir = dir.to_path_buf();
    }

    fn start_profiling(
        &mut self,
        device: &DeviceHandle,
        _options: &StartOptions,
    ) -> Result<(), HarnessError> {
        self.lifecycle.check("start_profiling", &[ProfilerState::Loaded])?;
        let trace_id = new_trace_id();
        self.trace_device_path = format!(
            "{TRACES_DEVICE_PATH}{}.perfetto_trace",
            (self.clock)().format("%Y_%m_%dT%H_%M_%S_%6f")
        );

        let output = device
            .exec_shell(&self.launch_command())
            .map_err(|err| err.with_trace(&trace_id))?;
        if !output.stderr.trim().is_empty() {
            return Err(HarnessError::profiler(
                format!("Perfetto: failed to start tracing: {}", output.stderr.trim()),
                &trace_id,
            ));
        }

        let reported = output.stdout.trim();
        let pid = if reported.is_empty() {
            debug!(trace_id = %trace_id, "perfetto did not report a pid, querying process table");
            let listing = device.shell(PID_QUERY).map_err(|err| err.with_trace(&trace_id))?;
            single_pid(&listing).map_err(|err| err.with_trace(&trace_id))?
        } else {
            reported.to_string()
        };
        info!(
            trace_id = %trace_id,
            device = %device.id(),
            pid = %pid,
            trace = %self.trace_device_path,
            "perfetto tracing started"
        );
        self.device_pid = Some(pid);
        self.lifecycle.start()
    }

    fn stop_profiling(&mut self, device: &DeviceHandle) -> Result<(), HarnessError> {
        self.lifecycle.check("stop_profiling", &[ProfilerState::Profiling])?;
        if let Some(pid) = &self.device_pid {
            device.shell(&format!("kill {pid}"))?;
        }
        self.lifecycle.stop()
    }

    fn collect_results(&mut self, device: &DeviceHandle) -> Result<(), HarnessError> {
        self.lifecycle.collect()?;
        device.pull(&self.trace_device_path, &self.output_dir)?;
        device.shell(&format!("rm -f {}", self.trace_device_path))?;
        Ok(())
    }

    fn unload(&mut self, device: &DeviceHandle) -> Result<(), HarnessError> {
        self.lifecycle
            .check("unload", &[ProfilerState::Loaded, ProfilerState::Stopped])?;
        device.shell(&format!("rm -Rf {}", self.config_device_path))?;
        self.device_pid = None;
        self.lifecycle.unload()
    }

    /// Traces are binary; there is nothing to average.
    fn aggregate_subject(&self) -> Result<SubjectRow, HarnessError> {
        Ok(SubjectRow::new())
    }

    fn aggregate_end(
        &self,
        data_dir: &Path,
        _output_file: &Path,
    ) -> Result<Vec<FinalRow>, HarnessError> {
        debug!(data_dir = %data_dir.display(), "perfetto traces are not aggregated");
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::adb::CommandOutput;
    use crate::app::testing::{Call, FakeDevice};
    use chrono::NaiveDate;
    use std::sync::Arc;

    fn fixed_clock() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2020, 12, 31)
            .and_then(|d| d.and_hms_micro_opt(21, 40, 22, 610621))
            .unwrap()
    }

    const TRACE: &str = "/data/misc/perfetto-traces/2020_12_31T21_40_22_610621.perfetto_trace";

    fn tracer(dir: &Path, format: &str) -> PerfettoTracer {
        let config_file = dir.join("perfetto_config.pbtx");
        std::fs::write(&config_file, "buffers { size_kb: 1024 }").unwrap();
        let config = ProfilerConfig {
            config_file: Some(config_file),
            config_file_format: Some(format.to_string()),
            ..ProfilerConfig::default()
        };
        PerfettoTracer::new(&config).unwrap().with_clock(fixed_clock)
    }

    fn launch(format_flag: &str) -> String {
        format!(
            "cat /data/misc/perfetto-configs/perfetto_config.pbtx | perfetto --background{format_flag} -c - -o {TRACE}"
        )
    }

    fn reply(stdout: &str, stderr: &str) -> CommandOutput {
        CommandOutput {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            exit_code: Some(0),
        }
    }

    fn loaded(dir: &Path, format: &str) -> (PerfettoTracer, Arc<FakeDevice>) {
        let mut tracer = tracer(dir, format);
        let device = FakeDevice::new("20");
        tracer.load(&device.handle()).unwrap();
        (tracer, device)
    }

    #[test]
    fn new_requires_config_file() {
        let err = PerfettoTracer::new(&ProfilerConfig::default()).err().expect("error");
        assert_eq!(err.code, "ERR_CONFIG");
    }

    #[test]
    fn load_pushes_config() {
        let dir = tempfile::tempdir().unwrap();
        let (tracer, device) = loaded(dir.path(), "text");
        assert_eq!(
            tracer.config_device_path(),
            "/data/misc/perfetto-configs/perfetto_config.pbtx"
        );
        assert_eq!(
            device.calls(),
            vec![Call::Push(
                dir.path().join("perfetto_config.pbtx"),
                "/data/misc/perfetto-configs/perfetto_config.pbtx".to_string()
            )]
        );
    }

    #[test]
    fn load_reports_missing_host_config() {
        let config = ProfilerConfig {
            config_file: Some(PathBuf::from("/home/user/no_file.pbtx")),
            ..ProfilerConfig::default()
        };
        let mut tracer = PerfettoTracer::new(&config).unwrap();
        let device = FakeDevice::new("20");
        let err = tracer.load(&device.handle()).unwrap_err();
        assert_eq!(err.code, "ERR_CONFIG");
        assert_eq!(
            err.error,
            "Config file not found on host. Is /home/user/no_file.pbtx the correct path?"
        );
        assert!(device.calls().is_empty());
    }

    #[test]
    fn start_with_text_config_records_reported_pid() {
        let dir = tempfile::tempdir().unwrap();
        let (mut tracer, device) = loaded(dir.path(), "text");
        device.on_shell_output(&launch(" --txt"), reply("42\n", ""));

        tracer.start_profiling(&device.handle(), &StartOptions::default()).unwrap();

        assert_eq!(tracer.trace_device_path(), TRACE);
        assert_eq!(tracer.device_pid(), Some("42"));
        assert_eq!(device.shell_calls(), vec![launch(" --txt")]);
    }

    #[test]
    fn start_with_binary_config_omits_txt_flag() {
        let dir = tempfile::tempdir().unwrap();
        let (mut tracer, device) = loaded(dir.path(), "binary");
        device.on_shell_output(&launch(""), reply("42", ""));

        tracer.start_profiling(&device.handle(), &StartOptions::default()).unwrap();

        assert_eq!(tracer.device_pid(), Some("42"));
    }

    #[test]
    fn launch_error_stream_is_profiler_error() {
        let dir = tempfile::tempdir().unwrap();
        let (mut tracer, device) = loaded(dir.path(), "binary");
        device.on_shell_output(&launch(""), reply("", "Error"));

        let err = tracer
            .start_profiling(&device.handle(), &StartOptions::default())
            .unwrap_err();

        assert_eq!(err.code, "ERR_PROFILER");
        assert!(!err.trace_id.is_empty());
        assert_eq!(tracer.state(), ProfilerState::Loaded);
    }

    #[test]
    fn missing_pid_falls_back_to_process_table() {
        let dir = tempfile::tempdir().unwrap();
        let (mut tracer, device) = loaded(dir.path(), "binary");
        device.on_shell_output(&launch(""), reply("", ""));
        device.on_shell(PID_QUERY, "22\n");

        tracer.start_profiling(&device.handle(), &StartOptions::default()).unwrap();

        assert_eq!(tracer.device_pid(), Some("22"));
        assert_eq!(device.shell_calls(), vec![launch(""), PID_QUERY.to_string()]);
    }

    #[test]
    fn ambiguous_process_table_is_profiler_error() {
        let dir = tempfile::tempdir().unwrap();
        let (mut tracer, device) = loaded(dir.path(), "binary");
        device.on_shell_output(&launch(""), reply("", ""));
        device.on_shell(PID_QUERY, "22 23 24");

        let err = tracer
            .start_profiling(&device.handle(), &StartOptions::default())
            .unwrap_err();

        assert_eq!(err.code, "ERR_PROFILER");
        assert_eq!(tracer.device_pid(), None);
    }

    #[test]
    fn single_pid_requires_exactly_one_token() {
        assert_eq!(single_pid(" 22 \n").unwrap(), "22");
        assert!(single_pid("").is_err());
        assert!(single_pid("22\n23").is_err());
    }

    #[test]
    fn stop_collect_unload_clean_up_the_device() {
        let dir = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let (mut tracer, device) = loaded(dir.path(), "text");
        let handle = device.handle();
        tracer.set_output(out.path());
        device.on_shell_output(&launch(" --txt"), reply("42", ""));
        device.on_pull(TRACE, "trace-bytes");

        tracer.start_profiling(&handle, &StartOptions::default()).unwrap();
        tracer.stop_profiling(&handle).unwrap();
        tracer.collect_results(&handle).unwrap();
        tracer.unload(&handle).unwrap();

        assert_eq!(
            device.shell_calls()[1..],
            [
                "kill 42".to_string(),
                format!("rm -f {TRACE}"),
                "rm -Rf /data/misc/perfetto-configs/perfetto_config.pbtx".to_string(),
            ]
        );
        assert!(device
            .calls()
            .contains(&Call::Pull(TRACE.to_string(), out.path().to_path_buf())));
        assert!(out
            .path()
            .join("2020_12_31T21_40_22_610621.perfetto_trace")
            .is_file());
    }

    #[test]
    fn aggregation_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let tracer = tracer(dir.path(), "text");
        assert!(tracer.aggregate_subject().unwrap().is_empty());
        let out = dir.path().join("final.csv");
        assert!(tracer.aggregate_end(dir.path(), &out).unwrap().is_empty());
        assert!(!out.exists());
    }
}
