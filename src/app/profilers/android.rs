//! Periodic CPU and memory sampler driven by `dumpsys`.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::app::adb::DeviceHandle;
use crate::app::aggregate::{
    aggregate_subject_dir, write_subject_row, write_table, ColumnPolicy, SubjectRow,
};
use crate::app::cancel::CancelToken;
use crate::app::config::ProfilerConfig;
use crate::app::error::HarnessError;
use crate::app::logging::new_trace_id;
use crate::app::perf::parse::{
    package_meminfo_command, package_pss_command, parse_cpu_usage, parse_package_pss,
    parse_used_ram, CPU_TOTAL_COMMAND, DEVICE_TIME_COMMAND, USED_RAM_COMMAND,
};
use crate::app::profilers::{Lifecycle, Profiler, ProfilerState, StartOptions};

pub const NAME: &str = "android";
pub const DATA_POINTS: [&str; 2] = ["cpu", "mem"];
const TIME_COLUMN: &str = "datetime";

fn is_time_column(name: &str) -> bool {
    name == TIME_COLUMN
}

const SUBJECT_COLUMNS: ColumnPolicy = ColumnPolicy {
    skip: is_time_column,
    prefix: "android_",
};

type Rows = Arc<Mutex<Vec<Vec<String>>>>;
type Failure = Arc<Mutex<Option<HarnessError>>>;

struct Sampling {
    token: Arc<CancelToken>,
    worker: JoinHandle<()>,
}

pub struct AndroidSampler {
    lifecycle: Lifecycle,
    interval: Duration,
    data_points: Vec<String>,
    output_dir: PathBuf,
    rows: Rows,
    failure: Failure,
    sampling: Option<Sampling>,
}

impl AndroidSampler {
    pub fn new(config: &ProfilerConfig) -> Self {
        let (data_points, invalid): (Vec<String>, Vec<String>) = config
            .data_points
            .iter()
            .cloned()
            .partition(|point| DATA_POINTS.contains(&point.as_str()));
        if !invalid.is_empty() {
            warn!(invalid = ?invalid, "Invalid data points in config: {:?}", invalid);
        }
        let mut header = vec![TIME_COLUMN.to_string()];
        header.extend(data_points.iter().cloned());

        Self {
            lifecycle: Lifecycle::new(NAME),
            interval: Duration::from_millis(config.sample_interval),
            data_points,
            output_dir: PathBuf::new(),
            rows: Arc::new(Mutex::new(vec![header])),
            failure: Arc::new(Mutex::new(None)),
            sampling: None,
        }
    }

    pub fn data_points(&self) -> &[String] {
        &self.data_points
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Header row first, then one row per sample.
    pub fn rows(&self) -> Vec<Vec<String>> {
        lock(&self.rows).clone()
    }

    fn take_failure(&self) -> Option<HarnessError> {
        lock(&self.failure).take()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// One row: the device clock followed by each requested data point.
pub fn sample(
    device: &DeviceHandle,
    data_points: &[String],
    app: Option<&str>,
) -> Result<Vec<String>, HarnessError> {
    let mut row = vec![device.shell(DEVICE_TIME_COMMAND)?.trim().to_string()];
    for point in data_points {
        let value = match point.as_str() {
            "cpu" => cpu_usage(device)?,
            "mem" => mem_usage(device, app)?,
            _ => continue,
        };
        row.push(value);
    }
    Ok(row)
}

pub fn cpu_usage(device: &DeviceHandle) -> Result<String, HarnessError> {
    let output = device.shell(CPU_TOTAL_COMMAND)?;
    parse_cpu_usage(&output).map_err(|err| HarnessError::profiler(format!("Android Profiler: {err}"), ""))
}

/// Device-wide used RAM, or the PSS of `app` when given.
pub fn mem_usage(device: &DeviceHandle, app: Option<&str>) -> Result<String, HarnessError> {
    let Some(app) = app else {
        let output = device.shell(USED_RAM_COMMAND)?;
        return parse_used_ram(&output)
            .map_err(|err| HarnessError::profiler(format!("Android Profiler: {err}"), ""));
    };
    let output = device.shell(&package_pss_command(app))?;
    if let Some(pss) = parse_package_pss(&output) {
        return Ok(pss);
    }
    let detail = device.shell(&package_meminfo_command(app))?;
    Err(HarnessError::profiler(
        format!("Android Profiler: {}", detail.trim()),
        "",
    ))
}

#[allow(clippy::too_many_arguments)]
fn spawn_sampling(
    device: DeviceHandle,
    data_points: Vec<String>,
    app: Option<String>,
    interval: Duration,
    rows: Rows,
    failure: Failure,
    token: Arc<CancelToken>,
    trace_id: String,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        // Checked at fire time so a stop between ticks never yields one more sample.
        if token.is_cancelled() {
            return;
        }
        let started = Instant::now();
        match sample(&device, &data_points, app.as_deref()) {
            Ok(row) => lock(&rows).push(row),
            Err(err) => {
                warn!(trace_id = %trace_id, device = %device.id(), error = %err, "sampling aborted");
                *lock(&failure) = Some(err.with_trace(&trace_id));
                return;
            }
        }
        if interval.is_zero() {
            return;
        }
        if token.wait_timeout(interval.saturating_sub(started.elapsed())) {
            return;
        }
    })
}

impl Profiler for AndroidSampler {
    fn name(&self) -> &'static str {
        NAME
    }

    fn state(&self) -> ProfilerState {
        self.lifecycle.state()
    }

    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    fn load(&mut self, _device: &DeviceHandle) -> Result<(), HarnessError> {
        self.lifecycle.load()
    }

    fn set_output(&mut self, dir: &Path) {
        self.output_dir = dir.to_path_buf();
    }

    /// Starts the sampling chain. A second call while profiling is a no-op.
    fn start_profiling(
        &mut self,
        device: &DeviceHandle,
        options: &StartOptions,
    ) -> Result<(), HarnessError> {
        if self.lifecycle.state() == ProfilerState::Profiling {
            debug!(device = %device.id(), "sampler already running");
            return Ok(());
        }
        self.lifecycle.start()?;
        let trace_id = new_trace_id();
        info!(
            trace_id = %trace_id,
            device = %device.id(),
            interval_ms = u64::try_from(self.interval.as_millis()).unwrap_or(u64::MAX),
            data_points = ?self.data_points,
            "starting android sampler"
        );
        let token = CancelToken::new();
        let worker = spawn_sampling(
            Arc::clone(device),
            self.data_points.clone(),
            options.app.clone(),
            self.interval,
            Arc::clone(&self.rows),
            Arc::clone(&self.failure),
            Arc::clone(&token),
            trace_id,
        );
        self.sampling = Some(Sampling { token, worker });
        Ok(())
    }

    /// Stops the chain after any in-flight sample. Surfaces a failure that ended sampling early.
    fn stop_profiling(&mut self, device: &DeviceHandle) -> Result<(), HarnessError> {
        self.lifecycle.stop()?;
        if let Some(sampling) = self.sampling.take() {
            sampling.token.cancel();
            if sampling.worker.join().is_err() {
                return Err(HarnessError::profiler("Android Profiler: sampling thread panicked", ""));
            }
        }
        debug!(device = %device.id(), samples = lock(&self.rows).len().saturating_sub(1), "android sampler stopped");
        match self.take_failure() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn collect_results(&mut self, device: &DeviceHandle) -> Result<(), HarnessError> {
        self.lifecycle.collect()?;
        let file = self.output_dir.join(format!(
            "{}_{}.csv",
            device.id(),
            chrono::Local::now().format("%Y.%m.%d_%H%M%S")
        ));
        let rows = {
            let mut rows = lock(&self.rows);
            let header = rows.first().cloned().unwrap_or_default();
            std::mem::replace(&mut *rows, vec![header])
        };
        write_table(&file, &rows)?;
        info!(device = %device.id(), file = %file.display(), rows = rows.len(), "android samples written");
        Ok(())
    }

    fn unload(&mut self, _device: &DeviceHandle) -> Result<(), HarnessError> {
        self.lifecycle.unload()
    }

    fn aggregate_subject(&self) -> Result<SubjectRow, HarnessError> {
        let row = aggregate_subject_dir(&self.output_dir, &SUBJECT_COLUMNS)?;
        write_subject_row(&self.output_dir, &row)?;
        Ok(row)
    }
}

impl Drop for AndroidSampler {
    fn drop(&mut self) {
        if let Some(sampling) = self.sampling.take() {
            sampling.token.cancel();
            let _ = sampling.worker.join();
        }
    }
}
