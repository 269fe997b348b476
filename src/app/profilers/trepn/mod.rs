//! Power and memory profiling delegated to the on-device Trepn service.

pub mod filter;
pub mod preferences;

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::app::adb::DeviceHandle;
use crate::app::aggregate::{aggregate_subject_dir, write_subject_row, ColumnPolicy, SubjectRow};
use crate::app::config::ProfilerConfig;
use crate::app::error::HarnessError;
use crate::app::poll::wait_until;
use crate::app::profilers::{Lifecycle, Profiler, ProfilerState, StartOptions};

pub use filter::{filter_columns, filter_data, get_wanted_columns};

pub const NAME: &str = "trepn";
pub const DEFAULT_PACKAGE: &str = "com.quicinc.trepn";
pub const DEVICE_PATH: &str = "/sdcard/trepn/";
pub const REMOTE_PREF_DIR: &str = "/sdcard/trepn/saved_preferences/";

const SERVICE: &str = "com.quicinc.trepn/.TrepnService";
const ACTION_LOAD_PREFERENCES: &str = "com.quicinc.trepn.load_preferences";
const ACTION_START: &str = "com.quicinc.trepn.start_profiling";
const ACTION_STOP: &str = "com.quicinc.trepn.stop_profiling";
const ACTION_EXPORT: &str = "com.quicinc.trepn.export_to_csv";

/// Statistic ids for the named data points Trepn understands.
const STATISTICS: [(&str, &str); 2] = [("battery_power", "332"), ("mem_usage", "328")];

fn is_time_column(name: &str) -> bool {
    name.starts_with("Time")
}

const SUBJECT_COLUMNS: ColumnPolicy = ColumnPolicy {
    skip: is_time_column,
    prefix: "",
};

/// Waits around the service's asynchronous broadcast handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrepnTimings {
    pub launch_settle: Duration,
    pub broadcast_settle: Duration,
    pub restart_settle: Duration,
    pub poll_retries: u32,
    pub poll_interval: Duration,
}

impl Default for TrepnTimings {
    fn default() -> Self {
        Self {
            launch_settle: Duration::from_secs(5),
            broadcast_settle: Duration::from_secs(1),
            restart_settle: Duration::from_secs(2),
            poll_retries: 5,
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Maps a data point name to its statistic id; numeric ids pass through.
pub fn statistic_id(data_point: &str) -> Option<String> {
    let data_point = data_point.trim();
    if !data_point.is_empty() && data_point.chars().all(|c| c.is_ascii_digit()) {
        return Some(data_point.to_string());
    }
    STATISTICS
        .iter()
        .find(|(name, _)| *name == data_point)
        .map(|(_, id)| id.to_string())
}

pub struct TrepnExporter {
    lifecycle: Lifecycle,
    package: String,
    stat_ids: Vec<String>,
    pref_dir: PathBuf,
    output_dir: PathBuf,
    timings: TrepnTimings,
}

impl TrepnExporter {
    /// Resolves the data points and writes the preference bundle under `work_dir`.
    pub fn new(config: &ProfilerConfig, work_dir: &Path) -> Result<Self, HarnessError> {
        let mut stat_ids = Vec::new();
        let mut invalid = Vec::new();
        for point in &config.data_points {
            match statistic_id(point) {
                Some(id) => stat_ids.push(id),
                None => invalid.push(point.clone()),
            }
        }
        if !invalid.is_empty() {
            warn!(invalid = ?invalid, "Invalid data points in config: {:?}", invalid);
        }
        let pref_dir = preferences::build_preferences(work_dir, &config.preferences, &stat_ids)?;
        Ok(Self {
            lifecycle: Lifecycle::new(NAME),
            package: config
                .package
                .clone()
                .unwrap_or_else(|| DEFAULT_PACKAGE.to_string()),
            stat_ids,
            pref_dir,
            output_dir: PathBuf::new(),
            timings: TrepnTimings::default(),
        })
    }

    pub fn with_timings(mut self, timings: TrepnTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn stat_ids(&self) -> &[String] {
        &self.stat_ids
    }

    pub fn pref_dir(&self) -> &Path {
        &self.pref_dir
    }

    fn remote_pref_file() -> String {
        format!("{REMOTE_PREF_DIR}{}", preferences::PREF_DIR_NAME)
    }

    fn export_one(&self, device: &DeviceHandle, db: &str) -> Result<PathBuf, HarnessError> {
        let stem = db.strip_suffix(".db").unwrap_or(db);
        let csv = format!("{}_{stem}.csv", device.id());
        device.shell(&format!(
            "am broadcast -a {ACTION_EXPORT} -e com.quicinc.trepn.export_db_input_file \"{db}\" \
             -e com.quicinc.trepn.export_csv_output_file \"{csv}\""
        ))?;
        wait_until(&csv, self.timings.poll_retries, self.timings.poll_interval, || {
            file_exists_and_not_empty(device, DEVICE_PATH, &csv)
        })?;

        let remote_csv = format!("{DEVICE_PATH}{csv}");
        device.pull(&remote_csv, &self.output_dir)?;
        let local = self.output_dir.join(&csv);
        wait_until(
            &local.display().to_string(),
            self.timings.poll_retries,
            self.timings.poll_interval,
            || Ok(local.exists()),
        )?;

        device.shell(&format!("rm {DEVICE_PATH}{db}"))?;
        device.shell(&format!("rm {remote_csv}"))?;
        filter::filter_results(&local, &self.stat_ids)?;
        Ok(local)
    }
}

/// True once `file` is listed in `dir` on the device and has content.
pub fn file_exists_and_not_empty(
    device: &DeviceHandle,
    dir: &str,
    file: &str,
) -> Result<bool, HarnessError> {
    let listing = device.shell(&format!("ls {dir}"))?;
    if !listing.contains(file) {
        return Ok(false);
    }
    let contents = device.shell(&format!("cat {dir}{file}"))?;
    Ok(!contents.trim().is_empty())
}

impl Profiler for TrepnExporter {
    fn name(&self) -> &'static str {
        NAME
    }

    fn state(&self) -> ProfilerState {
        self.lifecycle.state()
    }

    fn dependencies(&self) -> Vec<String> {
        vec![self.package.clone()]
    }

    fn load(&mut self, device: &DeviceHandle) -> Result<(), HarnessError> {
        self.lifecycle.check("load", &[ProfilerState::Unloaded])?;
        info!(device = %device.id(), package = %self.package, "loading trepn preferences");
        device.push(&self.pref_dir, REMOTE_PREF_DIR)?;
        device.launch_package(&self.package)?;
        thread::sleep(self.timings.launch_settle);
        device.shell(&format!(
            "am broadcast -a {ACTION_LOAD_PREFERENCES} -e com.quicinc.trepn.load_preferences_file \"{}\"",
            Self::remote_pref_file()
        ))?;
        thread::sleep(self.timings.broadcast_settle);
        device.force_stop(&self.package)?;
        thread::sleep(self.timings.restart_settle);
        device.shell(&format!("am startservice {SERVICE}"))?;
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
        device.shell(&format!("am broadcast -a {ACTION_START}"))?;
        self.lifecycle.start()
    }

    fn stop_profiling(&mut self, device: &DeviceHandle) -> Result<(), HarnessError> {
        self.lifecycle.check("stop_profiling", &[ProfilerState::Profiling])?;
        device.shell(&format!("am broadcast -a {ACTION_STOP}"))?;
        self.lifecycle.stop()
    }

    /// Exports every database the service left on the device, then filters each export.
    fn collect_results(&mut self, device: &DeviceHandle) -> Result<(), HarnessError> {
        self.lifecycle.collect()?;
        let listing = device.shell(&format!("ls {DEVICE_PATH} | grep \"\\.db$\""))?;
        let databases: Vec<&str> = listing
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect();
        if databases.is_empty() {
            return Err(HarnessError::profiler(
                format!("Trepn: no database found in {DEVICE_PATH}"),
                "",
            ));
        }
        for db in databases {
            let local = self.export_one(device, db)?;
            debug!(device = %device.id(), file = %local.display(), "trepn export collected");
        }
        Ok(())
    }

    fn unload(&mut self, device: &DeviceHandle) -> Result<(), HarnessError> {
        self.lifecycle
            .check("unload", &[ProfilerState::Loaded, ProfilerState::Stopped])?;
        device.shell(&format!("am stopservice {SERVICE}"))?;
        device.shell(&format!("rm -r {}", Self::remote_pref_file()))?;
        self.lifecycle.unload()
    }

    fn aggregate_subject(&self) -> Result<SubjectRow, HarnessError> {
        let row = aggregate_subject_dir(&self.output_dir, &SUBJECT_COLUMNS)?;
        write_subject_row(&self.output_dir, &row)?;
        Ok(row)
    }
}
