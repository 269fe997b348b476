//! Profiler plugins.
//!
//! Every plugin walks the same [`Lifecycle`]; out-of-order calls are `ERR_LIFECYCLE`. Raw
//! telemetry for a run lands in the directory given to [`Profiler::set_output`], which the
//! subject aggregation later reads back.

pub mod android;
pub mod lifecycle;
pub mod perfetto;
pub mod trepn;

use std::path::Path;

use tracing::warn;

use crate::app::adb::DeviceHandle;
use crate::app::aggregate::{aggregate_final, write_rows, FinalRow, SubjectRow};
use crate::app::config::ProfilerConfig;
use crate::app::error::HarnessError;

pub use android::AndroidSampler;
pub use lifecycle::{Lifecycle, ProfilerState};
pub use perfetto::PerfettoTracer;
pub use trepn::TrepnExporter;

/// Options passed to `start_profiling`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartOptions {
    /// Package under test, when the subject is an app.
    pub app: Option<String>,
}

impl StartOptions {
    pub fn for_app(app: &str) -> Self {
        Self {
            app: Some(app.to_string()),
        }
    }
}

pub trait Profiler: Send {
    /// Directory name the plugin's output lives under.
    fn name(&self) -> &'static str;

    fn state(&self) -> ProfilerState;

    /// Packages that must be installed on the device.
    fn dependencies(&self) -> Vec<String>;

    fn load(&mut self, device: &DeviceHandle) -> Result<(), HarnessError>;

    fn set_output(&mut self, dir: &Path);

    fn start_profiling(
        &mut self,
        device: &DeviceHandle,
        options: &StartOptions,
    ) -> Result<(), HarnessError>;

    fn stop_profiling(&mut self, device: &DeviceHandle) -> Result<(), HarnessError>;

    fn collect_results(&mut self, device: &DeviceHandle) -> Result<(), HarnessError>;

    fn unload(&mut self, device: &DeviceHandle) -> Result<(), HarnessError>;

    /// Reduces the current output directory to one row and writes it as `Aggregated.csv`.
    fn aggregate_subject(&self) -> Result<SubjectRow, HarnessError>;

    /// Collects every subject row under `data_dir` into `output_file`.
    fn aggregate_end(
        &self,
        data_dir: &Path,
        output_file: &Path,
    ) -> Result<Vec<FinalRow>, HarnessError> {
        let rows = aggregate_final(data_dir, self.name())?;
        write_rows(output_file, &rows)?;
        Ok(rows)
    }
}

pub const PROFILER_NAMES: [&str; 3] = [android::NAME, trepn::NAME, perfetto::NAME];

/// Builds the plugin named in the config. `work_dir` receives generated plugin files.
pub fn build_profiler(
    name: &str,
    config: &ProfilerConfig,
    work_dir: &Path,
) -> Result<Box<dyn Profiler>, HarnessError> {
    match name.to_ascii_lowercase().as_str() {
        android::NAME => Ok(Box::new(AndroidSampler::new(config))),
        trepn::NAME => Ok(Box::new(TrepnExporter::new(config, work_dir)?)),
        perfetto::NAME => Ok(Box::new(PerfettoTracer::new(config)?)),
        _ => Err(HarnessError::config(
            format!(
                "Unknown profiler plugin: {name} (expected one of {})",
                PROFILER_NAMES.join(", ")
            ),
            "",
        )),
    }
}

/// Dependencies of `profiler` that `pm list packages` does not report.
pub fn missing_dependencies(
    profiler: &dyn Profiler,
    device: &DeviceHandle,
) -> Result<Vec<String>, HarnessError> {
    let wanted = profiler.dependencies();
    if wanted.is_empty() {
        return Ok(Vec::new());
    }
    let listing = device.shell("pm list packages")?;
    let installed: Vec<&str> = listing
        .lines()
        .filter_map(|line| line.trim().strip_prefix("package:"))
        .collect();
    let missing: Vec<String> = wanted
        .into_iter()
        .filter(|package| !installed.contains(&package.as_str()))
        .collect();
    if !missing.is_empty() {
        warn!(profiler = profiler.name(), device = %device.id(), missing = ?missing, "missing profiler dependencies");
    }
    Ok(missing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::testing::FakeDevice;

    #[test]
    fn build_profiler_knows_each_plugin() {
        let dir = tempfile::tempdir().unwrap();
        let android = build_profiler("android", &ProfilerConfig::default(), dir.path()).unwrap();
        assert_eq!(android.name(), "android");
        assert_eq!(android.state(), ProfilerState::Unloaded);

        let trepn = build_profiler("Trepn", &ProfilerConfig::default(), dir.path()).unwrap();
        assert_eq!(trepn.name(), "trepn");

        let perfetto_config = ProfilerConfig {
            config_file: Some(dir.path().join("trace.pbtx")),
            ..ProfilerConfig::default()
        };
        let perfetto = build_profiler("perfetto", &perfetto_config, dir.path()).unwrap();
        assert_eq!(perfetto.name(), "perfetto");
    }

    #[test]
    fn build_profiler_rejects_unknown_plugin() {
        let dir = tempfile::tempdir().unwrap();
        let err = build_profiler("batterystats", &ProfilerConfig::default(), dir.path())
            .err()
            .expect("expected failure");
        assert_eq!(err.code, "ERR_CONFIG");
        assert!(err.error.contains("batterystats"));
    }

    #[test]
    fn missing_dependencies_reads_package_list() {
        let dir = tempfile::tempdir().unwrap();
        let trepn = build_profiler("trepn", &ProfilerConfig::default(), dir.path()).unwrap();
        let device = FakeDevice::new("device-1");
        device.on_shell("pm list packages", "package:com.android.chrome\npackage:com.example\n");
        assert_eq!(
            missing_dependencies(trepn.as_ref(), &device.handle()).unwrap(),
            vec!["com.quicinc.trepn".to_string()]
        );

        device.on_shell("pm list packages", "package:com.quicinc.trepn\n");
        assert!(missing_dependencies(trepn.as_ref(), &device.handle())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn plugins_without_dependencies_skip_the_device() {
        let dir = tempfile::tempdir().unwrap();
        let android = build_profiler("android", &ProfilerConfig::default(), dir.path()).unwrap();
        let device = FakeDevice::new("device-1");
        assert!(missing_dependencies(android.as_ref(), &device.handle())
            .unwrap()
            .is_empty());
        assert!(device.calls().is_empty());
    }
}
