use serde::Deserialize;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

use crate::app::error::HarnessError;

pub const CONFIG_PATH_ENV: &str = "ANDROID_RUNNER_CONFIG_PATH";

/// One script entry of a hook, before it is loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptDescriptor {
    pub kind: String,
    pub path: PathBuf,
    /// Seconds; 0 means unbounded.
    pub timeout: u64,
    pub logcat_regex: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawDescriptor {
    #[serde(rename = "type")]
    kind: String,
    path: PathBuf,
    #[serde(default)]
    timeout: u64,
    #[serde(default)]
    logcat_regex: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ProfilerConfig {
    /// Milliseconds between samples; 0 samples once.
    #[serde(default)]
    pub sample_interval: u64,
    #[serde(default)]
    pub data_points: Vec<String>,
    #[serde(default)]
    pub config_file: Option<PathBuf>,
    #[serde(default)]
    pub config_file_format: Option<String>,
    #[serde(default)]
    pub preferences: Map<String, Value>,
    #[serde(default)]
    pub package: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExperimentConfig {
    #[serde(default)]
    pub adb_path: String,
    #[serde(default)]
    pub devices: Vec<String>,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub scripts: Map<String, Value>,
    #[serde(default)]
    pub profilers: Map<String, Value>,
    /// Directory relative paths are resolved against.
    #[serde(skip)]
    pub config_dir: PathBuf,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

impl ExperimentConfig {
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.config_dir.join(path)
        }
    }

    /// Hook descriptors in file order, with script paths resolved.
    pub fn hooks(&self) -> Result<Vec<(String, Vec<ScriptDescriptor>)>, HarnessError> {
        let mut hooks = Vec::with_capacity(self.scripts.len());
        for (name, value) in &self.scripts {
            let descriptors = match value {
                Value::String(path) => vec![ScriptDescriptor {
                    kind: "python3".to_string(),
                    path: self.resolve(Path::new(path)),
                    timeout: 0,
                    logcat_regex: None,
                }],
                Value::Array(items) => items
                    .iter()
                    .map(|item| self.descriptor(name, item))
                    .collect::<Result<Vec<_>, _>>()?,
                other => {
                    return Err(HarnessError::config(
                        format!("Hook {name} must be a path or a list of scripts, got {other}"),
                        "",
                    ))
                }
            };
            hooks.push((name.clone(), descriptors));
        }
        Ok(hooks)
    }

    fn descriptor(&self, hook: &str, value: &Value) -> Result<ScriptDescriptor, HarnessError> {
        let raw: RawDescriptor = serde_json::from_value(value.clone()).map_err(|err| {
            HarnessError::config(format!("Invalid script in hook {hook}: {err}"), "")
        })?;
        Ok(ScriptDescriptor {
            kind: raw.kind,
            path: self.resolve(&raw.path),
            timeout: raw.timeout,
            logcat_regex: raw.logcat_regex,
        })
    }

    pub fn profiler(&self, name: &str) -> Result<Option<ProfilerConfig>, HarnessError> {
        let Some(value) = self.profilers.get(name) else {
            return Ok(None);
        };
        let mut config: ProfilerConfig = serde_json::from_value(value.clone()).map_err(|err| {
            HarnessError::config(format!("Invalid config for profiler {name}: {err}"), "")
        })?;
        if let Some(path) = config.config_file.take() {
            config.config_file = Some(self.resolve(&path));
        }
        Ok(Some(config))
    }

    pub fn profiler_names(&self) -> Vec<String> {
        self.profilers.keys().cloned().collect()
    }
}

pub fn config_path() -> PathBuf {
    match std::env::var(CONFIG_PATH_ENV) {
        Ok(path) if !path.trim().is_empty() => PathBuf::from(path),
        _ => PathBuf::from("config.json"),
    }
}

pub fn load_config_from_path(path: &Path) -> Result<ExperimentConfig, HarnessError> {
    if !path.is_file() {
        return Err(HarnessError::config(
            format!("Config file not found: {}", path.display()),
            "",
        ));
    }
    let raw = fs::read_to_string(path).map_err(|err| {
        HarnessError::config(format!("Failed to read config {}: {err}", path.display()), "")
    })?;
    let mut config: ExperimentConfig = serde_json::from_str(&raw).map_err(|err| {
        HarnessError::config(format!("Failed to parse config {}: {err}", path.display()), "")
    })?;
    config.config_dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(dir: &Path, value: serde_json::Value) -> PathBuf {
        let path = dir.join("config.json");
        fs::write(&path, serde_json::to_string_pretty(&value).unwrap()).unwrap();
        path
    }

    #[test]
    fn hooks_keep_file_order_and_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            serde_json::json!({
                "scripts": {
                    "before_run": "scripts/before.py",
                    "interaction": [
                        {"type": "shell", "path": "scripts/tap.sh", "timeout": 30, "logcat_regex": "Done"},
                        {"type": "python3", "path": "/abs/idle.py"}
                    ],
                    "after_run": "scripts/after.py"
                }
            }),
        );
        let config = load_config_from_path(&path).unwrap();
        let hooks = config.hooks().unwrap();

        let names: Vec<&str> = hooks.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["before_run", "interaction", "after_run"]);

        let before = &hooks[0].1[0];
        assert_eq!(before.kind, "python3");
        assert_eq!(before.path, dir.path().join("scripts/before.py"));
        assert_eq!(before.timeout, 0);
        assert_eq!(before.logcat_regex, None);

        let interaction = &hooks[1].1;
        assert_eq!(interaction.len(), 2);
        assert_eq!(interaction[0].kind, "shell");
        assert_eq!(interaction[0].timeout, 30);
        assert_eq!(interaction[0].logcat_regex.as_deref(), Some("Done"));
        assert_eq!(interaction[1].path, PathBuf::from("/abs/idle.py"));
    }

    #[test]
    fn descriptor_without_path_is_config_error() {
        let config = ExperimentConfig {
            scripts: serde_json::json!({"interaction": [{"type": "python3"}]})
                .as_object()
                .cloned()
                .unwrap(),
            ..ExperimentConfig::default()
        };
        let err = config.hooks().unwrap_err();
        assert_eq!(err.code, "ERR_CONFIG");
        assert!(err.error.contains("interaction"));
    }

    #[test]
    fn profiler_defaults_and_relative_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            serde_json::json!({
                "profilers": {
                    "android": {"data_points": ["cpu"]},
                    "perfetto": {"config_file": "perfetto.pbtx", "config_file_format": "text"}
                }
            }),
        );
        let config = load_config_from_path(&path).unwrap();

        let android = config.profiler("android").unwrap().unwrap();
        assert_eq!(android.sample_interval, 0);
        assert_eq!(android.data_points, vec!["cpu"]);

        let perfetto = config.profiler("perfetto").unwrap().unwrap();
        assert_eq!(perfetto.config_file, Some(dir.path().join("perfetto.pbtx")));
        assert!(config.profiler("trepn").unwrap().is_none());
        assert_eq!(config.profiler_names(), vec!["android", "perfetto"]);
    }

    #[test]
    fn missing_config_file_is_config_error() {
        let err = load_config_from_path(Path::new("/this/should/not/exist.json")).unwrap_err();
        assert_eq!(err.code, "ERR_CONFIG");
    }
}
