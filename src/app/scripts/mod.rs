//! User-supplied hook scripts.
//!
//! A script is executed in its own process group so that a hang or crash cannot take the harness
//! down with it, and a deadline can kill everything it started. A python3 script is a module
//! defining `main(device, *args)`; the harness imports it and calls `main` with the device id and
//! the experiment context, printing a non-`None` return value. A shell script receives the same
//! two values as its arguments. Both see the device id as `ANDROID_SERIAL`, which `adb` honours.

pub mod registry;
pub mod runner;

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::app::adb::runner::run_command_with_timeout;
use crate::app::config::ScriptDescriptor;
use crate::app::error::HarnessError;

pub use registry::ScriptRegistry;
pub use runner::ScriptRunner;

const LOAD_CHECK_TIMEOUT: Duration = Duration::from_secs(30);

/// Parses the module without running it and requires a top-level `main`.
const PYTHON_LOAD_CHECK: &str = r#"
import ast, sys
path = sys.argv[1]
with open(path) as source:
    tree = ast.parse(source.read(), path)
names = {node.name for node in tree.body if isinstance(node, (ast.FunctionDef, ast.AsyncFunctionDef))}
names |= {target.id for node in tree.body if isinstance(node, ast.Assign)
          for target in node.targets if isinstance(target, ast.Name)}
if "main" not in names:
    sys.exit("AttributeError: %s defines no main(device, *args)" % path)
"#;

/// Imports the module at argv[1] and calls `main(device, context)`.
const PYTHON_MAIN: &str = r#"
import json, os, runpy, sys
path, device, context = sys.argv[1], sys.argv[2], json.loads(sys.argv[3])
sys.path.insert(0, os.path.dirname(path))
result = runpy.run_path(path, run_name="__hook__")["main"](device, context)
if result is not None:
    print(result)
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptKind {
    Python3,
    Shell,
}

impl ScriptKind {
    pub fn parse(value: &str) -> Result<Self, HarnessError> {
        match value.trim() {
            "python3" => Ok(Self::Python3),
            "shell" | "sh" => Ok(Self::Shell),
            other => Err(HarnessError::config(
                format!("Unknown script type: {other}"),
                "",
            )),
        }
    }

    fn interpreter(self) -> &'static str {
        match self {
            Self::Python3 => "python3",
            Self::Shell => "sh",
        }
    }

    /// Arguments that compile the script without running it.
    fn check_args(self, path: &Path) -> Vec<String> {
        let path = path.to_string_lossy().to_string();
        match self {
            Self::Python3 => vec!["-c".to_string(), PYTHON_LOAD_CHECK.to_string(), path],
            Self::Shell => vec!["-n".to_string(), path],
        }
    }

    /// Interpreter arguments placed before the script path.
    fn launch_args(self) -> &'static [&'static str] {
        match self {
            Self::Python3 => &["-c", PYTHON_MAIN],
            Self::Shell => &[],
        }
    }
}

/// Experiment state handed to every script of a hook.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ScriptContext(Map<String, Value>);

impl ScriptContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn to_json(&self) -> String {
        Value::Object(self.0.clone()).to_string()
    }
}

/// Error raised inside a script, reduced to its class name and message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScriptFailure {
    pub kind: String,
    pub message: String,
}

impl ScriptFailure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ScriptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptOutcome {
    /// The script returned; carries its trimmed stdout.
    Completed(String),
    TimedOut,
    PatternMatched,
    Failed(ScriptFailure),
}

impl ScriptOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed(_) => "script",
            Self::TimedOut => "timeout",
            Self::PatternMatched => "logcat",
            Self::Failed(_) => "failed",
        }
    }

    pub fn into_result(self, script: &str, trace_id: &str) -> Result<Self, HarnessError> {
        match self {
            Self::Failed(failure) => Err(HarnessError::script(
                format!("Script {script} failed: {failure}"),
                trace_id,
            )),
            outcome => Ok(outcome),
        }
    }
}

/// A loaded hook script. Loading verifies the file and compiles it once; runs reuse it.
#[derive(Debug, Clone)]
pub struct Script {
    name: String,
    path: PathBuf,
    kind: ScriptKind,
    timeout: Option<Duration>,
    logcat_pattern: Option<Regex>,
}

impl Script {
    pub fn load(descriptor: &ScriptDescriptor) -> Result<Self, HarnessError> {
        let kind = ScriptKind::parse(&descriptor.kind)?;
        if !descriptor.path.is_file() {
            return Err(HarnessError::script_not_found(
                format!("Script not found: {}", descriptor.path.display()),
                "",
            ));
        }
        let path = descriptor.path.canonicalize().map_err(|err| {
            HarnessError::script_load(
                format!("Cannot load {}: {err}", descriptor.path.display()),
                "",
            )
        })?;
        let logcat_pattern = descriptor
            .logcat_regex
            .as_deref()
            .map(|pattern| {
                Regex::new(pattern).map_err(|err| {
                    HarnessError::config(
                        format!("Invalid logcat_regex for {}: {err}", path.display()),
                        "",
                    )
                })
            })
            .transpose()?;

        check_compiles(kind, &path)?;

        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Self {
            name,
            path,
            kind,
            timeout: (descriptor.timeout > 0).then(|| Duration::from_secs(descriptor.timeout)),
            logcat_pattern,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> ScriptKind {
        self.kind
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn logcat_pattern(&self) -> Option<&Regex> {
        self.logcat_pattern.as_ref()
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub(crate) fn command(&self, device_id: &str, context: &ScriptContext) -> Command {
        let mut command = Command::new(self.kind.interpreter());
        command
            .args(self.kind.launch_args())
            .arg(&self.path)
            .arg(device_id)
            .arg(context.to_json())
            .env("ANDROID_SERIAL", device_id);
        if let Some(dir) = self.path.parent() {
            command.current_dir(dir);
        }
        command
    }
}

fn check_compiles(kind: ScriptKind, path: &Path) -> Result<(), HarnessError> {
    let output = run_command_with_timeout(
        kind.interpreter(),
        &kind.check_args(path),
        LOAD_CHECK_TIMEOUT,
        "",
    )
    .map_err(|err| {
        HarnessError::script_load(
            format!("Cannot load {}: {}", path.display(), err.error),
            "",
        )
    })?;
    if !output.success() {
        let detail = output
            .stderr
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .unwrap_or("")
            .trim()
            .to_string();
        return Err(HarnessError::script_load(
            format!("Cannot load {}: {detail}", path.display()),
            "",
        ));
    }
    Ok(())
}
