use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use android_runner_lib::app::adb::{AdbDevice, DeviceHandle};
use android_runner_lib::app::config::{config_path, load_config_from_path, ExperimentConfig, ProfilerConfig};
use android_runner_lib::app::error::HarnessError;
use android_runner_lib::app::logging::{init_logging, new_trace_id};
use android_runner_lib::app::profilers::{build_profiler, missing_dependencies, StartOptions};
use android_runner_lib::app::scripts::{ScriptContext, ScriptOutcome, ScriptRegistry};
use serde::Serialize;
use tracing::{error, info};

const USAGE: &str = "Usage:\n  \
    harness hook --hook NAME [--config FILE] [--serial SERIAL]\n  \
    harness profile --profiler NAME --out DIR [--config FILE] [--serial SERIAL] [--duration SECS] [--app PACKAGE]\n  \
    harness aggregate --profiler NAME --data DIR --out FILE [--config FILE]\n";

#[derive(Debug, Clone)]
enum Command {
    Hook {
        hook: String,
    },
    Profile {
        profiler: String,
        out_dir: PathBuf,
        duration: Duration,
        app: Option<String>,
    },
    Aggregate {
        profiler: String,
        data_dir: PathBuf,
        out_file: PathBuf,
    },
}

#[derive(Debug, Clone)]
struct Args {
    command: Command,
    config: PathBuf,
    serial: Option<String>,
}

#[derive(Serialize)]
struct Summary {
    tool: &'static str,
    command: &'static str,
    status: &'static str,
    trace_id: String,
    duration_ms: u128,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    outcomes: Vec<OutcomeSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rows: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    metrics: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
struct OutcomeSummary {
    script: String,
    outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

fn required(value: Option<String>, flag: &str) -> Result<String, String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| format!("{flag} requires a value"))
}

fn parse_args() -> Result<Args, String> {
    let mut it = std::env::args().skip(1);
    let command = it.next().ok_or_else(|| USAGE.to_string())?;

    let mut config = config_path();
    let mut serial = std::env::var("ANDROID_SERIAL")
        .ok()
        .filter(|s| !s.trim().is_empty());
    let mut hook: Option<String> = None;
    let mut profiler: Option<String> = None;
    let mut data_dir: Option<PathBuf> = None;
    let mut out: Option<PathBuf> = None;
    let mut duration = Duration::from_secs(10);
    let mut app: Option<String> = None;

    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--config" => config = PathBuf::from(required(it.next(), "--config")?),
            "--serial" => serial = Some(required(it.next(), "--serial")?),
            "--hook" => hook = Some(required(it.next(), "--hook")?),
            "--profiler" => profiler = Some(required(it.next(), "--profiler")?),
            "--data" => data_dir = Some(PathBuf::from(required(it.next(), "--data")?)),
            "--out" => out = Some(PathBuf::from(required(it.next(), "--out")?)),
            "--app" => app = Some(required(it.next(), "--app")?),
            "--duration" => {
                let value = required(it.next(), "--duration")?;
                let secs: u64 = value
                    .parse()
                    .map_err(|_| format!("--duration must be whole seconds, got {value}"))?;
                duration = Duration::from_secs(secs);
            }
            "-h" | "--help" => return Err(USAGE.to_string()),
            other => return Err(format!("Unknown arg: {other}")),
        }
    }

    let command = match command.as_str() {
        "hook" => Command::Hook {
            hook: hook.ok_or("hook requires --hook")?,
        },
        "profile" => Command::Profile {
            profiler: profiler.ok_or("profile requires --profiler")?,
            out_dir: out.ok_or("profile requires --out")?,
            duration,
            app,
        },
        "aggregate" => Command::Aggregate {
            profiler: profiler.ok_or("aggregate requires --profiler")?,
            data_dir: data_dir.ok_or("aggregate requires --data")?,
            out_file: out.ok_or("aggregate requires --out")?,
        },
        "-h" | "--help" => return Err(USAGE.to_string()),
        other => return Err(format!("Unknown command: {other}\n{USAGE}")),
    };

    Ok(Args {
        command,
        config,
        serial,
    })
}

fn open_device(config: &ExperimentConfig, serial: Option<String>) -> Result<DeviceHandle, HarnessError> {
    let serial = serial
        .or_else(|| config.devices.first().cloned())
        .ok_or_else(|| {
            HarnessError::config("No device: pass --serial, set ANDROID_SERIAL or list devices in the config", "")
        })?;
    Ok(Arc::new(AdbDevice::new(serial, &config.adb_path)))
}

fn profiler_config(config: &ExperimentConfig, name: &str) -> Result<ProfilerConfig, HarnessError> {
    config.profiler(name)?.ok_or_else(|| {
        HarnessError::config(format!("Profiler {name} is not configured"), "")
    })
}

fn run_hook(
    args: &Args,
    hook: &str,
    trace_id: &str,
) -> Result<Vec<OutcomeSummary>, HarnessError> {
    let config = load_config_from_path(&args.config)?;
    let registry = ScriptRegistry::from_config(&config)?;
    let device = open_device(&config, args.serial.clone())?;
    let context = ScriptContext::new()
        .with("hook", hook)
        .with("trace_id", trace_id);
    let names: Vec<String> = registry
        .scripts(hook)
        .iter()
        .map(|script| script.name().to_string())
        .collect();
    let outcomes = registry.run(hook, &device, &context);
    let failed = outcomes.iter().any(|o| matches!(o, ScriptOutcome::Failed(_)));
    let summaries = names
        .into_iter()
        .zip(outcomes)
        .map(|(script, outcome)| OutcomeSummary {
            script,
            outcome: outcome.label(),
            detail: match outcome {
                ScriptOutcome::Completed(stdout) if !stdout.is_empty() => Some(stdout),
                ScriptOutcome::Failed(failure) => Some(failure.to_string()),
                _ => None,
            },
        })
        .collect();
    if failed {
        info!(trace_id = %trace_id, hook = %hook, "hook finished with failures");
    }
    Ok(summaries)
}

/// One measured run: load, profile for `duration`, collect, unload and aggregate.
fn run_profile(
    args: &Args,
    name: &str,
    out_dir: &Path,
    duration: Duration,
    app: Option<&str>,
    trace_id: &str,
) -> Result<usize, HarnessError> {
    let config = load_config_from_path(&args.config)?;
    let profiler_config = profiler_config(&config, name)?;
    let device = open_device(&config, args.serial.clone())?;
    let mut profiler = build_profiler(name, &profiler_config, out_dir)?;
    let run_dir = out_dir.join(profiler.name());
    std::fs::create_dir_all(&run_dir).map_err(|err| {
        HarnessError::system(format!("Failed to create dir {}: {err}", run_dir.display()), trace_id)
    })?;
    let missing = missing_dependencies(profiler.as_ref(), &device)?;
    if !missing.is_empty() {
        return Err(HarnessError::profiler(
            format!("Missing packages on {}: {}", device.id(), missing.join(", ")),
            trace_id,
        ));
    }
    let options = StartOptions {
        app: app.map(str::to_string),
    };

    profiler.set_output(&run_dir);
    profiler.load(&device)?;
    profiler.start_profiling(&device, &options)?;
    info!(trace_id = %trace_id, profiler = %name, duration_s = duration.as_secs(), "profiling");
    thread::sleep(duration);
    let stopped = profiler.stop_profiling(&device);
    let collected = stopped.and_then(|_| profiler.collect_results(&device));
    profiler.unload(&device)?;
    collected?;
    Ok(profiler.aggregate_subject()?.len())
}

fn run_aggregate(
    args: &Args,
    name: &str,
    data_dir: &Path,
    out_file: &Path,
) -> Result<usize, HarnessError> {
    let profiler_config = match load_config_from_path(&args.config) {
        Ok(config) => config.profiler(name)?.unwrap_or_default(),
        Err(_) => ProfilerConfig::default(),
    };
    let work_dir = std::env::temp_dir().join(format!("android_runner_{}", new_trace_id()));
    let profiler = build_profiler(name, &profiler_config, &work_dir)?;
    let rows = profiler.aggregate_end(data_dir, out_file)?;
    let _ = std::fs::remove_dir_all(&work_dir);
    Ok(rows.len())
}

fn main() {
    let args = match parse_args() {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("{msg}");
            std::process::exit(2);
        }
    };
    init_logging("info");

    let trace_id = new_trace_id();
    let start = Instant::now();
    let mut summary = Summary {
        tool: "android_runner_harness",
        command: "",
        status: "pass",
        trace_id: trace_id.clone(),
        duration_ms: 0,
        outcomes: Vec::new(),
        rows: None,
        metrics: None,
        error_code: None,
        error: None,
    };

    let result = match &args.command {
        Command::Hook { hook } => {
            summary.command = "hook";
            run_hook(&args, hook, &trace_id).map(|outcomes| {
                if outcomes.iter().any(|o| o.outcome == "failed") {
                    summary.status = "warn";
                }
                summary.outcomes = outcomes;
            })
        }
        Command::Profile {
            profiler,
            out_dir,
            duration,
            app,
        } => {
            summary.command = "profile";
            run_profile(&args, profiler, out_dir, *duration, app.as_deref(), &trace_id)
                .map(|metrics| summary.metrics = Some(metrics))
        }
        Command::Aggregate {
            profiler,
            data_dir,
            out_file,
        } => {
            summary.command = "aggregate";
            run_aggregate(&args, profiler, data_dir, out_file).map(|rows| summary.rows = Some(rows))
        }
    };

    summary.duration_ms = start.elapsed().as_millis();
    if let Err(err) = &result {
        let err = err.clone().with_trace(&trace_id);
        error!(trace_id = %trace_id, code = %err.code, error = %err.error, "harness command failed");
        summary.status = "fail";
        summary.error_code = Some(err.code);
        summary.error = Some(err.error);
    }
    println!(
        "{}",
        serde_json::to_string_pretty(&summary).unwrap_or_default()
    );
    if result.is_err() {
        std::process::exit(1);
    }
}
