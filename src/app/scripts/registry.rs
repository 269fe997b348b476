use tracing::{debug, warn};

use crate::app::adb::DeviceHandle;
use crate::app::config::{ExperimentConfig, ScriptDescriptor};
use crate::app::error::HarnessError;
use crate::app::logging::new_trace_id;
use crate::app::scripts::{Script, ScriptContext, ScriptOutcome, ScriptRunner};

/// Scripts grouped by experiment hook, loaded once and reused across runs.
#[derive(Debug, Clone, Default)]
pub struct ScriptRegistry {
    hooks: Vec<(String, Vec<Script>)>,
    runner: ScriptRunner,
}

impl ScriptRegistry {
    /// Loads every script up front; any missing or broken script fails construction.
    pub fn from_descriptors(
        hooks: Vec<(String, Vec<ScriptDescriptor>)>,
    ) -> Result<Self, HarnessError> {
        let mut loaded = Vec::with_capacity(hooks.len());
        for (hook, descriptors) in hooks {
            let scripts = descriptors
                .iter()
                .map(Script::load)
                .collect::<Result<Vec<_>, _>>()?;
            debug!(hook = %hook, scripts = scripts.len(), "registered hook");
            loaded.push((hook, scripts));
        }
        Ok(Self {
            hooks: loaded,
            runner: ScriptRunner::default(),
        })
    }

    pub fn from_config(config: &ExperimentConfig) -> Result<Self, HarnessError> {
        Self::from_descriptors(config.hooks()?)
    }

    pub fn with_runner(mut self, runner: ScriptRunner) -> Self {
        self.runner = runner;
        self
    }

    pub fn hook_names(&self) -> Vec<&str> {
        self.hooks.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn scripts(&self, hook: &str) -> &[Script] {
        self.hooks
            .iter()
            .find(|(name, _)| name == hook)
            .map(|(_, scripts)| scripts.as_slice())
            .unwrap_or(&[])
    }

    /// Runs the scripts of `hook` in order. An unknown hook runs nothing.
    pub fn run(
        &self,
        hook: &str,
        device: &DeviceHandle,
        context: &ScriptContext,
    ) -> Vec<ScriptOutcome> {
        debug!(hook = %hook, device = %device.id(), "running hook");
        self.scripts(hook)
            .iter()
            .map(|script| self.runner.run(script, device, context))
            .collect()
    }

    /// Like [`run`](Self::run) but stops at the first failed script.
    pub fn run_checked(
        &self,
        hook: &str,
        device: &DeviceHandle,
        context: &ScriptContext,
    ) -> Result<Vec<ScriptOutcome>, HarnessError> {
        let trace_id = new_trace_id();
        let mut outcomes = Vec::new();
        for script in self.scripts(hook) {
            let outcome = self.runner.run(script, device, context);
            if let ScriptOutcome::Failed(failure) = &outcome {
                warn!(trace_id = %trace_id, hook = %hook, script = %script.name(), error = %failure, "hook aborted");
            }
            outcomes.push(outcome.into_result(script.name(), &trace_id)?);
        }
        Ok(outcomes)
    }
}
