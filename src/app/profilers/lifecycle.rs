use serde::Serialize;
use tracing::debug;

use crate::app::error::HarnessError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfilerState {
    Unloaded,
    Loaded,
    Profiling,
    Stopped,
}

/// Guards the `Unloaded -> Loaded -> Profiling -> Stopped -> Unloaded` cycle of one profiler.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    profiler: &'static str,
    state: ProfilerState,
}

impl Lifecycle {
    pub fn new(profiler: &'static str) -> Self {
        Self {
            profiler,
            state: ProfilerState::Unloaded,
        }
    }

    pub fn state(&self) -> ProfilerState {
        self.state
    }

    /// Fails with `ERR_LIFECYCLE` unless the current state is one of `from`.
    pub fn check(&self, operation: &str, from: &[ProfilerState]) -> Result<(), HarnessError> {
        if from.contains(&self.state) {
            return Ok(());
        }
        Err(HarnessError::lifecycle(
            format!(
                "{}: {operation} is not allowed while {:?}",
                self.profiler, self.state
            ),
            "",
        ))
    }

    pub fn advance(
        &mut self,
        operation: &str,
        from: &[ProfilerState],
        to: ProfilerState,
    ) -> Result<(), HarnessError> {
        self.check(operation, from)?;
        debug!(profiler = self.profiler, operation, from = ?self.state, to = ?to, "profiler transition");
        self.state = to;
        Ok(())
    }

    pub fn load(&mut self) -> Result<(), HarnessError> {
        self.advance("load", &[ProfilerState::Unloaded], ProfilerState::Loaded)
    }

    pub fn start(&mut self) -> Result<(), HarnessError> {
        self.advance("start_profiling", &[ProfilerState::Loaded], ProfilerState::Profiling)
    }

    pub fn stop(&mut self) -> Result<(), HarnessError> {
        self.advance("stop_profiling", &[ProfilerState::Profiling], ProfilerState::Stopped)
    }

    pub fn collect(&self) -> Result<(), HarnessError> {
        self.check("collect_results", &[ProfilerState::Stopped])
    }

    /// Allowed after a completed run or straight after load.
    pub fn unload(&mut self) -> Result<(), HarnessError> {
        self.advance(
            "unload",
            &[ProfilerState::Loaded, ProfilerState::Stopped],
            ProfilerState::Unloaded,
        )
    }
}
