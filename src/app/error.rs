use serde::Serialize;

#[derive(Debug, Clone, Serialize, thiserror::Error)]
#[error("{error} ({code})")]
pub struct HarnessError {
    pub error: String,
    pub code: String,
    pub trace_id: String,
}

impl HarnessError {
    pub fn new(code: impl Into<String>, message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            code: code.into(),
            trace_id: trace_id.into(),
        }
    }

    pub fn config(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new("ERR_CONFIG", message, trace_id)
    }

    pub fn script_not_found(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new("ERR_SCRIPT_NOT_FOUND", message, trace_id)
    }

    pub fn script_load(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new("ERR_SCRIPT_LOAD", message, trace_id)
    }

    pub fn script(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new("ERR_SCRIPT", message, trace_id)
    }

    pub fn profiler(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new("ERR_PROFILER", message, trace_id)
    }

    pub fn lifecycle(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new("ERR_LIFECYCLE", message, trace_id)
    }

    pub fn aggregation(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new("ERR_AGGREGATION", message, trace_id)
    }

    pub fn device(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new("ERR_DEVICE", message, trace_id)
    }

    pub fn system(message: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self::new("ERR_SYSTEM", message, trace_id)
    }

    /// Rebinds the error to the trace id of the operation that observed it.
    pub fn with_trace(mut self, trace_id: &str) -> Self {
        if self.trace_id.is_empty() {
            self.trace_id = trace_id.to_string();
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_message_and_code() {
        let err = HarnessError::profiler("no perfetto process", "trace-1");
        assert_eq!(err.to_string(), "no perfetto process (ERR_PROFILER)");
        assert_eq!(err.trace_id, "trace-1");
    }

    #[test]
    fn with_trace_keeps_existing_trace_id() {
        let err = HarnessError::device("adb failed", "").with_trace("trace-2");
        assert_eq!(err.trace_id, "trace-2");
        let err = HarnessError::device("adb failed", "trace-1").with_trace("trace-2");
        assert_eq!(err.trace_id, "trace-1");
    }
}
