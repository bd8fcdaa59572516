use std::time::Duration;
use thiserror::Error;

/// Result type for queue operations
pub type QueueResult<T> = Result<T, QueueError>;

/// Infrastructure and supervisor errors
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// Enqueue-time validation failure; nothing is persisted
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Job payload could not be deserialized: {0}")]
    Deserialization(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Process is already running with pid {pid}")]
    AlreadyRunning { pid: i32 },

    #[error("Supervisor is not running: {0}")]
    NotRunning(String),

    #[error("Failed to spawn execution unit: {0}")]
    Spawn(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for QueueError {
    fn from(err: sqlx::Error) -> Self {
        Self::Store(err.to_string())
    }
}

/// Job execution failure - always converted into a store mutation, never propagated
#[derive(Error, Debug, Clone)]
pub enum JobError {
    /// The job's own operation (or one of its hooks) failed
    #[error("{message}")]
    Execution { message: String, trace: Vec<String> },

    /// The payload could not be turned back into an invocable job
    #[error("Job payload could not be deserialized: {0}")]
    Deserialization(String),

    /// Execution exceeded the configured maximum run time
    #[error("execution expired after {0:?}")]
    Expired(Duration),

    /// Job code panicked
    #[error("job panicked: {0}")]
    Panicked(String),
}

impl JobError {
    /// Create an execution error from a message
    pub fn new(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
            trace: Vec::new(),
        }
    }

    /// Create an execution error from any std error, recording its source chain as the trace
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut trace = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            trace.push(format!("caused by: {}", cause));
            source = cause.source();
        }
        Self::Execution {
            message: err.to_string(),
            trace,
        }
    }

    /// Append a trace line
    pub fn with_trace(mut self, line: impl Into<String>) -> Self {
        if let Self::Execution { trace, .. } = &mut self {
            trace.push(line.into());
        }
        self
    }

    /// Short classification used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Execution { .. } => "ExecutionError",
            Self::Deserialization(_) => "DeserializationError",
            Self::Expired(_) => "Expired",
            Self::Panicked(_) => "Panic",
        }
    }

    /// Get the error message (may be empty)
    pub fn message(&self) -> String {
        match self {
            Self::Execution { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Text persisted into `last_error`: message, then one trace line per row
    pub fn last_error_text(&self) -> String {
        let mut text = self.message();
        if let Self::Execution { trace, .. } = self {
            for line in trace {
                text.push('\n');
                text.push_str(line);
            }
        }
        text
    }
}

impl From<QueueError> for JobError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Deserialization(msg) => Self::Deserialization(msg),
            other => Self::new(other.to_string()),
        }
    }
}

impl From<anyhow::Error> for JobError {
    fn from(err: anyhow::Error) -> Self {
        let trace = err.chain().skip(1).map(|cause| format!("caused by: {}", cause)).collect();
        Self::Execution {
            message: err.to_string(),
            trace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_message_renders_empty() {
        let err = JobError::new("");
        assert_eq!(err.last_error_text(), "");
        assert_eq!(err.message(), "");
    }

    #[test]
    fn trace_lines_follow_message() {
        let err = JobError::new("did not work").with_trace("at perform").with_trace("at run");
        assert_eq!(err.last_error_text(), "did not work\nat perform\nat run");
    }

    #[test]
    fn expired_is_distinguishable() {
        let err = JobError::Expired(Duration::from_secs(1));
        assert!(err.last_error_text().contains("expired"));
        assert_eq!(err.kind(), "Expired");
    }

    #[test]
    fn deserialization_queue_error_keeps_its_class() {
        let err: JobError = QueueError::Deserialization("unknown job type".into()).into();
        assert!(matches!(err, JobError::Deserialization(_)));
    }
}
