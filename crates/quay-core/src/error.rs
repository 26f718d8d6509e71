use std::convert::Infallible;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue {0} not found")]
    NotFound(String),

    #[error("Invalid job status: {0}")]
    InvalidStatus(String),

    #[error("Invalid cron expression '{pattern}': {reason}")]
    InvalidCron { pattern: String, reason: String },

    #[error("Invalid job payload: {0}")]
    InvalidPayload(String),

    #[error("Invalid job options: {0}")]
    InvalidOptions(String),

    #[error("Job serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Queue {0} is closed")]
    Closed(String),

    #[error("{0}")]
    Initialization(String),

    #[error("Failed to close {} queue resource(s)", failures.len())]
    CloseFailed { failures: Vec<CloseFailure> },
}

impl QueueError {
    pub fn engine(msg: impl fmt::Display) -> Self {
        Self::Engine(msg.to_string())
    }

    /// Whether the error stems from caller input rather than the engine.
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_)
                | Self::InvalidStatus(_)
                | Self::InvalidCron { .. }
                | Self::InvalidPayload(_)
                | Self::InvalidOptions(_)
                | Self::Config(_)
        )
    }
}

impl From<Infallible> for QueueError {
    fn from(never: Infallible) -> Self {
        match never {}
    }
}

/// One resource that failed to close during a registry shutdown.
#[derive(Debug)]
pub struct CloseFailure {
    /// Queue name, or `"connection"` for the shared store connection
    pub resource: String,
    pub error: QueueError,
}

impl fmt::Display for CloseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.resource, self.error)
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;
