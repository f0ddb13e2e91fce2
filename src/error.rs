use crate::config::ConfigError;

/// Error type for the job orchestration layer
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    // Resource errors
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    Conflict(String),

    // Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    // Queue-level errors (submission rejected, queue closed, ...)
    #[error("Queue error: {0}")]
    Queue(String),

    // Broker transport errors
    #[error("Broker error: {0}")]
    Broker(String),

    // Job payload/result serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Startup/configuration faults - fatal, never retried
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<redis::RedisError> for AppError {
    fn from(err: redis::RedisError) -> Self {
        AppError::Broker(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

/// Result type alias for the orchestration layer
pub type AppResult<T> = Result<T, AppError>;
