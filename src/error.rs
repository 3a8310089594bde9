//! Error types for reliq.

use thiserror::Error;

use crate::model::JobId;

/// A failure raised by a job payload, captured onto the record before
/// being re-raised so the transport's retry policy can take over.
#[derive(Debug, Clone, Error)]
#[error("{error_type}: {message}")]
pub struct PayloadError {
    /// Classification of the failure (the payload's error type name).
    pub error_type: String,
    pub message: String,
}

impl PayloadError {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("invalid job record: {0}")]
    Validation(String),

    #[error("unknown uniqueness strategy: {0}")]
    UnknownUniquenessStrategy(String),

    #[error("unknown enqueue conflict resolution strategy: {0}")]
    UnknownConflictStrategy(String),

    #[error("job class not registered: {0}")]
    UnknownJobClass(String),

    #[error("job {0} is already completed or dropped")]
    Unprocessable(JobId),

    #[error("payload execution failed: {0}")]
    Payload(#[from] PayloadError),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("invalid cron expression {expr:?}: {reason}")]
    InvalidCron { expr: String, reason: String },

    #[error("transport error: {0}")]
    Transport(String),
}

pub type Result<T> = std::result::Result<T, Error>;
