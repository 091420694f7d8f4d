//! Error types for the bulk-send engine.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Send error: {0}")]
    Send(#[from] SendError),

    #[error("Sheet error: {0}")]
    Sheet(#[from] SheetError),

    /// A client exceeded its HTTP request allowance.
    #[error("Rate limit exceeded. Maximum {limit} requests per {window_secs} seconds.")]
    RateLimited { limit: u32, window_secs: u32 },
}

impl Error {
    /// Stable, coarse error code for external callers.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIGURATION_ERROR",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Job(JobError::NotFound { .. }) => "JOB_NOT_FOUND",
            Self::Job(JobError::MaxJobsExceeded { .. }) => "MAX_JOBS_EXCEEDED",
            Self::Job(_) => "JOB_ERROR",
            Self::Send(_) => "SEND_ERROR",
            Self::Sheet(SheetError::NotFound { .. }) => "FILE_NOT_FOUND",
            Self::Sheet(_) => "FILE_PARSE_ERROR",
            Self::RateLimited { .. } => "RATE_LIMIT_EXCEEDED",
        }
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Request validation errors. Rejected synchronously at job creation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Message template is empty")]
    EmptyTemplate,

    #[error("File {file_id} has no phone column")]
    MissingPhoneColumn { file_id: Uuid },

    #[error("Phone column {column} is not a header of the file")]
    UnknownPhoneColumn { column: String },

    #[error("Condition #{index} has an empty column name")]
    EmptyConditionColumn { index: usize },

    #[error("Condition #{index} references unknown column {column}")]
    UnknownConditionColumn { index: usize, column: String },

    #[error("No recipients matched the conditions")]
    NoRecipients,
}

/// Job-related errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: Uuid },

    #[error("Job {id} already in state {state}, cannot transition to {target}")]
    InvalidTransition {
        id: Uuid,
        state: String,
        target: String,
    },

    #[error("Maximum concurrent jobs ({max}) exceeded")]
    MaxJobsExceeded { max: usize },

    #[error("Job {id} is still active and cannot be purged")]
    StillActive { id: Uuid },
}

/// Failures reported by the outbound message transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// Network hiccup, channel busy, 5xx. Retried.
    #[error("Transient send failure: {0}")]
    Transient(String),

    /// Recipient-level permanent failure (invalid number, blocked). Not retried.
    #[error("Recipient rejected: {0}")]
    Rejected(String),

    /// The transport itself is gone. Aborts the whole job.
    #[error("Transport unavailable: {0}")]
    Fatal(String),

    #[error("Send timed out after {0:?}")]
    Timeout(Duration),
}

impl SendError {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    /// Coarse reason shown to observers. The raw text stays on the attempt.
    pub fn public_reason(&self) -> &'static str {
        match self {
            Self::Transient(_) => "temporary delivery failure",
            Self::Rejected(_) => "recipient rejected the message",
            Self::Fatal(_) => "campaign aborted: messaging channel unavailable",
            Self::Timeout(_) => "delivery timed out",
        }
    }
}

/// Sheet (uploaded file) errors.
#[derive(Debug, thiserror::Error)]
pub enum SheetError {
    #[error("File {id} not found")]
    NotFound { id: Uuid },

    #[error("Row {row} has {found} cells, expected {expected}")]
    RaggedRow {
        row: usize,
        found: usize,
        expected: usize,
    },

    #[error("File has no headers")]
    NoHeaders,
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
