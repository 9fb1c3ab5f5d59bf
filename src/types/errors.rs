//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context.

use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error enum for the notification core.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid silence, matcher, or query parameter. No state change.
    #[error("validation error: {0}")]
    Validation(String),

    /// A hard cap (`max_silences`, `max_silence_size_bytes`) was hit.
    #[error("limit exceeded: {0}")]
    LimitExceeded(String),

    /// Unknown silence id, missing context value, unconfigured receiver.
    #[error("not found: {0}")]
    NotFound(String),

    /// Transient integration failure; retried under backoff.
    #[error("transient notify error: {0}")]
    Transient(String),

    /// Permanent integration failure; surfaced immediately.
    #[error("permanent notify error: {0}")]
    Permanent(String),

    /// Snapshot or gossip payload could not be decoded.
    #[error("state corruption: {0}")]
    Corrupt(String),

    /// Several child failures gathered into one (fanout, GC).
    #[error("{}", format_aggregate(.0))]
    Aggregate(Vec<Error>),

    /// Operation cancelled before completion.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// Deadline exceeded.
    #[error("deadline exceeded: {0}")]
    Timeout(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Metric construction/registration errors.
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn format_aggregate(errs: &[Error]) -> String {
    let msgs: Vec<String> = errs.iter().map(|e| e.to_string()).collect();
    format!("{} errors: [{}]", errs.len(), msgs.join("; "))
}

impl Error {
    /// Whether the retry stage may try again after backoff.
    ///
    /// Cancellation and deadline expiry are final even when the underlying
    /// cause was transient.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }
}

// Convenience constructors
impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn limit_exceeded(msg: impl Into<String>) -> Self {
        Self::LimitExceeded(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Collapse a list of child errors: empty → Ok, one → itself, many →
    /// `Aggregate`.
    pub fn from_many(mut errs: Vec<Error>) -> Result<()> {
        match errs.len() {
            0 => Ok(()),
            1 => Err(errs.remove(0)),
            _ => Err(Error::Aggregate(errs)),
        }
    }
}
