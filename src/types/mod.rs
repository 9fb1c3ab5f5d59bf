//! Core types for the notification core.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (SilenceId, GroupKey)
//! - **Alerts**: Label sets, fingerprints, batch identity
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Configuration structures for stores and pipeline

mod alert;
mod config;
mod errors;
mod ids;

pub use alert::{batch_hash, batch_resolved, Alert, AlertStatus, Fingerprint, LabelSet};
pub use config::{
    Config, NflogConfig, ObservabilityConfig, PipelineConfig, SilencesConfig,
};
pub use errors::{Error, Result};
pub use ids::{GroupKey, SilenceId};
