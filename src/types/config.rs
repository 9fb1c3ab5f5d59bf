//! Configuration structures.
//!
//! The core reads only from this typed configuration and the per-call
//! notification context; it never consults environment variables.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Global notification-core configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Silence store configuration.
    #[serde(default)]
    pub silences: SilencesConfig,

    /// Notification log configuration.
    #[serde(default)]
    pub nflog: NflogConfig,

    /// Pipeline timing configuration.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Silence store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SilencesConfig {
    /// How long an expired silence is kept before GC removes it.
    #[serde(with = "humantime_serde")]
    pub retention: Duration,

    /// Hard cap on the number of silences (active + expired). 0 = unlimited.
    pub max_silences: usize,

    /// Hard cap on a single silence's serialized size. 0 = unlimited.
    pub max_silence_size_bytes: usize,

    /// Accept any non-empty UTF-8 label name in matchers instead of the
    /// classic `[a-zA-Z_][a-zA-Z0-9_]*` form.
    pub utf8_labels: bool,
}

impl Default for SilencesConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(120 * 3600),
            max_silences: 0,
            max_silence_size_bytes: 0,
            utf8_labels: false,
        }
    }
}

/// Notification log configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NflogConfig {
    /// How long an entry is kept to suppress duplicates across peer churn.
    #[serde(with = "humantime_serde")]
    pub retention: Duration,
}

impl Default for NflogConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(120 * 3600),
        }
    }
}

/// Pipeline timing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Wait-stage unit: this node waits `peer_position * peer_timeout`
    /// before first fire, giving earlier peers a chance to notify.
    #[serde(with = "humantime_serde")]
    pub peer_timeout: Duration,

    /// Minimum deadline enforced at pipeline entry. Callers may pass a
    /// longer deadline, never a shorter one.
    #[serde(with = "humantime_serde")]
    pub min_notify_timeout: Duration,

    /// First retry backoff interval.
    #[serde(with = "humantime_serde")]
    pub backoff_initial: Duration,

    /// Backoff cap.
    #[serde(with = "humantime_serde")]
    pub backoff_max: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            peer_timeout: Duration::from_secs(15),
            min_notify_timeout: Duration::from_secs(10),
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}
