//! Prometheus metric bundles.
//!
//! Metrics are plain structs registered against a caller-supplied
//! `Registry`, never process globals. Constructing a bundle without
//! registering it is valid and is what tests do.

use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};

use crate::types::Result;

/// Per-integration notification outcome metrics.
#[derive(Debug, Clone)]
pub struct NotifyMetrics {
    /// Attempts, labelled by integration kind. Counted per attempt outcome.
    pub notifications_total: IntCounterVec,
    /// Failed attempts, labelled by integration kind.
    pub notifications_failed_total: IntCounterVec,
    /// Wall time of individual notify attempts.
    pub notification_latency_seconds: HistogramVec,
}

impl NotifyMetrics {
    pub fn new() -> Result<Self> {
        Ok(Self {
            notifications_total: IntCounterVec::new(
                Opts::new("notifications_total", "Total notification attempts."),
                &["integration"],
            )?,
            notifications_failed_total: IntCounterVec::new(
                Opts::new(
                    "notifications_failed_total",
                    "Total failed notification attempts.",
                ),
                &["integration"],
            )?,
            notification_latency_seconds: HistogramVec::new(
                HistogramOpts::new(
                    "notification_latency_seconds",
                    "Latency of individual notify attempts.",
                ),
                &["integration"],
            )?,
        })
    }

    pub fn register(&self, registry: &Registry) -> Result<()> {
        registry.register(Box::new(self.notifications_total.clone()))?;
        registry.register(Box::new(self.notifications_failed_total.clone()))?;
        registry.register(Box::new(self.notification_latency_seconds.clone()))?;
        Ok(())
    }
}

/// Shared shape for the replicated stores (silences, nflog).
#[derive(Debug, Clone)]
pub struct StoreMetrics {
    pub gc_duration_seconds: Histogram,
    pub snapshot_duration_seconds: Histogram,
    pub snapshot_size_bytes: IntGauge,
    pub queries_total: IntCounter,
    pub query_errors_total: IntCounter,
    pub query_duration_seconds: Histogram,
}

impl StoreMetrics {
    /// `subsystem` prefixes every metric name (`silences`, `nflog`).
    pub fn new(subsystem: &str) -> Result<Self> {
        Ok(Self {
            gc_duration_seconds: Histogram::with_opts(HistogramOpts::new(
                format!("{}_gc_duration_seconds", subsystem),
                "Duration of garbage collection cycles.",
            ))?,
            snapshot_duration_seconds: Histogram::with_opts(HistogramOpts::new(
                format!("{}_snapshot_duration_seconds", subsystem),
                "Duration of snapshot writes.",
            ))?,
            snapshot_size_bytes: IntGauge::new(
                format!("{}_snapshot_size_bytes", subsystem),
                "Size of the last snapshot.",
            )?,
            queries_total: IntCounter::new(
                format!("{}_queries_total", subsystem),
                "Total queries served.",
            )?,
            query_errors_total: IntCounter::new(
                format!("{}_query_errors_total", subsystem),
                "Total queries that failed.",
            )?,
            query_duration_seconds: Histogram::with_opts(HistogramOpts::new(
                format!("{}_query_duration_seconds", subsystem),
                "Duration of queries.",
            ))?,
        })
    }

    pub fn register(&self, registry: &Registry) -> Result<()> {
        registry.register(Box::new(self.gc_duration_seconds.clone()))?;
        registry.register(Box::new(self.snapshot_duration_seconds.clone()))?;
        registry.register(Box::new(self.snapshot_size_bytes.clone()))?;
        registry.register(Box::new(self.queries_total.clone()))?;
        registry.register(Box::new(self.query_errors_total.clone()))?;
        registry.register(Box::new(self.query_duration_seconds.clone()))?;
        Ok(())
    }
}
