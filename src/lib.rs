//! # Herald Core - Cluster-Aware Notification Pipeline
//!
//! The notification core of a cluster-aware alert router:
//! - Staged per-integration pipeline: muting, peer wait, resolved
//!   filtering, dedup, retry with backoff, log commit
//! - Gossip-replicated silences with matcher cache and snapshots
//! - Replicated notification log for at-most-one-ish delivery decisions
//! - Per-receiver metadata side channel for integration-owned state
//!
//! ## Architecture
//!
//! ```text
//!   dispatcher →  Pipeline.exec(ctx, alerts)
//!                    │ Routing (by receiver name)
//!                    │ Inhibit → Silence        (shared muting preamble)
//!                    └ Fanout ─ per integration:
//!                        Wait → FilterResolved → Dedup → Retry → SetNotifies
//!                                 │                │               │
//!                                 └── Silences ────┴─ Notification log
//!                                      (gossip + snapshots)
//! ```
//!
//! The stores are single-owner components behind their own locks, passed by
//! `Arc` through constructors; nothing in the crate is process-global.

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

// Re-export public API
pub mod cluster;
pub mod integration;
pub mod marker;
pub mod matcher;
pub mod metrics;
pub mod nflog;
pub mod pipeline;
pub mod silence;
pub mod types;

// Internal utilities
pub mod observability;

pub use types::{Config, Error, Result};
