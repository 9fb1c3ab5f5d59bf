//! The per-call notification context.
//!
//! An explicit immutable struct threaded through the stages instead of
//! dynamically-typed context values: absence of a value is an explicit
//! error at the stage that needs it, and tests construct exactly the
//! context they mean.

use chrono::{DateTime, Duration, Utc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::types::{Error, GroupKey, Result};

/// Values carried into a single pipeline execution for one alert group.
#[derive(Debug, Clone)]
pub struct NotifyContext {
    receiver_name: Option<String>,
    group_key: Option<GroupKey>,
    repeat_interval: Option<Duration>,
    now: DateTime<Utc>,
    notification_hash: Option<Vec<u8>>,
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl NotifyContext {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            receiver_name: None,
            group_key: None,
            repeat_interval: None,
            now,
            notification_hash: None,
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_receiver(mut self, name: impl Into<String>) -> Self {
        self.receiver_name = Some(name.into());
        self
    }

    pub fn with_group_key(mut self, group_key: GroupKey) -> Self {
        self.group_key = Some(group_key);
        self
    }

    pub fn with_repeat_interval(mut self, interval: Duration) -> Self {
        self.repeat_interval = Some(interval);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub(crate) fn with_notification_hash(mut self, hash: Vec<u8>) -> Self {
        self.notification_hash = Some(hash);
        self
    }

    /// Extend the deadline to at least `min` from now. Pipeline entry calls
    /// this so no chain runs under a deadline too short to retry at all.
    pub fn ensure_min_deadline(mut self, min: std::time::Duration) -> Self {
        let floor = Instant::now() + min;
        self.deadline = Some(match self.deadline {
            Some(deadline) if deadline >= floor => deadline,
            _ => floor,
        });
        self
    }

    pub fn receiver_name(&self) -> Result<&str> {
        self.receiver_name
            .as_deref()
            .ok_or_else(|| Error::not_found("receiver missing from notify context"))
    }

    pub fn group_key(&self) -> Result<&GroupKey> {
        self.group_key
            .as_ref()
            .ok_or_else(|| Error::not_found("group key missing from notify context"))
    }

    pub fn repeat_interval(&self) -> Result<Duration> {
        self.repeat_interval
            .ok_or_else(|| Error::not_found("repeat interval missing from notify context"))
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn notification_hash(&self) -> Result<&[u8]> {
        self.notification_hash
            .as_deref()
            .ok_or_else(|| Error::not_found("notification hash missing from notify context"))
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Non-blocking liveness check; stages call this between steps.
    pub fn check_live(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::cancelled("notify context cancelled"));
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(Error::timeout("notify deadline exceeded"));
            }
        }
        Ok(())
    }
}
