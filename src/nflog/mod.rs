//! The notification log: a replicated, idempotent record of what was last
//! notified per `(receiver, group key)`.
//!
//! Entries exist to answer one question: does this batch of alerts still
//! need notifying? The dedup stage queries, the commit stage upserts, gossip
//! keeps peers convergent, retention keeps duplicates suppressed across
//! peer churn.

mod metadata;

pub use metadata::MetadataStore;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cluster::{codec, snapshot, Broadcast, NoopBroadcast};
use crate::metrics::StoreMetrics;
use crate::types::{Error, GroupKey, NflogConfig, Result};

/// Identifies one integration instance of a receiver group.
///
/// The canonical string form `"{group}/{integration}/{idx}"` prefixes the
/// notification log key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReceiverDescriptor {
    pub group_name: String,
    pub integration: String,
    pub idx: u32,
}

impl ReceiverDescriptor {
    pub fn new(group_name: impl Into<String>, integration: impl Into<String>, idx: u32) -> Self {
        Self {
            group_name: group_name.into(),
            integration: integration.into(),
            idx,
        }
    }
}

impl fmt::Display for ReceiverDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.group_name, self.integration, self.idx)
    }
}

/// One notification record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub receiver: ReceiverDescriptor,
    pub group_key: GroupKey,

    /// Stable hash of the notified batch (sorted fingerprints with
    /// resolved bits).
    pub hash: Vec<u8>,

    pub timestamp: DateTime<Utc>,

    /// Whether the recorded notification was for an all-resolved batch.
    pub resolved: bool,

    pub expires_at: DateTime<Utc>,
}

/// Query filter for [`NotificationLog::query`].
#[derive(Debug, Default, Clone)]
pub struct NflogQuery {
    group_key: Option<GroupKey>,
    receiver: Option<ReceiverDescriptor>,
}

impl NflogQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn group_key(mut self, group_key: GroupKey) -> Self {
        self.group_key = Some(group_key);
        self
    }

    pub fn receiver(mut self, receiver: ReceiverDescriptor) -> Self {
        self.receiver = Some(receiver);
        self
    }
}

type EntryKey = (String, String);

fn entry_key(receiver: &ReceiverDescriptor, group_key: &GroupKey) -> EntryKey {
    (receiver.to_string(), group_key.to_string())
}

/// The notification log store.
///
/// Also owns the per-receiver metadata side table: metadata annotates log
/// entries, so it lives and dies with them.
pub struct NotificationLog {
    entries: Mutex<HashMap<EntryKey, LogEntry>>,
    metadata: Arc<MetadataStore>,
    retention: Duration,
    broadcast: Box<dyn Broadcast>,
    metrics: StoreMetrics,
}

impl fmt::Debug for NotificationLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationLog")
            .field("len", &self.entries.lock().len())
            .finish()
    }
}

impl NotificationLog {
    pub fn new(cfg: &NflogConfig) -> Result<Self> {
        Self::with_broadcast(cfg, Box::new(NoopBroadcast))
    }

    pub fn with_broadcast(cfg: &NflogConfig, broadcast: Box<dyn Broadcast>) -> Result<Self> {
        let retention = Duration::from_std(cfg.retention)
            .map_err(|_| Error::validation("nflog retention out of range"))?;
        Ok(Self {
            entries: Mutex::new(HashMap::new()),
            metadata: Arc::new(MetadataStore::new()),
            retention,
            broadcast,
            metrics: StoreMetrics::new("nflog")?,
        })
    }

    /// Metric bundle for registration against the embedding registry.
    pub fn metrics(&self) -> &StoreMetrics {
        &self.metrics
    }

    /// The metadata side table. Integrations hold a clone to stash upstream
    /// message ids keyed by `(receiver, group key)`.
    pub fn metadata(&self) -> Arc<MetadataStore> {
        self.metadata.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Record a firing notification.
    pub fn log_active(
        &self,
        receiver: &ReceiverDescriptor,
        group_key: &GroupKey,
        hash: Vec<u8>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.log(receiver, group_key, hash, false, now)
    }

    /// Record an all-resolved notification.
    pub fn log_resolved(
        &self,
        receiver: &ReceiverDescriptor,
        group_key: &GroupKey,
        hash: Vec<u8>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.log(receiver, group_key, hash, true, now)
    }

    fn log(
        &self,
        receiver: &ReceiverDescriptor,
        group_key: &GroupKey,
        hash: Vec<u8>,
        resolved: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let entry = LogEntry {
            receiver: receiver.clone(),
            group_key: group_key.clone(),
            hash,
            timestamp: now,
            resolved,
            expires_at: now + self.retention,
        };

        let mut entries = self.entries.lock();
        entries.insert(entry_key(receiver, group_key), entry.clone());
        match codec::encode_entries(&[entry]) {
            Ok(delta) => self.broadcast.broadcast(delta),
            Err(e) => warn!(error = %e, "failed to encode nflog delta"),
        }
        Ok(())
    }

    /// Filtered query. Locally at most one entry exists per
    /// `(receiver, group key)`; transient cluster duplicates are resolved
    /// at merge time.
    pub fn query(&self, query: &NflogQuery) -> Result<Vec<LogEntry>> {
        self.metrics.queries_total.inc();
        let _timer = self.metrics.query_duration_seconds.start_timer();

        let entries = self.entries.lock();
        Ok(entries
            .values()
            .filter(|e| match &query.receiver {
                Some(receiver) => e.receiver == *receiver,
                None => true,
            })
            .filter(|e| match &query.group_key {
                Some(group_key) => e.group_key == *group_key,
                None => true,
            })
            .cloned()
            .collect())
    }

    /// Remove entries past their expiry, dropping their metadata with
    /// them. Returns the number of entries removed.
    pub fn gc(&self, now: DateTime<Utc>) -> usize {
        let _timer = self.metrics.gc_duration_seconds.start_timer();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        let removed = before - entries.len();
        if removed > 0 {
            // Metadata must not outlive the notifications it annotates.
            self.metadata.retain(|receiver, group_key| {
                entries.contains_key(&(receiver.to_string(), group_key.to_string()))
            });
            debug!(removed, "nflog gc");
        }
        removed
    }

    /// Append every entry, length-delimited, to the writer. Returns bytes
    /// written.
    pub fn snapshot<W: Write + ?Sized>(&self, writer: &mut W) -> Result<u64> {
        let _timer = self.metrics.snapshot_duration_seconds.start_timer();
        let entries = self.entries.lock();
        let mut size = 0u64;
        for entry in entries.values() {
            size += codec::write_entry(writer, entry)?;
        }
        self.metrics.snapshot_size_bytes.set(size as i64);
        Ok(size)
    }

    /// Snapshot to a file via write-to-temp-then-rename.
    pub fn snapshot_to_file(&self, path: &Path) -> Result<u64> {
        snapshot::replace_file(path, |w| self.snapshot(w))
    }

    /// Replace in-memory state from a snapshot stream.
    pub fn load_snapshot<R: Read>(&self, reader: &mut R) -> Result<()> {
        let decoded: Vec<LogEntry> = codec::read_entries(reader)?;
        let mut map = HashMap::with_capacity(decoded.len());
        for entry in decoded {
            map.insert(entry_key(&entry.receiver, &entry.group_key), entry);
        }
        let mut entries = self.entries.lock();
        *entries = map;
        info!(entries = entries.len(), "nflog snapshot loaded");
        Ok(())
    }

    /// Merge a gossip delta. Per key the later `timestamp` wins; ties break
    /// toward the larger `expires_at`. Already-expired entries are not
    /// inserted on first sight. Returns the entries that changed local
    /// state.
    pub fn merge(&self, data: &[u8], now: DateTime<Utc>) -> Result<Vec<LogEntry>> {
        let incoming: Vec<LogEntry> = codec::read_entries(&mut std::io::Cursor::new(data))?;
        let mut changed = Vec::new();

        let mut entries = self.entries.lock();
        for entry in incoming {
            let key = entry_key(&entry.receiver, &entry.group_key);
            let accept = match entries.get(&key) {
                // Already-expired entries are not resurrected on first sight.
                None => entry.expires_at > now,
                Some(prev) => supersedes(&entry, prev),
            };
            if accept {
                entries.insert(key, entry.clone());
                changed.push(entry);
            }
        }
        Ok(changed)
    }

    /// Periodic GC + snapshot until cancellation; a final snapshot runs on
    /// shutdown.
    pub async fn maintenance(
        self: Arc<Self>,
        interval: std::time::Duration,
        snapshot_path: Option<std::path::PathBuf>,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // first tick fires immediately; skip it

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.maintenance_cycle(snapshot_path.as_deref());
                }
                _ = cancel.cancelled() => {
                    self.maintenance_cycle(snapshot_path.as_deref());
                    info!("nflog maintenance stopped");
                    return;
                }
            }
        }
    }

    fn maintenance_cycle(&self, snapshot_path: Option<&Path>) {
        self.gc(Utc::now());
        if let Some(path) = snapshot_path {
            if let Err(e) = self.snapshot_to_file(path) {
                warn!(error = %e, "nflog snapshot failed");
            }
        }
    }
}

fn supersedes(incoming: &LogEntry, prev: &LogEntry) -> bool {
    incoming.timestamp > prev.timestamp
        || (incoming.timestamp == prev.timestamp && incoming.expires_at > prev.expires_at)
}

#[cfg(test)]
mod tests;
