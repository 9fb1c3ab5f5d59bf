//! Per-receiver notification metadata side channel.
//!
//! Integrations stash opaque strings here (upstream message ids, thread
//! keys) so a later notification for the same group can update instead of
//! re-post. In-memory only and best-effort: never snapshotted, never
//! gossiped, gone on restart. Owned by the notification log, which prunes
//! it during GC so metadata shares the log entries' retention.

use parking_lot::Mutex;
use std::collections::HashMap;

use crate::nflog::ReceiverDescriptor;
use crate::types::GroupKey;

type MetaKey = (String, String);

#[derive(Debug, Default)]
pub struct MetadataStore {
    inner: Mutex<HashMap<MetaKey, HashMap<String, String>>>,
}

impl MetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(receiver: &ReceiverDescriptor, group_key: &GroupKey) -> MetaKey {
        (receiver.to_string(), group_key.to_string())
    }

    pub fn set(
        &self,
        receiver: &ReceiverDescriptor,
        group_key: &GroupKey,
        field: impl Into<String>,
        value: impl Into<String>,
    ) {
        self.inner
            .lock()
            .entry(Self::key(receiver, group_key))
            .or_default()
            .insert(field.into(), value.into());
    }

    pub fn get(
        &self,
        receiver: &ReceiverDescriptor,
        group_key: &GroupKey,
        field: &str,
    ) -> Option<String> {
        self.inner
            .lock()
            .get(&Self::key(receiver, group_key))
            .and_then(|fields| fields.get(field).cloned())
    }

    /// Full field map for one `(receiver, group key)`.
    pub fn all(
        &self,
        receiver: &ReceiverDescriptor,
        group_key: &GroupKey,
    ) -> HashMap<String, String> {
        self.inner
            .lock()
            .get(&Self::key(receiver, group_key))
            .cloned()
            .unwrap_or_default()
    }

    pub fn delete(&self, receiver: &ReceiverDescriptor, group_key: &GroupKey) {
        self.inner.lock().remove(&Self::key(receiver, group_key));
    }

    /// Keep only entries the predicate accepts. The owning log calls this
    /// from its GC with the surviving entry keys.
    pub fn retain<F>(&self, mut keep: F)
    where
        F: FnMut(&str, &str) -> bool,
    {
        self.inner
            .lock()
            .retain(|(receiver, group_key), _| keep(receiver, group_key));
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
