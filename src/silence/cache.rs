//! Matcher cache: memoized silence evaluation per alert fingerprint.

use std::collections::{HashMap, HashSet};

use crate::types::{Fingerprint, SilenceId};

/// Cached verdict for one fingerprint.
///
/// `version` is the silence store's counter at compute time; a bumped store
/// version invalidates the entry. Pending matches are kept so a silence
/// crossing into Active by time alone (no version bump) is detected.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub active: Vec<SilenceId>,
    pub pending: Vec<SilenceId>,
    pub version: u64,
}

/// Maps alert fingerprint → matching silences, keeping matcher evaluation
/// O(1) on hits.
#[derive(Debug, Default)]
pub struct MatcherCache {
    entries: HashMap<Fingerprint, CacheEntry>,
}

impl MatcherCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, fp: Fingerprint) -> Option<&CacheEntry> {
        self.entries.get(&fp)
    }

    pub fn insert(
        &mut self,
        fp: Fingerprint,
        active: Vec<SilenceId>,
        pending: Vec<SilenceId>,
        version: u64,
    ) {
        self.entries.insert(
            fp,
            CacheEntry {
                active,
                pending,
                version,
            },
        );
    }

    /// Drop every entry referencing any of the given silence IDs. Called
    /// from GC inside the store's critical section.
    pub fn prune_ids(&mut self, removed: &HashSet<SilenceId>) {
        if removed.is_empty() {
            return;
        }
        self.entries.retain(|_, entry| {
            !entry.active.iter().chain(entry.pending.iter()).any(|id| removed.contains(id))
        });
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
