//! The silences store: a gossip-replicated, snapshotted set of label-matcher
//! predicates with a Pending → Active → Expired lifecycle.
//!
//! The store exclusively owns its state map and the matcher cache behind one
//! RwLock; readers take the read lock and cache refreshes escalate to the
//! write lock. Every mutation bumps a monotonic version counter, which both
//! invalidates cache entries and drives incremental (`since`) queries.

mod cache;

pub use cache::{CacheEntry, MatcherCache};

use chrono::{DateTime, Duration, Utc};
use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cluster::{codec, snapshot, Broadcast, NoopBroadcast};
use crate::marker::Marker;
use crate::matcher::{dnf_matches, Matcher};
use crate::metrics::StoreMetrics;
use crate::types::{Error, LabelSet, Result, SilenceId, SilencesConfig};

/// Lifecycle state, derived from the timing fields and `now`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SilenceState {
    Pending,
    Active,
    Expired,
}

/// An operator-configured mute predicate with a time window.
///
/// `matcher_sets` is in disjunctive normal form: the silence matches a label
/// set iff any inner set matches in full. The DNF list is the only matcher
/// representation; wire adapters needing a legacy flat form convert at the
/// boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Silence {
    /// Unset on creation; assigned by `set`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<SilenceId>,

    pub matcher_sets: Vec<Vec<Matcher>>,

    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(default)]
    pub created_by: String,

    #[serde(default)]
    pub comment: String,

    #[serde(default, skip_serializing_if = "LabelSet::is_empty")]
    pub annotations: LabelSet,
}

impl Silence {
    pub fn new(
        matcher_sets: Vec<Vec<Matcher>>,
        starts_at: DateTime<Utc>,
        ends_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: None,
            matcher_sets,
            starts_at,
            ends_at,
            updated_at: starts_at,
            created_by: String::new(),
            comment: String::new(),
            annotations: LabelSet::new(),
        }
    }

    pub fn state_at(&self, now: DateTime<Utc>) -> SilenceState {
        if now < self.starts_at {
            SilenceState::Pending
        } else if now > self.ends_at {
            SilenceState::Expired
        } else {
            SilenceState::Active
        }
    }

    pub fn matches(&self, labels: &LabelSet) -> bool {
        dnf_matches(&self.matcher_sets, labels)
    }

    /// Structural validation. Matchers are assumed compiled; `init_matchers`
    /// re-validates patterns for silences coming off the wire.
    fn validate(&self) -> Result<()> {
        if self.matcher_sets.is_empty() {
            return Err(Error::validation("silence must have at least one matcher set"));
        }
        for set in &self.matcher_sets {
            if set.is_empty() {
                return Err(Error::validation("matcher set must not be empty"));
            }
            if set.iter().all(Matcher::matches_empty) {
                return Err(Error::validation(
                    "at least one matcher in each set must not match the empty string",
                ));
            }
        }
        if self.ends_at < self.starts_at {
            return Err(Error::validation("silence must not end before it starts"));
        }
        if self.starts_at == DateTime::UNIX_EPOCH || self.ends_at == DateTime::UNIX_EPOCH {
            return Err(Error::validation("silence timestamps must be set"));
        }
        Ok(())
    }

    /// Recompile and validate every matcher. Required after deserialization.
    fn init_matchers(&mut self, utf8_labels: bool) -> Result<()> {
        for set in &mut self.matcher_sets {
            for matcher in set {
                matcher.init(utf8_labels)?;
            }
        }
        Ok(())
    }

    /// Content equality ignoring `id` and `updated_at`; a `set` carrying an
    /// identical silence is a no-op.
    fn same_content(&self, other: &Silence) -> bool {
        self.matcher_sets == other.matcher_sets
            && self.starts_at == other.starts_at
            && self.ends_at == other.ends_at
            && self.created_by == other.created_by
            && self.comment == other.comment
            && self.annotations == other.annotations
    }
}

/// Gossip/snapshot envelope: the silence plus its GC horizon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshSilence {
    pub silence: Silence,
    pub expires_at: DateTime<Utc>,
}

/// Update policy: which changes may keep the existing silence id.
///
/// Matcher changes always force recreation. A Pending silence may shift both
/// timestamps forward of `now`; an Active one may only move its end, and not
/// into the past; an Expired one is immutable.
pub fn can_update(old: &Silence, new: &Silence, now: DateTime<Utc>) -> bool {
    if old.matcher_sets != new.matcher_sets {
        return false;
    }
    match old.state_at(now) {
        SilenceState::Expired => false,
        SilenceState::Pending => new.starts_at >= now && new.ends_at >= new.starts_at,
        SilenceState::Active => new.starts_at == old.starts_at && new.ends_at >= now,
    }
}

/// Query filter for [`Silences::query`]. Filters compose conjunctively.
#[derive(Debug, Default, Clone)]
pub struct SilenceQuery {
    ids: Option<Vec<SilenceId>>,
    states: Option<Vec<SilenceState>>,
    matches: Option<LabelSet>,
    since: Option<u64>,
}

impl SilenceQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to the given ids. An empty list is a validation error.
    pub fn ids(mut self, ids: impl IntoIterator<Item = SilenceId>) -> Self {
        self.ids = Some(ids.into_iter().collect());
        self
    }

    pub fn states(mut self, states: impl IntoIterator<Item = SilenceState>) -> Self {
        self.states = Some(states.into_iter().collect());
        self
    }

    /// Only silences matching the given label set.
    pub fn matches(mut self, labels: LabelSet) -> Self {
        self.matches = Some(labels);
        self
    }

    /// Only silences touched by a mutation after the given store version.
    pub fn since(mut self, version: u64) -> Self {
        self.since = Some(version);
        self
    }
}

/// Result of a GC cycle.
///
/// Entries with an unset expiry are skipped, aggregated here, and left in
/// place; the cycle keeps going.
#[derive(Debug, Default)]
pub struct GcStats {
    pub removed: usize,
    pub errors: Vec<Error>,
}

impl GcStats {
    pub fn into_result(self) -> Result<usize> {
        let removed = self.removed;
        Error::from_many(self.errors)?;
        Ok(removed)
    }
}

#[derive(Debug, Default)]
struct State {
    silences: HashMap<SilenceId, MeshSilence>,
    /// Monotonic mutation counter; bumped by set/expire/merge/load.
    version: u64,
    /// version → touched id, for O(Δ) `since` queries.
    version_index: BTreeMap<u64, SilenceId>,
    cache: MatcherCache,
}

/// The silences store.
pub struct Silences {
    inner: RwLock<State>,
    retention: Duration,
    max_silences: usize,
    max_silence_size_bytes: usize,
    utf8_labels: bool,
    broadcast: Box<dyn Broadcast>,
    metrics: StoreMetrics,
}

impl std::fmt::Debug for Silences {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Silences")
            .field("len", &self.inner.read().silences.len())
            .field("version", &self.inner.read().version)
            .finish()
    }
}

impl Silences {
    pub fn new(cfg: &SilencesConfig) -> Result<Self> {
        Self::with_broadcast(cfg, Box::new(NoopBroadcast))
    }

    pub fn with_broadcast(cfg: &SilencesConfig, broadcast: Box<dyn Broadcast>) -> Result<Self> {
        let retention = Duration::from_std(cfg.retention)
            .map_err(|_| Error::validation("silences retention out of range"))?;
        Ok(Self {
            inner: RwLock::new(State::default()),
            retention,
            max_silences: cfg.max_silences,
            max_silence_size_bytes: cfg.max_silence_size_bytes,
            utf8_labels: cfg.utf8_labels,
            broadcast,
            metrics: StoreMetrics::new("silences")?,
        })
    }

    /// Metric bundle for registration against the embedding registry.
    pub fn metrics(&self) -> &StoreMetrics {
        &self.metrics
    }

    /// Current store version. Strictly increases with every mutation.
    pub fn version(&self) -> u64 {
        self.inner.read().version
    }

    pub fn len(&self) -> usize {
        self.inner.read().silences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().silences.is_empty()
    }

    /// Create or update a silence. Returns the id the silence lives under,
    /// which differs from the input id when the update policy forces
    /// recreation.
    pub fn set(&self, mut sil: Silence, now: DateTime<Utc>) -> Result<SilenceId> {
        sil.init_matchers(self.utf8_labels)?;
        sil.validate()?;

        let mut state = self.inner.write();
        match sil.id.clone() {
            None => self.create_locked(&mut state, sil, now),
            Some(id) => {
                let prev = state
                    .silences
                    .get(&id)
                    .ok_or_else(|| Error::not_found(format!("silence {} not found", id)))?
                    .silence
                    .clone();

                if prev.same_content(&sil) {
                    return Ok(id);
                }

                if can_update(&prev, &sil, now) {
                    sil.updated_at = now;
                    let mesh = self.envelope(sil)?;
                    self.insert_locked(&mut state, id.clone(), mesh);
                    Ok(id)
                } else {
                    // History-preserving replacement: retire the old window,
                    // re-issue under a fresh id.
                    if prev.state_at(now) != SilenceState::Expired {
                        self.expire_locked(&mut state, &id, now)?;
                    }
                    sil.id = None;
                    self.create_locked(&mut state, sil, now)
                }
            }
        }
    }

    /// Expire a silence now. Pending silences collapse to a zero-length
    /// window so they never activate.
    pub fn expire(&self, id: &SilenceId, now: DateTime<Utc>) -> Result<()> {
        let mut state = self.inner.write();
        self.expire_locked(&mut state, id, now)
    }

    /// Filtered query. Returns the matching silences (no ordering
    /// guarantee) and the store version they were read at.
    pub fn query(
        &self,
        query: &SilenceQuery,
        now: DateTime<Utc>,
    ) -> Result<(Vec<Silence>, u64)> {
        self.metrics.queries_total.inc();
        let _timer = self.metrics.query_duration_seconds.start_timer();

        if let Some(ids) = &query.ids {
            if ids.is_empty() {
                self.metrics.query_errors_total.inc();
                return Err(Error::validation("id query must name at least one id"));
            }
        }

        let state = self.inner.read();

        // `since` narrows the candidate set via the version index; every
        // other filter then applies to that subset.
        let candidates: Vec<&MeshSilence> = match query.since {
            Some(since) => {
                let mut seen = HashSet::new();
                state
                    .version_index
                    .range(since + 1..)
                    .filter(|(_, id)| seen.insert((*id).clone()))
                    .filter_map(|(_, id)| state.silences.get(id))
                    .collect()
            }
            None => state.silences.values().collect(),
        };

        let results = candidates
            .into_iter()
            .filter(|mesh| match &query.ids {
                Some(ids) => mesh.silence.id.as_ref().is_some_and(|id| ids.contains(id)),
                None => true,
            })
            .filter(|mesh| match &query.states {
                Some(states) => states.contains(&mesh.silence.state_at(now)),
                None => true,
            })
            .filter(|mesh| match &query.matches {
                Some(labels) => mesh.silence.matches(labels),
                None => true,
            })
            .map(|mesh| mesh.silence.clone())
            .collect();

        Ok((results, state.version))
    }

    pub fn count_state(&self, silence_state: SilenceState, now: DateTime<Utc>) -> usize {
        self.inner
            .read()
            .silences
            .values()
            .filter(|mesh| mesh.silence.state_at(now) == silence_state)
            .count()
    }

    /// Remove silences past their GC horizon, pruning the matcher cache and
    /// version index in the same critical section.
    pub fn gc(&self, now: DateTime<Utc>) -> GcStats {
        let _timer = self.metrics.gc_duration_seconds.start_timer();
        let mut stats = GcStats::default();
        let mut state = self.inner.write();

        let mut removed: HashSet<SilenceId> = HashSet::new();
        for (id, mesh) in &state.silences {
            if mesh.expires_at == DateTime::UNIX_EPOCH {
                stats
                    .errors
                    .push(Error::corrupt(format!("silence {} has unset expiry", id)));
                continue;
            }
            if mesh.expires_at <= now {
                removed.insert(id.clone());
            }
        }

        state.silences.retain(|id, _| !removed.contains(id));
        state.cache.prune_ids(&removed);
        state
            .version_index
            .retain(|_, id| !removed.contains(id));

        stats.removed = removed.len();
        if stats.removed > 0 {
            debug!(removed = stats.removed, "silence gc");
        }
        stats
    }

    /// Append every envelope, length-delimited, to the writer. Returns
    /// bytes written.
    pub fn snapshot<W: Write + ?Sized>(&self, writer: &mut W) -> Result<u64> {
        let _timer = self.metrics.snapshot_duration_seconds.start_timer();
        let state = self.inner.read();
        let mut size = 0u64;
        for mesh in state.silences.values() {
            size += codec::write_entry(writer, mesh)?;
        }
        self.metrics.snapshot_size_bytes.set(size as i64);
        Ok(size)
    }

    /// Snapshot to a file via write-to-temp-then-rename.
    pub fn snapshot_to_file(&self, path: &Path) -> Result<u64> {
        snapshot::replace_file(path, |w| self.snapshot(w))
    }

    /// Replace in-memory state from a snapshot stream. The cache and
    /// version index restart empty; the version still bumps so stale cache
    /// holders re-evaluate.
    pub fn load_snapshot<R: Read>(&self, reader: &mut R) -> Result<()> {
        let envelopes: Vec<MeshSilence> = codec::read_entries(reader)?;

        let mut silences = HashMap::with_capacity(envelopes.len());
        for mut mesh in envelopes {
            mesh.silence
                .init_matchers(self.utf8_labels)
                .map_err(|e| Error::corrupt(format!("snapshot silence invalid: {}", e)))?;
            let id = mesh
                .silence
                .id
                .clone()
                .ok_or_else(|| Error::corrupt("snapshot silence without id"))?;
            silences.insert(id, mesh);
        }

        let mut state = self.inner.write();
        state.silences = silences;
        state.version += 1;
        state.version_index.clear();
        state.cache.clear();
        info!(silences = state.silences.len(), "silence snapshot loaded");
        Ok(())
    }

    /// Merge a gossip delta. For each id the envelope with the larger
    /// `updated_at` wins; pre-expired envelopes are not inserted on first
    /// sight. Returns the envelopes that changed local state.
    pub fn merge(&self, data: &[u8], now: DateTime<Utc>) -> Result<Vec<MeshSilence>> {
        let incoming: Vec<MeshSilence> = codec::read_entries(&mut std::io::Cursor::new(data))?;
        let mut changed = Vec::new();

        let mut state = self.inner.write();
        for mut mesh in incoming {
            if let Err(e) = mesh.silence.init_matchers(self.utf8_labels) {
                warn!(error = %e, "dropping gossiped silence with invalid matchers");
                continue;
            }
            let Some(id) = mesh.silence.id.clone() else {
                warn!("dropping gossiped silence without id");
                continue;
            };

            let accept = match state.silences.get(&id) {
                // Pre-expired envelopes are not resurrected on first sight.
                None => mesh.expires_at > now,
                Some(prev) => mesh.silence.updated_at > prev.silence.updated_at,
            };
            if accept {
                self.index_locked(&mut state, id, mesh.clone());
                changed.push(mesh);
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
                    info!("silence maintenance stopped");
                    return;
                }
            }
        }
    }

    fn maintenance_cycle(&self, snapshot_path: Option<&Path>) {
        if let Err(e) = self.gc(Utc::now()).into_result() {
            warn!(error = %e, "silence gc reported errors");
        }
        if let Some(path) = snapshot_path {
            if let Err(e) = self.snapshot_to_file(path) {
                warn!(error = %e, "silence snapshot failed");
            }
        }
    }

    /// Active silences muting the given labels, via the matcher cache.
    ///
    /// A cache hit is only trusted when the store version is unchanged and
    /// no cached match has drifted across a state boundary by time alone.
    pub fn muting(&self, labels: &LabelSet, now: DateTime<Utc>) -> Vec<SilenceId> {
        let fp = labels.fingerprint();
        let state = self.inner.upgradable_read();

        if let Some(entry) = state.cache.get(fp) {
            if entry.version == state.version && !self.cache_entry_drifted(&state, entry, now) {
                return entry.active.clone();
            }
        }

        let mut active = Vec::new();
        let mut pending = Vec::new();
        for mesh in state.silences.values() {
            let Some(id) = mesh.silence.id.clone() else {
                continue;
            };
            match mesh.silence.state_at(now) {
                SilenceState::Active if mesh.silence.matches(labels) => active.push(id),
                SilenceState::Pending if mesh.silence.matches(labels) => pending.push(id),
                _ => {}
            }
        }

        let version = state.version;
        let mut state = RwLockUpgradableReadGuard::upgrade(state);
        state.cache.insert(fp, active.clone(), pending.clone(), version);
        active
    }

    fn cache_entry_drifted(&self, state: &State, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        let stale_active = entry.active.iter().any(|id| {
            state
                .silences
                .get(id)
                .map(|m| m.silence.state_at(now) != SilenceState::Active)
                .unwrap_or(true)
        });
        let awakened_pending = entry.pending.iter().any(|id| {
            state
                .silences
                .get(id)
                .map(|m| m.silence.state_at(now) != SilenceState::Pending)
                .unwrap_or(true)
        });
        stale_active || awakened_pending
    }

    fn envelope(&self, sil: Silence) -> Result<MeshSilence> {
        let mesh = MeshSilence {
            expires_at: sil.ends_at + self.retention,
            silence: sil,
        };
        if self.max_silence_size_bytes > 0 {
            let size = serde_json::to_vec(&mesh)?.len();
            if size > self.max_silence_size_bytes {
                return Err(Error::limit_exceeded(format!(
                    "silence size {} exceeds limit {}",
                    size, self.max_silence_size_bytes
                )));
            }
        }
        Ok(mesh)
    }

    fn create_locked(
        &self,
        state: &mut State,
        mut sil: Silence,
        now: DateTime<Utc>,
    ) -> Result<SilenceId> {
        if self.max_silences > 0 && state.silences.len() >= self.max_silences {
            return Err(Error::limit_exceeded(format!(
                "silence count limit {} reached",
                self.max_silences
            )));
        }
        let id = SilenceId::new();
        sil.id = Some(id.clone());
        sil.updated_at = now;
        let mesh = self.envelope(sil)?;
        self.insert_locked(state, id.clone(), mesh);
        Ok(id)
    }

    fn expire_locked(&self, state: &mut State, id: &SilenceId, now: DateTime<Utc>) -> Result<()> {
        let mesh = state
            .silences
            .get(id)
            .ok_or_else(|| Error::not_found(format!("silence {} not found", id)))?;
        let mut sil = mesh.silence.clone();

        match sil.state_at(now) {
            SilenceState::Expired => {
                return Err(Error::validation(format!("silence {} already expired", id)))
            }
            SilenceState::Active => sil.ends_at = now,
            SilenceState::Pending => {
                sil.starts_at = now;
                sil.ends_at = now;
            }
        }
        sil.updated_at = now;

        let mesh = self.envelope(sil)?;
        self.insert_locked(state, id.clone(), mesh);
        Ok(())
    }

    /// Version-bumping insert + delta broadcast. All local mutations land
    /// here.
    fn insert_locked(&self, state: &mut State, id: SilenceId, mesh: MeshSilence) {
        self.index_locked(state, id, mesh.clone());
        match codec::encode_entries(&[mesh]) {
            Ok(delta) => self.broadcast.broadcast(delta),
            Err(e) => warn!(error = %e, "failed to encode silence delta"),
        }
    }

    /// Insert + version bump without broadcasting (merges must not echo).
    fn index_locked(&self, state: &mut State, id: SilenceId, mesh: MeshSilence) {
        state.version += 1;
        let version = state.version;
        state.version_index.insert(version, id.clone());
        state.silences.insert(id, mesh);
    }
}

/// The `Mutes` evaluator handed to the pipeline's silence stage: resolves
/// matching silences through the store's cache and keeps the marker current.
#[derive(Debug, Clone)]
pub struct Silencer {
    silences: Arc<Silences>,
    marker: Arc<Marker>,
}

impl Silencer {
    pub fn new(silences: Arc<Silences>, marker: Arc<Marker>) -> Self {
        Self { silences, marker }
    }

    /// Whether any active silence mutes the given labels. Updates the
    /// marker with the matching silence ids as a side effect.
    pub fn mutes(&self, labels: &LabelSet, now: DateTime<Utc>) -> bool {
        let ids = self.silences.muting(labels, now);
        let muted = !ids.is_empty();
        self.marker.set_silenced(labels.fingerprint(), ids);
        muted
    }
}
