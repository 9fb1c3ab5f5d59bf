//! Alert model: label sets, fingerprints, batch identity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Stable identity of a label set across time.
///
/// Derived from the first 8 bytes of a SHA-256 over the sorted label pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(pub u64);

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// An ordered label set. Ordering gives stable iteration and hashing.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LabelSet(pub BTreeMap<String, String>);

impl LabelSet {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Stable fingerprint over the sorted `name=value` pairs.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Sha256::new();
        for (name, value) in &self.0 {
            hasher.update(name.as_bytes());
            hasher.update([0xff]);
            hasher.update(value.as_bytes());
            hasher.update([0xff]);
        }
        let digest = hasher.finalize();
        let mut first = [0u8; 8];
        first.copy_from_slice(&digest[..8]);
        Fingerprint(u64::from_be_bytes(first))
    }
}

impl<const N: usize> From<[(&str, &str); N]> for LabelSet {
    fn from(pairs: [(&str, &str); N]) -> Self {
        let mut set = LabelSet::new();
        for (name, value) in pairs {
            set.insert(name, value);
        }
        set
    }
}

/// Firing/resolved status of an alert or batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Firing,
    Resolved,
}

/// A labelled, time-bounded event awaiting notification.
///
/// Alerts are read-only inside the pipeline; the only mutation is the
/// muting-transition flags set by the inhibit/silence stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub labels: LabelSet,

    #[serde(default)]
    pub annotations: LabelSet,

    pub starts_at: DateTime<Utc>,

    /// Unset means still firing with unknown end.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ends_at: Option<DateTime<Utc>>,

    pub updated_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub generator_url: String,

    /// Previously silenced, no longer muted. Lets integrations render the
    /// transition.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub was_silenced: bool,

    /// Previously inhibited, no longer muted.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub was_inhibited: bool,
}

impl Alert {
    pub fn new(labels: LabelSet, starts_at: DateTime<Utc>) -> Self {
        Self {
            labels,
            annotations: LabelSet::new(),
            starts_at,
            ends_at: None,
            updated_at: starts_at,
            generator_url: String::new(),
            was_silenced: false,
            was_inhibited: false,
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.labels.fingerprint()
    }

    /// Resolved iff the end time is set and has passed.
    pub fn resolved_at(&self, now: DateTime<Utc>) -> bool {
        match self.ends_at {
            Some(ends_at) => ends_at <= now,
            None => false,
        }
    }

    pub fn status_at(&self, now: DateTime<Utc>) -> AlertStatus {
        if self.resolved_at(now) {
            AlertStatus::Resolved
        } else {
            AlertStatus::Firing
        }
    }
}

/// A batch is resolved iff every alert in it is resolved. An empty batch
/// counts as resolved (nothing left firing).
pub fn batch_resolved(alerts: &[Alert], now: DateTime<Utc>) -> bool {
    alerts.iter().all(|a| a.resolved_at(now))
}

/// Identity of a specific notification: SHA-256 over the sorted alert
/// fingerprints, each followed by its resolved bit.
///
/// The same alert set re-notified with different resolved states hashes
/// differently, so a resolution is never deduplicated against the firing
/// notification that preceded it.
pub fn batch_hash(alerts: &[Alert], now: DateTime<Utc>) -> Vec<u8> {
    let mut keyed: Vec<(Fingerprint, bool)> = alerts
        .iter()
        .map(|a| (a.fingerprint(), a.resolved_at(now)))
        .collect();
    keyed.sort_unstable();

    let mut hasher = Sha256::new();
    for (fp, resolved) in keyed {
        hasher.update(fp.0.to_be_bytes());
        hasher.update([u8::from(resolved)]);
    }
    hasher.finalize().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-06-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn fingerprint_is_order_independent() {
        let a = LabelSet::from([("job", "api"), ("env", "prod")]);
        let b = LabelSet::from([("env", "prod"), ("job", "api")]);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_differs_on_value_change() {
        let a = LabelSet::from([("job", "api")]);
        let b = LabelSet::from([("job", "db")]);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn fingerprint_distinguishes_name_value_split() {
        let a = LabelSet::from([("ab", "c")]);
        let b = LabelSet::from([("a", "bc")]);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn resolved_requires_passed_end() {
        let now = t0();
        let mut alert = Alert::new(LabelSet::from([("job", "api")]), now);
        assert!(!alert.resolved_at(now));

        alert.ends_at = Some(now + Duration::minutes(5));
        assert!(!alert.resolved_at(now));
        assert_eq!(alert.status_at(now), AlertStatus::Firing);

        assert!(alert.resolved_at(now + Duration::minutes(5)));
        assert_eq!(
            alert.status_at(now + Duration::minutes(6)),
            AlertStatus::Resolved
        );
    }

    #[test]
    fn batch_resolved_needs_all() {
        let now = t0();
        let mut firing = Alert::new(LabelSet::from([("job", "api")]), now);
        let mut done = Alert::new(LabelSet::from([("job", "db")]), now);
        done.ends_at = Some(now - Duration::minutes(1));

        assert!(!batch_resolved(&[firing.clone(), done.clone()], now));

        firing.ends_at = Some(now - Duration::seconds(1));
        assert!(batch_resolved(&[firing, done], now));
    }

    #[test]
    fn batch_hash_is_order_independent() {
        let now = t0();
        let a = Alert::new(LabelSet::from([("job", "api")]), now);
        let b = Alert::new(LabelSet::from([("job", "db")]), now);

        assert_eq!(
            batch_hash(&[a.clone(), b.clone()], now),
            batch_hash(&[b, a], now)
        );
    }

    #[test]
    fn batch_hash_tracks_resolved_bits() {
        let now = t0();
        let firing = Alert::new(LabelSet::from([("job", "api")]), now);
        let mut resolved = firing.clone();
        resolved.ends_at = Some(now - Duration::minutes(1));

        assert_ne!(batch_hash(&[firing], now), batch_hash(&[resolved], now));
    }
}
