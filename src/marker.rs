//! Per-alert muting annotations shared across pipeline stages.

use parking_lot::RwLock;
use std::collections::HashMap;

use crate::types::{Fingerprint, SilenceId};

#[derive(Debug, Clone, Default)]
struct AlertMark {
    silenced_by: Vec<SilenceId>,
    inhibited: bool,
}

/// Thread-safe record of which alerts are currently silenced (and by which
/// silence IDs) and which are inhibited.
///
/// Muting stages consult it; the silence evaluator and the embedding
/// router's inhibitor update it. Single component, per spec'd locking
/// discipline: one RwLock over the fingerprint map.
#[derive(Debug, Default)]
pub struct Marker {
    marks: RwLock<HashMap<Fingerprint, AlertMark>>,
}

impl Marker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the silences currently muting an alert. An empty list clears
    /// the silenced state.
    pub fn set_silenced(&self, fp: Fingerprint, silence_ids: Vec<SilenceId>) {
        let mut marks = self.marks.write();
        let mark = marks.entry(fp).or_default();
        mark.silenced_by = silence_ids;
        if mark.silenced_by.is_empty() && !mark.inhibited {
            marks.remove(&fp);
        }
    }

    /// Record whether an alert is inhibited.
    pub fn set_inhibited(&self, fp: Fingerprint, inhibited: bool) {
        let mut marks = self.marks.write();
        let mark = marks.entry(fp).or_default();
        mark.inhibited = inhibited;
        if mark.silenced_by.is_empty() && !mark.inhibited {
            marks.remove(&fp);
        }
    }

    /// IDs of the silences muting this alert; empty when not silenced.
    pub fn silenced(&self, fp: Fingerprint) -> Vec<SilenceId> {
        self.marks
            .read()
            .get(&fp)
            .map(|m| m.silenced_by.clone())
            .unwrap_or_default()
    }

    pub fn is_silenced(&self, fp: Fingerprint) -> bool {
        self.marks
            .read()
            .get(&fp)
            .map(|m| !m.silenced_by.is_empty())
            .unwrap_or(false)
    }

    pub fn is_inhibited(&self, fp: Fingerprint) -> bool {
        self.marks
            .read()
            .get(&fp)
            .map(|m| m.inhibited)
            .unwrap_or(false)
    }

    /// Drop all marks for an alert (e.g. when the dispatcher forgets it).
    pub fn delete(&self, fp: Fingerprint) {
        self.marks.write().remove(&fp);
    }

    /// Number of currently silenced alerts. Exposed for metrics.
    pub fn count_silenced(&self) -> usize {
        self.marks
            .read()
            .values()
            .filter(|m| !m.silenced_by.is_empty())
            .count()
    }

    /// Number of currently inhibited alerts. Exposed for metrics.
    pub fn count_inhibited(&self) -> usize {
        self.marks.read().values().filter(|m| m.inhibited).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LabelSet;

    fn fp(n: u64) -> Fingerprint {
        Fingerprint(n)
    }

    #[test]
    fn silenced_roundtrip() {
        let marker = Marker::new();
        let id = SilenceId::new();

        assert!(!marker.is_silenced(fp(1)));
        marker.set_silenced(fp(1), vec![id.clone()]);
        assert!(marker.is_silenced(fp(1)));
        assert_eq!(marker.silenced(fp(1)), vec![id]);

        marker.set_silenced(fp(1), vec![]);
        assert!(!marker.is_silenced(fp(1)));
        assert_eq!(marker.count_silenced(), 0);
    }

    #[test]
    fn inhibited_is_independent_of_silenced() {
        let marker = Marker::new();
        marker.set_inhibited(fp(2), true);
        assert!(marker.is_inhibited(fp(2)));
        assert!(!marker.is_silenced(fp(2)));

        marker.set_silenced(fp(2), vec![SilenceId::new()]);
        marker.set_inhibited(fp(2), false);
        assert!(marker.is_silenced(fp(2)), "clearing inhibit keeps silences");
    }

    #[test]
    fn cleared_marks_do_not_leak() {
        let marker = Marker::new();
        for i in 0..100 {
            marker.set_inhibited(fp(i), true);
            marker.set_inhibited(fp(i), false);
        }
        assert_eq!(marker.count_inhibited(), 0);
        assert_eq!(marker.marks.read().len(), 0);
    }

    #[test]
    fn counts_track_real_alerts() {
        let marker = Marker::new();
        let a = LabelSet::from([("job", "api")]).fingerprint();
        let b = LabelSet::from([("job", "db")]).fingerprint();

        marker.set_silenced(a, vec![SilenceId::new()]);
        marker.set_inhibited(b, true);

        assert_eq!(marker.count_silenced(), 1);
        assert_eq!(marker.count_inhibited(), 1);
    }
}
