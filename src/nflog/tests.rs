use super::*;
use crate::cluster::CapturingBroadcast;
use pretty_assertions::assert_eq;
use proptest::prelude::*;

fn t0() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-06-01T00:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

fn mins(n: i64) -> Duration {
    Duration::minutes(n)
}

fn store() -> NotificationLog {
    NotificationLog::new(&NflogConfig::default()).unwrap()
}

fn recv(group: &str) -> ReceiverDescriptor {
    ReceiverDescriptor::new(group, "webhook", 0)
}

#[test]
fn receiver_descriptor_canonical_form() {
    assert_eq!(recv("team-x").to_string(), "team-x/webhook/0");
    assert_eq!(
        ReceiverDescriptor::new("ops", "email", 3).to_string(),
        "ops/email/3"
    );
}

#[test]
fn log_active_then_query() {
    let nflog = store();
    let now = t0();
    let gk = GroupKey::must("g1");

    nflog
        .log_active(&recv("team-x"), &gk, vec![1, 2, 3], now)
        .unwrap();

    let entries = nflog
        .query(&NflogQuery::new().receiver(recv("team-x")).group_key(gk))
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].hash, vec![1, 2, 3]);
    assert!(!entries[0].resolved);
    assert_eq!(entries[0].timestamp, now);
    assert_eq!(
        entries[0].expires_at,
        now + Duration::from_std(NflogConfig::default().retention).unwrap()
    );
}

#[test]
fn upsert_replaces_prior_entry() {
    let nflog = store();
    let now = t0();
    let gk = GroupKey::must("g1");

    nflog
        .log_active(&recv("team-x"), &gk, vec![1], now)
        .unwrap();
    nflog
        .log_resolved(&recv("team-x"), &gk, vec![2], now + mins(5))
        .unwrap();

    let entries = nflog
        .query(&NflogQuery::new().receiver(recv("team-x")).group_key(gk))
        .unwrap();
    assert_eq!(entries.len(), 1, "one entry per (receiver, group key)");
    assert!(entries[0].resolved);
    assert_eq!(entries[0].hash, vec![2]);
}

#[test]
fn query_filters_are_conjunctive() {
    let nflog = store();
    let now = t0();

    nflog
        .log_active(&recv("team-x"), &GroupKey::must("g1"), vec![1], now)
        .unwrap();
    nflog
        .log_active(&recv("team-y"), &GroupKey::must("g1"), vec![2], now)
        .unwrap();
    nflog
        .log_active(&recv("team-x"), &GroupKey::must("g2"), vec![3], now)
        .unwrap();

    let by_receiver = nflog
        .query(&NflogQuery::new().receiver(recv("team-x")))
        .unwrap();
    assert_eq!(by_receiver.len(), 2);

    let both = nflog
        .query(
            &NflogQuery::new()
                .receiver(recv("team-x"))
                .group_key(GroupKey::must("g2")),
        )
        .unwrap();
    assert_eq!(both.len(), 1);
    assert_eq!(both[0].hash, vec![3]);

    // Same group name, different integration index: distinct receiver.
    let other_idx = ReceiverDescriptor::new("team-x", "webhook", 1);
    assert!(nflog
        .query(&NflogQuery::new().receiver(other_idx))
        .unwrap()
        .is_empty());
}

#[test]
fn gc_removes_expired_entries() {
    let cfg = NflogConfig {
        retention: std::time::Duration::from_secs(60),
    };
    let nflog = NotificationLog::new(&cfg).unwrap();
    let now = t0();

    nflog
        .log_active(&recv("a"), &GroupKey::must("g1"), vec![1], now)
        .unwrap();
    nflog
        .log_active(&recv("b"), &GroupKey::must("g2"), vec![2], now + mins(10))
        .unwrap();

    assert_eq!(nflog.gc(now + mins(2)), 1);
    assert_eq!(nflog.len(), 1);
    assert_eq!(nflog.gc(now + mins(2)), 0);
}

#[test]
fn gc_prunes_metadata_with_its_entries() {
    let cfg = NflogConfig {
        retention: std::time::Duration::from_secs(60),
    };
    let nflog = NotificationLog::new(&cfg).unwrap();
    let now = t0();
    let metadata = nflog.metadata();

    nflog
        .log_active(&recv("a"), &GroupKey::must("g1"), vec![1], now)
        .unwrap();
    nflog
        .log_active(&recv("b"), &GroupKey::must("g2"), vec![2], now + mins(10))
        .unwrap();
    metadata.set(&recv("a"), &GroupKey::must("g1"), "message_id", "m1");
    metadata.set(&recv("b"), &GroupKey::must("g2"), "message_id", "m2");

    assert_eq!(nflog.gc(now + mins(2)), 1);

    assert_eq!(metadata.get(&recv("a"), &GroupKey::must("g1"), "message_id"), None);
    assert_eq!(
        metadata.get(&recv("b"), &GroupKey::must("g2"), "message_id"),
        Some("m2".to_string())
    );
}

#[test]
fn snapshot_roundtrip() {
    let nflog = store();
    let now = t0();
    nflog
        .log_active(&recv("a"), &GroupKey::must("g1"), vec![1], now)
        .unwrap();
    nflog
        .log_resolved(&recv("b"), &GroupKey::must("g2"), vec![2], now)
        .unwrap();

    let mut buf = Vec::new();
    let written = nflog.snapshot(&mut buf).unwrap();
    assert_eq!(written as usize, buf.len());

    let restored = store();
    restored
        .load_snapshot(&mut std::io::Cursor::new(buf))
        .unwrap();

    let mut a = nflog.query(&NflogQuery::new()).unwrap();
    let mut b = restored.query(&NflogQuery::new()).unwrap();
    a.sort_by_key(|e| e.receiver.to_string());
    b.sort_by_key(|e| e.receiver.to_string());
    assert_eq!(a, b);
}

#[test]
fn snapshot_file_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nflog.snap");
    let nflog = store();
    nflog
        .log_active(&recv("a"), &GroupKey::must("g1"), vec![1], t0())
        .unwrap();

    nflog.snapshot_to_file(&path).unwrap();

    let restored = store();
    let mut file = std::fs::File::open(&path).unwrap();
    restored.load_snapshot(&mut file).unwrap();
    assert_eq!(restored.len(), 1);
}

#[test]
fn log_broadcasts_entry() {
    let capture = CapturingBroadcast::new();
    let nflog =
        NotificationLog::with_broadcast(&NflogConfig::default(), Box::new(capture.clone()))
            .unwrap();
    let now = t0();

    nflog
        .log_active(&recv("team-x"), &GroupKey::must("g1"), vec![7], now)
        .unwrap();

    let deltas = capture.take();
    assert_eq!(deltas.len(), 1);
    let decoded: Vec<LogEntry> =
        codec::read_entries(&mut std::io::Cursor::new(deltas[0].clone())).unwrap();
    assert_eq!(decoded[0].hash, vec![7]);
}

#[test]
fn merge_keeps_later_timestamp() {
    let nflog = store();
    let now = t0();
    let gk = GroupKey::must("g1");

    nflog
        .log_active(&recv("team-x"), &gk, vec![1], now + mins(5))
        .unwrap();

    // Older peer entry loses.
    let stale = LogEntry {
        receiver: recv("team-x"),
        group_key: gk.clone(),
        hash: vec![9],
        timestamp: now,
        resolved: true,
        expires_at: now + mins(600),
    };
    let delta = codec::encode_entries(&[stale]).unwrap();
    assert!(nflog.merge(&delta, now).unwrap().is_empty());

    // Newer peer entry wins.
    let fresh = LogEntry {
        receiver: recv("team-x"),
        group_key: gk.clone(),
        hash: vec![8],
        timestamp: now + mins(10),
        resolved: true,
        expires_at: now + mins(600),
    };
    let delta = codec::encode_entries(&[fresh]).unwrap();
    assert_eq!(nflog.merge(&delta, now).unwrap().len(), 1);

    let entries = nflog
        .query(&NflogQuery::new().receiver(recv("team-x")).group_key(gk))
        .unwrap();
    assert_eq!(entries[0].hash, vec![8]);
}

#[test]
fn merge_ties_break_on_expiry() {
    let nflog = store();
    let now = t0();
    let gk = GroupKey::must("g1");

    let base = LogEntry {
        receiver: recv("team-x"),
        group_key: gk.clone(),
        hash: vec![1],
        timestamp: now,
        resolved: false,
        expires_at: now + mins(60),
    };
    let delta = codec::encode_entries(&[base.clone()]).unwrap();
    nflog.merge(&delta, now).unwrap();

    let mut longer = base.clone();
    longer.hash = vec![2];
    longer.expires_at = now + mins(120);
    let delta = codec::encode_entries(&[longer]).unwrap();
    assert_eq!(nflog.merge(&delta, now).unwrap().len(), 1);

    let mut shorter = base;
    shorter.hash = vec![3];
    shorter.expires_at = now + mins(30);
    let delta = codec::encode_entries(&[shorter]).unwrap();
    assert!(nflog.merge(&delta, now).unwrap().is_empty());

    let entries = nflog.query(&NflogQuery::new()).unwrap();
    assert_eq!(entries[0].hash, vec![2]);
}

#[test]
fn merge_skips_expired_on_first_sight() {
    let nflog = store();
    let now = t0();

    let ghost = LogEntry {
        receiver: recv("team-x"),
        group_key: GroupKey::must("g1"),
        hash: vec![1],
        timestamp: now - mins(600),
        resolved: false,
        expires_at: now - mins(1),
    };
    let delta = codec::encode_entries(&[ghost]).unwrap();
    assert!(nflog.merge(&delta, now).unwrap().is_empty());
    assert!(nflog.is_empty());
}

fn arbitrary_entry(group: u8, ts_min: i64, expiry_min: i64) -> LogEntry {
    let now = t0();
    LogEntry {
        receiver: recv("team-x"),
        group_key: GroupKey::must(&format!("g{}", group)),
        hash: vec![group, ts_min.unsigned_abs() as u8],
        timestamp: now + mins(ts_min),
        resolved: ts_min % 2 == 0,
        expires_at: now + mins(600 + expiry_min),
    }
}

fn merged_state(deltas: &[Vec<LogEntry>]) -> Vec<(String, Vec<u8>)> {
    let nflog = store();
    let now = t0();
    for delta in deltas {
        let buf = codec::encode_entries(delta).unwrap();
        nflog.merge(&buf, now).unwrap();
    }
    let mut result: Vec<(String, Vec<u8>)> = nflog
        .query(&NflogQuery::new())
        .unwrap()
        .into_iter()
        .map(|e| (e.group_key.to_string(), e.hash))
        .collect();
    result.sort();
    result
}

proptest! {
    // Merge converges regardless of delivery order or batching.
    #[test]
    fn merge_order_does_not_matter(
        entries in proptest::collection::vec((0u8..3, -10i64..10, -10i64..10), 1..8)
    ) {
        let entries: Vec<LogEntry> = entries
            .iter()
            .map(|(g, ts, exp)| arbitrary_entry(*g, *ts, *exp))
            .collect();

        let forward = merged_state(&[entries.clone()]);
        let reversed: Vec<LogEntry> = entries.iter().rev().cloned().collect();
        prop_assert_eq!(&forward, &merged_state(&[reversed]));

        for cut in 0..entries.len() {
            let split = merged_state(&[entries[..cut].to_vec(), entries[cut..].to_vec()]);
            prop_assert_eq!(&forward, &split);
        }
    }
}
