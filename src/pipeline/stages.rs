//! The per-integration stage chain: muting preamble, peer wait, resolved
//! filtering, dedup against the notification log, and the commit stage.

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, sleep_until};
use tracing::debug;

use crate::marker::Marker;
use crate::nflog::{LogEntry, NflogQuery, NotificationLog, ReceiverDescriptor};
use crate::pipeline::context::NotifyContext;
use crate::pipeline::Stage;
use crate::silence::Silencer;
use crate::types::{batch_hash, batch_resolved, Alert, Error, LabelSet, Result};

/// A mute decision source. The silence evaluator is one; the embedding
/// router's inhibitor is another.
pub trait Muter: Send + Sync + fmt::Debug {
    fn mutes(&self, labels: &LabelSet, now: DateTime<Utc>) -> bool;
}

impl Muter for Silencer {
    fn mutes(&self, labels: &LabelSet, now: DateTime<Utc>) -> bool {
        Silencer::mutes(self, labels, now)
    }
}

/// Muter that reads precomputed inhibition marks. Routers that evaluate
/// inhibition rules out-of-band mark alerts and hand this to the pipeline.
#[derive(Debug)]
pub struct MarkerInhibitor(pub Arc<Marker>);

impl Muter for MarkerInhibitor {
    fn mutes(&self, labels: &LabelSet, _now: DateTime<Utc>) -> bool {
        self.0.is_inhibited(labels.fingerprint())
    }
}

/// Drops inhibited alerts. Never fails.
#[derive(Debug)]
pub struct InhibitStage {
    muter: Arc<dyn Muter>,
    marker: Arc<Marker>,
}

impl InhibitStage {
    pub fn new(muter: Arc<dyn Muter>, marker: Arc<Marker>) -> Self {
        Self { muter, marker }
    }
}

#[async_trait::async_trait]
impl Stage for InhibitStage {
    async fn exec(
        &self,
        ctx: NotifyContext,
        alerts: Vec<Alert>,
    ) -> Result<(NotifyContext, Vec<Alert>)> {
        let mut kept = Vec::with_capacity(alerts.len());
        for mut alert in alerts {
            let fp = alert.fingerprint();
            // Previous verdict, read before the muter refreshes the mark.
            let was = self.marker.is_inhibited(fp);
            let muted = self.muter.mutes(&alert.labels, ctx.now());
            self.marker.set_inhibited(fp, muted);
            if muted {
                continue;
            }
            if was {
                alert.was_inhibited = true;
            }
            kept.push(alert);
        }
        Ok((ctx, kept))
    }
}

/// Drops silenced alerts via the silence evaluator. Never fails.
#[derive(Debug)]
pub struct SilenceStage {
    silencer: Arc<Silencer>,
    marker: Arc<Marker>,
}

impl SilenceStage {
    pub fn new(silencer: Arc<Silencer>, marker: Arc<Marker>) -> Self {
        Self { silencer, marker }
    }
}

#[async_trait::async_trait]
impl Stage for SilenceStage {
    async fn exec(
        &self,
        ctx: NotifyContext,
        alerts: Vec<Alert>,
    ) -> Result<(NotifyContext, Vec<Alert>)> {
        let mut kept = Vec::with_capacity(alerts.len());
        for mut alert in alerts {
            let fp = alert.fingerprint();
            // The silencer rewrites the mark; capture the prior one first.
            let was = self.marker.is_silenced(fp);
            if self.silencer.mutes(&alert.labels, ctx.now()) {
                continue;
            }
            if was {
                alert.was_silenced = true;
            }
            kept.push(alert);
        }
        Ok((ctx, kept))
    }
}

/// Holds this node back proportionally to its peer position so earlier
/// peers get to write the notification log first.
pub struct WaitStage {
    wait: Arc<dyn Fn() -> Duration + Send + Sync>,
}

impl fmt::Debug for WaitStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitStage").finish()
    }
}

impl WaitStage {
    pub fn new(wait: Arc<dyn Fn() -> Duration + Send + Sync>) -> Self {
        Self { wait }
    }

    pub fn fixed(duration: Duration) -> Self {
        Self::new(Arc::new(move || duration))
    }
}

#[async_trait::async_trait]
impl Stage for WaitStage {
    async fn exec(
        &self,
        ctx: NotifyContext,
        alerts: Vec<Alert>,
    ) -> Result<(NotifyContext, Vec<Alert>)> {
        let duration = (self.wait)();
        if duration.is_zero() {
            return Ok((ctx, alerts));
        }
        match ctx.deadline() {
            Some(deadline) => tokio::select! {
                _ = sleep(duration) => {}
                _ = sleep_until(deadline) => {
                    return Err(Error::timeout("notify deadline exceeded"))
                }
                _ = ctx.cancellation().cancelled() => {
                    return Err(Error::cancelled("notify context cancelled"))
                }
            },
            None => tokio::select! {
                _ = sleep(duration) => {}
                _ = ctx.cancellation().cancelled() => {
                    return Err(Error::cancelled("notify context cancelled"))
                }
            },
        }
        Ok((ctx, alerts))
    }
}

/// Drops resolved alerts for integrations that do not send resolutions.
#[derive(Debug)]
pub struct FilterResolvedStage {
    send_resolved: bool,
}

impl FilterResolvedStage {
    pub fn new(send_resolved: bool) -> Self {
        Self { send_resolved }
    }
}

#[async_trait::async_trait]
impl Stage for FilterResolvedStage {
    async fn exec(
        &self,
        ctx: NotifyContext,
        mut alerts: Vec<Alert>,
    ) -> Result<(NotifyContext, Vec<Alert>)> {
        if !self.send_resolved {
            let now = ctx.now();
            alerts.retain(|a| !a.resolved_at(now));
        }
        Ok((ctx, alerts))
    }
}

/// Decides whether this batch still needs notifying, against the
/// notification log. Attaches the batch hash to the context for the commit
/// stage.
#[derive(Debug)]
pub struct DedupStage {
    nflog: Arc<NotificationLog>,
    receiver: ReceiverDescriptor,
}

impl DedupStage {
    pub fn new(nflog: Arc<NotificationLog>, receiver: ReceiverDescriptor) -> Self {
        Self { nflog, receiver }
    }

    fn need_update(
        prior: Option<&LogEntry>,
        all_resolved: bool,
        hash: &[u8],
        repeat: chrono::Duration,
        now: DateTime<Utc>,
    ) -> bool {
        match prior {
            // Nothing recorded: only firing batches are worth sending.
            None => !all_resolved,
            Some(entry) if entry.resolved => !all_resolved,
            Some(entry) => {
                if all_resolved {
                    return true;
                }
                if entry.hash != hash {
                    return true;
                }
                now >= entry.timestamp + repeat
            }
        }
    }
}

#[async_trait::async_trait]
impl Stage for DedupStage {
    async fn exec(
        &self,
        ctx: NotifyContext,
        alerts: Vec<Alert>,
    ) -> Result<(NotifyContext, Vec<Alert>)> {
        let group_key = ctx.group_key()?.clone();
        let repeat = ctx.repeat_interval()?;
        let now = ctx.now();

        let hash = batch_hash(&alerts, now);
        let all_resolved = batch_resolved(&alerts, now);

        let entries = self.nflog.query(
            &NflogQuery::new()
                .receiver(self.receiver.clone())
                .group_key(group_key),
        )?;
        // Cluster duplicates converge toward the freshest entry.
        let prior = entries
            .iter()
            .max_by_key(|e| (e.timestamp, e.expires_at));

        let ctx = ctx.with_notification_hash(hash.clone());
        if Self::need_update(prior, all_resolved, &hash, repeat, now) {
            Ok((ctx, alerts))
        } else {
            debug!(receiver = %self.receiver, "deduplicated notification");
            Ok((ctx, Vec::new()))
        }
    }
}

/// Commits the notification to the log. A failure here surfaces: the
/// notification happened but was not recorded, so the next cycle may
/// resend (at-least-once).
#[derive(Debug)]
pub struct SetNotifiesStage {
    nflog: Arc<NotificationLog>,
    receiver: ReceiverDescriptor,
}

impl SetNotifiesStage {
    pub fn new(nflog: Arc<NotificationLog>, receiver: ReceiverDescriptor) -> Self {
        Self { nflog, receiver }
    }
}

#[async_trait::async_trait]
impl Stage for SetNotifiesStage {
    async fn exec(
        &self,
        ctx: NotifyContext,
        alerts: Vec<Alert>,
    ) -> Result<(NotifyContext, Vec<Alert>)> {
        let group_key = ctx.group_key()?.clone();
        let hash = ctx.notification_hash()?.to_vec();
        let now = ctx.now();

        if batch_resolved(&alerts, now) {
            self.nflog
                .log_resolved(&self.receiver, &group_key, hash, now)?;
        } else {
            self.nflog
                .log_active(&self.receiver, &group_key, hash, now)?;
        }
        Ok((ctx, alerts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::silence::{Silence, Silences};
    use crate::types::{GroupKey, NflogConfig, SilencesConfig};
    use chrono::Duration as ChronoDuration;
    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-06-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn alert(job: &str, now: DateTime<Utc>) -> Alert {
        Alert::new(LabelSet::from([("job", job)]), now)
    }

    fn resolved_alert(job: &str, now: DateTime<Utc>) -> Alert {
        let mut a = alert(job, now);
        a.ends_at = Some(now - ChronoDuration::minutes(1));
        a
    }

    fn ctx(now: DateTime<Utc>) -> NotifyContext {
        NotifyContext::new(now)
            .with_group_key(GroupKey::must("g1"))
            .with_repeat_interval(ChronoDuration::hours(1))
    }

    fn recv() -> ReceiverDescriptor {
        ReceiverDescriptor::new("r", "webhook", 0)
    }

    #[tokio::test]
    async fn silence_stage_drops_muted_and_flags_transitions() {
        let now = t0();
        let silences = Arc::new(Silences::new(&SilencesConfig::default()).unwrap());
        let marker = Arc::new(Marker::new());
        let silencer = Arc::new(Silencer::new(silences.clone(), marker.clone()));
        let stage = SilenceStage::new(silencer, marker.clone());

        let matcher =
            crate::matcher::Matcher::new("job", "api", crate::matcher::MatchType::Equal, false)
                .unwrap();
        let id = silences
            .set(
                Silence::new(vec![vec![matcher]], now, now + ChronoDuration::minutes(30)),
                now,
            )
            .unwrap();

        let alerts = vec![alert("api", now), alert("db", now)];
        let (_, kept) = stage.exec(ctx(now), alerts.clone()).await.unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].labels.get("job"), Some("db"));
        assert!(marker.is_silenced(alerts[0].fingerprint()));

        // Expire the silence: the api alert passes again, flagged.
        silences.expire(&id, now + ChronoDuration::minutes(5)).unwrap();
        let later = NotifyContext::new(now + ChronoDuration::minutes(10))
            .with_group_key(GroupKey::must("g1"))
            .with_repeat_interval(ChronoDuration::hours(1));
        let (_, kept) = stage.exec(later, alerts).await.unwrap();
        assert_eq!(kept.len(), 2);
        let api = kept
            .iter()
            .find(|a| a.labels.get("job") == Some("api"))
            .unwrap();
        assert!(api.was_silenced);
        assert!(!kept
            .iter()
            .find(|a| a.labels.get("job") == Some("db"))
            .unwrap()
            .was_silenced);
    }

    #[tokio::test]
    async fn inhibit_stage_reads_marker() {
        let now = t0();
        let marker = Arc::new(Marker::new());
        let stage = InhibitStage::new(Arc::new(MarkerInhibitor(marker.clone())), marker.clone());

        let muted = alert("api", now);
        let free = alert("db", now);
        marker.set_inhibited(muted.fingerprint(), true);

        let (_, kept) = stage
            .exec(ctx(now), vec![muted.clone(), free])
            .await
            .unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].labels.get("job"), Some("db"));

        // Inhibition lifted: alert flows again with the transition flag.
        marker.set_inhibited(muted.fingerprint(), false);
        let (_, kept) = stage.exec(ctx(now), vec![muted]).await.unwrap();
        assert_eq!(kept.len(), 1);
        assert!(kept[0].was_inhibited);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_stage_sleeps_then_passes_through() {
        let stage = WaitStage::fixed(Duration::from_secs(30));
        let before = Instant::now();
        let (_, alerts) = stage.exec(ctx(t0()), vec![alert("api", t0())]).await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert!(Instant::now() - before >= Duration::from_secs(30));
    }

    #[tokio::test]
    async fn wait_stage_honours_cancellation() {
        let stage = WaitStage::fixed(Duration::from_secs(3600));
        let cancel = CancellationToken::new();
        let c = ctx(t0()).with_cancel(cancel.clone());

        let handle = tokio::spawn(async move {
            let stage = stage;
            stage.exec(c, vec![]).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
    }

    #[tokio::test]
    async fn filter_resolved_respects_policy() {
        let now = t0();
        let batch = vec![alert("api", now), resolved_alert("db", now)];

        let keep = FilterResolvedStage::new(true);
        let (_, kept) = keep.exec(ctx(now), batch.clone()).await.unwrap();
        assert_eq!(kept.len(), 2);

        let drop = FilterResolvedStage::new(false);
        let (_, kept) = drop.exec(ctx(now), batch).await.unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].labels.get("job"), Some("api"));

        // All-resolved batch filters to empty: never reaches the nflog.
        let all_resolved = vec![resolved_alert("api", now)];
        let (_, kept) = FilterResolvedStage::new(false)
            .exec(ctx(now), all_resolved)
            .await
            .unwrap();
        assert!(kept.is_empty());
    }

    fn nflog() -> Arc<NotificationLog> {
        Arc::new(NotificationLog::new(&NflogConfig::default()).unwrap())
    }

    #[tokio::test]
    async fn dedup_notifies_on_first_firing_batch() {
        let stage = DedupStage::new(nflog(), recv());
        let now = t0();

        let (out_ctx, kept) = stage.exec(ctx(now), vec![alert("api", now)]).await.unwrap();
        assert_eq!(kept.len(), 1);
        assert!(out_ctx.notification_hash().is_ok());
    }

    #[tokio::test]
    async fn dedup_skips_resolved_batch_with_no_prior() {
        let stage = DedupStage::new(nflog(), recv());
        let now = t0();

        let (_, kept) = stage
            .exec(ctx(now), vec![resolved_alert("api", now)])
            .await
            .unwrap();
        assert!(kept.is_empty(), "nothing to resolve");
    }

    #[tokio::test]
    async fn dedup_repeat_interval_matrix() {
        // Prior firing entry at T; same batch within the repeat interval is
        // suppressed, past it becomes a heartbeat, resolution always goes.
        let log = nflog();
        let now = t0();
        let batch = vec![alert("api", now)];
        let hash = batch_hash(&batch, now);
        log.log_active(&recv(), &GroupKey::must("g1"), hash, now)
            .unwrap();

        let stage = DedupStage::new(log.clone(), recv());

        // T+5m, same hash, within repeat=1h: skip.
        let (_, kept) = stage
            .exec(ctx(now + ChronoDuration::minutes(5)), batch.clone())
            .await
            .unwrap();
        assert!(kept.is_empty());

        // T+61m: heartbeat.
        let (_, kept) = stage
            .exec(ctx(now + ChronoDuration::minutes(61)), batch.clone())
            .await
            .unwrap();
        assert_eq!(kept.len(), 1);

        // T+70m all resolved: send resolution despite repeat interval.
        let mut resolved = batch.clone();
        resolved[0].ends_at = Some(now + ChronoDuration::minutes(65));
        let (_, kept) = stage
            .exec(ctx(now + ChronoDuration::minutes(70)), resolved)
            .await
            .unwrap();
        assert_eq!(kept.len(), 1);

        // Changed alert set within repeat: notify.
        let grown = vec![alert("api", now), alert("db", now)];
        let (_, kept) = stage
            .exec(ctx(now + ChronoDuration::minutes(5)), grown)
            .await
            .unwrap();
        assert_eq!(kept.len(), 2);
    }

    #[tokio::test]
    async fn dedup_after_resolved_entry() {
        let log = nflog();
        let now = t0();
        let batch = vec![alert("api", now)];
        log.log_resolved(&recv(), &GroupKey::must("g1"), batch_hash(&batch, now), now)
            .unwrap();

        let stage = DedupStage::new(log, recv());

        // Still resolved: already notified, skip.
        let mut resolved = batch.clone();
        resolved[0].ends_at = Some(now - ChronoDuration::minutes(1));
        let (_, kept) = stage
            .exec(ctx(now + ChronoDuration::minutes(5)), resolved)
            .await
            .unwrap();
        assert!(kept.is_empty());

        // Re-firing: notify.
        let (_, kept) = stage
            .exec(ctx(now + ChronoDuration::minutes(5)), batch)
            .await
            .unwrap();
        assert_eq!(kept.len(), 1);
    }

    #[tokio::test]
    async fn set_notifies_commits_by_batch_status() {
        let log = nflog();
        let now = t0();
        let stage = SetNotifiesStage::new(log.clone(), recv());

        let firing_ctx = ctx(now).with_notification_hash(vec![1]);
        stage
            .exec(firing_ctx, vec![alert("api", now)])
            .await
            .unwrap();
        let entries = log.query(&NflogQuery::new().receiver(recv())).unwrap();
        assert!(!entries[0].resolved);

        let resolved_ctx = ctx(now + ChronoDuration::minutes(1)).with_notification_hash(vec![2]);
        stage
            .exec(resolved_ctx, vec![resolved_alert("api", now)])
            .await
            .unwrap();
        let entries = log.query(&NflogQuery::new().receiver(recv())).unwrap();
        assert!(entries[0].resolved);
        assert_eq!(entries[0].hash, vec![2]);
    }

    #[tokio::test]
    async fn set_notifies_requires_hash() {
        let stage = SetNotifiesStage::new(nflog(), recv());
        let err = stage.exec(ctx(t0()), vec![]).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
