//! The notification pipeline: routing, shared muting preamble, and
//! per-receiver fanout of per-integration stage chains.
//!
//! Chain shape per integration:
//! `Wait → FilterResolved → Dedup → Retry → SetNotifies`,
//! fronted by shared `Inhibit → Silence` stages and selected by receiver
//! name. Stages suspend only at I/O and explicit wait points; every
//! suspension honours cancellation and the pipeline deadline.

pub mod context;
pub mod retry;
pub mod stages;

pub use context::NotifyContext;
pub use retry::{BackoffPolicy, RetryStage};
pub use stages::{
    DedupStage, FilterResolvedStage, InhibitStage, MarkerInhibitor, Muter, SetNotifiesStage,
    SilenceStage, WaitStage,
};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::cluster::{peer_wait, PeerPosition};
use crate::integration::Integration;
use crate::marker::Marker;
use crate::metrics::NotifyMetrics;
use crate::nflog::NotificationLog;
use crate::silence::Silencer;
use crate::types::{Alert, Error, PipelineConfig, Result};

/// Polymorphic unit of pipeline work.
///
/// A stage receives the context and the current alert batch, and hands both
/// on, possibly narrowed. Errors propagate verbatim to the caller.
#[async_trait::async_trait]
pub trait Stage: Send + Sync + fmt::Debug {
    async fn exec(
        &self,
        ctx: NotifyContext,
        alerts: Vec<Alert>,
    ) -> Result<(NotifyContext, Vec<Alert>)>;
}

/// Executes stages in sequence, short-circuiting once the alert batch is
/// empty.
#[derive(Debug, Default)]
pub struct MultiStage {
    stages: Vec<Arc<dyn Stage>>,
}

impl MultiStage {
    pub fn new(stages: Vec<Arc<dyn Stage>>) -> Self {
        Self { stages }
    }
}

#[async_trait::async_trait]
impl Stage for MultiStage {
    async fn exec(
        &self,
        mut ctx: NotifyContext,
        mut alerts: Vec<Alert>,
    ) -> Result<(NotifyContext, Vec<Alert>)> {
        for stage in &self.stages {
            if alerts.is_empty() {
                return Ok((ctx, alerts));
            }
            (ctx, alerts) = stage.exec(ctx, alerts).await?;
        }
        Ok((ctx, alerts))
    }
}

/// Runs child stages concurrently, one task per child. Child failures are
/// gathered into one aggregate error and do not cancel siblings. The input
/// alerts pass through unchanged: fanout is side-effecting only.
#[derive(Debug, Default)]
pub struct FanoutStage {
    stages: Vec<Arc<dyn Stage>>,
}

impl FanoutStage {
    pub fn new(stages: Vec<Arc<dyn Stage>>) -> Self {
        Self { stages }
    }
}

#[async_trait::async_trait]
impl Stage for FanoutStage {
    async fn exec(
        &self,
        ctx: NotifyContext,
        alerts: Vec<Alert>,
    ) -> Result<(NotifyContext, Vec<Alert>)> {
        let handles: Vec<_> = self
            .stages
            .iter()
            .map(|stage| {
                let stage = Arc::clone(stage);
                let child_ctx = ctx.clone();
                let child_alerts = alerts.clone();
                tokio::spawn(async move { stage.exec(child_ctx, child_alerts).await })
            })
            .collect();

        let errs: Vec<Error> = futures::future::join_all(handles)
            .await
            .into_iter()
            .filter_map(|joined| match joined {
                Ok(Ok(_)) => None,
                Ok(Err(e)) => Some(e),
                Err(join_err) => Some(Error::cancelled(format!(
                    "notify chain aborted: {}",
                    join_err
                ))),
            })
            .collect();
        Error::from_many(errs)?;
        Ok((ctx, alerts))
    }
}

/// Selects the per-receiver chain by the receiver name carried in the
/// context.
#[derive(Debug, Default)]
pub struct RoutingStage {
    stages: HashMap<String, Arc<dyn Stage>>,
}

impl RoutingStage {
    pub fn new(stages: HashMap<String, Arc<dyn Stage>>) -> Self {
        Self { stages }
    }

    pub fn receiver_names(&self) -> impl Iterator<Item = &str> {
        self.stages.keys().map(String::as_str)
    }
}

#[async_trait::async_trait]
impl Stage for RoutingStage {
    async fn exec(
        &self,
        ctx: NotifyContext,
        alerts: Vec<Alert>,
    ) -> Result<(NotifyContext, Vec<Alert>)> {
        let name = ctx.receiver_name()?;
        let stage = self
            .stages
            .get(name)
            .ok_or_else(|| Error::not_found(format!("no stage for receiver {}", name)))?
            .clone();
        stage.exec(ctx, alerts).await
    }
}

/// The assembled notification pipeline for a configured set of receivers.
#[derive(Debug)]
pub struct Pipeline {
    routing: RoutingStage,
    min_notify_timeout: Duration,
}

impl Pipeline {
    /// Entry point: enforces the minimum deadline, then routes.
    ///
    /// Returns the alerts that were actually dispatched (empty when every
    /// chain deduplicated or muted them away).
    pub async fn exec(&self, ctx: NotifyContext, alerts: Vec<Alert>) -> Result<Vec<Alert>> {
        let ctx = ctx.ensure_min_deadline(self.min_notify_timeout);
        debug!(
            receiver = ctx.receiver_name().unwrap_or("?"),
            alerts = alerts.len(),
            "pipeline exec"
        );
        let (_, alerts) = self.routing.exec(ctx, alerts).await?;
        Ok(alerts)
    }
}

/// Wires receivers into the full stage graph.
pub struct PipelineBuilder {
    cfg: PipelineConfig,
    peer: Arc<dyn PeerPosition>,
    metrics: NotifyMetrics,
}

impl fmt::Debug for PipelineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineBuilder").finish()
    }
}

impl PipelineBuilder {
    pub fn new(cfg: PipelineConfig, peer: Arc<dyn PeerPosition>) -> Result<Self> {
        Ok(Self {
            cfg,
            peer,
            metrics: NotifyMetrics::new()?,
        })
    }

    /// Metric bundle for registration against the embedding registry.
    pub fn metrics(&self) -> &NotifyMetrics {
        &self.metrics
    }

    /// Build the pipeline:
    /// `Routing ∘ (Inhibit → Silence → Fanout[per-integration chains])`.
    pub fn build(
        &self,
        receivers: HashMap<String, Vec<Integration>>,
        inhibitor: Arc<dyn Muter>,
        silencer: Arc<Silencer>,
        marker: Arc<Marker>,
        nflog: Arc<NotificationLog>,
    ) -> Pipeline {
        let backoff = BackoffPolicy {
            initial: self.cfg.backoff_initial,
            max: self.cfg.backoff_max,
            ..BackoffPolicy::default()
        };

        let mut routes: HashMap<String, Arc<dyn Stage>> = HashMap::new();
        for (group_name, integrations) in receivers {
            let chains: Vec<Arc<dyn Stage>> = integrations
                .into_iter()
                .map(|integration| {
                    self.integration_chain(&group_name, integration, &backoff, &nflog)
                })
                .collect();

            let route = MultiStage::new(vec![
                Arc::new(InhibitStage::new(inhibitor.clone(), marker.clone())),
                Arc::new(SilenceStage::new(silencer.clone(), marker.clone())),
                Arc::new(FanoutStage::new(chains)),
            ]);
            routes.insert(group_name, Arc::new(route));
        }

        Pipeline {
            routing: RoutingStage::new(routes),
            min_notify_timeout: self.cfg.min_notify_timeout,
        }
    }

    fn integration_chain(
        &self,
        group_name: &str,
        integration: Integration,
        backoff: &BackoffPolicy,
        nflog: &Arc<NotificationLog>,
    ) -> Arc<dyn Stage> {
        let receiver = integration.receiver(group_name);
        let send_resolved = integration.send_resolved();
        let integration = Arc::new(integration);

        let peer = self.peer.clone();
        let peer_timeout = self.cfg.peer_timeout;
        let wait = WaitStage::new(Arc::new(move || peer_wait(peer.as_ref(), peer_timeout)));

        Arc::new(MultiStage::new(vec![
            Arc::new(wait),
            Arc::new(FilterResolvedStage::new(send_resolved)),
            Arc::new(DedupStage::new(nflog.clone(), receiver.clone())),
            Arc::new(RetryStage::new(
                integration,
                backoff.clone(),
                self.metrics.clone(),
            )),
            Arc::new(SetNotifiesStage::new(nflog.clone(), receiver)),
        ]))
    }
}
