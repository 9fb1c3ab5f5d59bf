//! Retry with exponential backoff under the pipeline deadline.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::{sleep, sleep_until};
use tracing::{debug, warn};

use crate::integration::Integration;
use crate::metrics::NotifyMetrics;
use crate::pipeline::context::NotifyContext;
use crate::pipeline::Stage;
use crate::types::{Alert, Error, Result};

/// Injectable backoff policy: exponential growth from `initial` to `max`
/// with optional jitter.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry attempt `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.initial.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = exp.min(self.max.as_secs_f64());
        let secs = if self.jitter {
            // Half fixed, half random: bounded below so retries never
            // stampede at zero delay.
            let half = capped / 2.0;
            half + rand::thread_rng().gen_range(0.0..=half)
        } else {
            capped
        };
        Duration::from_secs_f64(secs)
    }
}

/// Invokes the integration, retrying transient failures with backoff until
/// success, a permanent error, cancellation, or the deadline.
pub struct RetryStage {
    integration: Arc<Integration>,
    backoff: BackoffPolicy,
    metrics: NotifyMetrics,
}

impl std::fmt::Debug for RetryStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryStage")
            .field("integration", &self.integration.kind())
            .finish()
    }
}

impl RetryStage {
    pub fn new(
        integration: Arc<Integration>,
        backoff: BackoffPolicy,
        metrics: NotifyMetrics,
    ) -> Self {
        Self {
            integration,
            backoff,
            metrics,
        }
    }

    async fn attempt(&self, ctx: &NotifyContext, alerts: &[Alert]) -> Result<()> {
        let kind = self.integration.kind();
        let timer = self
            .metrics
            .notification_latency_seconds
            .with_label_values(&[kind])
            .start_timer();
        let result = match ctx.deadline() {
            Some(deadline) => tokio::select! {
                r = self.integration.notify(ctx, alerts) => r,
                _ = sleep_until(deadline) => Err(Error::timeout("notify deadline exceeded")),
                _ = ctx.cancellation().cancelled() => {
                    Err(Error::cancelled("notify context cancelled"))
                }
            },
            None => tokio::select! {
                r = self.integration.notify(ctx, alerts) => r,
                _ = ctx.cancellation().cancelled() => {
                    Err(Error::cancelled("notify context cancelled"))
                }
            },
        };
        timer.observe_duration();

        self.metrics
            .notifications_total
            .with_label_values(&[kind])
            .inc();
        if result.is_err() {
            self.metrics
                .notifications_failed_total
                .with_label_values(&[kind])
                .inc();
        }
        result
    }

    /// Sleep the backoff delay, aborting early on cancellation or deadline.
    async fn wait_backoff(&self, ctx: &NotifyContext, attempt: u32) -> Result<()> {
        let delay = self.backoff.delay(attempt);
        match ctx.deadline() {
            Some(deadline) => tokio::select! {
                _ = sleep(delay) => Ok(()),
                _ = sleep_until(deadline) => Err(Error::timeout("notify deadline exceeded")),
                _ = ctx.cancellation().cancelled() => {
                    Err(Error::cancelled("notify context cancelled"))
                }
            },
            None => tokio::select! {
                _ = sleep(delay) => Ok(()),
                _ = ctx.cancellation().cancelled() => {
                    Err(Error::cancelled("notify context cancelled"))
                }
            },
        }
    }
}

#[async_trait::async_trait]
impl Stage for RetryStage {
    async fn exec(
        &self,
        ctx: NotifyContext,
        alerts: Vec<Alert>,
    ) -> Result<(NotifyContext, Vec<Alert>)> {
        let kind = self.integration.kind().to_string();
        let mut attempt: u32 = 0;

        loop {
            ctx.check_live()?;

            match self.attempt(&ctx, &alerts).await {
                Ok(()) => {
                    debug!(integration = %kind, attempts = attempt + 1, "notified");
                    return Ok((ctx, alerts));
                }
                Err(e) if e.is_transient() => {
                    warn!(integration = %kind, attempt = attempt + 1, error = %e, "notify failed, retrying");
                    self.wait_backoff(&ctx, attempt).await.map_err(|abort| {
                        match abort {
                            Error::Timeout(_) => Error::timeout(format!(
                                "notify aborted after {} attempts, last error: {}",
                                attempt + 1,
                                e
                            )),
                            other => other,
                        }
                    })?;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
