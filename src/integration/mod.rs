//! Integrations: named delivery channels behind the `Notifier` seam.

pub mod webhook;

pub use webhook::{WebhookConfig, WebhookNotifier};

use std::fmt;
use std::sync::Arc;

use crate::nflog::ReceiverDescriptor;
use crate::pipeline::NotifyContext;
use crate::types::{Alert, Result};

/// A single delivery channel.
///
/// Contract: `Ok(())` means delivered, do not retry. `Error::Transient`
/// means try again under backoff. Any other error is permanent and
/// surfaces to the caller. Implementations must respect the context's
/// cancellation token for long-running I/O.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync + fmt::Debug {
    async fn notify(&self, ctx: &NotifyContext, alerts: &[Alert]) -> Result<()>;
}

/// A notifier bound to its position and resolved-sending policy within a
/// receiver group.
#[derive(Debug, Clone)]
pub struct Integration {
    kind: String,
    idx: u32,
    send_resolved: bool,
    notifier: Arc<dyn Notifier>,
}

impl Integration {
    pub fn new(
        kind: impl Into<String>,
        idx: u32,
        send_resolved: bool,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            kind: kind.into(),
            idx,
            send_resolved,
            notifier,
        }
    }

    /// Transport kind ("webhook", "email", ...).
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn idx(&self) -> u32 {
        self.idx
    }

    pub fn send_resolved(&self) -> bool {
        self.send_resolved
    }

    /// The notification-log key prefix for this integration under the given
    /// receiver group.
    pub fn receiver(&self, group_name: &str) -> ReceiverDescriptor {
        ReceiverDescriptor::new(group_name, self.kind.clone(), self.idx)
    }

    pub async fn notify(&self, ctx: &NotifyContext, alerts: &[Alert]) -> Result<()> {
        self.notifier.notify(ctx, alerts).await
    }
}
