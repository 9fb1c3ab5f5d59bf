//! Generic webhook integration: POSTs the alert batch as JSON.
//!
//! Status classification follows the shared HTTP contract: 2xx is success,
//! 429 and 5xx are retriable, any other status is permanent. Endpoints
//! that ack with a `message_id` get it echoed back on the next
//! notification for the same group, letting them update in place.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::nflog::{MetadataStore, ReceiverDescriptor};
use crate::pipeline::NotifyContext;
use crate::types::{batch_resolved, Alert, AlertStatus, Error, Result};

use super::Notifier;

const MESSAGE_ID_FIELD: &str = "message_id";

/// Webhook endpoint configuration.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub url: String,

    /// Per-request timeout; the pipeline deadline still applies on top.
    pub timeout: Duration,
}

impl WebhookConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Payload shape posted to the endpoint.
#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    version: &'static str,
    group_key: &'a str,
    status: AlertStatus,
    alerts: &'a [Alert],

    /// Upstream id from a previous ack, when one is on record.
    #[serde(skip_serializing_if = "Option::is_none")]
    message_id: Option<String>,
}

#[derive(Debug)]
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
    /// Message-id tracking, keyed under this integration's receiver.
    metadata: Option<(ReceiverDescriptor, Arc<MetadataStore>)>,
}

impl WebhookNotifier {
    pub fn new(cfg: WebhookConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .build()
            .map_err(|e| Error::permanent(format!("webhook client: {}", e)))?;
        Ok(Self {
            url: cfg.url,
            client,
            metadata: None,
        })
    }

    /// Track upstream message ids in the given store (usually the
    /// notification log's side table) under `receiver`.
    pub fn with_metadata(
        cfg: WebhookConfig,
        receiver: ReceiverDescriptor,
        metadata: Arc<MetadataStore>,
    ) -> Result<Self> {
        let mut notifier = Self::new(cfg)?;
        notifier.metadata = Some((receiver, metadata));
        Ok(notifier)
    }

    fn stored_message_id(&self, ctx: &NotifyContext) -> Option<String> {
        let (receiver, store) = self.metadata.as_ref()?;
        let group_key = ctx.group_key().ok()?;
        store.get(receiver, group_key, MESSAGE_ID_FIELD)
    }

    /// Best-effort: endpoints acking with `{"message_id": ...}` get updates
    /// instead of re-posts next time.
    async fn record_ack(&self, ctx: &NotifyContext, response: reqwest::Response) {
        let Some((receiver, store)) = self.metadata.as_ref() else {
            return;
        };
        let Ok(group_key) = ctx.group_key() else {
            return;
        };
        if let Ok(body) = response.json::<serde_json::Value>().await {
            if let Some(id) = body.get(MESSAGE_ID_FIELD).and_then(|v| v.as_str()) {
                store.set(receiver, group_key, MESSAGE_ID_FIELD, id);
            }
        }
    }
}

#[async_trait::async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, ctx: &NotifyContext, alerts: &[Alert]) -> Result<()> {
        let now = ctx.now();
        let status = if batch_resolved(alerts, now) {
            AlertStatus::Resolved
        } else {
            AlertStatus::Firing
        };
        let payload = WebhookPayload {
            version: "4",
            group_key: ctx.group_key().map(|gk| gk.as_str()).unwrap_or(""),
            status,
            alerts,
            message_id: self.stored_message_id(ctx),
        };

        let response = tokio::select! {
            r = self.client.post(&self.url).json(&payload).send() => r,
            _ = ctx.cancellation().cancelled() => {
                return Err(Error::cancelled("webhook request cancelled"))
            }
        };

        let response = match response {
            Ok(response) => response,
            // Connection-level failures are worth retrying.
            Err(e) => return Err(Error::transient(format!("webhook request: {}", e))),
        };

        let code = response.status();
        if code.is_success() {
            self.record_ack(ctx, response).await;
            return Ok(());
        }
        let msg = format!("webhook returned status {}", code);
        if code.is_server_error() || code == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Err(Error::transient(msg))
        } else {
            Err(Error::permanent(msg))
        }
    }
}
