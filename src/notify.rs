//! Post-publish notifications
//!
//! Notification is best-effort: the orchestrator calls [`Notifier::notify`]
//! once per event, logs any failure and moves on. Delivery to the sink is the
//! durability boundary, so a failed notification never undoes a delivered mark.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{WebhookConfig, WebhookEvent};
use crate::error::NotifyError;
use crate::types::ItemId;

/// Structured event handed to a [`Notifier`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum NotifyEvent {
    /// One artifact reached the sink
    Published {
        /// Owning item
        item_id: ItemId,
        /// Item title
        title: String,
        /// Public URL returned by the sink
        external_url: String,
        /// Item tags
        tags: Vec<String>,
    },

    /// End-of-run totals
    RunSummary {
        /// Items known to the ledger
        total_found: u64,
        /// Artifacts fetched this run
        fetched: u64,
        /// Artifacts published this run
        published: u64,
        /// Errors this run
        errors: u64,
    },
}

impl NotifyEvent {
    /// Webhook filter this event is delivered under
    pub fn webhook_event(&self) -> WebhookEvent {
        match self {
            NotifyEvent::Published { .. } => WebhookEvent::OnPublished,
            NotifyEvent::RunSummary { .. } => WebhookEvent::OnRunComplete,
        }
    }
}

/// Receives post-publish events
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver one event. Failures are reported, never retried.
    async fn notify(&self, event: &NotifyEvent) -> Result<(), NotifyError>;

    /// Human-readable name for logging
    fn name(&self) -> &str;
}

/// Discards every event
#[derive(Clone, Copy, Debug, Default)]
pub struct NoOpNotifier;

#[async_trait]
impl Notifier for NoOpNotifier {
    async fn notify(&self, _event: &NotifyEvent) -> Result<(), NotifyError> {
        Ok(())
    }

    fn name(&self) -> &str {
        "noop"
    }
}

/// Body POSTed to webhooks
#[derive(Serialize)]
struct WebhookPayload<'a> {
    #[serde(flatten)]
    event: &'a NotifyEvent,
    /// Unix timestamp when the payload was built
    timestamp: i64,
}

/// POSTs events as JSON to the configured webhooks
#[derive(Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    webhooks: Vec<WebhookConfig>,
}

impl WebhookNotifier {
    /// Create a notifier for the given webhooks
    pub fn new(webhooks: Vec<WebhookConfig>) -> Self {
        Self {
            client: reqwest::Client::new(),
            webhooks,
        }
    }

    async fn send(&self, webhook: &WebhookConfig, payload: &WebhookPayload<'_>) -> Result<(), NotifyError> {
        let mut request = self.client.post(&webhook.url).json(payload).timeout(webhook.timeout);
        if let Some(auth) = &webhook.auth_header {
            request = request.header("Authorization", auth);
        }

        match tokio::time::timeout(webhook.timeout, request.send()).await {
            Ok(Ok(response)) if response.status().is_success() => {
                tracing::debug!(url = %webhook.url, "webhook sent successfully");
                Ok(())
            }
            Ok(Ok(response)) => Err(NotifyError::Status {
                url: webhook.url.clone(),
                status: response.status().as_u16(),
            }),
            Ok(Err(e)) if e.is_timeout() => Err(NotifyError::Timeout {
                url: webhook.url.clone(),
                timeout: webhook.timeout,
            }),
            Ok(Err(e)) => Err(NotifyError::Request {
                url: webhook.url.clone(),
                reason: e.to_string(),
            }),
            Err(_) => Err(NotifyError::Timeout {
                url: webhook.url.clone(),
                timeout: webhook.timeout,
            }),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, event: &NotifyEvent) -> Result<(), NotifyError> {
        let kind = event.webhook_event();
        let payload = WebhookPayload {
            event,
            timestamp: chrono::Utc::now().timestamp(),
        };

        // Every matching hook gets the event; the first failure is reported
        let mut first_error = None;
        for webhook in self.webhooks.iter().filter(|w| w.events.contains(&kind)) {
            if let Err(e) = self.send(webhook, &payload).await {
                tracing::warn!(url = %webhook.url, error = %e, "webhook failed");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn name(&self) -> &str {
        "webhook"
    }
}
