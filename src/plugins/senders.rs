use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use lapin::{BasicProperties, Channel, options::BasicPublishOptions};
use reqwest::Client;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use crate::{
    models::request::{ActionKind, NotificationRequest},
    plugins::{PluginError, PluginParameters, RecipientSender, SendFailure},
};

pub const LOG: &str = "log";
pub const WEBHOOK: &str = "webhook";
pub const AMQP: &str = "amqp";

const DEFAULT_WEBHOOK_TIMEOUT_MS: u64 = 10_000;

/// Wire shape handed to downstream recipients.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundNotification<'a> {
    pub request_id: &'a str,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<&'a str>,

    pub action: ActionKind,
    pub payload: &'a JsonValue,
    pub created_at: DateTime<Utc>,
}

impl<'a> From<&'a NotificationRequest> for OutboundNotification<'a> {
    fn from(request: &'a NotificationRequest) -> Self {
        Self {
            request_id: &request.request_id,
            owner: request.owner.as_deref(),
            action: request.action,
            payload: &request.payload,
            created_at: request.created_at,
        }
    }
}

/// Writes every request to the service log. Fire-and-forget.
#[derive(Debug, Clone)]
pub struct LogSender {
    label: String,
    direct: bool,
}

impl LogSender {
    pub fn from_parameters(
        parameters: &PluginParameters<'_>,
        label: &str,
    ) -> Result<Arc<dyn RecipientSender>, PluginError> {
        Ok(Arc::new(Self {
            label: label.to_string(),
            direct: parameters.optional_bool("direct")?.unwrap_or(false),
        }))
    }
}

#[async_trait]
impl RecipientSender for LogSender {
    async fn send(&self, requests: &[NotificationRequest]) -> Result<Vec<SendFailure>, PluginError> {
        for request in requests {
            info!(
                recipient = %self.label,
                request_id = %request.request_id,
                action = request.action.as_str(),
                "Notification delivered to log recipient"
            );
        }
        Ok(Vec::new())
    }

    fn is_ack_required(&self) -> bool {
        false
    }

    fn accepts_direct_notifications(&self) -> bool {
        self.direct
    }

    fn label(&self) -> &str {
        &self.label
    }
}

/// POSTs each request as JSON to a fixed URL; any non-2xx answer fails that request.
#[derive(Debug, Clone)]
pub struct WebhookSender {
    label: String,
    url: String,
    http_client: Client,
    ack_required: bool,
    direct: bool,
}

impl WebhookSender {
    pub fn new(label: &str, url: &str, timeout: Duration) -> Result<Self, PluginError> {
        let http_client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            label: label.to_string(),
            url: url.to_string(),
            http_client,
            ack_required: true,
            direct: false,
        })
    }

    pub fn from_parameters(
        parameters: &PluginParameters<'_>,
        label: &str,
    ) -> Result<Arc<dyn RecipientSender>, PluginError> {
        let url = parameters.require_str("url")?;

        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(PluginError::invalid("url", "must be an http(s) URL"));
        }

        let timeout_ms = parameters
            .optional_u64("timeout_ms")?
            .unwrap_or(DEFAULT_WEBHOOK_TIMEOUT_MS);

        let mut sender = Self::new(label, url, Duration::from_millis(timeout_ms))?;
        sender.ack_required = parameters.optional_bool("ack_required")?.unwrap_or(true);
        sender.direct = parameters.optional_bool("direct")?.unwrap_or(false);

        info!(recipient = %label, url = %url, "Webhook sender initialized");

        Ok(Arc::new(sender))
    }

    async fn post_one(&self, request: &NotificationRequest) -> Result<(), String> {
        let response = self
            .http_client
            .post(&self.url)
            .header("X-Request-Id", request.request_id.as_str())
            .json(&OutboundNotification::from(request))
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(format!("Webhook returned status {}", status))
        }
    }
}

#[async_trait]
impl RecipientSender for WebhookSender {
    async fn send(&self, requests: &[NotificationRequest]) -> Result<Vec<SendFailure>, PluginError> {
        debug!(recipient = %self.label, batch = requests.len(), "Posting batch to webhook");

        let results = join_all(requests.iter().map(|request| async move {
            self.post_one(request)
                .await
                .map_err(|cause| SendFailure::new(request.id, cause))
        }))
        .await;

        let failures: Vec<SendFailure> = results.into_iter().filter_map(Result::err).collect();

        if !failures.is_empty() {
            warn!(
                recipient = %self.label,
                failed = failures.len(),
                batch = requests.len(),
                "Webhook rejected part of the batch"
            );
        }

        Ok(failures)
    }

    fn is_ack_required(&self) -> bool {
        self.ack_required
    }

    fn accepts_direct_notifications(&self) -> bool {
        self.direct
    }

    fn label(&self) -> &str {
        &self.label
    }
}

/// Publishes each request to an AMQP exchange with persistent delivery.
#[derive(Debug, Clone)]
pub struct AmqpSender {
    label: String,
    channel: Channel,
    exchange: String,
    routing_key: String,
    direct: bool,
}

impl AmqpSender {
    /// Factory bound to a broker channel opened at start-up.
    pub fn factory(
        channel: Channel,
    ) -> impl Fn(&PluginParameters<'_>, &str) -> Result<Arc<dyn RecipientSender>, PluginError>
    + Send
    + Sync
    + 'static {
        move |parameters: &PluginParameters<'_>, label: &str| {
            let exchange = parameters
                .get("exchange")
                .and_then(JsonValue::as_str)
                .unwrap_or_default()
                .to_string();
            let routing_key = parameters.require_str("routing_key")?.to_string();

            Ok(Arc::new(AmqpSender {
                label: label.to_string(),
                channel: channel.clone(),
                exchange,
                routing_key,
                direct: parameters.optional_bool("direct")?.unwrap_or(false),
            }) as Arc<dyn RecipientSender>)
        }
    }

    async fn publish_one(&self, request: &NotificationRequest) -> Result<(), PluginError> {
        let payload = serde_json::to_vec(&OutboundNotification::from(request))?;

        self.channel
            .basic_publish(
                &self.exchange,
                &self.routing_key,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default()
                    .with_delivery_mode(2)
                    .with_content_type("application/json".into()),
            )
            .await?
            .await?;

        Ok(())
    }
}

#[async_trait]
impl RecipientSender for AmqpSender {
    async fn send(&self, requests: &[NotificationRequest]) -> Result<Vec<SendFailure>, PluginError> {
        if !self.channel.status().connected() {
            return Err(PluginError::Delivery("broker channel is closed".to_string()));
        }

        let mut failures = Vec::new();
        for request in requests {
            if let Err(e) = self.publish_one(request).await {
                failures.push(SendFailure::new(request.id, e.to_string()));
            }
        }

        Ok(failures)
    }

    fn accepts_direct_notifications(&self) -> bool {
        self.direct
    }

    fn label(&self) -> &str {
        &self.label
    }
}
