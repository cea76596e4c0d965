use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use crate::models::status::NotifierEvent;

/// Sink for the GRANTED/DENIED/SUCCESS/ERROR lifecycle events.
#[async_trait]
pub trait StatusPublisher: Send + Sync {
    async fn publish(&self, events: &[NotifierEvent]) -> Result<()>;
}

/// Writes events to the service log; used when no broker is configured.
#[derive(Debug, Clone, Default)]
pub struct LogPublisher;

#[async_trait]
impl StatusPublisher for LogPublisher {
    async fn publish(&self, events: &[NotifierEvent]) -> Result<()> {
        for event in events {
            info!(
                tenant = %event.tenant,
                request_id = %event.request_id,
                status = %event.status,
                recipient = event.recipient.as_deref().unwrap_or_default(),
                reason = event.reason.as_deref().unwrap_or_default(),
                "Notifier event"
            );
        }
        Ok(())
    }
}
