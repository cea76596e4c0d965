use std::sync::Arc;

use anyhow::{Result, anyhow};
use chrono::Utc;
use tracing::{info, warn};

use crate::{
    clients::{publisher::StatusPublisher, store::NotifierStore},
    models::{
        report::RegistrationReport,
        request::{NotificationRequest, RawEvent},
        status::{NotificationStatus, NotifierEvent},
        tenant::TenantId,
        validation::validate_raw_event,
    },
    services::rule_cache::{RecipientSlot, RuleCache, TenantRules},
};

/// Turns raw events into persisted TO_MATCH (or, for direct events, TO_SEND)
/// requests.
pub struct RegistrationService {
    store: Arc<dyn NotifierStore>,
    cache: Arc<RuleCache>,
    publisher: Arc<dyn StatusPublisher>,
    max_bulk_size: usize,
}

impl RegistrationService {
    pub fn new(
        store: Arc<dyn NotifierStore>,
        cache: Arc<RuleCache>,
        publisher: Arc<dyn StatusPublisher>,
        max_bulk_size: usize,
    ) -> Self {
        Self {
            store,
            cache,
            publisher,
            max_bulk_size,
        }
    }

    /// Validates each event, inserts the accepted ones in one write and
    /// reports GRANTED/DENIED per event. Duplicate events are not collapsed.
    pub async fn register(&self, tenant: &TenantId, events: Vec<RawEvent>) -> Result<RegistrationReport> {
        if events.len() > self.max_bulk_size {
            return Err(anyhow!(
                "Batch of {} events exceeds the bulk size of {}",
                events.len(),
                self.max_bulk_size
            ));
        }

        let rules = if events.iter().any(|event| !event.recipients.is_empty()) {
            Some(self.cache.active_rules(tenant).await?)
        } else {
            None
        };

        let now = Utc::now();
        let mut accepted = Vec::with_capacity(events.len());
        let mut status_events = Vec::with_capacity(events.len());

        for event in events {
            let verdict = validate_raw_event(&event)
                .and_then(|()| check_direct_recipients(&event, rules.as_deref()));

            match verdict {
                Ok(()) => accepted.push(NotificationRequest::from_event(event, now)),
                Err(e) => {
                    warn!(
                        tenant = %tenant,
                        request_id = %event.request_id,
                        reason = %e,
                        "Event denied"
                    );
                    status_events.push(
                        NotifierEvent::new(tenant, event.request_id, event.owner, NotificationStatus::Denied)
                            .with_reason(e.to_string()),
                    );
                }
            }
        }

        let denied = status_events.len();
        let registered = self.store.insert_requests(tenant, &accepted).await?;

        status_events.extend(
            accepted
                .iter()
                .map(|request| NotifierEvent::for_request(tenant, request, NotificationStatus::Granted)),
        );

        if let Err(e) = self.publisher.publish(&status_events).await {
            warn!(tenant = %tenant, error = %e, "Failed to publish registration events");
        }

        info!(tenant = %tenant, registered, denied, "Events registered");

        Ok(RegistrationReport { registered, denied })
    }
}

fn check_direct_recipients(event: &RawEvent, rules: Option<&TenantRules>) -> Result<()> {
    if event.recipients.is_empty() {
        return Ok(());
    }

    let rules = rules.ok_or_else(|| anyhow!("Direct recipients could not be resolved"))?;

    for recipient_id in &event.recipients {
        match rules.recipient(recipient_id) {
            Some(RecipientSlot::Ready { sender, .. }) if sender.accepts_direct_notifications() => {}
            Some(RecipientSlot::Ready { recipient, .. }) => {
                return Err(anyhow!(
                    "Recipient '{}' does not accept direct notifications",
                    recipient.label
                ));
            }
            Some(RecipientSlot::Broken { recipient, .. }) => {
                return Err(anyhow!("Recipient '{}' is unavailable", recipient.label));
            }
            None => return Err(anyhow!("Unknown recipient {}", recipient_id)),
        }
    }

    Ok(())
}
