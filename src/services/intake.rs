use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
    time::Duration,
};

use anyhow::{Error, Result};
use futures_util::StreamExt;
use lapin::{Consumer, message::Delivery};
use thiserror::Error as ThisError;
use tokio::time::{Instant, timeout};
use tracing::{debug, error, info, warn};

use crate::{
    clients::rbmq::RabbitMqClient,
    models::{message::IntakeMessage, request::RawEvent, tenant::TenantId},
    services::registration::RegistrationService,
};

#[derive(Debug, ThisError)]
pub enum IntakeError {
    #[error("malformed intake message: {0}")]
    Malformed(String),

    #[error("tenant '{0}' is not served by this instance")]
    ForeignTenant(TenantId),
}

impl IntakeError {
    /// Foreign-tenant messages go back to the queue so an instance serving
    /// that tenant can take them. Malformed ones would never decode anywhere.
    pub fn requeue(&self) -> bool {
        matches!(self, IntakeError::ForeignTenant(_))
    }
}

/// Decodes one intake message and checks that this instance serves its tenant.
pub fn decode_intake_message(
    data: &[u8],
    tenants: &HashSet<TenantId>,
) -> Result<(TenantId, RawEvent), IntakeError> {
    let message: IntakeMessage =
        serde_json::from_slice(data).map_err(|e| IntakeError::Malformed(e.to_string()))?;
    let tenant = TenantId::parse(&message.tenant).map_err(|e| IntakeError::Malformed(e.to_string()))?;

    if !tenants.contains(&tenant) {
        return Err(IntakeError::ForeignTenant(tenant));
    }

    Ok((tenant, message.event))
}

/// Drains the intake queue into `register` calls of at most `max_bulk_size`
/// events, flushing early when the queue goes quiet.
pub struct IntakeWorker {
    rbmq: Arc<RabbitMqClient>,
    registration: Arc<RegistrationService>,
    tenants: HashSet<TenantId>,
    max_bulk_size: usize,
    flush_interval: Duration,
}

impl IntakeWorker {
    pub fn new(
        rbmq: Arc<RabbitMqClient>,
        registration: Arc<RegistrationService>,
        tenants: &[TenantId],
        max_bulk_size: usize,
        flush_interval: Duration,
    ) -> Self {
        Self {
            rbmq,
            registration,
            tenants: tenants.iter().cloned().collect(),
            max_bulk_size,
            flush_interval,
        }
    }

    pub async fn run(self, mut consumer: Consumer) -> Result<(), Error> {
        info!(max_bulk_size = self.max_bulk_size, "Intake worker started");

        let mut pending: Vec<Delivery> = Vec::with_capacity(self.max_bulk_size);
        let mut deadline = Instant::now() + self.flush_interval;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());

            match timeout(remaining, consumer.next()).await {
                Ok(Some(Ok(delivery))) => {
                    pending.push(delivery);
                    if pending.len() >= self.max_bulk_size {
                        self.flush(std::mem::take(&mut pending)).await;
                        deadline = Instant::now() + self.flush_interval;
                    }
                }
                Ok(Some(Err(e))) => {
                    error!(error = %e, "Error receiving intake message");
                }
                Ok(None) => {
                    self.flush(std::mem::take(&mut pending)).await;
                    warn!("Intake consumer stream ended");
                    return Ok(());
                }
                Err(_) => {
                    if !pending.is_empty() {
                        self.flush(std::mem::take(&mut pending)).await;
                    }
                    deadline = Instant::now() + self.flush_interval;
                }
            }
        }
    }

    async fn flush(&self, deliveries: Vec<Delivery>) {
        if deliveries.is_empty() {
            return;
        }

        let mut by_tenant: BTreeMap<TenantId, (Vec<u64>, Vec<RawEvent>)> = BTreeMap::new();

        for delivery in deliveries {
            match decode_intake_message(&delivery.data, &self.tenants) {
                Ok((tenant, event)) => {
                    let entry = by_tenant.entry(tenant).or_default();
                    entry.0.push(delivery.delivery_tag);
                    entry.1.push(event);
                }
                Err(e) => {
                    let requeue = e.requeue();
                    if requeue {
                        debug!(
                            delivery_tag = delivery.delivery_tag,
                            error = %e,
                            "Intake message for another instance, requeueing"
                        );
                    } else {
                        warn!(
                            delivery_tag = delivery.delivery_tag,
                            error = %e,
                            "Undecodable intake message, rejecting"
                        );
                    }
                    if let Err(e) = self.rbmq.reject(delivery.delivery_tag, requeue).await {
                        error!(error = %e, "Failed to reject message");
                    }
                }
            }
        }

        for (tenant, (tags, events)) in by_tenant {
            debug!(tenant = %tenant, count = events.len(), "Registering intake batch");

            match self.registration.register(&tenant, events).await {
                Ok(_) => {
                    for tag in tags {
                        if let Err(e) = self.rbmq.acknowledge(tag).await {
                            error!(error = %e, delivery_tag = tag, "Failed to acknowledge message");
                        }
                    }
                }
                Err(e) => {
                    error!(tenant = %tenant, error = %e, "Registration failed, requeueing batch");
                    for tag in tags {
                        if let Err(e) = self.rbmq.reject(tag, true).await {
                            error!(error = %e, delivery_tag = tag, "Failed to reject message");
                        }
                    }
                }
            }
        }
    }
}
