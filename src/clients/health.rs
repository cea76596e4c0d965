use std::{collections::BTreeMap, sync::Arc, time::Instant};

use chrono::Utc;
use tracing::{debug, warn};

use crate::{
    clients::{lock::LeaseLock, rbmq::RabbitMqClient, store::NotifierStore},
    models::health::{ComponentHealth, HealthCheckResponse},
};

#[derive(Clone)]
pub struct HealthChecker {
    store: Arc<dyn NotifierStore>,
    lock: Arc<dyn LeaseLock>,
    broker: Option<Arc<RabbitMqClient>>,
}

impl HealthChecker {
    pub fn new(
        store: Arc<dyn NotifierStore>,
        lock: Arc<dyn LeaseLock>,
        broker: Option<Arc<RabbitMqClient>>,
    ) -> Self {
        Self {
            store,
            lock,
            broker,
        }
    }

    pub async fn check_all(&self) -> HealthCheckResponse {
        let mut checks = BTreeMap::new();

        checks.insert("database".to_string(), self.check_database().await);
        checks.insert("lock_service".to_string(), self.check_lock().await);

        if let Some(broker) = &self.broker {
            checks.insert("message_broker".to_string(), Self::check_broker(broker));
        }

        HealthCheckResponse {
            status: HealthCheckResponse::overall(&checks),
            timestamp: Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            checks,
        }
    }

    async fn check_database(&self) -> ComponentHealth {
        let start = Instant::now();

        match self.store.health_check().await {
            Ok(()) => {
                let elapsed = start.elapsed().as_millis() as u64;
                debug!(response_time_ms = elapsed, "Database health check passed");
                ComponentHealth::healthy(elapsed, true)
            }
            Err(e) => {
                warn!(error = %e, "Database health check failed");
                ComponentHealth::unhealthy(format!("Health check query failed: {}", e), true)
            }
        }
    }

    async fn check_lock(&self) -> ComponentHealth {
        let start = Instant::now();

        match self.lock.health_check().await {
            Ok(()) => {
                let elapsed = start.elapsed().as_millis() as u64;
                debug!(response_time_ms = elapsed, "Lock service health check passed");
                ComponentHealth::healthy(elapsed, true)
            }
            Err(e) => {
                warn!(error = %e, "Lock service health check failed");
                ComponentHealth::unhealthy(format!("Ping failed: {}", e), true)
            }
        }
    }

    // Intake stalls without the broker but scheduled passes keep running.
    fn check_broker(broker: &RabbitMqClient) -> ComponentHealth {
        if broker.is_connected() {
            ComponentHealth::healthy(0, false)
        } else {
            warn!("RabbitMQ channel is not connected");
            ComponentHealth::unhealthy("Channel not connected".to_string(), false)
        }
    }
}
