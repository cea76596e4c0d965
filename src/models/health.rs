use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResponse {
    pub status: HealthStatus,
    pub timestamp: String,
    pub checks: BTreeMap<String, ComponentHealth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: HealthStatus,

    /// Critical components drag the overall status down to unhealthy.
    pub critical: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ComponentHealth {
    pub fn healthy(response_time_ms: u64, critical: bool) -> Self {
        Self {
            status: HealthStatus::Healthy,
            critical,
            response_time_ms: Some(response_time_ms),
            error: None,
        }
    }

    pub fn unhealthy(error: String, critical: bool) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            critical,
            response_time_ms: None,
            error: Some(error),
        }
    }
}

impl HealthCheckResponse {
    pub fn overall(checks: &BTreeMap<String, ComponentHealth>) -> HealthStatus {
        let critical_unhealthy = checks
            .values()
            .any(|health| health.critical && health.status == HealthStatus::Unhealthy);

        let any_unhealthy = checks
            .values()
            .any(|health| health.status != HealthStatus::Healthy);

        if critical_unhealthy {
            HealthStatus::Unhealthy
        } else if any_unhealthy {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}
