use std::time::Duration;

use anyhow::{Error, Result, anyhow};
use dotenvy::dotenv;
use serde::Deserialize;

use crate::models::{retry::RetryConfig, tenant::TenantId};

#[derive(Clone, Copy, Deserialize, Debug, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Postgres,
    Memory,
}

#[derive(Clone, Copy, Deserialize, Debug, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Clone, Deserialize, Debug)]
pub struct Config {
    #[serde(default)]
    pub database_url: String,
    #[serde(default)]
    pub store_backend: StoreBackend,

    #[serde(default)]
    pub redis_url: String,

    #[serde(default)]
    pub rabbitmq_url: String,
    #[serde(default = "default_intake_queue_name")]
    pub intake_queue_name: String,
    #[serde(default = "default_status_queue_name")]
    pub status_queue_name: String,
    #[serde(default = "default_prefetch_count")]
    pub prefetch_count: u16,

    /// Comma separated tenant ids served by this instance.
    pub tenants: String,

    #[serde(default = "default_max_bulk_size")]
    pub max_bulk_size: usize,
    #[serde(default = "default_intake_flush_ms")]
    pub intake_flush_ms: u64,

    #[serde(default = "default_task_delay_ms")]
    pub match_delay_ms: u64,
    #[serde(default = "default_task_delay_ms")]
    pub dispatch_delay_ms: u64,
    #[serde(default = "default_match_lock_ttl_ms")]
    pub match_lock_ttl_ms: u64,
    #[serde(default = "default_dispatch_lock_ttl_ms")]
    pub dispatch_lock_ttl_ms: u64,

    #[serde(default = "default_sender_timeout_ms")]
    pub sender_timeout_ms: u64,
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
    #[serde(default = "default_stale_job_after_ms")]
    pub stale_job_after_ms: u64,
    #[serde(default = "default_job_retention_ms")]
    pub job_retention_ms: u64,

    /// Bound on how long configuration written by another process can go
    /// unnoticed.
    #[serde(default = "default_rule_cache_ttl_ms")]
    pub rule_cache_ttl_ms: u64,

    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    #[serde(default = "default_initial_retry_delay_ms")]
    pub initial_retry_delay_ms: u64,
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    #[serde(default = "default_retry_backoff_multiplier")]
    pub retry_backoff_multiplier: u64,

    #[serde(default = "default_server_port")]
    pub server_port: u16,
    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_intake_queue_name() -> String {
    "notifier.requests".to_string()
}

fn default_status_queue_name() -> String {
    "notifier.status".to_string()
}

fn default_prefetch_count() -> u16 {
    100
}

fn default_max_bulk_size() -> usize {
    1000
}

fn default_intake_flush_ms() -> u64 {
    500
}

fn default_task_delay_ms() -> u64 {
    1000
}

fn default_match_lock_ttl_ms() -> u64 {
    60_000
}

fn default_dispatch_lock_ttl_ms() -> u64 {
    300_000
}

fn default_sender_timeout_ms() -> u64 {
    30_000
}

fn default_worker_concurrency() -> usize {
    8
}

fn default_stale_job_after_ms() -> u64 {
    600_000
}

fn default_job_retention_ms() -> u64 {
    86_400_000
}

fn default_rule_cache_ttl_ms() -> u64 {
    30_000
}

fn default_max_retry_attempts() -> u32 {
    3
}

fn default_initial_retry_delay_ms() -> u64 {
    100
}

fn default_max_retry_delay_ms() -> u64 {
    2000
}

fn default_retry_backoff_multiplier() -> u64 {
    2
}

fn default_server_port() -> u16 {
    8080
}

impl Config {
    pub fn load() -> Result<Self, Error> {
        dotenv().ok();

        let config = envy::from_env::<Self>()
            .map_err(|e| anyhow!("Invalid or missing environmental variable: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.max_bulk_size == 0 {
            return Err(anyhow!("MAX_BULK_SIZE must be positive"));
        }

        if self.worker_concurrency == 0 {
            return Err(anyhow!("WORKER_CONCURRENCY must be positive"));
        }

        if self.store_backend == StoreBackend::Postgres {
            for (name, value) in [
                ("DATABASE_URL", &self.database_url),
                ("REDIS_URL", &self.redis_url),
                ("RABBITMQ_URL", &self.rabbitmq_url),
            ] {
                if value.trim().is_empty() {
                    return Err(anyhow!("{} is required with the postgres backend", name));
                }
            }
        }

        self.tenant_ids()?;
        Ok(())
    }

    pub fn tenant_ids(&self) -> Result<Vec<TenantId>, Error> {
        let mut tenants = Vec::new();

        for raw in self.tenants.split(',').filter(|s| !s.trim().is_empty()) {
            let tenant = TenantId::parse(raw)?;
            if !tenants.contains(&tenant) {
                tenants.push(tenant);
            }
        }

        if tenants.is_empty() {
            return Err(anyhow!("TENANTS must name at least one tenant"));
        }

        Ok(tenants)
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_retry_attempts,
            initial_delay_ms: self.initial_retry_delay_ms,
            max_delay_ms: self.max_retry_delay_ms,
            backoff_multiplier: self.retry_backoff_multiplier,
        }
    }

    pub fn sender_timeout(&self) -> Duration {
        Duration::from_millis(self.sender_timeout_ms)
    }

    pub fn stale_job_after(&self) -> Duration {
        Duration::from_millis(self.stale_job_after_ms)
    }

    pub fn job_retention(&self) -> Duration {
        Duration::from_millis(self.job_retention_ms)
    }

    pub fn rule_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.rule_cache_ttl_ms)
    }

    pub fn intake_flush_interval(&self) -> Duration {
        Duration::from_millis(self.intake_flush_ms)
    }
}
