use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::Result;
use thiserror::Error;
use tokio::task::AbortHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::{
    clients::lock::{Lease, LeaseLock, task_lock_key},
    config::Config,
    models::{
        report::{DispatchReport, MatchReport},
        retry::RetryConfig,
        tenant::TenantId,
    },
    services::{dispatch::DispatchEngine, matching::MatchingEngine},
    utils::retry_with_backoff,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Match,
    Dispatch,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Match => "match",
            TaskKind::Dispatch => "dispatch",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("{task} task for tenant {tenant} is running elsewhere")]
    TaskBusy { tenant: TenantId, task: TaskKind },
}

#[derive(Debug, Clone, Copy)]
pub struct TaskSettings {
    /// Pause between the end of one tick and the start of the next.
    pub delay: Duration,
    pub lock_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub matching: TaskSettings,
    pub dispatch: TaskSettings,
    /// Backoff for lease release.
    pub retry: RetryConfig,
}

impl SchedulerConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            matching: TaskSettings {
                delay: Duration::from_millis(config.match_delay_ms),
                lock_ttl: Duration::from_millis(config.match_lock_ttl_ms),
            },
            dispatch: TaskSettings {
                delay: Duration::from_millis(config.dispatch_delay_ms),
                lock_ttl: Duration::from_millis(config.dispatch_lock_ttl_ms),
            },
            retry: config.retry_config(),
        }
    }

    fn settings(&self, kind: TaskKind) -> TaskSettings {
        match kind {
            TaskKind::Match => self.matching,
            TaskKind::Dispatch => self.dispatch,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Lock held elsewhere or lock service unreachable.
    Skipped,
    Matched(MatchReport),
    Dispatched(DispatchReport),
    /// The pass failed; the next tick simply runs again.
    Failed(String),
}

/// Runs matching and dispatch per tenant on a fixed delay, each
/// (tenant, task) serialized fleet-wide through the lease lock.
pub struct Scheduler {
    matching: Arc<MatchingEngine>,
    dispatch: Arc<DispatchEngine>,
    lock: Arc<dyn LeaseLock>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        matching: Arc<MatchingEngine>,
        dispatch: Arc<DispatchEngine>,
        lock: Arc<dyn LeaseLock>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            matching,
            dispatch,
            lock,
            config,
        }
    }

    pub async fn tick(&self, tenant: &TenantId, kind: TaskKind) -> TickOutcome {
        let key = task_lock_key(tenant.as_str(), kind.as_str());
        let settings = self.config.settings(kind);

        let lease = match self.lock.try_acquire(&key, settings.lock_ttl).await {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                debug!(tenant = %tenant, task = %kind, "Task running elsewhere, skipping tick");
                return TickOutcome::Skipped;
            }
            Err(e) => {
                warn!(tenant = %tenant, task = %kind, error = %e, "Could not reach lock service, skipping tick");
                return TickOutcome::Skipped;
            }
        };

        let outcome = match kind {
            TaskKind::Match => match self.matching.schedule_requests(tenant).await {
                Ok(report) => TickOutcome::Matched(report),
                Err(e) => {
                    error!(tenant = %tenant, task = %kind, error = %e, "Matching pass failed");
                    TickOutcome::Failed(e.to_string())
                }
            },
            TaskKind::Dispatch => match self.dispatch.run_tick(tenant).await {
                Ok(report) => TickOutcome::Dispatched(report),
                Err(e) => {
                    error!(tenant = %tenant, task = %kind, error = %e, "Dispatch pass failed");
                    TickOutcome::Failed(e.to_string())
                }
            },
        };

        self.release(tenant, kind, &lease).await;

        outcome
    }

    /// Re-runs a FAILED dispatch job under the tenant's dispatch lease, so it
    /// never overlaps a scheduled pass.
    pub async fn retry_job(&self, tenant: &TenantId, job_id: Uuid) -> Result<DispatchReport> {
        let kind = TaskKind::Dispatch;
        let key = task_lock_key(tenant.as_str(), kind.as_str());

        let Some(lease) = self
            .lock
            .try_acquire(&key, self.config.dispatch.lock_ttl)
            .await?
        else {
            return Err(SchedulerError::TaskBusy {
                tenant: tenant.clone(),
                task: kind,
            }
            .into());
        };

        let result = self.dispatch.retry_job(tenant, job_id).await;
        self.release(tenant, kind, &lease).await;

        result
    }

    async fn release(&self, tenant: &TenantId, kind: TaskKind, lease: &Lease) {
        let released = retry_with_backoff(&self.config.retry, || self.lock.release(lease)).await;

        match released {
            Ok(true) => {}
            Ok(false) => warn!(tenant = %tenant, task = %kind, "Lease expired before the pass finished"),
            Err(e) => warn!(tenant = %tenant, task = %kind, error = %e, "Failed to release lease"),
        }
    }

    /// One loop per (tenant, task). Tenants run independently of each other.
    pub fn spawn(self: Arc<Self>, tenants: &[TenantId]) -> SchedulerHandle {
        let is_closing = Arc::new(AtomicBool::default());
        let mut abort_handles = Vec::with_capacity(tenants.len() * 2);

        for tenant in tenants {
            for kind in [TaskKind::Match, TaskKind::Dispatch] {
                let scheduler = self.clone();
                let tenant = tenant.clone();
                let is_closing_inner = is_closing.clone();
                let delay = self.config.settings(kind).delay;

                let abort_handle = tokio::spawn(async move {
                    debug!(tenant = %tenant, task = %kind, "Spawned scheduler loop");
                    while !is_closing_inner.load(Ordering::Relaxed) {
                        scheduler.tick(&tenant, kind).await;
                        tokio::time::sleep(delay).await;
                    }
                })
                .abort_handle();

                abort_handles.push(abort_handle);
            }
        }

        SchedulerHandle {
            is_closing,
            abort_handles,
        }
    }
}

pub struct SchedulerHandle {
    is_closing: Arc<AtomicBool>,
    abort_handles: Vec<AbortHandle>,
}

impl SchedulerHandle {
    /// Lets every loop finish its current tick, then returns.
    pub async fn close(&self) {
        debug!("Gracefully closing scheduler");
        self.is_closing.store(true, Ordering::Relaxed);
        while !self.abort_handles.iter().all(AbortHandle::is_finished) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        debug!("Scheduler closed");
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        for handle in &self.abort_handles {
            if !handle.is_finished() {
                handle.abort();
            }
        }
    }
}
