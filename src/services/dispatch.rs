use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use anyhow::{Error, Result};
use chrono::Utc;
use futures_util::{StreamExt, stream};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    clients::{
        publisher::StatusPublisher,
        store::{DeliveryOutcome, NotifierStore, StoreError},
    },
    config::Config,
    models::{
        job::{DispatchJob, JobState},
        report::DispatchReport,
        request::NotificationRequest,
        rule::RecipientId,
        status::{NotificationStatus, NotifierEvent},
        tenant::TenantId,
    },
    plugins::SendFailure,
    services::rule_cache::{RecipientSlot, RuleCache, TenantRules},
};

const MAX_RECOVERED_JOBS: usize = 16;

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub max_bulk_size: usize,
    pub worker_concurrency: usize,
    pub sender_timeout: Duration,
    pub stale_job_after: Duration,
    /// SUCCEEDED jobs older than this are purged.
    pub job_retention: Duration,
}

impl DispatchSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_bulk_size: config.max_bulk_size,
            worker_concurrency: config.worker_concurrency,
            sender_timeout: config.sender_timeout(),
            stale_job_after: config.stale_job_after(),
            job_retention: config.job_retention(),
        }
    }
}

/// How one recipient group went, before it is written back.
#[derive(Default)]
struct GroupResult {
    report: DispatchReport,
    events: Vec<NotifierEvent>,
}

pub struct DispatchEngine {
    store: Arc<dyn NotifierStore>,
    cache: Arc<RuleCache>,
    publisher: Arc<dyn StatusPublisher>,
    settings: DispatchSettings,
}

impl DispatchEngine {
    pub fn new(
        store: Arc<dyn NotifierStore>,
        cache: Arc<RuleCache>,
        publisher: Arc<dyn StatusPublisher>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            store,
            cache,
            publisher,
            settings,
        }
    }

    /// What the scheduler runs each dispatch tick: recover failed jobs if
    /// there are any, otherwise start a fresh one.
    pub async fn run_tick(&self, tenant: &TenantId) -> Result<DispatchReport> {
        self.purge_jobs(tenant).await?;

        let recovered = self.recover_jobs(tenant).await?;
        if !recovered.is_empty() {
            let mut merged = DispatchReport::default();
            for report in &recovered {
                merged.merge(report);
            }
            return Ok(merged);
        }

        self.send_to_recipients(tenant).await
    }

    /// One dispatch pass wrapped in a new job record. Nothing is recorded
    /// when no request is pending.
    pub async fn send_to_recipients(&self, tenant: &TenantId) -> Result<DispatchReport> {
        if self.store.pending_recipient_ids(tenant).await?.is_empty() {
            debug!(tenant = %tenant, "No request to dispatch");
            return Ok(DispatchReport::default());
        }

        let job = DispatchJob::queued(Utc::now());
        self.store.save_job(tenant, &job).await?;

        self.run_job(tenant, job).await
    }

    /// Runs a QUEUED job to SUCCEEDED or FAILED.
    pub async fn run_job(&self, tenant: &TenantId, mut job: DispatchJob) -> Result<DispatchReport> {
        job.start(Utc::now())?;
        self.store.save_job(tenant, &job).await?;

        debug!(tenant = %tenant, job_id = %job.id, attempt = job.attempts, "Dispatch job started");

        match self.dispatch_pass(tenant).await {
            Ok(mut report) => {
                job.succeed(Utc::now())?;
                self.store.save_job(tenant, &job).await?;

                report.job_id = Some(job.id);
                info!(
                    tenant = %tenant,
                    job_id = %job.id,
                    recipients = report.recipients,
                    delivered = report.delivered,
                    errored = report.errored,
                    dropped = report.dropped,
                    completed = report.completed,
                    "Dispatch job succeeded"
                );
                Ok(report)
            }
            Err(e) => {
                job.fail(e.to_string(), Utc::now())?;
                if let Err(save_err) = self.store.save_job(tenant, &job).await {
                    warn!(
                        tenant = %tenant,
                        job_id = %job.id,
                        error = %save_err,
                        "Failed to record dispatch job failure"
                    );
                }

                error!(tenant = %tenant, job_id = %job.id, error = %e, "Dispatch job failed");
                Err(e)
            }
        }
    }

    /// Marks stale RUNNING jobs as failed, then re-queues and re-runs failed
    /// jobs. Each run re-reads the live pending sets.
    pub async fn recover_jobs(&self, tenant: &TenantId) -> Result<Vec<DispatchReport>> {
        let now = Utc::now();
        let stale_after = chrono::Duration::from_std(self.settings.stale_job_after)?;

        for mut job in self
            .store
            .find_jobs(tenant, JobState::Running, MAX_RECOVERED_JOBS)
            .await?
        {
            if job.is_stale(now, stale_after) {
                warn!(tenant = %tenant, job_id = %job.id, "Dispatch job stalled, marking as failed");
                job.fail("no progress before the stale deadline".to_string(), now)?;
                self.store.save_job(tenant, &job).await?;
            }
        }

        let failed = self
            .store
            .find_jobs(tenant, JobState::Failed, MAX_RECOVERED_JOBS)
            .await?;

        let mut reports = Vec::with_capacity(failed.len());
        for mut job in failed {
            info!(tenant = %tenant, job_id = %job.id, attempts = job.attempts, "Re-queueing failed dispatch job");
            job.requeue(Utc::now())?;
            self.store.save_job(tenant, &job).await?;

            reports.push(self.run_job(tenant, job).await?);
        }

        Ok(reports)
    }

    pub async fn purge_jobs(&self, tenant: &TenantId) -> Result<usize> {
        let retention = chrono::Duration::from_std(self.settings.job_retention)?;
        let Some(before) = Utc::now().checked_sub_signed(retention) else {
            return Ok(0);
        };

        let purged = self.store.purge_succeeded_jobs(tenant, before).await?;
        if purged > 0 {
            debug!(tenant = %tenant, purged, "Succeeded dispatch jobs purged");
        }

        Ok(purged)
    }

    /// Manual re-queue of a FAILED job. The caller must hold the tenant's
    /// dispatch lease, see `Scheduler::retry_job`.
    pub async fn retry_job(&self, tenant: &TenantId, job_id: Uuid) -> Result<DispatchReport> {
        let mut job = self
            .store
            .get_job(tenant, job_id)
            .await?
            .ok_or(StoreError::NotFound {
                entity: "dispatch job",
                id: job_id,
            })?;

        job.requeue(Utc::now())?;
        self.store.save_job(tenant, &job).await?;

        self.run_job(tenant, job).await
    }

    /// Each recipient pulls its own page of at most `max_bulk_size`
    /// requests, so a backlog stuck on one recipient never crowds out the
    /// others.
    async fn dispatch_pass(&self, tenant: &TenantId) -> Result<DispatchReport> {
        let recipient_ids = self.store.pending_recipient_ids(tenant).await?;

        if recipient_ids.is_empty() {
            debug!(tenant = %tenant, "No request to dispatch");
            return Ok(DispatchReport::default());
        }

        let rules = self.cache.active_rules(tenant).await?;
        let rules: &TenantRules = &rules;

        debug!(tenant = %tenant, recipients = recipient_ids.len(), "Dispatching recipient groups");

        let results: Vec<Result<GroupResult>> = stream::iter(
            recipient_ids
                .into_iter()
                .map(move |recipient_id| self.dispatch_recipient(tenant, rules, recipient_id)),
        )
        .buffer_unordered(self.settings.worker_concurrency.max(1))
        .collect()
        .await;

        let mut report = DispatchReport::default();
        let mut events = Vec::new();
        let mut first_error: Option<Error> = None;

        for result in results {
            match result {
                Ok(group) => {
                    report.merge(&group.report);
                    events.extend(group.events);
                }
                Err(e) => {
                    error!(tenant = %tenant, error = %e, "Failed to record recipient group outcome");
                    first_error.get_or_insert(e);
                }
            }
        }

        if !events.is_empty() {
            if let Err(e) = self.publisher.publish(&events).await {
                warn!(tenant = %tenant, error = %e, "Failed to publish dispatch events");
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    async fn dispatch_recipient(
        &self,
        tenant: &TenantId,
        rules: &TenantRules,
        recipient_id: RecipientId,
    ) -> Result<GroupResult> {
        let batch = self
            .store
            .find_pending_for(tenant, recipient_id, self.settings.max_bulk_size)
            .await?;

        // Another group may have completed these requests in the meantime.
        if batch.is_empty() {
            return Ok(GroupResult::default());
        }

        self.deliver_group(tenant, rules, recipient_id, batch).await
    }

    async fn deliver_group(
        &self,
        tenant: &TenantId,
        rules: &TenantRules,
        recipient_id: RecipientId,
        batch: Vec<NotificationRequest>,
    ) -> Result<GroupResult> {
        let mut outcome = DeliveryOutcome::new(recipient_id);
        let mut dropped = 0;

        let Some(slot) = rules.recipient(&recipient_id) else {
            // Recipient removed from configuration: nothing left to deliver to.
            info!(
                tenant = %tenant,
                recipient_id = %recipient_id,
                batch = batch.len(),
                "Recipient no longer configured, releasing its requests"
            );
            outcome.delivered = batch.iter().map(|request| request.id).collect();
            let write = self.store.record_delivery(tenant, &outcome).await?;
            return Ok(GroupResult {
                report: DispatchReport {
                    recipients: 1,
                    delivered: write.delivered,
                    completed: write.completed.len(),
                    ..Default::default()
                },
                events: completion_events(tenant, &batch, &write.completed),
            });
        };

        let label = slot.recipient().label.clone();
        let failures = self.invoke_sender(tenant, slot, &batch).await;
        let failed_ids: HashMap<Uuid, String> = failures
            .into_iter()
            .map(|failure| (failure.request_id, failure.cause))
            .collect();

        let ack_required = slot.ack_required();
        let mut error_events = Vec::new();

        for request in &batch {
            match failed_ids.get(&request.id) {
                None => outcome.delivered.push(request.id),
                Some(cause) if ack_required => {
                    outcome.failed.push((request.id, cause.clone()));
                    error_events.push(
                        NotifierEvent::for_request(tenant, request, NotificationStatus::Error)
                            .with_recipient(label.clone())
                            .with_reason(cause.clone()),
                    );
                }
                Some(cause) => {
                    debug!(
                        tenant = %tenant,
                        recipient = %label,
                        request_id = %request.request_id,
                        error = %cause,
                        "Delivery failed for fire-and-forget recipient, dropped"
                    );
                    outcome.delivered.push(request.id);
                    dropped += 1;
                }
            }
        }

        if dropped > 0 {
            warn!(tenant = %tenant, recipient = %label, dropped, "Fire-and-forget deliveries dropped");
        }

        let write = self.store.record_delivery(tenant, &outcome).await?;

        let mut events = error_events;
        events.extend(completion_events(tenant, &batch, &write.completed));

        Ok(GroupResult {
            report: DispatchReport {
                job_id: None,
                recipients: 1,
                delivered: write.delivered.saturating_sub(dropped),
                errored: write.errored,
                dropped,
                completed: write.completed.len(),
            },
            events,
        })
    }

    /// Calls the sender under the timeout. A plugin error, a timeout or a
    /// broken plugin fails the whole batch.
    async fn invoke_sender(
        &self,
        tenant: &TenantId,
        slot: &RecipientSlot,
        batch: &[NotificationRequest],
    ) -> Vec<SendFailure> {
        let whole_batch = |cause: String| -> Vec<SendFailure> {
            batch
                .iter()
                .map(|request| SendFailure::new(request.id, cause.clone()))
                .collect()
        };

        let sender = match slot {
            RecipientSlot::Ready { sender, .. } => sender,
            RecipientSlot::Broken { recipient, cause } => {
                warn!(
                    tenant = %tenant,
                    recipient = %recipient.label,
                    error = %cause,
                    "Recipient plugin unavailable, batch kept pending"
                );
                return whole_batch(format!("recipient plugin unavailable: {}", cause));
            }
        };

        let in_batch: HashSet<Uuid> = batch.iter().map(|request| request.id).collect();

        match timeout(self.settings.sender_timeout, sender.send(batch)).await {
            Ok(Ok(failures)) => failures
                .into_iter()
                .filter(|failure| {
                    let known = in_batch.contains(&failure.request_id);
                    if !known {
                        debug!(
                            tenant = %tenant,
                            recipient = %sender.label(),
                            request_id = %failure.request_id,
                            "Sender reported a request outside its batch, ignored"
                        );
                    }
                    known
                })
                .collect(),
            Ok(Err(e)) => {
                warn!(
                    tenant = %tenant,
                    recipient = %sender.label(),
                    batch = batch.len(),
                    error = %e,
                    "Sender failed, whole batch kept pending"
                );
                whole_batch(e.to_string())
            }
            Err(_) => {
                warn!(
                    tenant = %tenant,
                    recipient = %sender.label(),
                    batch = batch.len(),
                    timeout_ms = self.settings.sender_timeout.as_millis() as u64,
                    "Sender timed out, whole batch kept pending"
                );
                whole_batch(format!(
                    "sender timed out after {}ms",
                    self.settings.sender_timeout.as_millis()
                ))
            }
        }
    }
}

fn completion_events(
    tenant: &TenantId,
    batch: &[NotificationRequest],
    completed: &[Uuid],
) -> Vec<NotifierEvent> {
    batch
        .iter()
        .filter(|request| completed.contains(&request.id))
        .map(|request| NotifierEvent::for_request(tenant, request, NotificationStatus::Success))
        .collect()
}
