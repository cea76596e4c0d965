use std::{
    collections::{BTreeSet, HashMap},
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::{
    clients::store::{
        DeliveryOutcome, DeliveryWriteResult, JobStore, MatchOutcome, RequestStore, RuleStore,
        StoreError,
    },
    models::{
        job::{DispatchJob, JobState},
        recipient_error::RecipientError,
        request::{NotificationRequest, RequestState},
        rule::{Recipient, RecipientId, Rule, RuleId},
        tenant::TenantId,
    },
};

#[derive(Debug, Clone)]
struct StoredRequest {
    seq: u64,
    request: NotificationRequest,
}

#[derive(Debug, Default)]
struct TenantTables {
    requests: HashMap<Uuid, StoredRequest>,
    errors: HashMap<(Uuid, RecipientId), RecipientError>,
    rules: HashMap<RuleId, Rule>,
    recipients: HashMap<RecipientId, Recipient>,
    jobs: HashMap<Uuid, DispatchJob>,
}

impl TenantTables {
    fn has_errors(&self, request_id: Uuid) -> bool {
        self.errors.keys().any(|(id, _)| *id == request_id)
    }

    fn delete_request(&mut self, request_id: Uuid) {
        self.requests.remove(&request_id);
        self.errors.retain(|(id, _), _| *id != request_id);
    }

    fn unlink_recipient(&mut self, recipient_id: RecipientId) {
        for rule in self.rules.values_mut() {
            rule.recipient_ids.remove(&recipient_id);
        }
    }
}

fn is_dispatchable(state: RequestState) -> bool {
    matches!(state, RequestState::ToSend | RequestState::Error)
}

/// Immediate first, then oldest first.
fn dispatch_order(stored: &StoredRequest) -> (i16, DateTime<Utc>, u64) {
    (
        stored.request.urgency.rank(),
        stored.request.created_at,
        stored.seq,
    )
}

/// Process-local store with the same semantics as the Postgres one.
///
/// Every operation runs under a single lock, so each call is trivially
/// atomic. `set_unavailable` makes every call fail, for exercising the
/// persistence-error paths.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tenants: Mutex<HashMap<TenantId, TenantTables>>,
    seq: AtomicU64,
    unavailable: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store switched off".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RequestStore for InMemoryStore {
    async fn insert_requests(
        &self,
        tenant: &TenantId,
        requests: &[NotificationRequest],
    ) -> Result<usize, StoreError> {
        self.check_available()?;

        let mut tenants = self.tenants.lock().await;
        let tables = tenants.entry(tenant.clone()).or_default();

        for request in requests {
            let seq = self.seq.fetch_add(1, Ordering::SeqCst);
            tables.requests.insert(
                request.id,
                StoredRequest {
                    seq,
                    request: request.clone(),
                },
            );
        }

        Ok(requests.len())
    }

    async fn find_by_state(
        &self,
        tenant: &TenantId,
        states: &[RequestState],
        limit: usize,
    ) -> Result<Vec<NotificationRequest>, StoreError> {
        self.check_available()?;

        let tenants = self.tenants.lock().await;
        let Some(tables) = tenants.get(tenant) else {
            return Ok(Vec::new());
        };

        let mut rows: Vec<&StoredRequest> = tables
            .requests
            .values()
            .filter(|stored| states.contains(&stored.request.state))
            .collect();

        rows.sort_by_key(|stored| dispatch_order(stored));

        Ok(rows
            .into_iter()
            .take(limit)
            .map(|stored| stored.request.clone())
            .collect())
    }

    async fn pending_recipient_ids(&self, tenant: &TenantId) -> Result<Vec<RecipientId>, StoreError> {
        self.check_available()?;

        let tenants = self.tenants.lock().await;
        let Some(tables) = tenants.get(tenant) else {
            return Ok(Vec::new());
        };

        let recipients: BTreeSet<RecipientId> = tables
            .requests
            .values()
            .filter(|stored| is_dispatchable(stored.request.state))
            .flat_map(|stored| stored.request.pending_recipients.iter().copied())
            .collect();

        Ok(recipients.into_iter().collect())
    }

    async fn find_pending_for(
        &self,
        tenant: &TenantId,
        recipient_id: RecipientId,
        limit: usize,
    ) -> Result<Vec<NotificationRequest>, StoreError> {
        self.check_available()?;

        let tenants = self.tenants.lock().await;
        let Some(tables) = tenants.get(tenant) else {
            return Ok(Vec::new());
        };

        let mut rows: Vec<&StoredRequest> = tables
            .requests
            .values()
            .filter(|stored| {
                is_dispatchable(stored.request.state) && stored.request.is_pending_for(&recipient_id)
            })
            .collect();
        rows.sort_by_key(|stored| dispatch_order(stored));

        Ok(rows
            .into_iter()
            .take(limit)
            .map(|stored| stored.request.clone())
            .collect())
    }

    async fn get_request(
        &self,
        tenant: &TenantId,
        request_id: Uuid,
    ) -> Result<Option<NotificationRequest>, StoreError> {
        self.check_available()?;

        let tenants = self.tenants.lock().await;
        Ok(tenants
            .get(tenant)
            .and_then(|tables| tables.requests.get(&request_id))
            .map(|stored| stored.request.clone()))
    }

    async fn apply_match_outcomes(
        &self,
        tenant: &TenantId,
        outcomes: &[MatchOutcome],
    ) -> Result<usize, StoreError> {
        self.check_available()?;

        let mut tenants = self.tenants.lock().await;
        let tables = tenants.entry(tenant.clone()).or_default();
        let mut applied = 0;

        for outcome in outcomes {
            let still_to_match = tables
                .requests
                .get(&outcome.request_id())
                .is_some_and(|stored| stored.request.state == RequestState::ToMatch);

            if !still_to_match {
                continue;
            }

            match outcome {
                MatchOutcome::Matched {
                    request_id,
                    recipients,
                    urgency,
                } => {
                    if let Some(stored) = tables.requests.get_mut(request_id) {
                        stored.request.pending_recipients = recipients.clone();
                        stored.request.urgency = *urgency;
                        stored.request.state = RequestState::ToSend;
                    }
                }
                MatchOutcome::Discarded { request_id } => tables.delete_request(*request_id),
            }
            applied += 1;
        }

        Ok(applied)
    }

    async fn record_delivery(
        &self,
        tenant: &TenantId,
        outcome: &DeliveryOutcome,
    ) -> Result<DeliveryWriteResult, StoreError> {
        self.check_available()?;

        let mut tenants = self.tenants.lock().await;
        let tables = tenants.entry(tenant.clone()).or_default();
        let recipient_id = outcome.recipient_id;
        let mut result = DeliveryWriteResult::default();
        let now = Utc::now();

        for request_id in &outcome.delivered {
            let Some(stored) = tables.requests.get_mut(request_id) else {
                continue;
            };
            if !stored.request.pending_recipients.remove(&recipient_id) {
                continue;
            }
            let now_empty = stored.request.pending_recipients.is_empty();

            tables.errors.remove(&(*request_id, recipient_id));
            result.delivered += 1;

            if now_empty {
                tables.delete_request(*request_id);
                result.completed.push(*request_id);
            } else {
                let state = if tables.has_errors(*request_id) {
                    RequestState::Error
                } else {
                    RequestState::ToSend
                };
                if let Some(stored) = tables.requests.get_mut(request_id) {
                    stored.request.state = state;
                }
            }
        }

        for (request_id, cause) in &outcome.failed {
            let Some(stored) = tables.requests.get_mut(request_id) else {
                continue;
            };
            if !stored.request.is_pending_for(&recipient_id) {
                continue;
            }
            stored.request.state = RequestState::Error;

            tables
                .errors
                .entry((*request_id, recipient_id))
                .and_modify(|error| error.record_retry_failure(cause.clone(), now))
                .or_insert_with(|| RecipientError::new(*request_id, recipient_id, cause.clone(), now));
            result.errored += 1;
        }

        debug!(
            tenant = %tenant,
            recipient_id = %recipient_id,
            delivered = result.delivered,
            errored = result.errored,
            "Delivery outcome recorded"
        );

        Ok(result)
    }

    async fn list_recipient_errors(
        &self,
        tenant: &TenantId,
        recipient_id: Option<RecipientId>,
    ) -> Result<Vec<RecipientError>, StoreError> {
        self.check_available()?;

        let tenants = self.tenants.lock().await;
        let Some(tables) = tenants.get(tenant) else {
            return Ok(Vec::new());
        };

        let mut errors: Vec<RecipientError> = tables
            .errors
            .values()
            .filter(|error| recipient_id.is_none_or(|id| error.recipient_id == id))
            .cloned()
            .collect();
        errors.sort_by_key(|error| (error.first_failed_at, error.request_id));

        Ok(errors)
    }

    async fn count_requests(
        &self,
        tenant: &TenantId,
        state: Option<RequestState>,
    ) -> Result<usize, StoreError> {
        self.check_available()?;

        let tenants = self.tenants.lock().await;
        Ok(tenants.get(tenant).map_or(0, |tables| {
            tables
                .requests
                .values()
                .filter(|stored| state.is_none_or(|s| stored.request.state == s))
                .count()
        }))
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        self.check_available()
    }
}

#[async_trait]
impl RuleStore for InMemoryStore {
    async fn list_rules(&self, tenant: &TenantId) -> Result<Vec<Rule>, StoreError> {
        self.check_available()?;

        let tenants = self.tenants.lock().await;
        let mut rules: Vec<Rule> = tenants
            .get(tenant)
            .map(|tables| tables.rules.values().cloned().collect())
            .unwrap_or_default();
        rules.sort_by(|a, b| a.label.cmp(&b.label).then(a.id.cmp(&b.id)));

        Ok(rules)
    }

    async fn get_rule(&self, tenant: &TenantId, rule_id: RuleId) -> Result<Option<Rule>, StoreError> {
        self.check_available()?;

        let tenants = self.tenants.lock().await;
        Ok(tenants
            .get(tenant)
            .and_then(|tables| tables.rules.get(&rule_id))
            .cloned())
    }

    async fn save_rule(&self, tenant: &TenantId, rule: &Rule) -> Result<(), StoreError> {
        self.check_available()?;

        let mut tenants = self.tenants.lock().await;
        let tables = tenants.entry(tenant.clone()).or_default();

        if let Some(missing) = rule
            .recipient_ids
            .iter()
            .find(|id| !tables.recipients.contains_key(id))
        {
            return Err(StoreError::NotFound {
                entity: "recipient",
                id: *missing,
            });
        }

        tables.rules.insert(rule.id, rule.clone());
        Ok(())
    }

    async fn delete_rule(&self, tenant: &TenantId, rule_id: RuleId) -> Result<bool, StoreError> {
        self.check_available()?;

        let mut tenants = self.tenants.lock().await;
        let Some(tables) = tenants.get_mut(tenant) else {
            return Ok(false);
        };

        if tables.rules.remove(&rule_id).is_none() {
            return Ok(false);
        }

        let owned: Vec<RecipientId> = tables
            .recipients
            .values()
            .filter(|recipient| recipient.rule_id == rule_id)
            .map(|recipient| recipient.id)
            .collect();

        for recipient_id in owned {
            tables.recipients.remove(&recipient_id);
            tables.unlink_recipient(recipient_id);
        }

        Ok(true)
    }

    async fn list_recipients(&self, tenant: &TenantId) -> Result<Vec<Recipient>, StoreError> {
        self.check_available()?;

        let tenants = self.tenants.lock().await;
        let mut recipients: Vec<Recipient> = tenants
            .get(tenant)
            .map(|tables| tables.recipients.values().cloned().collect())
            .unwrap_or_default();
        recipients.sort_by(|a, b| a.label.cmp(&b.label).then(a.id.cmp(&b.id)));

        Ok(recipients)
    }

    async fn get_recipient(
        &self,
        tenant: &TenantId,
        recipient_id: RecipientId,
    ) -> Result<Option<Recipient>, StoreError> {
        self.check_available()?;

        let tenants = self.tenants.lock().await;
        Ok(tenants
            .get(tenant)
            .and_then(|tables| tables.recipients.get(&recipient_id))
            .cloned())
    }

    async fn save_recipient(&self, tenant: &TenantId, recipient: &Recipient) -> Result<(), StoreError> {
        self.check_available()?;

        let mut tenants = self.tenants.lock().await;
        let tables = tenants.entry(tenant.clone()).or_default();

        let Some(owner) = tables.rules.get_mut(&recipient.rule_id) else {
            return Err(StoreError::NotFound {
                entity: "rule",
                id: recipient.rule_id,
            });
        };
        owner.recipient_ids.insert(recipient.id);

        tables.recipients.insert(recipient.id, recipient.clone());
        Ok(())
    }

    async fn delete_recipient(
        &self,
        tenant: &TenantId,
        recipient_id: RecipientId,
    ) -> Result<bool, StoreError> {
        self.check_available()?;

        let mut tenants = self.tenants.lock().await;
        let Some(tables) = tenants.get_mut(tenant) else {
            return Ok(false);
        };

        if tables.recipients.remove(&recipient_id).is_none() {
            return Ok(false);
        }
        tables.unlink_recipient(recipient_id);

        Ok(true)
    }
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn save_job(&self, tenant: &TenantId, job: &DispatchJob) -> Result<(), StoreError> {
        self.check_available()?;

        let mut tenants = self.tenants.lock().await;
        tenants
            .entry(tenant.clone())
            .or_default()
            .jobs
            .insert(job.id, job.clone());

        Ok(())
    }

    async fn get_job(&self, tenant: &TenantId, job_id: Uuid) -> Result<Option<DispatchJob>, StoreError> {
        self.check_available()?;

        let tenants = self.tenants.lock().await;
        Ok(tenants
            .get(tenant)
            .and_then(|tables| tables.jobs.get(&job_id))
            .cloned())
    }

    async fn find_jobs(
        &self,
        tenant: &TenantId,
        state: JobState,
        limit: usize,
    ) -> Result<Vec<DispatchJob>, StoreError> {
        self.check_available()?;

        let tenants = self.tenants.lock().await;
        let mut jobs: Vec<DispatchJob> = tenants
            .get(tenant)
            .map(|tables| {
                tables
                    .jobs
                    .values()
                    .filter(|job| job.state == state)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        jobs.sort_by_key(|job| (job.created_at, job.id));
        jobs.truncate(limit);

        Ok(jobs)
    }

    async fn purge_succeeded_jobs(
        &self,
        tenant: &TenantId,
        before: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        self.check_available()?;

        let mut tenants = self.tenants.lock().await;
        let Some(tables) = tenants.get_mut(tenant) else {
            return Ok(0);
        };

        let before_count = tables.jobs.len();
        tables
            .jobs
            .retain(|_, job| !(job.state == JobState::Succeeded && job.updated_at < before));

        Ok(before_count - tables.jobs.len())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::models::request::{ActionKind, RawEvent};

    fn tenant() -> TenantId {
        TenantId::parse("project-a").unwrap()
    }

    fn direct_request(recipients: &[RecipientId]) -> NotificationRequest {
        let event = RawEvent::new(ActionKind::Create, json!({ "id": 1 }))
            .with_recipients(recipients.iter().copied());
        NotificationRequest::from_event(event, Utc::now())
    }

    #[tokio::test]
    async fn delivery_shrinks_pending_set_and_deletes_when_empty() {
        let store = InMemoryStore::new();
        let (first, second) = (Uuid::new_v4(), Uuid::new_v4());
        let request = direct_request(&[first, second]);
        store.insert_requests(&tenant(), &[request.clone()]).await.unwrap();

        let mut failing = DeliveryOutcome::new(first);
        failing.failed.push((request.id, "boom".to_string()));
        store.record_delivery(&tenant(), &failing).await.unwrap();
        store.record_delivery(&tenant(), &failing).await.unwrap();

        let errors = store.list_recipient_errors(&tenant(), None).await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].attempts, 2);

        let mut ok = DeliveryOutcome::new(second);
        ok.delivered.push(request.id);
        store.record_delivery(&tenant(), &ok).await.unwrap();

        let stored = store.get_request(&tenant(), request.id).await.unwrap().unwrap();
        assert_eq!(stored.state, RequestState::Error);
        assert_eq!(stored.pending_recipients.len(), 1);

        let mut recovered = DeliveryOutcome::new(first);
        recovered.delivered.push(request.id);
        let result = store.record_delivery(&tenant(), &recovered).await.unwrap();

        assert_eq!(result.completed, vec![request.id]);
        assert!(store.get_request(&tenant(), request.id).await.unwrap().is_none());
        assert!(store.list_recipient_errors(&tenant(), None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn tenants_do_not_see_each_other() {
        let store = InMemoryStore::new();
        let other = TenantId::parse("project-b").unwrap();
        store
            .insert_requests(&tenant(), &[direct_request(&[Uuid::new_v4()])])
            .await
            .unwrap();

        assert_eq!(store.count_requests(&tenant(), None).await.unwrap(), 1);
        assert_eq!(store.count_requests(&other, None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn pending_pages_are_per_recipient() {
        let store = InMemoryStore::new();
        let (busy, quiet) = (Uuid::new_v4(), Uuid::new_v4());
        let backlog: Vec<NotificationRequest> = (0..3).map(|_| direct_request(&[busy])).collect();
        let lone = direct_request(&[quiet]);
        store.insert_requests(&tenant(), &backlog).await.unwrap();
        store.insert_requests(&tenant(), &[lone.clone()]).await.unwrap();

        let mut expected = vec![busy, quiet];
        expected.sort();
        assert_eq!(store.pending_recipient_ids(&tenant()).await.unwrap(), expected);

        let page = store.find_pending_for(&tenant(), busy, 2).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].id, backlog[0].id);
        assert_eq!(page[1].id, backlog[1].id);

        let page = store.find_pending_for(&tenant(), quiet, 2).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, lone.id);
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let store = InMemoryStore::new();
        store.set_unavailable(true);

        assert!(matches!(
            store.count_requests(&tenant(), None).await,
            Err(StoreError::Unavailable(_))
        ));
    }
}
