use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    job::{DispatchJob, JobState},
    recipient_error::RecipientError,
    request::{NotificationRequest, RequestState, Urgency},
    rule::{Recipient, RecipientId, Rule, RuleId},
    tenant::TenantId,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("corrupted row: {0}")]
    Corrupted(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Result of evaluating one TO_MATCH request.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    Matched {
        request_id: Uuid,
        recipients: BTreeSet<RecipientId>,
        urgency: Urgency,
    },
    Discarded {
        request_id: Uuid,
    },
}

impl MatchOutcome {
    pub fn request_id(&self) -> Uuid {
        match self {
            MatchOutcome::Matched { request_id, .. } | MatchOutcome::Discarded { request_id } => {
                *request_id
            }
        }
    }
}

/// What one recipient's sender made of its batch.
///
/// `delivered` ids leave the pending set; `failed` ids keep the recipient
/// pending and get an error row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeliveryOutcome {
    pub recipient_id: RecipientId,
    pub delivered: Vec<Uuid>,
    pub failed: Vec<(Uuid, String)>,
}

impl DeliveryOutcome {
    pub fn new(recipient_id: RecipientId) -> Self {
        Self {
            recipient_id,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeliveryWriteResult {
    pub delivered: usize,
    pub errored: usize,
    /// Requests whose pending set became empty and were deleted.
    pub completed: Vec<Uuid>,
}

#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Inserts the whole batch in one unit of work.
    async fn insert_requests(
        &self,
        tenant: &TenantId,
        requests: &[NotificationRequest],
    ) -> Result<usize, StoreError>;

    /// Immediate requests first, then oldest first.
    async fn find_by_state(
        &self,
        tenant: &TenantId,
        states: &[RequestState],
        limit: usize,
    ) -> Result<Vec<NotificationRequest>, StoreError>;

    /// Recipients that still have at least one TO_SEND or ERROR request.
    async fn pending_recipient_ids(&self, tenant: &TenantId) -> Result<Vec<RecipientId>, StoreError>;

    /// TO_SEND and ERROR requests still pending for `recipient_id`, in the
    /// same order as `find_by_state`.
    async fn find_pending_for(
        &self,
        tenant: &TenantId,
        recipient_id: RecipientId,
        limit: usize,
    ) -> Result<Vec<NotificationRequest>, StoreError>;

    async fn get_request(
        &self,
        tenant: &TenantId,
        request_id: Uuid,
    ) -> Result<Option<NotificationRequest>, StoreError>;

    /// Matched requests move to TO_SEND, discarded ones are deleted. Only
    /// requests still in TO_MATCH are touched.
    async fn apply_match_outcomes(
        &self,
        tenant: &TenantId,
        outcomes: &[MatchOutcome],
    ) -> Result<usize, StoreError>;

    /// Writes back one recipient's results, atomically per request.
    async fn record_delivery(
        &self,
        tenant: &TenantId,
        outcome: &DeliveryOutcome,
    ) -> Result<DeliveryWriteResult, StoreError>;

    async fn list_recipient_errors(
        &self,
        tenant: &TenantId,
        recipient_id: Option<RecipientId>,
    ) -> Result<Vec<RecipientError>, StoreError>;

    async fn count_requests(
        &self,
        tenant: &TenantId,
        state: Option<RequestState>,
    ) -> Result<usize, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;
}

#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn list_rules(&self, tenant: &TenantId) -> Result<Vec<Rule>, StoreError>;

    async fn get_rule(&self, tenant: &TenantId, rule_id: RuleId) -> Result<Option<Rule>, StoreError>;

    /// Upserts the rule and replaces its recipient links.
    async fn save_rule(&self, tenant: &TenantId, rule: &Rule) -> Result<(), StoreError>;

    /// Removes the rule, the recipients it owns and every link to either.
    async fn delete_rule(&self, tenant: &TenantId, rule_id: RuleId) -> Result<bool, StoreError>;

    async fn list_recipients(&self, tenant: &TenantId) -> Result<Vec<Recipient>, StoreError>;

    async fn get_recipient(
        &self,
        tenant: &TenantId,
        recipient_id: RecipientId,
    ) -> Result<Option<Recipient>, StoreError>;

    /// Upserts the recipient and links it to its owning rule.
    async fn save_recipient(&self, tenant: &TenantId, recipient: &Recipient) -> Result<(), StoreError>;

    async fn delete_recipient(
        &self,
        tenant: &TenantId,
        recipient_id: RecipientId,
    ) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn save_job(&self, tenant: &TenantId, job: &DispatchJob) -> Result<(), StoreError>;

    async fn get_job(&self, tenant: &TenantId, job_id: Uuid) -> Result<Option<DispatchJob>, StoreError>;

    async fn find_jobs(
        &self,
        tenant: &TenantId,
        state: JobState,
        limit: usize,
    ) -> Result<Vec<DispatchJob>, StoreError>;

    /// Deletes SUCCEEDED jobs last updated before `before`.
    async fn purge_succeeded_jobs(
        &self,
        tenant: &TenantId,
        before: DateTime<Utc>,
    ) -> Result<usize, StoreError>;
}

/// Everything the engines need from persistence.
pub trait NotifierStore: RequestStore + RuleStore + JobStore {}

impl<T: RequestStore + RuleStore + JobStore> NotifierStore for T {}
