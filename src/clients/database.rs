use std::collections::{BTreeSet, HashMap};

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{ManagerConfig, Pool, RecyclingMethod, Runtime};
use tokio_postgres::{NoTls, Row};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    clients::store::{
        DeliveryOutcome, DeliveryWriteResult, JobStore, MatchOutcome, RequestStore, RuleStore,
        StoreError,
    },
    models::{
        job::{DispatchJob, JobState},
        recipient_error::RecipientError,
        request::{ActionKind, NotificationRequest, RequestState, Urgency},
        rule::{PluginConfiguration, Recipient, RecipientId, Rule, RuleId},
        tenant::TenantId,
    },
};

mod ddl {
    pub const CREATE_TABLE_NOTIFICATION_REQUESTS: &str = r"
CREATE TABLE IF NOT EXISTS notification_requests (
    tenant TEXT NOT NULL,
    id UUID NOT NULL,
    seq BIGSERIAL,
    request_id TEXT NOT NULL,
    owner TEXT,
    payload JSONB NOT NULL,
    action TEXT NOT NULL,
    urgency TEXT NOT NULL,
    urgency_rank SMALLINT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    pending_recipients UUID[] NOT NULL,
    state TEXT NOT NULL,
    PRIMARY KEY (tenant, id)
);
";

    pub const IDX_NOTIFICATION_REQUESTS_STATE: &str = r"
CREATE INDEX IF NOT EXISTS idx_notification_requests_state
    ON notification_requests (tenant, state, urgency_rank, created_at, seq);
";

    pub const IDX_NOTIFICATION_REQUESTS_PENDING: &str = r"
CREATE INDEX IF NOT EXISTS idx_notification_requests_pending
    ON notification_requests USING GIN (pending_recipients);
";

    pub const CREATE_TABLE_RECIPIENT_ERRORS: &str = r"
CREATE TABLE IF NOT EXISTS recipient_errors (
    tenant TEXT NOT NULL,
    request_id UUID NOT NULL,
    recipient_id UUID NOT NULL,
    cause TEXT NOT NULL,
    attempts INTEGER NOT NULL,
    first_failed_at TIMESTAMPTZ NOT NULL,
    last_failed_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (tenant, request_id, recipient_id),
    FOREIGN KEY (tenant, request_id)
        REFERENCES notification_requests (tenant, id) ON DELETE CASCADE
);
";

    pub const IDX_RECIPIENT_ERRORS_RECIPIENT: &str = r"
CREATE INDEX IF NOT EXISTS idx_recipient_errors_recipient
    ON recipient_errors (tenant, recipient_id);
";

    pub const CREATE_TABLE_RULES: &str = r"
CREATE TABLE IF NOT EXISTS rules (
    tenant TEXT NOT NULL,
    id UUID NOT NULL,
    label TEXT NOT NULL,
    matcher JSONB NOT NULL,
    active BOOLEAN NOT NULL,
    urgency TEXT NOT NULL,
    PRIMARY KEY (tenant, id)
);
";

    pub const CREATE_TABLE_RECIPIENTS: &str = r"
CREATE TABLE IF NOT EXISTS recipients (
    tenant TEXT NOT NULL,
    id UUID NOT NULL,
    rule_id UUID NOT NULL,
    label TEXT NOT NULL,
    sender JSONB NOT NULL,
    ack_required BOOLEAN,
    PRIMARY KEY (tenant, id),
    FOREIGN KEY (tenant, rule_id) REFERENCES rules (tenant, id) ON DELETE CASCADE
);
";

    pub const CREATE_TABLE_RULE_RECIPIENTS: &str = r"
CREATE TABLE IF NOT EXISTS rule_recipients (
    tenant TEXT NOT NULL,
    rule_id UUID NOT NULL,
    recipient_id UUID NOT NULL,
    PRIMARY KEY (tenant, rule_id, recipient_id),
    FOREIGN KEY (tenant, rule_id) REFERENCES rules (tenant, id) ON DELETE CASCADE,
    FOREIGN KEY (tenant, recipient_id) REFERENCES recipients (tenant, id) ON DELETE CASCADE
);
";

    pub const CREATE_TABLE_DISPATCH_JOBS: &str = r"
CREATE TABLE IF NOT EXISTS dispatch_jobs (
    tenant TEXT NOT NULL,
    id UUID NOT NULL,
    state TEXT NOT NULL,
    attempts INTEGER NOT NULL,
    error TEXT,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (tenant, id)
);
";

    pub const IDX_DISPATCH_JOBS_STATE: &str = r"
CREATE INDEX IF NOT EXISTS idx_dispatch_jobs_state
    ON dispatch_jobs (tenant, state, updated_at);
";
}

const DISPATCHABLE_STATES: [&str; 2] = ["TO_SEND", "ERROR"];

const REQUEST_COLUMNS: &str = "id, request_id, owner, payload, action, urgency, created_at, pending_recipients, state";

pub struct PostgresStore {
    pool: Pool,
}

impl PostgresStore {
    /// Opens the pool and creates missing tables.
    pub async fn connect(database_url: &str) -> Result<Self, Error> {
        info!("Connecting to PostgreSQL database");

        let mut cfg = deadpool_postgres::Config::new();
        cfg.url = Some(database_url.to_string());
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| anyhow!("Failed to create database pool: {}", e))?;

        let client = pool
            .get()
            .await
            .map_err(|e| anyhow!("Failed to connect to database: {}", e))?;

        let statements = [
            ddl::CREATE_TABLE_NOTIFICATION_REQUESTS,
            ddl::IDX_NOTIFICATION_REQUESTS_STATE,
            ddl::IDX_NOTIFICATION_REQUESTS_PENDING,
            ddl::CREATE_TABLE_RECIPIENT_ERRORS,
            ddl::IDX_RECIPIENT_ERRORS_RECIPIENT,
            ddl::CREATE_TABLE_RULES,
            ddl::CREATE_TABLE_RECIPIENTS,
            ddl::CREATE_TABLE_RULE_RECIPIENTS,
            ddl::CREATE_TABLE_DISPATCH_JOBS,
            ddl::IDX_DISPATCH_JOBS_STATE,
        ];

        client
            .batch_execute(&statements.join("\n"))
            .await
            .map_err(|e| anyhow!("Failed to run schema migration: {}", e))?;

        info!("PostgreSQL connection established");

        Ok(Self { pool })
    }
}

fn request_from_row(row: &Row) -> Result<NotificationRequest, StoreError> {
    let state: String = row.try_get("state")?;
    let state = RequestState::from_string(&state)
        .ok_or_else(|| StoreError::Corrupted(format!("unknown request state '{}'", state)))?;
    let action: String = row.try_get("action")?;
    let urgency: String = row.try_get("urgency")?;
    let pending: Vec<Uuid> = row.try_get("pending_recipients")?;

    Ok(NotificationRequest {
        id: row.try_get("id")?,
        request_id: row.try_get("request_id")?,
        owner: row.try_get("owner")?,
        payload: row.try_get("payload")?,
        action: ActionKind::from_string(&action),
        urgency: Urgency::from_string(&urgency),
        created_at: row.try_get("created_at")?,
        pending_recipients: pending.into_iter().collect(),
        state,
    })
}

fn recipient_error_from_row(row: &Row) -> Result<RecipientError, StoreError> {
    let attempts: i32 = row.try_get("attempts")?;

    Ok(RecipientError {
        request_id: row.try_get("request_id")?,
        recipient_id: row.try_get("recipient_id")?,
        cause: row.try_get("cause")?,
        attempts: attempts.max(0) as u32,
        first_failed_at: row.try_get("first_failed_at")?,
        last_failed_at: row.try_get("last_failed_at")?,
    })
}

fn rule_from_row(row: &Row, links: &HashMap<RuleId, BTreeSet<RecipientId>>) -> Result<Rule, StoreError> {
    let id: Uuid = row.try_get("id")?;
    let matcher: PluginConfiguration = serde_json::from_value(row.try_get("matcher")?)?;
    let urgency: String = row.try_get("urgency")?;

    Ok(Rule {
        id,
        label: row.try_get("label")?,
        matcher,
        active: row.try_get("active")?,
        urgency: Urgency::from_string(&urgency),
        recipient_ids: links.get(&id).cloned().unwrap_or_default(),
    })
}

fn recipient_from_row(row: &Row) -> Result<Recipient, StoreError> {
    let sender: PluginConfiguration = serde_json::from_value(row.try_get("sender")?)?;

    Ok(Recipient {
        id: row.try_get("id")?,
        rule_id: row.try_get("rule_id")?,
        label: row.try_get("label")?,
        sender,
        ack_required: row.try_get("ack_required")?,
    })
}

fn job_from_row(row: &Row) -> Result<DispatchJob, StoreError> {
    let state: String = row.try_get("state")?;
    let state = JobState::from_string(&state)
        .ok_or_else(|| StoreError::Corrupted(format!("unknown job state '{}'", state)))?;
    let attempts: i32 = row.try_get("attempts")?;

    Ok(DispatchJob {
        id: row.try_get("id")?,
        state,
        attempts: attempts.max(0) as u32,
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl RequestStore for PostgresStore {
    async fn insert_requests(
        &self,
        tenant: &TenantId,
        requests: &[NotificationRequest],
    ) -> Result<usize, StoreError> {
        if requests.is_empty() {
            return Ok(0);
        }

        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        let statement = tx
            .prepare(
                "INSERT INTO notification_requests (
                    tenant, id, request_id, owner, payload, action, urgency, urgency_rank,
                    created_at, pending_recipients, state
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
            )
            .await?;

        for request in requests {
            let pending: Vec<Uuid> = request.pending_recipients.iter().copied().collect();
            tx.execute(
                &statement,
                &[
                    &tenant.as_str(),
                    &request.id,
                    &request.request_id,
                    &request.owner,
                    &request.payload,
                    &request.action.as_str(),
                    &request.urgency.as_str(),
                    &request.urgency.rank(),
                    &request.created_at,
                    &pending,
                    &request.state.as_str(),
                ],
            )
            .await?;
        }

        tx.commit().await?;

        debug!(tenant = %tenant, count = requests.len(), "Notification requests inserted");
        Ok(requests.len())
    }

    async fn find_by_state(
        &self,
        tenant: &TenantId,
        states: &[RequestState],
        limit: usize,
    ) -> Result<Vec<NotificationRequest>, StoreError> {
        let client = self.pool.get().await?;
        let states: Vec<&str> = states.iter().map(RequestState::as_str).collect();
        let limit = limit as i64;

        let rows = client
            .query(
                &format!(
                    "SELECT {} FROM notification_requests
                     WHERE tenant = $1 AND state = ANY($2)
                     ORDER BY urgency_rank, created_at, seq
                     LIMIT $3",
                    REQUEST_COLUMNS
                ),
                &[&tenant.as_str(), &states, &limit],
            )
            .await?;

        rows.iter().map(request_from_row).collect()
    }

    async fn pending_recipient_ids(&self, tenant: &TenantId) -> Result<Vec<RecipientId>, StoreError> {
        let client = self.pool.get().await?;

        let rows = client
            .query(
                "SELECT DISTINCT unnest(pending_recipients) AS recipient_id
                 FROM notification_requests
                 WHERE tenant = $1 AND state = ANY($2)
                 ORDER BY recipient_id",
                &[&tenant.as_str(), &DISPATCHABLE_STATES.as_slice()],
            )
            .await?;

        rows.iter()
            .map(|row| row.try_get("recipient_id").map_err(StoreError::from))
            .collect()
    }

    async fn find_pending_for(
        &self,
        tenant: &TenantId,
        recipient_id: RecipientId,
        limit: usize,
    ) -> Result<Vec<NotificationRequest>, StoreError> {
        let client = self.pool.get().await?;
        let limit = limit as i64;

        let rows = client
            .query(
                &format!(
                    "SELECT {} FROM notification_requests
                     WHERE tenant = $1 AND state = ANY($2) AND pending_recipients @> ARRAY[$3::uuid]
                     ORDER BY urgency_rank, created_at, seq
                     LIMIT $4",
                    REQUEST_COLUMNS
                ),
                &[
                    &tenant.as_str(),
                    &DISPATCHABLE_STATES.as_slice(),
                    &recipient_id,
                    &limit,
                ],
            )
            .await?;

        rows.iter().map(request_from_row).collect()
    }

    async fn get_request(
        &self,
        tenant: &TenantId,
        request_id: Uuid,
    ) -> Result<Option<NotificationRequest>, StoreError> {
        let client = self.pool.get().await?;

        let row = client
            .query_opt(
                &format!(
                    "SELECT {} FROM notification_requests WHERE tenant = $1 AND id = $2",
                    REQUEST_COLUMNS
                ),
                &[&tenant.as_str(), &request_id],
            )
            .await?;

        row.as_ref().map(request_from_row).transpose()
    }

    async fn apply_match_outcomes(
        &self,
        tenant: &TenantId,
        outcomes: &[MatchOutcome],
    ) -> Result<usize, StoreError> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let mut applied = 0;

        for outcome in outcomes {
            let changed = match outcome {
                MatchOutcome::Matched {
                    request_id,
                    recipients,
                    urgency,
                } => {
                    let pending: Vec<Uuid> = recipients.iter().copied().collect();
                    tx.execute(
                        "UPDATE notification_requests
                         SET pending_recipients = $3, urgency = $4, urgency_rank = $5, state = $6
                         WHERE tenant = $1 AND id = $2 AND state = $7",
                        &[
                            &tenant.as_str(),
                            request_id,
                            &pending,
                            &urgency.as_str(),
                            &urgency.rank(),
                            &RequestState::ToSend.as_str(),
                            &RequestState::ToMatch.as_str(),
                        ],
                    )
                    .await?
                }
                MatchOutcome::Discarded { request_id } => {
                    tx.execute(
                        "DELETE FROM notification_requests
                         WHERE tenant = $1 AND id = $2 AND state = $3",
                        &[&tenant.as_str(), request_id, &RequestState::ToMatch.as_str()],
                    )
                    .await?
                }
            };
            applied += changed as usize;
        }

        tx.commit().await?;
        Ok(applied)
    }

    async fn record_delivery(
        &self,
        tenant: &TenantId,
        outcome: &DeliveryOutcome,
    ) -> Result<DeliveryWriteResult, StoreError> {
        let mut client = self.pool.get().await?;
        let recipient_id = outcome.recipient_id;
        let mut result = DeliveryWriteResult::default();

        for request_id in &outcome.delivered {
            let tx = client.transaction().await?;

            let row = tx
                .query_opt(
                    "SELECT pending_recipients FROM notification_requests
                     WHERE tenant = $1 AND id = $2 FOR UPDATE",
                    &[&tenant.as_str(), request_id],
                )
                .await?;

            let Some(row) = row else {
                tx.commit().await?;
                continue;
            };

            let mut pending: Vec<Uuid> = row.try_get("pending_recipients")?;
            if !pending.contains(&recipient_id) {
                tx.commit().await?;
                continue;
            }
            pending.retain(|id| *id != recipient_id);

            tx.execute(
                "DELETE FROM recipient_errors
                 WHERE tenant = $1 AND request_id = $2 AND recipient_id = $3",
                &[&tenant.as_str(), request_id, &recipient_id],
            )
            .await?;

            if pending.is_empty() {
                tx.execute(
                    "DELETE FROM notification_requests WHERE tenant = $1 AND id = $2",
                    &[&tenant.as_str(), request_id],
                )
                .await?;
                result.completed.push(*request_id);
            } else {
                let has_errors: bool = tx
                    .query_one(
                        "SELECT EXISTS (
                            SELECT 1 FROM recipient_errors WHERE tenant = $1 AND request_id = $2
                         )",
                        &[&tenant.as_str(), request_id],
                    )
                    .await?
                    .try_get(0)?;

                let state = if has_errors {
                    RequestState::Error
                } else {
                    RequestState::ToSend
                };

                tx.execute(
                    "UPDATE notification_requests SET pending_recipients = $3, state = $4
                     WHERE tenant = $1 AND id = $2",
                    &[&tenant.as_str(), request_id, &pending, &state.as_str()],
                )
                .await?;
            }

            tx.commit().await?;
            result.delivered += 1;
        }

        for (request_id, cause) in &outcome.failed {
            let tx = client.transaction().await?;
            let now = Utc::now();

            let row = tx
                .query_opt(
                    "SELECT pending_recipients FROM notification_requests
                     WHERE tenant = $1 AND id = $2 FOR UPDATE",
                    &[&tenant.as_str(), request_id],
                )
                .await?;

            let still_pending = match &row {
                Some(row) => row
                    .try_get::<_, Vec<Uuid>>("pending_recipients")?
                    .contains(&recipient_id),
                None => false,
            };

            if !still_pending {
                tx.commit().await?;
                continue;
            }

            tx.execute(
                "INSERT INTO recipient_errors (
                    tenant, request_id, recipient_id, cause, attempts, first_failed_at, last_failed_at
                 ) VALUES ($1, $2, $3, $4, 1, $5, $5)
                 ON CONFLICT (tenant, request_id, recipient_id) DO UPDATE
                 SET cause = EXCLUDED.cause,
                     attempts = recipient_errors.attempts + 1,
                     last_failed_at = EXCLUDED.last_failed_at",
                &[&tenant.as_str(), request_id, &recipient_id, cause, &now],
            )
            .await?;

            tx.execute(
                "UPDATE notification_requests SET state = $3 WHERE tenant = $1 AND id = $2",
                &[&tenant.as_str(), request_id, &RequestState::Error.as_str()],
            )
            .await?;

            tx.commit().await?;
            result.errored += 1;
        }

        debug!(
            tenant = %tenant,
            recipient_id = %recipient_id,
            delivered = result.delivered,
            errored = result.errored,
            completed = result.completed.len(),
            "Delivery outcome recorded"
        );

        Ok(result)
    }

    async fn list_recipient_errors(
        &self,
        tenant: &TenantId,
        recipient_id: Option<RecipientId>,
    ) -> Result<Vec<RecipientError>, StoreError> {
        let client = self.pool.get().await?;

        let rows = client
            .query(
                "SELECT request_id, recipient_id, cause, attempts, first_failed_at, last_failed_at
                 FROM recipient_errors
                 WHERE tenant = $1 AND ($2::UUID IS NULL OR recipient_id = $2)
                 ORDER BY first_failed_at, request_id",
                &[&tenant.as_str(), &recipient_id],
            )
            .await?;

        rows.iter().map(recipient_error_from_row).collect()
    }

    async fn count_requests(
        &self,
        tenant: &TenantId,
        state: Option<RequestState>,
    ) -> Result<usize, StoreError> {
        let client = self.pool.get().await?;
        let state = state.map(|s| s.as_str());

        let count: i64 = client
            .query_one(
                "SELECT COUNT(*) FROM notification_requests
                 WHERE tenant = $1 AND ($2::TEXT IS NULL OR state = $2)",
                &[&tenant.as_str(), &state],
            )
            .await?
            .try_get(0)?;

        Ok(count.max(0) as usize)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        let client = self.pool.get().await?;
        client.query_one("SELECT 1", &[]).await?;
        Ok(())
    }
}

impl PostgresStore {
    async fn load_links(
        &self,
        tenant: &TenantId,
    ) -> Result<HashMap<RuleId, BTreeSet<RecipientId>>, StoreError> {
        let client = self.pool.get().await?;

        let rows = client
            .query(
                "SELECT rule_id, recipient_id FROM rule_recipients WHERE tenant = $1",
                &[&tenant.as_str()],
            )
            .await?;

        let mut links: HashMap<RuleId, BTreeSet<RecipientId>> = HashMap::new();
        for row in &rows {
            links
                .entry(row.try_get("rule_id")?)
                .or_default()
                .insert(row.try_get("recipient_id")?);
        }

        Ok(links)
    }
}

#[async_trait]
impl RuleStore for PostgresStore {
    async fn list_rules(&self, tenant: &TenantId) -> Result<Vec<Rule>, StoreError> {
        let links = self.load_links(tenant).await?;
        let client = self.pool.get().await?;

        let rows = client
            .query(
                "SELECT id, label, matcher, active, urgency FROM rules
                 WHERE tenant = $1 ORDER BY label, id",
                &[&tenant.as_str()],
            )
            .await?;

        rows.iter().map(|row| rule_from_row(row, &links)).collect()
    }

    async fn get_rule(&self, tenant: &TenantId, rule_id: RuleId) -> Result<Option<Rule>, StoreError> {
        let links = self.load_links(tenant).await?;
        let client = self.pool.get().await?;

        let row = client
            .query_opt(
                "SELECT id, label, matcher, active, urgency FROM rules WHERE tenant = $1 AND id = $2",
                &[&tenant.as_str(), &rule_id],
            )
            .await?;

        row.as_ref().map(|row| rule_from_row(row, &links)).transpose()
    }

    async fn save_rule(&self, tenant: &TenantId, rule: &Rule) -> Result<(), StoreError> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let matcher = serde_json::to_value(&rule.matcher)?;

        tx.execute(
            "INSERT INTO rules (tenant, id, label, matcher, active, urgency)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (tenant, id) DO UPDATE
             SET label = EXCLUDED.label, matcher = EXCLUDED.matcher,
                 active = EXCLUDED.active, urgency = EXCLUDED.urgency",
            &[
                &tenant.as_str(),
                &rule.id,
                &rule.label,
                &matcher,
                &rule.active,
                &rule.urgency.as_str(),
            ],
        )
        .await?;

        tx.execute(
            "DELETE FROM rule_recipients WHERE tenant = $1 AND rule_id = $2",
            &[&tenant.as_str(), &rule.id],
        )
        .await?;

        for recipient_id in &rule.recipient_ids {
            tx.execute(
                "INSERT INTO rule_recipients (tenant, rule_id, recipient_id) VALUES ($1, $2, $3)",
                &[&tenant.as_str(), &rule.id, recipient_id],
            )
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete_rule(&self, tenant: &TenantId, rule_id: RuleId) -> Result<bool, StoreError> {
        let client = self.pool.get().await?;

        let deleted = client
            .execute(
                "DELETE FROM rules WHERE tenant = $1 AND id = $2",
                &[&tenant.as_str(), &rule_id],
            )
            .await?;

        Ok(deleted > 0)
    }

    async fn list_recipients(&self, tenant: &TenantId) -> Result<Vec<Recipient>, StoreError> {
        let client = self.pool.get().await?;

        let rows = client
            .query(
                "SELECT id, rule_id, label, sender, ack_required FROM recipients
                 WHERE tenant = $1 ORDER BY label, id",
                &[&tenant.as_str()],
            )
            .await?;

        rows.iter().map(recipient_from_row).collect()
    }

    async fn get_recipient(
        &self,
        tenant: &TenantId,
        recipient_id: RecipientId,
    ) -> Result<Option<Recipient>, StoreError> {
        let client = self.pool.get().await?;

        let row = client
            .query_opt(
                "SELECT id, rule_id, label, sender, ack_required FROM recipients
                 WHERE tenant = $1 AND id = $2",
                &[&tenant.as_str(), &recipient_id],
            )
            .await?;

        row.as_ref().map(recipient_from_row).transpose()
    }

    async fn save_recipient(&self, tenant: &TenantId, recipient: &Recipient) -> Result<(), StoreError> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let sender = serde_json::to_value(&recipient.sender)?;

        let owner_exists: bool = tx
            .query_one(
                "SELECT EXISTS (SELECT 1 FROM rules WHERE tenant = $1 AND id = $2)",
                &[&tenant.as_str(), &recipient.rule_id],
            )
            .await?
            .try_get(0)?;

        if !owner_exists {
            return Err(StoreError::NotFound {
                entity: "rule",
                id: recipient.rule_id,
            });
        }

        tx.execute(
            "INSERT INTO recipients (tenant, id, rule_id, label, sender, ack_required)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (tenant, id) DO UPDATE
             SET rule_id = EXCLUDED.rule_id, label = EXCLUDED.label,
                 sender = EXCLUDED.sender, ack_required = EXCLUDED.ack_required",
            &[
                &tenant.as_str(),
                &recipient.id,
                &recipient.rule_id,
                &recipient.label,
                &sender,
                &recipient.ack_required,
            ],
        )
        .await?;

        tx.execute(
            "INSERT INTO rule_recipients (tenant, rule_id, recipient_id) VALUES ($1, $2, $3)
             ON CONFLICT DO NOTHING",
            &[&tenant.as_str(), &recipient.rule_id, &recipient.id],
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn delete_recipient(
        &self,
        tenant: &TenantId,
        recipient_id: RecipientId,
    ) -> Result<bool, StoreError> {
        let client = self.pool.get().await?;

        let deleted = client
            .execute(
                "DELETE FROM recipients WHERE tenant = $1 AND id = $2",
                &[&tenant.as_str(), &recipient_id],
            )
            .await?;

        Ok(deleted > 0)
    }
}

#[async_trait]
impl JobStore for PostgresStore {
    async fn save_job(&self, tenant: &TenantId, job: &DispatchJob) -> Result<(), StoreError> {
        let client = self.pool.get().await?;
        let attempts = job.attempts as i32;

        client
            .execute(
                "INSERT INTO dispatch_jobs (tenant, id, state, attempts, error, created_at, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)
                 ON CONFLICT (tenant, id) DO UPDATE
                 SET state = EXCLUDED.state, attempts = EXCLUDED.attempts,
                     error = EXCLUDED.error, updated_at = EXCLUDED.updated_at",
                &[
                    &tenant.as_str(),
                    &job.id,
                    &job.state.as_str(),
                    &attempts,
                    &job.error,
                    &job.created_at,
                    &job.updated_at,
                ],
            )
            .await?;

        Ok(())
    }

    async fn get_job(&self, tenant: &TenantId, job_id: Uuid) -> Result<Option<DispatchJob>, StoreError> {
        let client = self.pool.get().await?;

        let row = client
            .query_opt(
                "SELECT id, state, attempts, error, created_at, updated_at FROM dispatch_jobs
                 WHERE tenant = $1 AND id = $2",
                &[&tenant.as_str(), &job_id],
            )
            .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn find_jobs(
        &self,
        tenant: &TenantId,
        state: JobState,
        limit: usize,
    ) -> Result<Vec<DispatchJob>, StoreError> {
        let client = self.pool.get().await?;
        let limit = limit as i64;

        let rows = client
            .query(
                "SELECT id, state, attempts, error, created_at, updated_at FROM dispatch_jobs
                 WHERE tenant = $1 AND state = $2
                 ORDER BY created_at, id
                 LIMIT $3",
                &[&tenant.as_str(), &state.as_str(), &limit],
            )
            .await?;

        rows.iter().map(job_from_row).collect()
    }

    async fn purge_succeeded_jobs(
        &self,
        tenant: &TenantId,
        before: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let client = self.pool.get().await?;

        let purged = client
            .execute(
                "DELETE FROM dispatch_jobs WHERE tenant = $1 AND state = $2 AND updated_at < $3",
                &[&tenant.as_str(), &JobState::Succeeded.as_str(), &before],
            )
            .await?;

        Ok(purged as usize)
    }
}
