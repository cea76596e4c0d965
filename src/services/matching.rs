use std::{collections::BTreeSet, sync::Arc};

use anyhow::Result;
use serde_json::Value as JsonValue;
use tracing::{debug, error, info, warn};

use crate::{
    clients::{
        publisher::StatusPublisher,
        store::{MatchOutcome, NotifierStore},
    },
    models::{
        report::MatchReport,
        request::{RequestState, Urgency},
        rule::{RecipientId, RuleId},
        status::{NotificationStatus, NotifierEvent},
        tenant::TenantId,
    },
    services::rule_cache::{ActiveRule, RuleCache},
};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedRecipients {
    pub recipients: BTreeSet<RecipientId>,
    pub urgency: Urgency,
    pub matched_rules: Vec<RuleId>,
    pub matcher_errors: Vec<(RuleId, String)>,
}

/// Union of the recipients of every rule whose matcher accepts `payload`.
///
/// A matcher error counts as a non-match for that rule only. The request is
/// IMMEDIATE as soon as one matched rule is.
pub fn resolve_recipients(rules: &[ActiveRule], payload: &JsonValue) -> ResolvedRecipients {
    let mut resolved = ResolvedRecipients::default();

    for active in rules {
        match active.matcher.matches(payload) {
            Ok(true) => {
                resolved
                    .recipients
                    .extend(active.rule.recipient_ids.iter().copied());
                resolved.urgency = resolved.urgency.min(active.rule.urgency);
                resolved.matched_rules.push(active.rule.id);
            }
            Ok(false) => {}
            Err(e) => resolved.matcher_errors.push((active.rule.id, e.to_string())),
        }
    }

    resolved
}

pub struct MatchingEngine {
    store: Arc<dyn NotifierStore>,
    cache: Arc<RuleCache>,
    publisher: Arc<dyn StatusPublisher>,
    max_bulk_size: usize,
}

impl MatchingEngine {
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

    /// One matching pass over the oldest TO_MATCH requests.
    pub async fn schedule_requests(&self, tenant: &TenantId) -> Result<MatchReport> {
        let requests = self
            .store
            .find_by_state(tenant, &[RequestState::ToMatch], self.max_bulk_size)
            .await?;

        if requests.is_empty() {
            debug!(tenant = %tenant, "No request to match");
            return Ok(MatchReport::default());
        }

        let rules = self.cache.active_rules(tenant).await?;
        for broken in &rules.broken {
            error!(
                tenant = %tenant,
                kind = ?broken.kind,
                owner_id = %broken.owner_id,
                label = %broken.label,
                plugin_id = %broken.plugin_id,
                cause = %broken.cause,
                "Plugin could not be instantiated"
            );
        }

        let mut report = MatchReport::default();
        let mut outcomes = Vec::with_capacity(requests.len());
        let mut discarded = Vec::new();

        for request in &requests {
            let resolved = resolve_recipients(&rules.rules, &request.payload);

            for (rule_id, cause) in &resolved.matcher_errors {
                warn!(
                    tenant = %tenant,
                    request_id = %request.request_id,
                    rule_id = %rule_id,
                    error = %cause,
                    "Matcher failed, rule skipped for this request"
                );
            }
            report.matcher_errors += resolved.matcher_errors.len();

            if resolved.recipients.is_empty() {
                outcomes.push(MatchOutcome::Discarded {
                    request_id: request.id,
                });
                discarded.push(request);
            } else {
                debug!(
                    tenant = %tenant,
                    request_id = %request.request_id,
                    rules = resolved.matched_rules.len(),
                    recipients = resolved.recipients.len(),
                    "Request matched"
                );
                outcomes.push(MatchOutcome::Matched {
                    request_id: request.id,
                    recipients: resolved.recipients,
                    urgency: resolved.urgency,
                });
                report.matched += 1;
            }
        }
        report.discarded = discarded.len();

        self.store.apply_match_outcomes(tenant, &outcomes).await?;

        if !discarded.is_empty() {
            let events: Vec<NotifierEvent> = discarded
                .iter()
                .map(|request| {
                    NotifierEvent::for_request(tenant, request, NotificationStatus::Success)
                        .with_reason("no rule matched")
                })
                .collect();

            if let Err(e) = self.publisher.publish(&events).await {
                warn!(tenant = %tenant, error = %e, "Failed to publish discard events");
            }
        }

        info!(
            tenant = %tenant,
            matched = report.matched,
            discarded = report.discarded,
            matcher_errors = report.matcher_errors,
            "Matching pass finished"
        );

        Ok(report)
    }
}
