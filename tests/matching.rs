use anyhow::Result;
use notifier_service::{
    clients::store::RequestStore,
    models::{
        request::{RequestState, Urgency},
        rule::{PluginConfiguration, Rule},
        status::NotificationStatus,
    },
};
use serde_json::json;

use crate::common::{Harness, event};

fn nature_is(value: &str) -> PluginConfiguration {
    PluginConfiguration::new("field-equals")
        .with_parameter("attribute", json!("properties.nature"))
        .with_parameter("value", json!(value))
}

/// Test: Requests no rule matches are deleted and reported as handled
#[tokio::test]
async fn test_unmatched_requests_are_not_kept() -> Result<()> {
    let h = Harness::new();
    let rule = h.rule("trademarks", nature_is("TM")).await?;
    h.recipient(&rule, "registry").await?;

    let events = vec![
        event(json!({ "properties": { "nature": "PATENT" } })).with_request_id("patent-1"),
        event(json!({ "properties": { "nature": "TM" } })).with_request_id("tm-1"),
    ];
    h.registration.register(&h.tenant, events).await?;

    let report = h.matching.schedule_requests(&h.tenant).await?;

    assert_eq!(report.matched, 1);
    assert_eq!(report.discarded, 1);
    assert_eq!(h.requests_left().await?, 1);

    let discarded: Vec<_> = h
        .publisher
        .events()
        .into_iter()
        .filter(|e| e.status == NotificationStatus::Success)
        .collect();
    assert_eq!(discarded.len(), 1);
    assert_eq!(discarded[0].request_id, "patent-1");
    assert_eq!(discarded[0].reason.as_deref(), Some("no rule matched"));

    Ok(())
}

/// Test: Matched requests move to TO_SEND with the recipients of every matching rule
#[tokio::test]
async fn test_matched_requests_carry_the_recipient_union() -> Result<()> {
    let h = Harness::new();
    let tm = h.rule("trademarks", nature_is("TM")).await?;
    let all = h.always_rule("audit").await?;
    let registry = h.recipient(&tm, "registry").await?;
    let auditor = h.recipient(&all, "auditor").await?;
    h.recipient(&h.rule("patents", nature_is("PATENT")).await?, "patent-office")
        .await?;

    h.registration
        .register(&h.tenant, vec![event(json!({ "properties": { "nature": "TM" } }))])
        .await?;
    h.matching.schedule_requests(&h.tenant).await?;

    let pending = h
        .store
        .find_by_state(&h.tenant, &[RequestState::ToSend], 10)
        .await?;

    assert_eq!(pending.len(), 1);
    assert_eq!(
        pending[0].pending_recipients.iter().copied().collect::<Vec<_>>(),
        {
            let mut expected = vec![registry.id, auditor.id];
            expected.sort();
            expected
        }
    );

    Ok(())
}

/// Test: A recipient reachable through two matching rules is notified once
#[tokio::test]
async fn test_shared_recipient_is_counted_once() -> Result<()> {
    let h = Harness::new();
    let first = h.always_rule("first").await?;
    let second = h.always_rule("second").await?;
    let shared = h.recipient(&first, "shared").await?;
    h.configuration
        .attach_recipient(&h.tenant, second.id, shared.id)
        .await?;

    h.register_events(3).await?;
    h.matching.schedule_requests(&h.tenant).await?;

    for request in h.store.find_by_state(&h.tenant, &[RequestState::ToSend], 10).await? {
        assert_eq!(request.pending_recipients.len(), 1);
    }

    let report = h.dispatch.send_to_recipients(&h.tenant).await?;
    let script = h.scripts.get("shared");

    assert_eq!(report.delivered, 3);
    assert_eq!(script.calls(), 1);
    assert_eq!(script.delivered().len(), 3);
    assert_eq!(h.requests_left().await?, 0);

    Ok(())
}

/// Test: Inactive rules never match
#[tokio::test]
async fn test_inactive_rules_are_ignored() -> Result<()> {
    let h = Harness::new();
    let rule = h
        .configuration
        .create_rule(&h.tenant, Rule::new("paused", PluginConfiguration::new("always")).inactive())
        .await?;
    h.recipient(&rule, "nobody").await?;

    h.register_events(2).await?;
    let report = h.matching.schedule_requests(&h.tenant).await?;

    assert_eq!(report.matched, 0);
    assert_eq!(report.discarded, 2);
    assert_eq!(h.requests_left().await?, 0);

    Ok(())
}

/// Test: Requests matched by an IMMEDIATE rule are dispatched before older deferred ones
#[tokio::test]
async fn test_immediate_requests_jump_the_queue() -> Result<()> {
    let h = Harness::new();
    let urgent = h
        .configuration
        .create_rule(
            &h.tenant,
            Rule::new("alerts", nature_is("ALERT")).with_urgency(Urgency::Immediate),
        )
        .await?;
    let routine = h.always_rule("routine").await?;
    h.recipient(&urgent, "pager").await?;
    h.recipient(&routine, "digest").await?;

    h.registration
        .register(
            &h.tenant,
            vec![event(json!({ "properties": { "nature": "INFO" } })).with_request_id("older")],
        )
        .await?;
    h.registration
        .register(
            &h.tenant,
            vec![event(json!({ "properties": { "nature": "ALERT" } })).with_request_id("newer")],
        )
        .await?;
    h.matching.schedule_requests(&h.tenant).await?;

    let queue = h
        .store
        .find_by_state(&h.tenant, &[RequestState::ToSend], 10)
        .await?;

    assert_eq!(queue[0].request_id, "newer");
    assert_eq!(queue[0].urgency, Urgency::Immediate);
    assert_eq!(queue[1].request_id, "older");
    assert_eq!(queue[1].urgency, Urgency::Deferred);

    Ok(())
}

/// Test: A matching pass only looks at TO_MATCH requests and is bounded by the bulk size
#[tokio::test]
async fn test_matching_pass_is_bounded() -> Result<()> {
    let mut settings = crate::common::test_settings();
    settings.max_bulk_size = 4;
    let h = Harness::with_settings(settings);
    let rule = h.always_rule("all").await?;
    h.recipient(&rule, "sink").await?;

    h.register_events(4).await?;
    h.register_events(2).await?;

    assert_eq!(h.matching.schedule_requests(&h.tenant).await?.matched, 4);
    assert_eq!(h.matching.schedule_requests(&h.tenant).await?.matched, 2);
    assert_eq!(h.matching.schedule_requests(&h.tenant).await?.matched, 0);
    assert_eq!(
        h.store
            .count_requests(&h.tenant, Some(RequestState::ToSend))
            .await?,
        6
    );

    Ok(())
}
