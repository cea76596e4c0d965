use anyhow::Result;
use notifier_service::{
    clients::store::RequestStore,
    models::{
        request::{ActionKind, RawEvent, RequestState},
        rule::PluginConfiguration,
        status::NotificationStatus,
    },
};
use serde_json::json;
use uuid::Uuid;

use crate::common::{Harness, SCRIPTED, event};

/// Test: Valid events are stored as TO_MATCH and granted
#[tokio::test]
async fn test_valid_events_are_granted() -> Result<()> {
    let h = Harness::new();

    let report = h
        .registration
        .register(
            &h.tenant,
            vec![
                event(json!({ "id": 1 })).with_request_id("req-1").with_owner("alice"),
                event(json!({ "id": 2 })).with_request_id("req-2"),
            ],
        )
        .await?;

    assert_eq!(report.registered, 2);
    assert_eq!(report.denied, 0);
    assert_eq!(
        h.store
            .count_requests(&h.tenant, Some(RequestState::ToMatch))
            .await?,
        2
    );

    let granted: Vec<_> = h
        .publisher
        .events()
        .into_iter()
        .filter(|e| e.status == NotificationStatus::Granted)
        .collect();
    assert_eq!(granted.len(), 2);
    let alice = granted.iter().find(|e| e.request_id == "req-1").unwrap();
    assert_eq!(alice.owner.as_deref(), Some("alice"));
    assert_eq!(alice.tenant, h.tenant);

    Ok(())
}

/// Test: Invalid events are denied without blocking the rest of the batch
#[tokio::test]
async fn test_invalid_events_are_denied() -> Result<()> {
    let h = Harness::new();

    let report = h
        .registration
        .register(
            &h.tenant,
            vec![
                event(json!("not an object")).with_request_id("bad-payload"),
                event(json!({})).with_request_id(" "),
                event(json!({})).with_owner("o".repeat(200)),
                event(json!({ "ok": true })).with_request_id("good"),
            ],
        )
        .await?;

    assert_eq!(report.registered, 1);
    assert_eq!(report.denied, 3);
    assert_eq!(h.requests_left().await?, 1);
    assert_eq!(h.publisher.count(NotificationStatus::Denied), 3);
    assert_eq!(h.publisher.count(NotificationStatus::Granted), 1);

    let denied = h
        .publisher
        .events()
        .into_iter()
        .find(|e| e.request_id == "bad-payload")
        .unwrap();
    assert_eq!(denied.status, NotificationStatus::Denied);
    assert!(denied.reason.unwrap().contains("JSON object"));

    Ok(())
}

/// Test: Batches above the bulk size are refused outright
#[tokio::test]
async fn test_oversized_batch_is_refused() -> Result<()> {
    let mut settings = crate::common::test_settings();
    settings.max_bulk_size = 2;
    let h = Harness::with_settings(settings);

    let events = (0..3).map(|i| event(json!({ "i": i }))).collect();
    let result = h.registration.register(&h.tenant, events).await;

    assert!(result.is_err());
    assert_eq!(h.requests_left().await?, 0);
    assert!(h.publisher.events().is_empty());

    Ok(())
}

/// Test: Registration does not collapse duplicate events
#[tokio::test]
async fn test_duplicates_are_registered_twice() -> Result<()> {
    let h = Harness::new();
    let duplicate = event(json!({ "id": 7 })).with_request_id("same");

    h.registration
        .register(&h.tenant, vec![duplicate.clone(), duplicate])
        .await?;

    assert_eq!(h.requests_left().await?, 2);

    Ok(())
}

/// Test: Events naming recipients skip matching and go straight to dispatch
#[tokio::test]
async fn test_direct_recipients_bypass_matching() -> Result<()> {
    let h = Harness::new();
    // No rule matches anything; the recipient only hangs off it.
    let rule = h
        .rule(
            "never",
            PluginConfiguration::new("field-equals")
                .with_parameter("attribute", json!("missing"))
                .with_parameter("value", json!(true)),
        )
        .await?;
    let direct = h
        .recipient_with(
            &rule,
            "direct-line",
            PluginConfiguration::new(SCRIPTED).with_parameter("direct", json!(true)),
        )
        .await?;

    let report = h
        .registration
        .register(
            &h.tenant,
            vec![
                RawEvent::new(ActionKind::Update, json!({ "id": 1 }))
                    .with_request_id("direct-1")
                    .with_recipients([direct.id]),
            ],
        )
        .await?;
    assert_eq!(report.registered, 1);
    assert_eq!(
        h.store
            .count_requests(&h.tenant, Some(RequestState::ToSend))
            .await?,
        1
    );

    assert_eq!(h.matching.schedule_requests(&h.tenant).await?.matched, 0);
    h.dispatch.send_to_recipients(&h.tenant).await?;

    assert_eq!(h.scripts.get("direct-line").delivered(), vec!["direct-1".to_string()]);
    assert_eq!(h.requests_left().await?, 0);

    Ok(())
}

/// Test: Direct recipients must exist and accept direct notifications
#[tokio::test]
async fn test_invalid_direct_recipients_are_denied() -> Result<()> {
    let h = Harness::new();
    let rule = h.always_rule("everything").await?;
    let rules_only = h.recipient(&rule, "rules-only").await?;

    let report = h
        .registration
        .register(
            &h.tenant,
            vec![
                event(json!({})).with_recipients([rules_only.id]),
                event(json!({})).with_recipients([Uuid::new_v4()]),
            ],
        )
        .await?;

    assert_eq!(report.registered, 0);
    assert_eq!(report.denied, 2);
    assert_eq!(h.requests_left().await?, 0);

    Ok(())
}

/// Test: Tenants registering the same events stay isolated
#[tokio::test]
async fn test_tenants_are_isolated() -> Result<()> {
    let h = Harness::new();
    let other = notifier_service::models::tenant::TenantId::parse("project-b")?;

    h.register_events(3).await?;
    h.registration
        .register(&other, vec![event(json!({ "id": 1 }))])
        .await?;

    assert_eq!(h.store.count_requests(&h.tenant, None).await?, 3);
    assert_eq!(h.store.count_requests(&other, None).await?, 1);

    Ok(())
}
