use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use chrono::Utc;
use notifier_service::{
    api::{AppState, router},
    clients::{
        health::HealthChecker,
        lock::{LeaseLock, task_lock_key},
        store::JobStore,
    },
    models::job::DispatchJob,
};
use serde_json::{Value as JsonValue, json};
use tokio::net::TcpListener;
use uuid::Uuid;

use crate::common::Harness;

async fn serve(h: &Harness) -> Result<SocketAddr> {
    let state = Arc::new(AppState {
        health_checker: HealthChecker::new(h.store.clone(), h.lock.clone(), None),
        scheduler: h.scheduler(h.lock.clone()),
        configuration: h.configuration.clone(),
    });

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, router(state)).await;
    });

    Ok(addr)
}

/// Test: Health reflects the critical dependencies
#[tokio::test]
async fn test_health_endpoint() -> Result<()> {
    let h = Harness::new();
    let addr = serve(&h).await?;
    let client = reqwest::Client::new();

    let healthy = client.get(format!("http://{}/health", addr)).send().await?;
    assert_eq!(healthy.status(), 200);
    let body: JsonValue = healthy.json().await?;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["checks"]["database"]["status"], "healthy");
    assert_eq!(body["checks"]["lock_service"]["status"], "healthy");

    h.store.set_unavailable(true);
    let unhealthy = client.get(format!("http://{}/health", addr)).send().await?;
    assert_eq!(unhealthy.status(), 503);
    let body: JsonValue = unhealthy.json().await?;
    assert_eq!(body["checks"]["database"]["status"], "unhealthy");

    Ok(())
}

/// Test: A failed dispatch job can be re-run over HTTP
#[tokio::test]
async fn test_retry_failed_job() -> Result<()> {
    let h = Harness::new();
    let rule = h.always_rule("everything").await?;
    h.recipient(&rule, "sink").await?;
    h.register_events(2).await?;
    h.matching.schedule_requests(&h.tenant).await?;

    let now = Utc::now();
    let mut job = DispatchJob::queued(now);
    job.start(now)?;
    job.fail("lease lost".to_string(), now)?;
    h.store.save_job(&h.tenant, &job).await?;

    let addr = serve(&h).await?;
    let url = format!("http://{}/tenants/{}/dispatch-jobs/{}/retry", addr, h.tenant, job.id);
    let client = reqwest::Client::new();

    let response = client.post(&url).send().await?;
    assert_eq!(response.status(), 200);
    let body: JsonValue = response.json().await?;
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["completed"], 2);

    let again = client.post(&url).send().await?;
    assert_eq!(again.status(), 409);
    let body: JsonValue = again.json().await?;
    assert_eq!(body["success"], false);

    Ok(())
}

/// Test: Unknown jobs and malformed tenants are client errors
#[tokio::test]
async fn test_retry_client_errors() -> Result<()> {
    let h = Harness::new();
    let addr = serve(&h).await?;
    let client = reqwest::Client::new();

    let missing = client
        .post(format!(
            "http://{}/tenants/{}/dispatch-jobs/{}/retry",
            addr,
            h.tenant,
            Uuid::new_v4()
        ))
        .send()
        .await?;
    assert_eq!(missing.status(), 404);

    let bad_tenant = client
        .post(format!(
            "http://{}/tenants/not%20valid/dispatch-jobs/{}/retry",
            addr,
            Uuid::new_v4()
        ))
        .send()
        .await?;
    assert_eq!(bad_tenant.status(), 400);

    Ok(())
}

/// Test: A manual retry is refused while a dispatch pass holds the tenant lease
#[tokio::test]
async fn test_retry_conflicts_with_running_pass() -> Result<()> {
    let h = Harness::new();
    let now = Utc::now();
    let mut job = DispatchJob::queued(now);
    job.start(now)?;
    job.fail("lease lost".to_string(), now)?;
    h.store.save_job(&h.tenant, &job).await?;

    let key = task_lock_key(h.tenant.as_str(), "dispatch");
    let held = h.lock.try_acquire(&key, Duration::from_secs(5)).await?.unwrap();

    let addr = serve(&h).await?;
    let url = format!("http://{}/tenants/{}/dispatch-jobs/{}/retry", addr, h.tenant, job.id);
    let client = reqwest::Client::new();

    let busy = client.post(&url).send().await?;
    assert_eq!(busy.status(), 409);
    let body: JsonValue = busy.json().await?;
    assert_eq!(body["success"], false);

    h.lock.release(&held).await?;
    let retried = client.post(&url).send().await?;
    assert_eq!(retried.status(), 200);

    Ok(())
}

/// Test: Rules and recipients can be managed over HTTP
#[tokio::test]
async fn test_configuration_routes() -> Result<()> {
    let h = Harness::new();
    let addr = serve(&h).await?;
    let base = format!("http://{}/tenants/{}", addr, h.tenant);
    let client = reqwest::Client::new();

    let created = client
        .post(format!("{}/rules", base))
        .json(&json!({ "label": "everything", "matcher": { "plugin_id": "always" } }))
        .send()
        .await?;
    assert_eq!(created.status(), 201);
    let body: JsonValue = created.json().await?;
    assert_eq!(body["data"]["active"], true);
    assert_eq!(body["data"]["urgency"], "DEFERRED");
    let rule_id = body["data"]["id"].as_str().unwrap().to_string();

    let recipient = client
        .post(format!("{}/recipients", base))
        .json(&json!({
            "rule_id": rule_id,
            "label": "ops-log",
            "sender": { "plugin_id": "log" }
        }))
        .send()
        .await?;
    assert_eq!(recipient.status(), 201);
    let body: JsonValue = recipient.json().await?;
    let recipient_id = body["data"]["id"].as_str().unwrap().to_string();

    let rule: JsonValue = client
        .get(format!("{}/rules/{}", base, rule_id))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(rule["data"]["recipient_ids"], json!([recipient_id]));

    let updated = client
        .put(format!("{}/rules/{}", base, rule_id))
        .json(&json!({ "label": "everything", "matcher": { "plugin_id": "always" }, "active": false }))
        .send()
        .await?;
    assert_eq!(updated.status(), 200);
    assert!(h.cache.active_rules(&h.tenant).await?.rules.is_empty());

    let bad_matcher = client
        .post(format!("{}/rules", base))
        .json(&json!({ "label": "broken", "matcher": { "plugin_id": "no-such-plugin" } }))
        .send()
        .await?;
    assert_eq!(bad_matcher.status(), 400);

    let missing = client
        .get(format!("{}/rules/{}", base, Uuid::new_v4()))
        .send()
        .await?;
    assert_eq!(missing.status(), 404);

    let deleted = client
        .delete(format!("{}/recipients/{}", base, recipient_id))
        .send()
        .await?;
    assert_eq!(deleted.status(), 200);
    let listed: JsonValue = client
        .get(format!("{}/recipients", base))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(listed["data"], json!([]));

    Ok(())
}
