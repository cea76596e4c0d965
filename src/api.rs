use std::sync::Arc;

use anyhow::Error;
use axum::{
    Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    clients::{health::HealthChecker, lock::LockError, store::StoreError},
    models::{
        health::HealthStatus,
        job::JobError,
        report::DispatchReport,
        response::ApiResponse,
        rule::{Recipient, RecipientId, Rule, RuleId},
        tenant::TenantId,
    },
    services::{
        configuration::{ConfigurationError, ConfigurationService},
        scheduler::{Scheduler, SchedulerError},
    },
};

pub struct AppState {
    pub health_checker: HealthChecker,
    pub scheduler: Arc<Scheduler>,
    pub configuration: Arc<ConfigurationService>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route(
            "/tenants/{tenant}/dispatch-jobs/{job_id}/retry",
            post(retry_dispatch_job),
        )
        .route("/tenants/{tenant}/rules", get(list_rules).post(create_rule))
        .route(
            "/tenants/{tenant}/rules/{rule_id}",
            get(get_rule).put(update_rule).delete(delete_rule),
        )
        .route(
            "/tenants/{tenant}/recipients",
            get(list_recipients).post(create_recipient),
        )
        .route(
            "/tenants/{tenant}/recipients/{recipient_id}",
            get(get_recipient)
                .put(update_recipient)
                .delete(delete_recipient),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_api_server(state: Arc<AppState>, port: u16) -> Result<(), Error> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    info!(address = %addr, "API server started");

    axum::serve(listener, router(state)).await?;

    Ok(())
}

async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_checker.check_all().await;

    let status_code = match health.status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

fn parse_tenant<T>(raw: &str) -> Result<TenantId, ApiResponse<T>> {
    TenantId::parse(raw)
        .map_err(|e| ApiResponse::error(StatusCode::BAD_REQUEST, e.to_string(), "Invalid tenant"))
}

async fn retry_dispatch_job(
    State(state): State<Arc<AppState>>,
    Path((tenant, job_id)): Path<(String, Uuid)>,
) -> ApiResponse<DispatchReport> {
    let tenant = match parse_tenant(&tenant) {
        Ok(tenant) => tenant,
        Err(response) => return response,
    };

    match state.scheduler.retry_job(&tenant, job_id).await {
        Ok(report) => ApiResponse::success(report, "Dispatch job re-run"),
        Err(e) => {
            warn!(tenant = %tenant, job_id = %job_id, error = %e, "Manual dispatch job retry failed");
            let status = retry_error_status(&e);
            ApiResponse::error(status, e.to_string(), "Dispatch job retry failed")
        }
    }
}

fn retry_error_status(error: &Error) -> StatusCode {
    if let Some(StoreError::NotFound { .. }) = error.downcast_ref::<StoreError>() {
        return StatusCode::NOT_FOUND;
    }
    if error.downcast_ref::<JobError>().is_some() {
        return StatusCode::CONFLICT;
    }
    if let Some(SchedulerError::TaskBusy { .. }) = error.downcast_ref::<SchedulerError>() {
        return StatusCode::CONFLICT;
    }
    if error.downcast_ref::<LockError>().is_some() {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    StatusCode::INTERNAL_SERVER_ERROR
}

fn configuration_failure<T>(tenant: &TenantId, error: ConfigurationError) -> ApiResponse<T> {
    let status = match &error {
        ConfigurationError::InvalidLabel | ConfigurationError::Plugin(_) => StatusCode::BAD_REQUEST,
        ConfigurationError::NotFound { .. } => StatusCode::NOT_FOUND,
        ConfigurationError::AlreadyExists { .. } => StatusCode::CONFLICT,
        ConfigurationError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };

    if status.is_server_error() {
        warn!(tenant = %tenant, error = %error, "Configuration request failed");
    }

    ApiResponse::error(status, error.to_string(), "Configuration request failed")
}

async fn list_rules(
    State(state): State<Arc<AppState>>,
    Path(tenant): Path<String>,
) -> ApiResponse<Vec<Rule>> {
    let tenant = match parse_tenant(&tenant) {
        Ok(tenant) => tenant,
        Err(response) => return response,
    };

    match state.configuration.list_rules(&tenant).await {
        Ok(rules) => ApiResponse::success(rules, "Rules listed"),
        Err(e) => configuration_failure(&tenant, e),
    }
}

async fn create_rule(
    State(state): State<Arc<AppState>>,
    Path(tenant): Path<String>,
    Json(rule): Json<Rule>,
) -> ApiResponse<Rule> {
    let tenant = match parse_tenant(&tenant) {
        Ok(tenant) => tenant,
        Err(response) => return response,
    };

    match state.configuration.create_rule(&tenant, rule).await {
        Ok(rule) => ApiResponse::created(rule, "Rule created"),
        Err(e) => configuration_failure(&tenant, e),
    }
}

async fn get_rule(
    State(state): State<Arc<AppState>>,
    Path((tenant, rule_id)): Path<(String, RuleId)>,
) -> ApiResponse<Rule> {
    let tenant = match parse_tenant(&tenant) {
        Ok(tenant) => tenant,
        Err(response) => return response,
    };

    match state.configuration.get_rule(&tenant, rule_id).await {
        Ok(rule) => ApiResponse::success(rule, "Rule found"),
        Err(e) => configuration_failure(&tenant, e),
    }
}

async fn update_rule(
    State(state): State<Arc<AppState>>,
    Path((tenant, rule_id)): Path<(String, RuleId)>,
    Json(mut rule): Json<Rule>,
) -> ApiResponse<Rule> {
    let tenant = match parse_tenant(&tenant) {
        Ok(tenant) => tenant,
        Err(response) => return response,
    };
    rule.id = rule_id;

    match state.configuration.update_rule(&tenant, rule).await {
        Ok(rule) => ApiResponse::success(rule, "Rule updated"),
        Err(e) => configuration_failure(&tenant, e),
    }
}

async fn delete_rule(
    State(state): State<Arc<AppState>>,
    Path((tenant, rule_id)): Path<(String, RuleId)>,
) -> ApiResponse<RuleId> {
    let tenant = match parse_tenant(&tenant) {
        Ok(tenant) => tenant,
        Err(response) => return response,
    };

    match state.configuration.delete_rule(&tenant, rule_id).await {
        Ok(()) => ApiResponse::success(rule_id, "Rule deleted"),
        Err(e) => configuration_failure(&tenant, e),
    }
}

async fn list_recipients(
    State(state): State<Arc<AppState>>,
    Path(tenant): Path<String>,
) -> ApiResponse<Vec<Recipient>> {
    let tenant = match parse_tenant(&tenant) {
        Ok(tenant) => tenant,
        Err(response) => return response,
    };

    match state.configuration.list_recipients(&tenant).await {
        Ok(recipients) => ApiResponse::success(recipients, "Recipients listed"),
        Err(e) => configuration_failure(&tenant, e),
    }
}

async fn create_recipient(
    State(state): State<Arc<AppState>>,
    Path(tenant): Path<String>,
    Json(recipient): Json<Recipient>,
) -> ApiResponse<Recipient> {
    let tenant = match parse_tenant(&tenant) {
        Ok(tenant) => tenant,
        Err(response) => return response,
    };

    match state.configuration.create_recipient(&tenant, recipient).await {
        Ok(recipient) => ApiResponse::created(recipient, "Recipient created"),
        Err(e) => configuration_failure(&tenant, e),
    }
}

async fn get_recipient(
    State(state): State<Arc<AppState>>,
    Path((tenant, recipient_id)): Path<(String, RecipientId)>,
) -> ApiResponse<Recipient> {
    let tenant = match parse_tenant(&tenant) {
        Ok(tenant) => tenant,
        Err(response) => return response,
    };

    match state.configuration.get_recipient(&tenant, recipient_id).await {
        Ok(recipient) => ApiResponse::success(recipient, "Recipient found"),
        Err(e) => configuration_failure(&tenant, e),
    }
}

async fn update_recipient(
    State(state): State<Arc<AppState>>,
    Path((tenant, recipient_id)): Path<(String, RecipientId)>,
    Json(mut recipient): Json<Recipient>,
) -> ApiResponse<Recipient> {
    let tenant = match parse_tenant(&tenant) {
        Ok(tenant) => tenant,
        Err(response) => return response,
    };
    recipient.id = recipient_id;

    match state.configuration.update_recipient(&tenant, recipient).await {
        Ok(recipient) => ApiResponse::success(recipient, "Recipient updated"),
        Err(e) => configuration_failure(&tenant, e),
    }
}

async fn delete_recipient(
    State(state): State<Arc<AppState>>,
    Path((tenant, recipient_id)): Path<(String, RecipientId)>,
) -> ApiResponse<RecipientId> {
    let tenant = match parse_tenant(&tenant) {
        Ok(tenant) => tenant,
        Err(response) => return response,
    };

    match state.configuration.delete_recipient(&tenant, recipient_id).await {
        Ok(()) => ApiResponse::success(recipient_id, "Recipient deleted"),
        Err(e) => configuration_failure(&tenant, e),
    }
}
