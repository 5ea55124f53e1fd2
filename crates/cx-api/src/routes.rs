//! Route table and handlers for the admin API.
//!
//! Metric names and JSON field names here are part of the external contract
//! and must be preserved bit-for-bit.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::json;
use tower_http::cors::CorsLayer;

use crate::auth::AuthLayer;
use crate::error::ApiError;
use crate::state::{ApiState, ControlError};
use cx_core::types::HealthEventType;

/// How recent a `gateway_critical` event must be for `/health` to go 503,
/// in seconds.
const GATEWAY_CRITICAL_WINDOW_SECS: i64 = 5 * 60;

/// Build the full admin router. Write endpoints sit behind [`AuthLayer`].
pub fn api_router(state: Arc<ApiState>) -> Router {
    let security = state.config.snapshot().api.security.clone();

    let write_routes = Router::new()
        .route("/dispatches/{id}/cancel", post(cancel_dispatch))
        .route("/dispatches/{id}/retry", post(retry_dispatch))
        .route("/scheduler/pause", post(pause_scheduler))
        .route("/scheduler/resume", post(resume_scheduler))
        .layer(AuthLayer::new(security));

    Router::new()
        .route("/status", get(get_status))
        .route("/projects", get(list_projects))
        .route("/projects/{id}", get(get_project))
        .route("/health", get(get_health))
        .route("/metrics", get(get_metrics))
        .route("/dispatches/{id}", get(get_dispatch_history))
        .route("/scheduler/status", get(scheduler_status))
        .merge(write_routes)
        .fallback(|| async { ApiError::NotFound("unknown endpoint".to_string()) })
        .method_not_allowed_fallback(|| async { ApiError::MethodNotAllowed })
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Read handlers
// ---------------------------------------------------------------------------

async fn get_status(State(state): State<Arc<ApiState>>) -> Result<impl IntoResponse, ApiError> {
    let running_count = state.store.running_count().await?;
    let usage = state
        .limiter
        .usage(&state.store, Utc::now())
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    Ok(Json(json!({
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "running_count": running_count,
        "paused": state.scheduler.is_paused(),
        "rate_limit": usage,
    })))
}

async fn list_projects(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    let config = state.config.snapshot();
    let projects: Vec<serde_json::Value> = config
        .projects
        .iter()
        .map(|(name, p)| project_json(name, p))
        .collect();
    Json(json!({ "projects": projects }))
}

async fn get_project(
    State(state): State<Arc<ApiState>>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let config = state.config.snapshot();
    match config.projects.get(&name) {
        Some(p) => Ok(Json(project_json(&name, p))),
        None => Err(ApiError::NotFound(format!("project {name}"))),
    }
}

fn project_json(name: &str, p: &cx_core::config::ProjectConfig) -> serde_json::Value {
    json!({
        "name": name,
        "enabled": p.enabled,
        "priority": p.priority,
        "workspace": p.workspace,
        "bead_dir": p.bead_dir,
        "use_branches": p.use_branches,
        "chat_room": p.chat_room,
    })
}

async fn get_health(State(state): State<Arc<ApiState>>) -> Result<impl IntoResponse, ApiError> {
    let events = state.store.recent_health_events(50).await?;
    let critical = state
        .store
        .has_recent_event(
            HealthEventType::GatewayCritical,
            Utc::now() - chrono::Duration::seconds(GATEWAY_CRITICAL_WINDOW_SECS),
        )
        .await?;

    let body = Json(json!({
        "healthy": !critical,
        "events": events,
    }));
    let status = if critical {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    Ok((status, body))
}

async fn get_metrics(State(state): State<Arc<ApiState>>) -> Result<impl IntoResponse, ApiError> {
    let metrics = &state.metrics;

    let running = state.store.running_count().await?;
    metrics.set_gauge("cortex_dispatches_running", &[], running as i64);

    metrics.clear_gauge_family("cortex_dispatches_running_by_stage");
    for (stage, count) in state.store.running_count_by_stage().await? {
        metrics.set_gauge(
            "cortex_dispatches_running_by_stage",
            &[("stage", &stage)],
            count as i64,
        );
    }

    let usage = state
        .limiter
        .usage(&state.store, Utc::now())
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    metrics.set_gauge("cortex_rate_limiter_usage_5h", &[], usage.used_5h as i64);
    let ratio = if usage.cap_5h == 0 {
        0.0
    } else {
        usage.used_5h as f64 / usage.cap_5h as f64
    };
    metrics.set_gauge_f64("cortex_rate_limiter_usage_ratio", &[], ratio);

    metrics.set_gauge(
        "cortex_uptime_seconds",
        &[],
        state.started_at.elapsed().as_secs() as i64,
    );

    Ok((
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics.export_prometheus(),
    ))
}

async fn get_dispatch_history(
    State(state): State<Arc<ApiState>>,
    Path(bead_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let dispatches = state.store.dispatches_for_bead(&bead_id).await?;
    if dispatches.is_empty() {
        return Err(ApiError::NotFound(format!("no dispatches for bead {bead_id}")));
    }

    let mut entries = Vec::with_capacity(dispatches.len());
    for dispatch in dispatches {
        let tail = state.store.output_tail(dispatch.id).await?;
        let mut value = serde_json::to_value(&dispatch)
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        value["output_tail"] = json!(tail);
        entries.push(value);
    }

    Ok(Json(json!({
        "bead_id": bead_id,
        "dispatches": entries,
    })))
}

async fn scheduler_status(State(state): State<Arc<ApiState>>) -> Result<Json<serde_json::Value>, ApiError> {
    let running = state.store.running_count().await?;
    Ok(Json(json!({
        "paused": state.scheduler.is_paused(),
        "running_count": running,
    })))
}

// ---------------------------------------------------------------------------
// Write handlers (behind auth)
// ---------------------------------------------------------------------------

async fn cancel_dispatch(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.scheduler.cancel_dispatch(id).await.map_err(control_error)?;
    Ok(Json(json!({ "id": id, "status": "cancelled" })))
}

async fn retry_dispatch(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.scheduler.retry_dispatch(id).await.map_err(control_error)?;
    Ok(Json(json!({ "id": id, "status": "pending_retry" })))
}

async fn pause_scheduler(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    state.scheduler.pause().await;
    Json(json!({ "paused": true }))
}

async fn resume_scheduler(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    state.scheduler.resume().await;
    Json(json!({ "paused": false }))
}

fn control_error(e: ControlError) -> ApiError {
    match e {
        ControlError::NotFound => ApiError::NotFound("dispatch".to_string()),
        ControlError::Conflict(msg) => ApiError::BadRequest(msg),
        ControlError::Internal(msg) => ApiError::Internal(msg),
    }
}
