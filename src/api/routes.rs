//! API route definitions.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use super::state::AppState;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/targets", get(list_targets))
        .route("/schedules", get(list_schedules).delete(stop_all_schedules))
        .route("/schedules/preview", get(preview_schedules))
        .route("/schedules/{id}", delete(stop_schedule))
        .route("/run", post(run_now))
        .route("/sessions", get(list_sessions))
}

fn meta(state: &AppState) -> Value {
    let now = chrono::Utc::now();
    json!({
        "timestamp": now.to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": (now - state.started_at).num_seconds(),
    })
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "scheduler_running": state.scheduler.status().running,
        },
        "meta": meta(&state)
    }))
}

async fn list_targets(State(state): State<AppState>) -> Json<Value> {
    let targets = state.scheduler.orchestrator().target_statuses();
    Json(json!({ "data": targets, "meta": { "total": targets.len() } }))
}

async fn list_schedules(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "data": state.scheduler.status(), "meta": meta(&state) }))
}

async fn stop_all_schedules(State(state): State<AppState>) -> Json<Value> {
    let stopped = state.scheduler.stop(None);
    info!(count = stopped.len(), "schedules stopped via api");
    Json(json!({ "data": { "stopped": stopped } }))
}

async fn stop_schedule(State(state): State<AppState>, Path(id): Path<String>) -> Json<Value> {
    let stopped = state.scheduler.stop(Some(&id));
    info!(schedule = %id, found = !stopped.is_empty(), "schedule stop via api");
    Json(json!({ "data": { "stopped": stopped } }))
}

#[derive(Debug, Deserialize)]
struct PreviewQuery {
    #[serde(default = "default_preview_hours")]
    hours: u64,
}

fn default_preview_hours() -> u64 {
    24
}

async fn preview_schedules(
    State(state): State<AppState>,
    Query(query): Query<PreviewQuery>,
) -> Json<Value> {
    let upcoming = state.scheduler.preview(query.hours);
    Json(json!({ "data": { "hours": query.hours, "upcoming": upcoming } }))
}

#[derive(Debug, Default, Deserialize)]
struct RunRequest {
    #[serde(default)]
    parallel: bool,
}

async fn run_now(
    State(state): State<AppState>,
    Json(request): Json<RunRequest>,
) -> (StatusCode, Json<Value>) {
    info!(parallel = request.parallel, "manual pass via api");
    match state.scheduler.run_now(request.parallel).await {
        Some(report) => (StatusCode::OK, Json(json!({ "data": report }))),
        None => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "pass did not complete" })),
        ),
    }
}

async fn list_sessions(State(state): State<AppState>) -> Json<Value> {
    let sessions = state.sessions.list_all().await;
    Json(json!({ "data": sessions, "meta": { "total": sessions.len() } }))
}
