use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        Json,
    },
};
use liftoff_core::{
    service::{NewReleaseRequest, ServiceError},
    types::{Platform, UploadStage},
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::AppState;

// ── Error helpers ─────────────────────────────────────────────────────────

type ApiError = (StatusCode, Json<Value>);

pub(crate) fn internal(e: impl std::fmt::Display) -> ApiError {
    tracing::error!("internal error: {e}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "internal error" })),
    )
}

fn service_error(e: ServiceError) -> ApiError {
    let status = StatusCode::from_u16(e.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(json!({ "error": e.message })))
}

// ── Request body types ────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(crate) struct TenantBody {
    pub tenant_id: String,
}

#[derive(Deserialize)]
pub(crate) struct AccountBody {
    pub account_id: String,
}

#[derive(Deserialize)]
pub(crate) struct TriggerStage3Body {
    pub tenant_id: String,
    pub approved_by: String,
    #[serde(default)]
    pub comments: Option<String>,
    #[serde(default)]
    pub force_approve: bool,
}

#[derive(Deserialize)]
pub(crate) struct UploadBody {
    pub tenant_id: String,
    pub platform: Platform,
    pub stage: UploadStage,
    pub artifact_path: String,
}

#[derive(Deserialize)]
pub(crate) struct ReleasesQuery {
    pub tenant: Option<String>,
}

// ── Health ────────────────────────────────────────────────────────────────

pub(crate) async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "uptime_s": state.start_time.elapsed().as_secs(),
        "tick_s": state.config.tick_secs,
    }))
}

// ── Releases ──────────────────────────────────────────────────────────────

pub(crate) async fn create_release(
    State(state): State<Arc<AppState>>,
    Json(body): Json<NewReleaseRequest>,
) -> Result<Json<Value>, ApiError> {
    let release = state.service.create_release(body).map_err(service_error)?;
    Ok(Json(json!({ "release": release })))
}

pub(crate) async fn list_releases(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ReleasesQuery>,
) -> Result<Json<Value>, ApiError> {
    let releases = state
        .db
        .list_releases(query.tenant.as_deref())
        .map_err(internal)?;
    Ok(Json(json!({ "releases": releases })))
}

pub(crate) async fn get_release(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let release = state
        .db
        .get_release(id)
        .map_err(internal)?
        .ok_or_else(|| service_error(ServiceError::not_found("release not found")))?;
    let cron = state.db.get_cron_job(id).map_err(internal)?;
    Ok(Json(json!({ "release": release, "cron": cron })))
}

pub(crate) async fn list_release_tasks(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let tasks = state.db.list_tasks_for_release(id).map_err(internal)?;
    Ok(Json(json!({ "tasks": tasks })))
}

pub(crate) async fn list_release_cycles(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let cycles = state.db.list_cycles(id).map_err(internal)?;
    Ok(Json(json!({ "cycles": cycles })))
}

// ── Cron lifecycle ────────────────────────────────────────────────────────

pub(crate) async fn start_release(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    state.service.start_cron_job(id).await.map_err(service_error)?;
    Ok(Json(json!({ "started": true })))
}

pub(crate) async fn stop_release(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    state.service.stop_cron_job(id).await.map_err(service_error)?;
    Ok(Json(json!({ "stopped": true })))
}

pub(crate) async fn pause_release(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<TenantBody>,
) -> Result<Json<Value>, ApiError> {
    state
        .service
        .pause_release(id, &body.tenant_id)
        .await
        .map_err(service_error)?;
    Ok(Json(json!({ "paused": true })))
}

pub(crate) async fn resume_release(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<TenantBody>,
) -> Result<Json<Value>, ApiError> {
    state
        .service
        .resume_release(id, &body.tenant_id)
        .await
        .map_err(service_error)?;
    Ok(Json(json!({ "resumed": true })))
}

pub(crate) async fn trigger_stage2(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<TenantBody>,
) -> Result<Json<Value>, ApiError> {
    state
        .service
        .trigger_stage2(id, &body.tenant_id)
        .await
        .map_err(service_error)?;
    Ok(Json(json!({ "triggered": true })))
}

pub(crate) async fn trigger_stage3(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<TriggerStage3Body>,
) -> Result<Json<Value>, ApiError> {
    state
        .service
        .trigger_stage3(
            id,
            &body.tenant_id,
            &body.approved_by,
            body.comments.as_deref(),
            body.force_approve,
        )
        .await
        .map_err(service_error)?;
    Ok(Json(json!({ "triggered": true })))
}

pub(crate) async fn archive_release(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<AccountBody>,
) -> Result<Json<Value>, ApiError> {
    state
        .service
        .archive_release(id, &body.account_id)
        .await
        .map_err(service_error)?;
    Ok(Json(json!({ "archived": true })))
}

// ── Tasks ─────────────────────────────────────────────────────────────────

pub(crate) async fn retry_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<AccountBody>,
) -> Result<Json<Value>, ApiError> {
    state
        .service
        .retry_task(id, &body.account_id)
        .await
        .map_err(service_error)?;
    Ok(Json(json!({ "retried": true })))
}

pub(crate) async fn approve_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<AccountBody>,
) -> Result<Json<Value>, ApiError> {
    state
        .service
        .approve_task(id, &body.account_id)
        .map_err(service_error)?;
    Ok(Json(json!({ "approved": true })))
}

// ── Manual upload intake ──────────────────────────────────────────────────

pub(crate) async fn upload_artifact(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<UploadBody>,
) -> Result<Json<Value>, ApiError> {
    state
        .service
        .upload_artifact(id, &body.tenant_id, body.platform, body.stage, &body.artifact_path)
        .map_err(service_error)?;
    Ok(Json(json!({ "uploaded": true })))
}

// ── SSE log stream ────────────────────────────────────────────────────────

pub(crate) async fn sse_logs(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let backlog: Vec<String> = state
        .log_ring
        .lock()
        .map(|ring| ring.iter().cloned().collect())
        .unwrap_or_default();
    let live = BroadcastStream::new(state.log_tx.subscribe())
        .filter_map(|line| line.ok());
    let stream = tokio_stream::iter(backlog)
        .chain(live)
        .map(|line| Ok::<Event, Infallible>(Event::default().data(line)));
    Sse::new(stream).keep_alive(KeepAlive::default())
}
