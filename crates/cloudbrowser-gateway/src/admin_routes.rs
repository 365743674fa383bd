//! `/api/admin/*` surface: pure aggregation reads plus the handful of
//! runtime-reconfiguration actions C5 dispatches across C1-C4. Every
//! route here is mounted behind [`crate::admin_auth::require_admin_auth`].

use crate::error::ApiError;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use cloudbrowser_common::Error;
use serde::{Deserialize, Serialize};

pub async fn list_sessions(
    State(state): State<AppState>,
) -> Json<Vec<cloudbrowser_core::session::SessionSnapshot>> {
    Json(state.admin.session_list().await)
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub page: Option<usize>,
    pub page_size: Option<usize>,
    pub q: Option<String>,
}

pub async fn session_history(
    State(state): State<AppState>,
    Query(q): Query<HistoryQuery>,
) -> Json<cloudbrowser_core::session::SessionHistoryPage> {
    let page = q.page.unwrap_or(1);
    let page_size = q.page_size.unwrap_or(25);
    Json(state.admin.session_history(page, page_size, q.q.as_deref()).await)
}

pub async fn kill_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.admin.kill_session(&id).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError(Error::NotFound(format!("session {id}"))))
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueListResponse {
    pub entries: Vec<cloudbrowser_core::queue::QueueEntrySnapshot>,
    pub length: usize,
    pub estimated_wait_seconds: u64,
}

pub async fn list_queue(State(state): State<AppState>) -> Json<QueueListResponse> {
    Json(QueueListResponse {
        entries: state.queue.list_entries().await,
        length: state.queue.length().await,
        estimated_wait_seconds: state.queue.estimated_wait_seconds().await,
    })
}

pub async fn stats(State(state): State<AppState>) -> Json<cloudbrowser_core::admin::Stats> {
    Json(state.admin.stats().await)
}

pub async fn rate_limit_stats(
    State(state): State<AppState>,
) -> Json<cloudbrowser_core::admin::RateLimitReport> {
    Json(state.admin.rate_limit_stats().await)
}

#[derive(Debug, Deserialize)]
pub struct IpPath {
    pub ip: String,
}

pub async fn block_ip(State(state): State<AppState>, Path(IpPath { ip }): Path<IpPath>) -> StatusCode {
    state.admin.block_ip(&ip).await;
    StatusCode::NO_CONTENT
}

pub async fn unblock_ip(State(state): State<AppState>, Path(IpPath { ip }): Path<IpPath>) -> StatusCode {
    state.admin.unblock_ip(&ip).await;
    StatusCode::NO_CONTENT
}

pub async fn whitelist_ip(State(state): State<AppState>, Path(IpPath { ip }): Path<IpPath>) -> StatusCode {
    state.admin.whitelist_ip(&ip).await;
    StatusCode::NO_CONTENT
}

pub async fn unwhitelist_ip(
    State(state): State<AppState>,
    Path(IpPath { ip }): Path<IpPath>,
) -> StatusCode {
    state.admin.unwhitelist_ip(&ip).await;
    StatusCode::NO_CONTENT
}

pub async fn clear_limit(State(state): State<AppState>, Path(IpPath { ip }): Path<IpPath>) -> StatusCode {
    state.admin.clear_limit(&ip).await;
    StatusCode::NO_CONTENT
}

pub async fn pause(State(state): State<AppState>) -> StatusCode {
    state.admin.pause().await;
    StatusCode::NO_CONTENT
}

pub async fn resume(State(state): State<AppState>) -> StatusCode {
    state.admin.resume().await;
    StatusCode::NO_CONTENT
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainResponse {
    pub drained: usize,
}

pub async fn drain_queue(State(state): State<AppState>) -> Json<DrainResponse> {
    Json(DrainResponse { drained: state.admin.drain_queue().await })
}

pub async fn restart_pool(State(state): State<AppState>) -> StatusCode {
    state.admin.restart_pool().await;
    StatusCode::NO_CONTENT
}

#[derive(Debug, Deserialize)]
pub struct PoolSizeRequest {
    pub size: usize,
}

pub async fn set_pool_size(
    State(state): State<AppState>,
    Json(req): Json<PoolSizeRequest>,
) -> Result<StatusCode, ApiError> {
    state.admin.set_pool_size(req.size).map_err(ApiError)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct DurationRequest {
    pub seconds: u64,
}

pub async fn set_duration(
    State(state): State<AppState>,
    Json(req): Json<DurationRequest>,
) -> Result<StatusCode, ApiError> {
    state.admin.set_duration(req.seconds).map_err(ApiError)?;
    Ok(StatusCode::NO_CONTENT)
}
