//! Public HTTP surface under `/api`: session admission, queue polling,
//! health, and metrics. Admin routes live in `admin_routes.rs`.

use crate::error::ApiError;
use crate::state::AppState;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::StatusCode;
use axum::Json;
use cloudbrowser_common::Error;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

fn client_ip(addr: &SocketAddr) -> String {
    addr.ip().to_string()
}

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub url: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    pub queue_id: String,
    pub position: usize,
}

/// `POST /api/session`. Always accepted unless paused or the URL is
/// missing — the per-IP rate limit is deferred to queue processing so the
/// caller lands on the queue page first.
pub async fn create_session(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<Json<CreateSessionResponse>, ApiError> {
    if state.sessions.is_paused().await {
        return Err(ApiError(Error::Paused));
    }
    let url = req.url.filter(|u| !u.trim().is_empty()).ok_or_else(|| {
        ApiError(Error::InputRejected("url is required".to_string()))
    })?;

    let ip = client_ip(&addr);
    let entry = state.queue.enqueue(&url, &ip).await;
    Ok(Json(CreateSessionResponse { queue_id: entry.id, position: entry.position }))
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<cloudbrowser_core::session::SessionSnapshot>, ApiError> {
    state
        .sessions
        .get_session(&id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError(Error::NotFound(format!("session {id}"))))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitStatusResponse {
    pub used: u32,
    pub remaining: u32,
    pub limit: u32,
}

pub async fn rate_limit_status(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Json<RateLimitStatusResponse> {
    let ip = client_ip(&addr);
    let status = state.sessions.check_rate_limit(&ip).await;
    Json(RateLimitStatusResponse {
        used: status.used,
        remaining: status.remaining,
        limit: status.limit,
    })
}

pub async fn end_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let ended = state.sessions.end_session(&id, "user_ended").await;
    if ended {
        state.realtime.notify_session_ended(&id, "user_ended").await;
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError(Error::NotFound(format!("session {id}"))))
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatusResponse {
    pub id: String,
    pub position: usize,
    pub total_in_queue: usize,
    pub estimated_wait_seconds: u64,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

pub async fn get_queue_entry(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<QueueStatusResponse>, ApiError> {
    let (entry, wait) = state
        .queue
        .get_with_wait(&id)
        .await
        .ok_or_else(|| ApiError(Error::NotFound(format!("queue entry {id}"))))?;
    Ok(Json(QueueStatusResponse {
        id: entry.id,
        position: entry.position,
        total_in_queue: entry.total_in_queue,
        estimated_wait_seconds: wait,
        created_at: entry.created_at,
    }))
}

pub async fn leave_queue(State(state): State<AppState>, Path(id): Path<String>) -> StatusCode {
    state.queue.leave(&id).await;
    StatusCode::NO_CONTENT
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub pool: Vec<cloudbrowser_core::pool::ContainerSnapshot>,
    pub active_sessions: usize,
    pub queue_length: usize,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: chrono::Utc::now(),
        pool: state.pool.status().await,
        active_sessions: state.sessions.active_count().await,
        queue_length: state.queue.length().await,
    })
}

pub async fn metrics(State(state): State<AppState>) -> String {
    let stats = state.admin.stats().await;
    let mut out = String::new();

    out.push_str("# HELP cloud_browser_active_sessions Currently active sessions\n");
    out.push_str("# TYPE cloud_browser_active_sessions gauge\n");
    out.push_str(&format!("cloud_browser_active_sessions {}\n", stats.active_sessions));

    out.push_str("# HELP cloud_browser_queue_length Entries waiting in the admission queue\n");
    out.push_str("# TYPE cloud_browser_queue_length gauge\n");
    out.push_str(&format!("cloud_browser_queue_length {}\n", stats.queue_length));

    out.push_str("# HELP cloud_browser_sessions_today Sessions started since local midnight\n");
    out.push_str("# TYPE cloud_browser_sessions_today counter\n");
    out.push_str(&format!("cloud_browser_sessions_today {}\n", stats.sessions_today));

    out.push_str("# HELP cloud_browser_peak_concurrent Highest concurrent session count today\n");
    out.push_str("# TYPE cloud_browser_peak_concurrent gauge\n");
    out.push_str(&format!("cloud_browser_peak_concurrent {}\n", stats.peak_concurrent));

    out.push_str("# HELP cloud_browser_pool_size Configured warm pool target\n");
    out.push_str("# TYPE cloud_browser_pool_size gauge\n");
    out.push_str(&format!("cloud_browser_pool_size {}\n", stats.pool_size));

    out.push_str("# HELP cloud_browser_avg_session_duration_seconds Rolling average session duration\n");
    out.push_str("# TYPE cloud_browser_avg_session_duration_seconds gauge\n");
    out.push_str(&format!("cloud_browser_avg_session_duration_seconds {}\n", stats.avg_session_duration));

    out
}
