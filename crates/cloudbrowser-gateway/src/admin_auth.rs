//! HTTP Basic auth gate for `/api/admin/*`: minimal plumbing to keep
//! operator-only routes off the open internet, not a session-based
//! auth layer.

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::Engine;

use crate::state::AppState;

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Basic realm=\"cloudbrowser-admin\"")],
        "unauthorized",
    )
        .into_response()
}

pub async fn require_admin_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(header_value) = request.headers().get(header::AUTHORIZATION) else {
        return unauthorized();
    };
    let Ok(header_str) = header_value.to_str() else {
        return unauthorized();
    };
    let Some(encoded) = header_str.strip_prefix("Basic ") else {
        return unauthorized();
    };
    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded) else {
        return unauthorized();
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return unauthorized();
    };
    let Some((user, password)) = decoded.split_once(':') else {
        return unauthorized();
    };

    if user == state.admin_user && password == state.admin_password {
        next.run(request).await
    } else {
        unauthorized()
    }
}
