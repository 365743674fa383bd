//! Maps `cloudbrowser_common::Error` onto HTTP status codes and JSON
//! bodies — never a blanket 500 for a domain error.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use cloudbrowser_common::Error;
use serde_json::json;
use tracing::error;

pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            Error::InputRejected(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            Error::Throttled { remaining } => {
                (StatusCode::TOO_MANY_REQUESTS, format!("rate limit exceeded, {remaining} remaining"))
            }
            Error::Paused => (StatusCode::SERVICE_UNAVAILABLE, "service is paused".to_string()),
            Error::NotFound(what) => (StatusCode::NOT_FOUND, what.clone()),
            Error::CapacityExhausted => (StatusCode::SERVICE_UNAVAILABLE, "no capacity available".to_string()),
            Error::RuntimeFailure(msg) => {
                error!("runtime failure: {msg}");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
            Error::Docker(e) => {
                error!("docker error: {e}");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
            Error::Io(e) => {
                error!("io error: {e}");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
            Error::Internal(msg) => {
                error!("internal error: {msg}");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}
