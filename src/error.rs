//! Gateway error taxonomy.
//!
//! One variant per gateway failure kind, following the same shape as
//! `EdgeServiceError`: a `thiserror` enum plus a status-code mapping
//! method, so the HTTP facade never leaks internal detail past `detail`.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// No eligible node found for a request. Transient; caller retries.
    #[error("no node available to serve this request")]
    NoAvailableNode,

    /// Chosen node failed before the first proxied byte, and failover was
    /// exhausted.
    #[error("upstream node unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Upstream stream broke mid-response. Surfaced in-band as an SSE
    /// error frame by the dispatcher; this variant exists for non-streaming
    /// callers (batch items) where it must become a terminal error instead.
    #[error("upstream stream truncated: {0}")]
    UpstreamTruncated(String),

    /// Caller-supplied dataset failed validation.
    #[error("invalid dataset: {0}")]
    BadDataset(String),

    /// Caller-supplied request failed validation.
    #[error("invalid request: {0}")]
    BadRequest(String),

    /// Referenced job id does not exist (or was evicted).
    #[error("job not found: {0}")]
    JobNotFound(String),

    /// Internal invariant violation; never expected in a correct build.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::NoAvailableNode => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            GatewayError::UpstreamTruncated(_) => StatusCode::BAD_GATEWAY,
            GatewayError::BadDataset(_) | GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::JobNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    detail: String,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorBody {
            detail: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
