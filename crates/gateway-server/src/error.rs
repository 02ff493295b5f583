//! API error responses.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use gateway_core::GatewayError;
use serde::Serialize;
use tracing::{debug, error, warn};

/// Error returned by HTTP handlers
#[derive(Debug, Clone)]
pub struct ApiError {
    /// HTTP status
    pub status: StatusCode,
    /// Client-facing message
    pub message: String,
    /// Stable machine-readable code
    pub code: &'static str,
    /// `Retry-After` seconds
    pub retry_after: Option<u64>,
}

/// JSON error body: `{"error": "...", "code": "..."}`
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Message
    pub error: String,
    /// Code
    pub code: &'static str,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            code,
            retry_after: None,
        }
    }

    /// 400
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_request", message)
    }

    /// 401
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", message)
    }

    /// 404
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    /// 503
    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "service_unavailable", message)
    }

    /// 500
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
    }

    /// JSON body for this error
    #[must_use]
    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            error: self.message.clone(),
            code: self.code,
        }
    }
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        match &err {
            e if e.is_cancellation() => debug!(error = %e, "Request cancelled"),
            GatewayError::UpstreamProtocol { .. }
            | GatewayError::Internal { .. }
            | GatewayError::Configuration { .. } => error!(error = %err, "Request failed"),
            GatewayError::RateLimitExceeded { reason, .. } => {
                debug!(reason = %reason, "Request denied by admission control");
            }
            _ => warn!(error = %err, "Request failed"),
        }

        Self {
            status: err.status_code(),
            message: err.client_message(),
            code: err.error_code(),
            retry_after: err.retry_after(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let retry_after = self.retry_after;
        let mut response = (self.status, Json(self.body())).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}
