//! Error taxonomy for the gateway.
//!
//! Every failure that can reach a client is a [`GatewayError`]. The server
//! crate maps these to HTTP responses and gRPC statuses; the resilience crate
//! uses [`GatewayError::is_upstream_fault`] and [`GatewayError::is_terminal`]
//! to decide what counts against a breaker and what may be retried.

use http::StatusCode;
use std::time::Duration;
use thiserror::Error;

/// Result alias used across the workspace
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Main error type for the gateway
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// Client exceeded an admission limit
    #[error("rate limit exceeded")]
    RateLimitExceeded {
        /// Seconds the client should wait before retrying
        retry_after_secs: u64,
        /// Which limit denied the request
        reason: String,
    },

    /// No registered provider serves the requested model
    #[error("model '{model}' is not supported by any provider")]
    UnsupportedModel {
        /// Requested model name
        model: String,
    },

    /// Provider could not serve the call (retries exhausted or breaker open)
    #[error("provider unavailable: {message}")]
    ProviderUnavailable {
        /// Provider name, when one was selected
        provider: Option<String>,
        /// Detail for logs
        message: String,
        /// Whether the provider's circuit was open
        circuit_open: bool,
    },

    /// Upstream returned a body that could not be understood
    #[error("upstream protocol error from {provider}: {message}")]
    UpstreamProtocol {
        /// Provider name
        provider: String,
        /// Parse failure detail, never shown to clients
        message: String,
    },

    /// Circuit breaker rejected the call without invoking it
    #[error("circuit breaker open for provider {provider}")]
    CircuitOpen {
        /// Provider name
        provider: String,
    },

    /// A single transport attempt failed
    #[error("transport error from {provider}: {message}")]
    Transport {
        /// Provider name
        provider: String,
        /// Error detail
        message: String,
        /// Upstream HTTP status, if one was received
        status_code: Option<u16>,
        /// Whether the attempt may succeed when repeated
        retryable: bool,
    },

    /// The caller went away or the gateway is shutting down
    #[error("request cancelled: {reason}")]
    Cancelled {
        /// Why the call was cancelled
        reason: String,
    },

    /// The per-call deadline elapsed
    #[error("deadline exceeded after {elapsed:?}")]
    DeadlineExceeded {
        /// Configured budget that elapsed
        elapsed: Duration,
    },

    /// Request failed validation
    #[error("validation error: {message}")]
    Validation {
        /// What was wrong
        message: String,
        /// Offending field
        field: Option<String>,
    },

    /// Missing or invalid admin credentials
    #[error("unauthorized: {message}")]
    Unauthorized {
        /// Detail
        message: String,
    },

    /// A named resource does not exist
    #[error("{resource} '{name}' not found")]
    NotFound {
        /// Kind of resource ("provider", "circuit breaker")
        resource: String,
        /// Resource name
        name: String,
    },

    /// A named resource already exists
    #[error("conflict: {message}")]
    Conflict {
        /// Detail
        message: String,
    },

    /// Counters store or rule store failure
    #[error("store error: {message}")]
    Store {
        /// Detail
        message: String,
    },

    /// Configuration problem (missing credential, bad TLS material)
    #[error("configuration error: {message}")]
    Configuration {
        /// Detail
        message: String,
    },

    /// Anything else
    #[error("internal error: {message}")]
    Internal {
        /// Detail
        message: String,
    },
}

impl GatewayError {
    /// Create a rate limit error
    #[must_use]
    pub fn rate_limited(retry_after_secs: u64, reason: impl Into<String>) -> Self {
        Self::RateLimitExceeded {
            retry_after_secs,
            reason: reason.into(),
        }
    }

    /// Create an unsupported model error
    #[must_use]
    pub fn unsupported_model(model: impl Into<String>) -> Self {
        Self::UnsupportedModel {
            model: model.into(),
        }
    }

    /// Create a provider unavailable error
    #[must_use]
    pub fn provider_unavailable(
        provider: Option<String>,
        message: impl Into<String>,
        circuit_open: bool,
    ) -> Self {
        Self::ProviderUnavailable {
            provider,
            message: message.into(),
            circuit_open,
        }
    }

    /// Create an upstream protocol error
    #[must_use]
    pub fn upstream_protocol(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::UpstreamProtocol {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create a circuit open error
    #[must_use]
    pub fn circuit_open(provider: impl Into<String>) -> Self {
        Self::CircuitOpen {
            provider: provider.into(),
        }
    }

    /// Create a transport error
    #[must_use]
    pub fn transport(
        provider: impl Into<String>,
        message: impl Into<String>,
        status_code: Option<u16>,
        retryable: bool,
    ) -> Self {
        Self::Transport {
            provider: provider.into(),
            message: message.into(),
            status_code,
            retryable,
        }
    }

    /// Create a cancellation error
    #[must_use]
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    /// Create a validation error
    #[must_use]
    pub fn validation(message: impl Into<String>, field: Option<&str>) -> Self {
        Self::Validation {
            message: message.into(),
            field: field.map(str::to_string),
        }
    }

    /// Create an unauthorized error
    #[must_use]
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized {
            message: message.into(),
        }
    }

    /// Create a not found error
    #[must_use]
    pub fn not_found(resource: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            name: name.into(),
        }
    }

    /// Create a conflict error
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Create a store error
    #[must_use]
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    /// Create a configuration error
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an internal error
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// HTTP status code for this error
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::UnsupportedModel { .. } | Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::ProviderUnavailable { circuit_open, .. } => {
                if *circuit_open {
                    StatusCode::SERVICE_UNAVAILABLE
                } else {
                    StatusCode::BAD_GATEWAY
                }
            }
            Self::UpstreamProtocol { .. } | Self::Transport { .. } => StatusCode::BAD_GATEWAY,
            Self::CircuitOpen { .. } | Self::Store { .. } => StatusCode::SERVICE_UNAVAILABLE,
            // 499 Client Closed Request
            Self::Cancelled { .. } => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::REQUEST_TIMEOUT)
            }
            Self::DeadlineExceeded { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Conflict { .. } => StatusCode::CONFLICT,
            Self::Configuration { .. } | Self::Internal { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Stable machine-readable error code
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::RateLimitExceeded { .. } => "rate_limit_exceeded",
            Self::UnsupportedModel { .. } => "unsupported_model",
            Self::ProviderUnavailable { .. } | Self::CircuitOpen { .. } => "provider_unavailable",
            Self::UpstreamProtocol { .. } => "upstream_protocol_error",
            Self::Transport { .. } => "upstream_error",
            Self::Cancelled { .. } => "request_cancelled",
            Self::DeadlineExceeded { .. } => "deadline_exceeded",
            Self::Validation { .. } => "invalid_request",
            Self::Unauthorized { .. } => "unauthorized",
            Self::NotFound { .. } => "not_found",
            Self::Conflict { .. } => "conflict",
            Self::Store { .. } => "store_unavailable",
            Self::Configuration { .. } => "configuration_error",
            Self::Internal { .. } => "internal_error",
        }
    }

    /// Message safe to return to clients.
    ///
    /// Upstream parse failures and internal errors are reported generically;
    /// the detail is only logged.
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            Self::UpstreamProtocol { .. } => "upstream returned an invalid response".to_string(),
            Self::Internal { .. } | Self::Configuration { .. } => {
                "internal server error".to_string()
            }
            Self::ProviderUnavailable { .. } | Self::CircuitOpen { .. } => {
                "upstream provider unavailable".to_string()
            }
            Self::Transport { .. } => "upstream request failed".to_string(),
            other => other.to_string(),
        }
    }

    /// Retry hint for 429 responses
    #[must_use]
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Self::RateLimitExceeded {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
            _ => None,
        }
    }

    /// Whether repeating the same call may succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { retryable, .. } => *retryable,
            Self::Store { .. } => true,
            _ => false,
        }
    }

    /// Errors that must never be retried, whatever the retry policy
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Cancelled { .. }
                | Self::DeadlineExceeded { .. }
                | Self::CircuitOpen { .. }
                | Self::Validation { .. }
                | Self::UnsupportedModel { .. }
                | Self::RateLimitExceeded { .. }
                | Self::Configuration { .. }
        )
    }

    /// Whether this error should count as a failure against a provider's breaker.
    ///
    /// Client-side 4xx answers (other than 408 and 429) mean the provider is
    /// healthy; cancellation says nothing about the provider at all.
    #[must_use]
    pub fn is_upstream_fault(&self) -> bool {
        match self {
            Self::Transport {
                status_code: Some(code),
                ..
            } => !((400..500).contains(code) && *code != 408 && *code != 429),
            Self::Cancelled { .. }
            | Self::Validation { .. }
            | Self::UnsupportedModel { .. }
            | Self::RateLimitExceeded { .. }
            | Self::CircuitOpen { .. } => false,
            _ => true,
        }
    }

    /// Whether this is a cancellation (logged at debug, not error)
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}
