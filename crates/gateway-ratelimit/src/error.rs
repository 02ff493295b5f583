//! Counters store errors.

use gateway_core::GatewayError;
use thiserror::Error;

/// Counters store or rule source failure
#[derive(Debug, Error)]
pub enum StoreError {
    /// Redis command failed
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Stored document was not valid JSON
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Script or document returned something unexpected
    #[error("unexpected store response: {0}")]
    Protocol(String),
}

impl From<StoreError> for GatewayError {
    fn from(err: StoreError) -> Self {
        Self::store(err.to_string())
    }
}
