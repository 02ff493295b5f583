//! Usage events sent to the billing ledger.

use crate::error::GatewayResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Whether the call that produced the event finished
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageOutcome {
    /// Call completed
    Complete,
    /// Stream ended early; tokens are the highest count seen
    Partial,
}

/// Fire-and-forget usage record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageEvent {
    /// Client key
    pub client_id: String,
    /// Model requested
    pub model: String,
    /// Provider that served the call
    pub provider: String,
    /// Tokens consumed
    pub tokens_used: u32,
    /// Gateway request id
    pub request_id: String,
    /// Completion state
    pub outcome: UsageOutcome,
    /// When the event was produced
    pub recorded_at: DateTime<Utc>,
}

/// Receiver of usage events
#[async_trait]
pub trait UsageSink: Send + Sync {
    /// Deliver one event
    async fn record(&self, event: &UsageEvent) -> GatewayResult<()>;
}
