//! # Gateway Routing
//!
//! Call path for the LLM Traffic Gateway.
//!
//! This crate provides:
//! - The dispatcher: model to provider, guarded by breaker and retry
//! - The streaming relay: ordered chunks with exactly one terminal chunk
//! - The usage reporter: an outbound queue to the billing ledger

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod dispatcher;
pub mod relay;
pub mod usage;

// Re-export main types
pub use dispatcher::{circuit_state_listener, DispatchOutcome, Dispatched, Dispatcher};
pub use relay::{relay_stream, RelayOutcome, RelaySummary};
pub use usage::{HttpUsageSink, LoggingUsageSink, UsageReporter};
