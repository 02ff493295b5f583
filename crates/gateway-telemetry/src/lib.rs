//! # Gateway Telemetry
//!
//! Observability for the LLM Traffic Gateway.
//!
//! This crate provides:
//! - Structured logging setup (`tracing-subscriber`, pretty or JSON)
//! - Prometheus metrics for admission, upstream calls, streams and breakers

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod logging;
pub mod metrics;

// Re-export main types
pub use logging::{init_logging, LogFormat, LoggingConfig, TelemetryError};
pub use metrics::Metrics;
