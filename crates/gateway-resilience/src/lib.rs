//! # Gateway Resilience
//!
//! Resilience patterns for the LLM Traffic Gateway:
//! - Circuit breaker for preventing cascading failures
//! - Per-provider breaker registry
//! - Retry policy with exponential backoff and jitter

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod circuit_breaker;
pub mod registry;
pub mod retry;

// Re-export main types
pub use circuit_breaker::{
    CallOutcome, CallPermit, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStatus,
    CircuitState, Counts, StateListener,
};
pub use registry::CircuitBreakerRegistry;
pub use retry::{RetryConfig, RetryOn, RetryPolicy, RetryPolicyBuilder};
