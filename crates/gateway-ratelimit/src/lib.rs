//! # Gateway Rate Limit
//!
//! Per-client admission control for the LLM Traffic Gateway.
//!
//! Every `(client, route)` pair owns a sliding-window request counter and a
//! token bucket in a counters store shared by all gateway instances. Limits
//! come from a hot-reloaded rule table.
//!
//! - [`AdmissionController`]: admit, deny with a retry hint, settle actual usage
//! - [`CounterStore`]: in-memory and Redis implementations with identical semantics
//! - [`RuleStore`]: copy-on-read rule table refreshed from a [`RuleSource`]

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod admission;
pub mod clock;
pub mod error;
pub mod redis_store;
pub mod rules;
pub mod store;

pub use admission::{
    Admission, AdmissionConfig, AdmissionController, DenyReason, FailurePolicy,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::StoreError;
pub use redis_store::{RedisCounterStore, RedisHandle, RedisRuleSource};
pub use rules::{RateRule, RuleSet, RuleSource, RuleStore, StaticRuleSource};
pub use store::{
    request_key, token_key, BucketOutcome, BucketSpec, CounterStore, MemoryCounterStore,
    SettleOutcome, WindowOutcome,
};
