//! # Gateway Config
//!
//! Configuration model for the LLM Traffic Gateway.
//!
//! Configuration is read from a YAML, TOML or JSON file, then `GATEWAY_*`
//! environment variables are applied on top, then the result is validated.
//! Provider credentials never appear here: `credential_ref` names a secret
//! resolved at call time.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod loader;
pub mod model;

pub use error::ConfigError;
pub use loader::{apply_env_overrides, load_config, parse_config, ConfigFormat, CONFIG_ENV};
pub use model::{
    BreakerSection, GatewayConfig, HealthSection, IdentitySection, JwtAlgorithm, JwtSection,
    RateLimitSection, ResilienceSection, RetrySection, ServerSection, StoreSection,
    TelemetrySection, TlsSection, UsageSection, UsageSinkKind,
};
