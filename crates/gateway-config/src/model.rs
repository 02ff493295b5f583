//! Configuration sections.

use crate::error::ConfigError;
use gateway_core::{ProviderConfig, TrustedProxies};
use gateway_ratelimit::{AdmissionConfig, FailurePolicy, RateRule};
use gateway_resilience::{CircuitBreakerConfig, RetryConfig, RetryOn};
use gateway_telemetry::{LogFormat, LoggingConfig};
use secrecy::SecretString;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listeners and deadlines
    pub server: ServerSection,
    /// Shared counters store
    pub store: StoreSection,
    /// Admission control
    pub rate_limit: RateLimitSection,
    /// Breakers and retries
    pub resilience: ResilienceSection,
    /// Provider health probing
    pub health: HealthSection,
    /// Client identity
    pub identity: IdentitySection,
    /// Usage reporting
    pub usage: UsageSection,
    /// Logging and metrics
    pub telemetry: TelemetrySection,
    /// Mutual TLS material for upstream calls
    pub upstream_tls: Option<TlsSection>,
    /// Providers registered at startup
    pub providers: Vec<ProviderConfig>,
}

/// Server section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Bind address
    pub host: String,
    /// HTTP port
    pub port: u16,
    /// gRPC port; `None` disables the RPC listener
    pub rpc_port: Option<u16>,
    /// Deadline for unary calls
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Deadline for streaming calls
    #[serde(with = "humantime_serde")]
    pub stream_timeout: Duration,
    /// Time allowed for in-flight requests after a shutdown signal
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
    /// Bearer token required on admin routes
    pub admin_token: Option<SecretString>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            rpc_port: Some(50051),
            request_timeout: Duration::from_secs(120),
            stream_timeout: Duration::from_secs(180),
            shutdown_grace: Duration::from_secs(30),
            admin_token: None,
        }
    }
}

/// Counters store section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// Redis URL; in-memory counters when unset
    pub redis_url: Option<String>,
    /// Bound on each store round trip
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            redis_url: None,
            timeout: Duration::from_millis(200),
        }
    }
}

/// Admission control section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitSection {
    /// Rule for routes without their own
    pub default_rule: RateRule,
    /// Per-route rules, used when no Redis store is configured
    pub rules: Vec<RateRule>,
    /// Rule table refresh interval
    #[serde(with = "humantime_serde")]
    pub reload_interval: Duration,
    /// Store outage behaviour
    pub failure_policy: FailurePolicy,
    /// Retry hint for request-rate denials
    pub default_retry_after_secs: u64,
    /// Upper bound on computed retry hints
    pub max_retry_after_secs: u64,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            default_rule: RateRule::requests("default", 600, 60),
            rules: Vec::new(),
            reload_interval: Duration::from_secs(10),
            failure_policy: FailurePolicy::FailOpen,
            default_retry_after_secs: 30,
            max_retry_after_secs: 3600,
        }
    }
}

impl RateLimitSection {
    /// Admission controller settings
    #[must_use]
    pub fn admission_config(&self, store: &StoreSection) -> AdmissionConfig {
        AdmissionConfig {
            store_timeout: store.timeout,
            failure_policy: self.failure_policy,
            default_retry_after_secs: self.default_retry_after_secs,
            max_retry_after_secs: self.max_retry_after_secs,
            ..AdmissionConfig::default()
        }
    }
}

/// Resilience section
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ResilienceSection {
    /// Per-provider breaker
    pub circuit_breaker: BreakerSection,
    /// Retry executor
    pub retry: RetrySection,
}

/// Circuit breaker settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerSection {
    /// Closed-state counting window
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Open duration before probing
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Half-open probe limit
    pub max_requests: u32,
    /// Calls needed before the ratio trips
    pub min_requests: u32,
    /// Failure ratio that trips
    pub failure_ratio: f64,
}

impl Default for BreakerSection {
    fn default() -> Self {
        let base = CircuitBreakerConfig::default();
        Self {
            interval: base.interval,
            timeout: base.timeout,
            max_requests: base.max_requests,
            min_requests: base.min_requests,
            failure_ratio: base.failure_ratio,
        }
    }
}

impl BreakerSection {
    /// Breaker settings
    #[must_use]
    pub fn to_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            interval: self.interval,
            timeout: self.timeout,
            max_requests: self.max_requests,
            min_requests: self.min_requests,
            failure_ratio: self.failure_ratio,
        }
    }
}

/// Retry settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// First backoff
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    /// Backoff ceiling before jitter
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Jitter factor
    pub jitter_factor: f64,
    /// Which errors are retried
    pub retry_on: RetryOn,
}

impl Default for RetrySection {
    fn default() -> Self {
        let base = RetryConfig::default();
        Self {
            max_attempts: base.max_attempts,
            initial_delay: base.initial_delay,
            max_delay: base.max_delay,
            jitter_factor: base.jitter_factor,
            retry_on: base.retry_on,
        }
    }
}

impl RetrySection {
    /// Retry settings
    #[must_use]
    pub fn to_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts,
            initial_delay: self.initial_delay,
            max_delay: self.max_delay,
            jitter_factor: self.jitter_factor,
            retry_on: self.retry_on,
        }
    }
}

/// Health probing section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthSection {
    /// Run the prober
    pub enabled: bool,
    /// Probe interval
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Per-probe timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
        }
    }
}

/// Identity section
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IdentitySection {
    /// Bearer JWT verification; bearer tokens are treated as opaque keys when unset
    pub jwt: Option<JwtSection>,
    /// Addresses or CIDR networks whose `X-Forwarded-For` / `X-Real-IP` are
    /// believed; empty means the socket peer is always the client address
    pub trusted_proxies: Vec<String>,
}

impl IdentitySection {
    /// Parsed trusted proxy set
    pub fn trusted_proxies(&self) -> Result<TrustedProxies, ConfigError> {
        TrustedProxies::parse(&self.trusted_proxies)
            .map_err(|e| ConfigError::invalid(format!("identity.trusted_proxies: {e}")))
    }
}

/// JWT signature algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JwtAlgorithm {
    /// Shared secret
    #[default]
    Hs256,
    /// RSA public key (PEM)
    Rs256,
}

/// JWT verification settings
#[derive(Debug, Clone, Deserialize)]
pub struct JwtSection {
    /// Signature algorithm
    #[serde(default)]
    pub algorithm: JwtAlgorithm,
    /// Secret name holding the shared secret or PEM public key
    pub key_ref: String,
    /// Required `iss`
    #[serde(default)]
    pub issuer: Option<String>,
    /// Required `aud`
    #[serde(default)]
    pub audience: Option<String>,
}

/// Where usage events go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageSinkKind {
    /// Structured log lines
    #[default]
    Log,
    /// JSON POST to a ledger endpoint
    Http,
}

/// Usage reporting section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UsageSection {
    /// Sink kind
    pub sink: UsageSinkKind,
    /// Ledger URL for the HTTP sink
    pub endpoint: Option<String>,
    /// Bounded queue size; events beyond it are dropped
    pub queue_capacity: usize,
    /// Per-event delivery timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for UsageSection {
    fn default() -> Self {
        Self {
            sink: UsageSinkKind::Log,
            endpoint: None,
            queue_capacity: 1024,
            timeout: Duration::from_secs(5),
        }
    }
}

/// Telemetry section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelemetrySection {
    /// Log filter directive
    pub log_level: String,
    /// Log output format
    pub log_format: LogFormat,
    /// Serve `GET /metrics`
    pub metrics_enabled: bool,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: true,
        }
    }
}

impl TelemetrySection {
    /// Logging settings
    #[must_use]
    pub fn logging(&self) -> LoggingConfig {
        LoggingConfig::new()
            .with_level(&self.log_level)
            .with_format(self.log_format)
    }
}

/// Upstream TLS material
#[derive(Debug, Clone, Deserialize)]
pub struct TlsSection {
    /// Trust anchor (PEM)
    pub ca_cert_path: PathBuf,
    /// Client certificate (PEM) for mutual TLS
    #[serde(default)]
    pub client_cert_path: Option<PathBuf>,
    /// Client private key (PEM) for mutual TLS
    #[serde(default)]
    pub client_key_path: Option<PathBuf>,
    /// Server name override for RPC channels
    #[serde(default)]
    pub domain_name: Option<String>,
}

impl GatewayConfig {
    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.request_timeout.is_zero() || self.server.stream_timeout.is_zero() {
            return Err(ConfigError::invalid("server timeouts must be non-zero"));
        }
        if self.server.rpc_port == Some(self.server.port) {
            return Err(ConfigError::invalid("rpc_port must differ from port"));
        }

        if let Some(url) = &self.store.redis_url {
            url::Url::parse(url)
                .map_err(|e| ConfigError::invalid(format!("store.redis_url: {e}")))?;
        }

        for rule in std::iter::once(&self.rate_limit.default_rule).chain(&self.rate_limit.rules) {
            validate_rule(rule)?;
        }
        let mut routes = HashSet::new();
        for rule in &self.rate_limit.rules {
            if !routes.insert(rule.route.as_str()) {
                return Err(ConfigError::invalid(format!(
                    "duplicate rate limit rule for route {}",
                    rule.route
                )));
            }
        }
        if self.rate_limit.reload_interval.is_zero() {
            return Err(ConfigError::invalid("rate_limit.reload_interval must be non-zero"));
        }

        let breaker = &self.resilience.circuit_breaker;
        if !(breaker.failure_ratio > 0.0 && breaker.failure_ratio <= 1.0) {
            return Err(ConfigError::invalid(
                "circuit_breaker.failure_ratio must be in (0, 1]",
            ));
        }
        if breaker.max_requests == 0 {
            return Err(ConfigError::invalid("circuit_breaker.max_requests must be >= 1"));
        }

        let retry = &self.resilience.retry;
        if retry.max_attempts == 0 {
            return Err(ConfigError::invalid("retry.max_attempts must be >= 1"));
        }
        if !(0.0..=1.0).contains(&retry.jitter_factor) {
            return Err(ConfigError::invalid("retry.jitter_factor must be in [0, 1]"));
        }
        if retry.initial_delay > retry.max_delay {
            return Err(ConfigError::invalid(
                "retry.initial_delay must not exceed retry.max_delay",
            ));
        }

        self.identity.trusted_proxies()?;

        if self.health.enabled && self.health.interval.is_zero() {
            return Err(ConfigError::invalid("health.interval must be non-zero"));
        }

        if self.usage.sink == UsageSinkKind::Http && self.usage.endpoint.is_none() {
            return Err(ConfigError::invalid("usage.endpoint is required for the http sink"));
        }
        if self.usage.queue_capacity == 0 {
            return Err(ConfigError::invalid("usage.queue_capacity must be >= 1"));
        }

        if let Some(tls) = &self.upstream_tls {
            if tls.client_cert_path.is_some() != tls.client_key_path.is_some() {
                return Err(ConfigError::invalid(
                    "upstream_tls client_cert_path and client_key_path go together",
                ));
            }
        }

        let mut names = HashSet::new();
        for provider in &self.providers {
            if provider.name.trim().is_empty() {
                return Err(ConfigError::invalid("provider name must not be empty"));
            }
            if !names.insert(provider.name.as_str()) {
                return Err(ConfigError::invalid(format!(
                    "duplicate provider name {}",
                    provider.name
                )));
            }
            url::Url::parse(&provider.base_address).map_err(|e| {
                ConfigError::invalid(format!("provider {} base_address: {e}", provider.name))
            })?;
            if provider.supported_models.is_empty() {
                return Err(ConfigError::invalid(format!(
                    "provider {} lists no supported models",
                    provider.name
                )));
            }
        }

        Ok(())
    }
}

fn validate_rule(rule: &RateRule) -> Result<(), ConfigError> {
    let limited = rule.requests_per_window > 0 || rule.tokens_per_window > 0;
    if limited && rule.window_seconds == 0 {
        return Err(ConfigError::invalid(format!(
            "rule for {} needs a non-zero window_seconds",
            rule.route
        )));
    }
    Ok(())
}
