//! Shared application state.

use gateway_core::ClientIdentityResolver;
use gateway_providers::ProviderRegistry;
use gateway_ratelimit::AdmissionController;
use gateway_resilience::CircuitBreakerRegistry;
use gateway_routing::{Dispatcher, UsageReporter};
use gateway_telemetry::Metrics;
use secrecy::SecretString;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// State handed to every handler; cheap to clone
#[derive(Clone)]
pub struct AppState {
    /// Model to provider dispatch
    pub dispatcher: Arc<Dispatcher>,
    /// Per-client admission control
    pub admission: Arc<AdmissionController>,
    /// Client key resolution
    pub identity: Arc<dyn ClientIdentityResolver>,
    /// Outbound usage queue
    pub usage: UsageReporter,
    /// Prometheus metrics
    pub metrics: Metrics,
    /// Unary call budget
    pub request_timeout: Duration,
    /// Streaming call budget
    pub stream_timeout: Duration,
    /// Static admin bearer token; admin routes are open when unset
    pub admin_token: Option<Arc<SecretString>>,
    /// Parent of every call context; cancelled when shutdown grace runs out
    pub calls: CancellationToken,
    /// Serve `GET /metrics`
    pub expose_metrics: bool,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("dispatcher", &self.dispatcher)
            .field("request_timeout", &self.request_timeout)
            .field("stream_timeout", &self.stream_timeout)
            .field("admin_token", &self.admin_token.is_some())
            .finish_non_exhaustive()
    }
}

impl AppState {
    /// Create a builder
    #[must_use]
    pub fn builder() -> AppStateBuilder {
        AppStateBuilder::default()
    }

    /// Provider registry
    #[must_use]
    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        self.dispatcher.registry()
    }

    /// Circuit breakers
    #[must_use]
    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        self.dispatcher.breakers()
    }
}

/// Builder for [`AppState`]
#[derive(Default)]
pub struct AppStateBuilder {
    dispatcher: Option<Arc<Dispatcher>>,
    admission: Option<Arc<AdmissionController>>,
    identity: Option<Arc<dyn ClientIdentityResolver>>,
    usage: Option<UsageReporter>,
    metrics: Option<Metrics>,
    request_timeout: Option<Duration>,
    stream_timeout: Option<Duration>,
    admin_token: Option<SecretString>,
    calls: Option<CancellationToken>,
    expose_metrics: Option<bool>,
}

/// A required part was not supplied to the builder
#[derive(Debug, thiserror::Error)]
#[error("application state is missing {0}")]
pub struct MissingPart(&'static str);

impl AppStateBuilder {
    /// Set the dispatcher
    #[must_use]
    pub fn dispatcher(mut self, dispatcher: Arc<Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Set the admission controller
    #[must_use]
    pub fn admission(mut self, admission: Arc<AdmissionController>) -> Self {
        self.admission = Some(admission);
        self
    }

    /// Set the identity resolver
    #[must_use]
    pub fn identity(mut self, identity: Arc<dyn ClientIdentityResolver>) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Set the usage reporter
    #[must_use]
    pub fn usage(mut self, usage: UsageReporter) -> Self {
        self.usage = Some(usage);
        self
    }

    /// Set metrics
    #[must_use]
    pub fn metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Set both call budgets
    #[must_use]
    pub fn timeouts(mut self, request: Duration, stream: Duration) -> Self {
        self.request_timeout = Some(request);
        self.stream_timeout = Some(stream);
        self
    }

    /// Protect admin routes with a bearer token
    #[must_use]
    pub fn admin_token(mut self, token: Option<SecretString>) -> Self {
        self.admin_token = token;
        self
    }

    /// Parent token for call contexts
    #[must_use]
    pub fn calls(mut self, calls: CancellationToken) -> Self {
        self.calls = Some(calls);
        self
    }

    /// Toggle the metrics endpoint (on by default)
    #[must_use]
    pub fn expose_metrics(mut self, expose: bool) -> Self {
        self.expose_metrics = Some(expose);
        self
    }

    /// Build the state
    ///
    /// # Errors
    /// [`MissingPart`] when the dispatcher, admission controller, usage
    /// reporter or metrics were not set
    pub fn build(self) -> Result<AppState, MissingPart> {
        Ok(AppState {
            dispatcher: self.dispatcher.ok_or(MissingPart("a dispatcher"))?,
            admission: self.admission.ok_or(MissingPart("an admission controller"))?,
            identity: self
                .identity
                .unwrap_or_else(|| Arc::new(gateway_core::DefaultIdentityResolver::new())),
            usage: self.usage.ok_or(MissingPart("a usage reporter"))?,
            metrics: self.metrics.ok_or(MissingPart("metrics"))?,
            request_timeout: self.request_timeout.unwrap_or(Duration::from_secs(120)),
            stream_timeout: self.stream_timeout.unwrap_or(Duration::from_secs(180)),
            admin_token: self.admin_token.map(Arc::new),
            calls: self.calls.unwrap_or_default(),
            expose_metrics: self.expose_metrics.unwrap_or(true),
        })
    }
}
