//! # LLM Traffic Gateway
//!
//! Traffic-control gateway in front of OpenAI-compatible LLM providers.
//!
//! ## Features
//!
//! - Per-client admission control (sliding window + token bucket) on shared counters
//! - Provider registry with background health probing
//! - Circuit breaker and retry around every upstream call
//! - SSE and gRPC streaming relay with usage reporting
//! - Prometheus metrics
//!
//! ## Usage
//!
//! ```bash
//! # Start with default configuration
//! llm-traffic-gateway
//!
//! # Start with custom config file
//! llm-traffic-gateway --config /path/to/config.yaml
//!
//! # Start with environment overrides
//! GATEWAY_PORT=9000 llm-traffic-gateway
//! ```

use anyhow::Context;
use clap::Parser;
use gateway_config::{load_config, GatewayConfig, UsageSinkKind};
use gateway_core::{
    ClientIdentityResolver, CredentialSource, DefaultIdentityResolver, EnvCredentialSource,
    UsageSink,
};
use gateway_providers::{DefaultTransportFactory, HealthProber, ProviderRegistry, TlsMaterial};
use gateway_ratelimit::{
    AdmissionController, CounterStore, MemoryCounterStore, RedisCounterStore, RedisHandle,
    RedisRuleSource, RuleSource, RuleStore, StaticRuleSource, SystemClock,
};
use gateway_resilience::{CircuitBreakerRegistry, RetryPolicy};
use gateway_routing::{
    circuit_state_listener, Dispatcher, HttpUsageSink, LoggingUsageSink, UsageReporter,
};
use gateway_server::{shutdown_signal, AppState, JwtSubjectVerifier, Server, ServerConfig};
use gateway_telemetry::{init_logging, Metrics};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Command line arguments
#[derive(Debug, Parser)]
#[command(name = "llm-traffic-gateway", version, about)]
struct Args {
    /// Configuration file (YAML or TOML)
    #[arg(short, long, env = "GATEWAY_CONFIG")]
    config: Option<PathBuf>,
}

/// Application entry point
#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match load_config(args.config.as_deref()).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    // Initialize logging first
    if let Err(e) = init_logging(&config.telemetry.logging()) {
        eprintln!("Failed to initialize logging: {e}");
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting LLM Traffic Gateway"
    );

    if let Err(e) = run(config).await {
        error!(error = ?e, "Application failed");
        std::process::exit(1);
    }
}

/// Main application logic
async fn run(config: GatewayConfig) -> anyhow::Result<()> {
    info!(
        host = %config.server.host,
        port = config.server.port,
        rpc_port = ?config.server.rpc_port,
        providers = config.providers.len(),
        "Configuration loaded"
    );

    let metrics = Metrics::new().context("failed to create metrics registry")?;
    let credentials: Arc<dyn CredentialSource> = Arc::new(EnvCredentialSource::new());
    let background = CancellationToken::new();
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    // Providers
    let tls = match &config.upstream_tls {
        Some(section) => Some(
            TlsMaterial::load(
                &section.ca_cert_path,
                section.client_cert_path.as_deref(),
                section.client_key_path.as_deref(),
                section.domain_name.clone(),
            )
            .await
            .context("failed to load upstream TLS material")?,
        ),
        None => None,
    };
    let factory = Arc::new(
        DefaultTransportFactory::new(Arc::clone(&credentials), tls)
            .context("failed to build upstream transports")?,
    );
    let http_client = factory.http_client();
    let registry = Arc::new(ProviderRegistry::new(factory));
    for provider in &config.providers {
        registry
            .register(provider.clone())
            .with_context(|| format!("failed to register provider {}", provider.name))?;
    }
    info!(providers = registry.len(), "Provider registry initialized");

    if config.health.enabled {
        let prober = Arc::new(
            HealthProber::new(
                Arc::clone(&registry),
                http_client.clone(),
                config.health.interval,
                config.health.timeout,
            )
            .with_metrics(metrics.clone()),
        );
        tasks.push(prober.spawn(background.clone()));
    }

    // Dispatch
    let breakers = Arc::new(
        CircuitBreakerRegistry::new(config.resilience.circuit_breaker.to_config())
            .with_listener(circuit_state_listener(metrics.clone())),
    );
    let retry = RetryPolicy::new(config.resilience.retry.to_config());
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&registry),
        breakers,
        retry,
        metrics.clone(),
    ));

    // Admission
    let (store, rule_source): (Arc<dyn CounterStore>, Arc<dyn RuleSource>) =
        match &config.store.redis_url {
            Some(url) => {
                let handle = RedisHandle::open(url).context("invalid counters store URL")?;
                info!("Using Redis counters store");
                (
                    Arc::new(RedisCounterStore::new(handle.clone())),
                    Arc::new(RedisRuleSource::new(handle)),
                )
            }
            None => {
                warn!("No counters store configured, limits are per instance");
                (
                    Arc::new(MemoryCounterStore::new()),
                    Arc::new(StaticRuleSource::new(config.rate_limit.rules.clone())),
                )
            }
        };
    let rules = Arc::new(RuleStore::new(
        config.rate_limit.default_rule.clone(),
        rule_source,
    ));
    match rules.reload().await {
        Ok(count) => info!(rules = count, "Rate rules loaded"),
        Err(e) => warn!(error = %e, "Initial rate rule load failed, using the default rule"),
    }
    tasks.push(rules.spawn_reloader(config.rate_limit.reload_interval, background.clone()));
    let admission = Arc::new(AdmissionController::new(
        store,
        rules,
        Arc::new(SystemClock),
        config.rate_limit.admission_config(&config.store),
    ));

    // Identity
    let proxies = config.identity.trusted_proxies()?;
    if !proxies.is_empty() {
        info!(networks = proxies.len(), "Forwarded client addresses trusted from proxies");
    }
    let mut resolver = DefaultIdentityResolver::new().with_trusted_proxies(proxies);
    if let Some(jwt) = &config.identity.jwt {
        let verifier = JwtSubjectVerifier::from_config(jwt, credentials.as_ref())
            .await
            .context("failed to set up JWT verification")?;
        resolver = resolver.with_verifier(Arc::new(verifier));
        info!(algorithm = ?jwt.algorithm, "JWT subject verification enabled");
    }
    let identity: Arc<dyn ClientIdentityResolver> = Arc::new(resolver);

    // Usage
    let sink: Arc<dyn UsageSink> = match (config.usage.sink, &config.usage.endpoint) {
        (UsageSinkKind::Http, Some(endpoint)) => Arc::new(HttpUsageSink::new(
            http_client,
            endpoint.clone(),
            config.usage.timeout,
        )),
        _ => Arc::new(LoggingUsageSink),
    };
    let (usage, usage_task) = UsageReporter::spawn(
        sink,
        config.usage.queue_capacity,
        Some(metrics.clone()),
        background.clone(),
    );
    tasks.push(usage_task);

    let state = AppState::builder()
        .dispatcher(dispatcher)
        .admission(admission)
        .identity(identity)
        .usage(usage)
        .metrics(metrics)
        .timeouts(config.server.request_timeout, config.server.stream_timeout)
        .admin_token(config.server.admin_token.clone())
        .expose_metrics(config.telemetry.metrics_enabled)
        .build()?;

    let server_config = server_config(&config)?;
    let server = Server::new(state, server_config);

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    let result = server.run(shutdown).await;

    background.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "Background task ended abnormally");
        }
    }

    info!("Gateway shutdown complete");
    result.map_err(Into::into)
}

fn server_config(config: &GatewayConfig) -> anyhow::Result<ServerConfig> {
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| format!("invalid bind address {}", config.server.host))?;
    let rpc_addr = config
        .server
        .rpc_port
        .map(|port| SocketAddr::new(addr.ip(), port));
    Ok(ServerConfig {
        addr,
        rpc_addr,
        shutdown_grace: config.server.shutdown_grace,
    })
}
