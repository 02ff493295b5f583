//! Prometheus metrics.
//!
//! One [`Metrics`] instance owns its registry; the server exposes it at
//! `GET /metrics`.

use crate::logging::TelemetryError;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;

/// Gateway metrics
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    admission_decisions: IntCounterVec,
    upstream_requests: IntCounterVec,
    upstream_latency: HistogramVec,
    stream_chunks: IntCounterVec,
    circuit_state: IntGaugeVec,
    provider_healthy: IntGaugeVec,
    usage_events_dropped: IntCounter,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

impl Metrics {
    /// Create and register every metric in a fresh registry
    ///
    /// # Errors
    /// Returns error if a metric cannot be registered
    pub fn new() -> Result<Self, TelemetryError> {
        let registry = Registry::new();

        let admission_decisions = IntCounterVec::new(
            Opts::new(
                "gateway_admission_decisions_total",
                "Admission decisions by route and outcome",
            ),
            &["route", "decision"],
        )?;
        let upstream_requests = IntCounterVec::new(
            Opts::new(
                "gateway_upstream_requests_total",
                "Upstream call attempts by provider and outcome",
            ),
            &["provider", "outcome"],
        )?;
        let upstream_latency = HistogramVec::new(
            HistogramOpts::new(
                "gateway_upstream_latency_seconds",
                "Upstream call latency",
            )
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
            &["provider"],
        )?;
        let stream_chunks = IntCounterVec::new(
            Opts::new("gateway_stream_chunks_total", "Chunks relayed to clients"),
            &["provider"],
        )?;
        let circuit_state = IntGaugeVec::new(
            Opts::new(
                "gateway_circuit_state",
                "Circuit breaker state (0=closed, 1=open, 2=half-open)",
            ),
            &["provider"],
        )?;
        let provider_healthy = IntGaugeVec::new(
            Opts::new("gateway_provider_healthy", "Provider health flag"),
            &["provider"],
        )?;
        let usage_events_dropped = IntCounter::new(
            "gateway_usage_events_dropped_total",
            "Usage events dropped because the queue was full",
        )?;

        registry.register(Box::new(admission_decisions.clone()))?;
        registry.register(Box::new(upstream_requests.clone()))?;
        registry.register(Box::new(upstream_latency.clone()))?;
        registry.register(Box::new(stream_chunks.clone()))?;
        registry.register(Box::new(circuit_state.clone()))?;
        registry.register(Box::new(provider_healthy.clone()))?;
        registry.register(Box::new(usage_events_dropped.clone()))?;

        Ok(Self {
            registry,
            admission_decisions,
            upstream_requests,
            upstream_latency,
            stream_chunks,
            circuit_state,
            provider_healthy,
            usage_events_dropped,
        })
    }

    /// Count an admission decision (`allowed` or a denial reason)
    pub fn record_admission(&self, route: &str, decision: &str) {
        self.admission_decisions
            .with_label_values(&[route, decision])
            .inc();
    }

    /// Count an upstream attempt and observe its latency
    pub fn record_upstream(&self, provider: &str, outcome: &str, latency: Duration) {
        self.upstream_requests
            .with_label_values(&[provider, outcome])
            .inc();
        self.upstream_latency
            .with_label_values(&[provider])
            .observe(latency.as_secs_f64());
    }

    /// Count a relayed chunk
    pub fn record_stream_chunk(&self, provider: &str) {
        self.stream_chunks.with_label_values(&[provider]).inc();
    }

    /// Set a breaker's state gauge
    pub fn set_circuit_state(&self, provider: &str, state: i64) {
        self.circuit_state.with_label_values(&[provider]).set(state);
    }

    /// Set a provider's health gauge
    pub fn set_provider_healthy(&self, provider: &str, healthy: bool) {
        self.provider_healthy
            .with_label_values(&[provider])
            .set(i64::from(healthy));
    }

    /// Drop the per-provider series of a deregistered provider
    pub fn forget_provider(&self, provider: &str) {
        let _ = self.circuit_state.remove_label_values(&[provider]);
        let _ = self.provider_healthy.remove_label_values(&[provider]);
    }

    /// Count a dropped usage event
    pub fn record_usage_dropped(&self) {
        self.usage_events_dropped.inc();
    }

    /// Dropped usage events so far
    #[must_use]
    pub fn usage_events_dropped(&self) -> u64 {
        self.usage_events_dropped.get()
    }

    /// Render the text exposition format
    ///
    /// # Errors
    /// Returns error if encoding fails
    pub fn render(&self) -> Result<String, TelemetryError> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| TelemetryError::Init(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_recorded_series() {
        let metrics = Metrics::new().expect("metrics");
        metrics.record_admission("/v1/chat/completions", "allowed");
        metrics.record_upstream("openai", "success", Duration::from_millis(120));
        metrics.set_circuit_state("openai", 1);
        metrics.set_provider_healthy("openai", true);
        metrics.record_usage_dropped();

        let text = metrics.render().expect("render");
        assert!(text.contains("gateway_admission_decisions_total"));
        assert!(text.contains("decision=\"allowed\""));
        assert!(text.contains("gateway_upstream_latency_seconds_bucket"));
        assert!(text.contains("gateway_circuit_state{provider=\"openai\"} 1"));
        assert_eq!(metrics.usage_events_dropped(), 1);
    }

    #[test]
    fn test_instances_are_independent() {
        let a = Metrics::new().expect("metrics");
        let b = Metrics::new().expect("metrics");
        a.record_usage_dropped();
        assert_eq!(b.usage_events_dropped(), 0);
    }
}
