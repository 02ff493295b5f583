//! Periodic provider liveness probes.

use crate::registry::ProviderRegistry;
use chrono::Utc;
use futures::future::join_all;
use gateway_telemetry::Metrics;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Probes every provider that has a probe address
pub struct HealthProber {
    registry: Arc<ProviderRegistry>,
    client: reqwest::Client,
    interval: Duration,
    timeout: Duration,
    metrics: Option<Metrics>,
}

impl std::fmt::Debug for HealthProber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthProber")
            .field("interval", &self.interval)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl HealthProber {
    /// Create a prober
    #[must_use]
    pub fn new(
        registry: Arc<ProviderRegistry>,
        client: reqwest::Client,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            client,
            interval,
            timeout,
            metrics: None,
        }
    }

    /// Export health to the `gateway_provider_healthy` gauge
    #[must_use]
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Probe all providers concurrently, each under its own timeout.
    ///
    /// Returns the number of providers probed.
    pub async fn probe_all(&self) -> usize {
        let targets: Vec<(String, String)> = self
            .registry
            .snapshot()
            .into_iter()
            .filter_map(|p| p.probe_address.map(|address| (p.name, address)))
            .collect();

        let probes = targets.iter().map(|(name, address)| async move {
            let healthy = self.probe(name, address).await;
            (name.as_str(), healthy)
        });

        let results = join_all(probes).await;
        let checked_at = Utc::now();
        for (name, healthy) in &results {
            // Deregistered during the probe
            if !self.registry.set_health(name, *healthy, checked_at) {
                continue;
            }
            if let Some(metrics) = &self.metrics {
                metrics.set_provider_healthy(name, *healthy);
            }
        }
        results.len()
    }

    async fn probe(&self, name: &str, address: &str) -> bool {
        let request = self.client.get(address).send();
        match tokio::time::timeout(self.timeout, request).await {
            Ok(Ok(response)) if response.status().is_server_error() => {
                warn!(provider = %name, status = %response.status(), "Health probe failed");
                false
            }
            Ok(Ok(_)) => {
                debug!(provider = %name, "Health probe passed");
                true
            }
            Ok(Err(e)) => {
                warn!(provider = %name, error = %e, "Health probe failed");
                false
            }
            Err(_) => {
                warn!(provider = %name, timeout = ?self.timeout, "Health probe timed out");
                false
            }
        }
    }

    /// Run probes on every interval tick until cancelled
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(interval = ?self.interval, "Health prober started");
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.probe_all().await;
                    }
                }
            }
            info!("Health prober stopped");
        })
    }
}
