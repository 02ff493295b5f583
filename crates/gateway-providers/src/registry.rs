//! Provider registry.
//!
//! Entries keep registration order; resolution walks them in that order, so
//! the earliest-registered matching provider wins. Weight is reported only.

use crate::transport::{Transport, TransportFactory};
use chrono::{DateTime, Utc};
use gateway_core::{GatewayError, GatewayResult, ModelObject, ModelsResponse, ProviderConfig};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A registered provider and its transport
#[derive(Clone)]
pub struct ProviderEntry {
    /// Live configuration, including health
    pub config: ProviderConfig,
    /// Transport chosen at registration
    pub transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for ProviderEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderEntry")
            .field("config", &self.config)
            .field("transport", &self.transport.kind())
            .finish()
    }
}

/// Result of resolving a model
#[derive(Clone)]
pub struct ResolvedProvider {
    /// Copy of the provider's configuration at resolution time
    pub config: ProviderConfig,
    /// Transport to call
    pub transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for ResolvedProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedProvider")
            .field("config", &self.config)
            .field("transport", &self.transport.kind())
            .finish()
    }
}

impl ResolvedProvider {
    /// Provider name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }
}

/// Process-wide provider registry
pub struct ProviderRegistry {
    entries: RwLock<Vec<ProviderEntry>>,
    factory: Arc<dyn TransportFactory>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.len())
            .finish_non_exhaustive()
    }
}

impl ProviderRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new(factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            factory,
        }
    }

    /// Register a provider.
    ///
    /// # Errors
    /// `Conflict` if the name is taken, `Validation` for an unusable config,
    /// or the factory's error if the transport cannot be built
    pub fn register(&self, config: ProviderConfig) -> GatewayResult<()> {
        if config.name.trim().is_empty() {
            return Err(GatewayError::validation(
                "provider name is required",
                Some("name"),
            ));
        }
        if config.supported_models.is_empty() {
            return Err(GatewayError::validation(
                "supported_models cannot be empty",
                Some("supported_models"),
            ));
        }
        if self.get(&config.name).is_some() {
            return Err(GatewayError::conflict(format!(
                "provider '{}' is already registered",
                config.name
            )));
        }

        // Built outside the lock; the name is checked again under it
        let transport = self.factory.build(&config)?;

        let mut entries = self.entries.write();
        if entries.iter().any(|e| e.config.name == config.name) {
            return Err(GatewayError::conflict(format!(
                "provider '{}' is already registered",
                config.name
            )));
        }
        info!(
            provider = %config.name,
            transport = %config.transport_kind,
            models = config.supported_models.len(),
            "Registered provider"
        );
        entries.push(ProviderEntry { config, transport });
        Ok(())
    }

    /// Remove a provider
    ///
    /// # Errors
    /// `NotFound` if no provider has that name
    pub fn deregister(&self, name: &str) -> GatewayResult<ProviderConfig> {
        let mut entries = self.entries.write();
        let position = entries
            .iter()
            .position(|e| e.config.name == name)
            .ok_or_else(|| GatewayError::not_found("provider", name))?;
        let removed = entries.remove(position);
        info!(provider = %name, "Deregistered provider");
        Ok(removed.config)
    }

    /// Pick a provider for `model`.
    ///
    /// Healthy providers are preferred; when no healthy provider serves the
    /// model, every registered provider is considered.
    ///
    /// # Errors
    /// `UnsupportedModel` when no registered provider serves the model
    pub fn resolve(&self, model: &str) -> GatewayResult<ResolvedProvider> {
        let entries = self.entries.read();

        let pick = entries
            .iter()
            .find(|e| e.config.is_healthy && e.config.supports(model))
            .or_else(|| {
                let fallback = entries.iter().find(|e| e.config.supports(model));
                if let Some(entry) = fallback {
                    warn!(
                        provider = %entry.config.name,
                        model = %model,
                        "No healthy provider for model, falling back"
                    );
                }
                fallback
            });

        match pick {
            Some(entry) => {
                debug!(provider = %entry.config.name, model = %model, "Resolved provider");
                Ok(ResolvedProvider {
                    config: entry.config.clone(),
                    transport: Arc::clone(&entry.transport),
                })
            }
            None => Err(GatewayError::unsupported_model(model)),
        }
    }

    /// Copy of every provider configuration, in registration order
    #[must_use]
    pub fn snapshot(&self) -> Vec<ProviderConfig> {
        self.entries.read().iter().map(|e| e.config.clone()).collect()
    }

    /// Copy of one provider configuration
    #[must_use]
    pub fn get(&self, name: &str) -> Option<ProviderConfig> {
        self.entries
            .read()
            .iter()
            .find(|e| e.config.name == name)
            .map(|e| e.config.clone())
    }

    /// Record a probe result; returns whether the provider still exists
    pub fn set_health(&self, name: &str, healthy: bool, checked_at: DateTime<Utc>) -> bool {
        let mut entries = self.entries.write();
        let Some(entry) = entries.iter_mut().find(|e| e.config.name == name) else {
            return false;
        };
        if entry.config.is_healthy != healthy {
            info!(provider = %name, healthy, "Provider health changed");
        }
        entry.config.is_healthy = healthy;
        entry.config.last_checked_at = Some(checked_at);
        true
    }

    /// Union of supported models, sorted by id
    #[must_use]
    pub fn models(&self) -> ModelsResponse {
        let mut owners: BTreeMap<String, String> = BTreeMap::new();
        for entry in self.entries.read().iter() {
            for model in &entry.config.supported_models {
                owners
                    .entry(model.clone())
                    .or_insert_with(|| entry.config.name.clone());
            }
        }
        ModelsResponse {
            object: "list".to_string(),
            data: owners
                .into_iter()
                .map(|(id, owned_by)| ModelObject {
                    id,
                    object: "model".to_string(),
                    owned_by,
                })
                .collect(),
        }
    }

    /// Number of registered providers
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether no provider is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Whether at least one provider is healthy
    #[must_use]
    pub fn has_healthy(&self) -> bool {
        self.entries.read().iter().any(|e| e.config.is_healthy)
    }
}
