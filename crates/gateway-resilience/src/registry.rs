//! One circuit breaker per provider name.

use crate::circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStatus, StateListener,
};
use dashmap::DashMap;
use std::sync::Arc;

/// Process-local breaker table keyed by provider name
#[derive(Default)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    config: CircuitBreakerConfig,
    listener: Option<StateListener>,
}

impl std::fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("breakers", &self.breakers.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CircuitBreakerRegistry {
    /// Create a registry whose breakers share `config`
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
            listener: None,
        }
    }

    /// Attach a listener to every breaker created from now on
    #[must_use]
    pub fn with_listener(mut self, listener: StateListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Get the breaker for `name`, creating it on first use
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            return Arc::clone(existing.value());
        }
        let entry = self.breakers.entry(name.to_string()).or_insert_with(|| {
            let breaker = CircuitBreaker::new(name, self.config.clone());
            let breaker = match &self.listener {
                Some(listener) => breaker.with_listener(Arc::clone(listener)),
                None => breaker,
            };
            Arc::new(breaker)
        });
        Arc::clone(entry.value())
    }

    /// Get an existing breaker
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|b| Arc::clone(b.value()))
    }

    /// Reset a breaker to closed; `false` when unknown
    pub fn reset(&self, name: &str) -> bool {
        match self.get(name) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    /// Status of one breaker
    #[must_use]
    pub fn status(&self, name: &str) -> Option<CircuitBreakerStatus> {
        self.get(name).map(|b| b.status())
    }

    /// Status of every breaker, sorted by name
    #[must_use]
    pub fn statuses(&self) -> Vec<CircuitBreakerStatus> {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.iter().map(|e| Arc::clone(e.value())).collect();
        let mut statuses: Vec<_> = breakers.iter().map(|b| b.status()).collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Forget a breaker (provider deregistered)
    pub fn remove(&self, name: &str) -> bool {
        self.breakers.remove(name).is_some()
    }
}
