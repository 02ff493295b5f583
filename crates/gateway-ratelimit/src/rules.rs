//! Per-route rate rules.
//!
//! The table is swapped atomically by the reloader and read by cloning the
//! rule for a route, so readers never observe a half-applied reload.

use crate::error::StoreError;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Limits for one route
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateRule {
    /// Route the rule applies to
    pub route: String,
    /// Requests admitted per window; zero disables request limiting
    pub requests_per_window: u32,
    /// Window length in seconds
    pub window_seconds: u32,
    /// Hard cap on requests in the window; defaults to `requests_per_window`
    #[serde(default)]
    pub burst: Option<u32>,
    /// Tokens refilled per window; zero disables token limiting
    #[serde(default)]
    pub tokens_per_window: u64,
    /// Bucket capacity; defaults to `tokens_per_window`
    #[serde(default)]
    pub tokens_burst: Option<u64>,
}

impl RateRule {
    /// Rule with request limiting only
    #[must_use]
    pub fn requests(
        route: impl Into<String>,
        requests_per_window: u32,
        window_seconds: u32,
    ) -> Self {
        Self {
            route: route.into(),
            requests_per_window,
            window_seconds,
            burst: None,
            tokens_per_window: 0,
            tokens_burst: None,
        }
    }

    /// Add a token budget
    #[must_use]
    pub fn with_tokens(mut self, tokens_per_window: u64, tokens_burst: Option<u64>) -> Self {
        self.tokens_per_window = tokens_per_window;
        self.tokens_burst = tokens_burst;
        self
    }

    /// Rule that admits everything
    #[must_use]
    pub fn unlimited(route: impl Into<String>) -> Self {
        Self::requests(route, 0, 60)
    }

    /// Effective request ceiling: the smaller of burst and per-window limit
    #[must_use]
    pub fn request_limit(&self) -> u32 {
        match self.burst {
            Some(burst) if burst > 0 => burst.min(self.requests_per_window),
            _ => self.requests_per_window,
        }
    }

    /// Window length
    #[must_use]
    pub fn window(&self) -> Duration {
        Duration::from_secs(u64::from(self.window_seconds.max(1)))
    }

    /// Bucket capacity
    #[must_use]
    pub fn token_capacity(&self) -> u64 {
        match self.tokens_burst {
            Some(burst) if burst > 0 => burst,
            _ => self.tokens_per_window,
        }
    }

    /// Refill rate in tokens per second
    #[must_use]
    pub fn refill_per_sec(&self) -> f64 {
        self.tokens_per_window as f64 / f64::from(self.window_seconds.max(1))
    }
}

/// Rules loaded from a source
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    /// Overrides the configured default rule when present
    pub default: Option<RateRule>,
    /// Route-specific rules
    pub routes: Vec<RateRule>,
}

/// Where rules come from
#[async_trait]
pub trait RuleSource: Send + Sync {
    /// Load the full rule set
    async fn load(&self) -> Result<RuleSet, StoreError>;

    /// Name for logs
    fn name(&self) -> &'static str;
}

/// Rules held in process, replaceable at runtime
#[derive(Debug, Default)]
pub struct StaticRuleSource {
    rules: RwLock<RuleSet>,
}

impl StaticRuleSource {
    /// Serve `routes` with no default override
    #[must_use]
    pub fn new(routes: Vec<RateRule>) -> Self {
        Self {
            rules: RwLock::new(RuleSet {
                default: None,
                routes,
            }),
        }
    }

    /// Replace the served rules
    pub fn set(&self, rules: RuleSet) {
        *self.rules.write() = rules;
    }
}

#[async_trait]
impl RuleSource for StaticRuleSource {
    async fn load(&self) -> Result<RuleSet, StoreError> {
        Ok(self.rules.read().clone())
    }

    fn name(&self) -> &'static str {
        "static"
    }
}

#[derive(Debug)]
struct RuleTable {
    default: RateRule,
    routes: HashMap<String, RateRule>,
}

/// Hot-reloaded rule table
pub struct RuleStore {
    table: ArcSwap<RuleTable>,
    configured_default: RateRule,
    source: Arc<dyn RuleSource>,
}

impl std::fmt::Debug for RuleStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleStore")
            .field("source", &self.source.name())
            .field("routes", &self.table.load().routes.len())
            .finish()
    }
}

impl RuleStore {
    /// Create an empty table that falls back to `default`
    #[must_use]
    pub fn new(default: RateRule, source: Arc<dyn RuleSource>) -> Self {
        Self {
            table: ArcSwap::from_pointee(RuleTable {
                default: default.clone(),
                routes: HashMap::new(),
            }),
            configured_default: default,
            source,
        }
    }

    /// Rule for `route`, or the default rule
    #[must_use]
    pub fn get(&self, route: &str) -> RateRule {
        let table = self.table.load();
        table
            .routes
            .get(route)
            .cloned()
            .unwrap_or_else(|| RateRule {
                route: route.to_string(),
                ..table.default.clone()
            })
    }

    /// Number of route-specific rules
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.load().routes.len()
    }

    /// Whether no route-specific rules are loaded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Load rules from the source and swap them in.
    ///
    /// On failure the previous table stays in effect.
    pub async fn reload(&self) -> Result<usize, StoreError> {
        let set = self.source.load().await?;
        let routes: HashMap<String, RateRule> = set
            .routes
            .into_iter()
            .map(|rule| (rule.route.clone(), rule))
            .collect();
        let count = routes.len();
        self.table.store(Arc::new(RuleTable {
            default: set.default.unwrap_or_else(|| self.configured_default.clone()),
            routes,
        }));
        debug!(source = self.source.name(), rules = count, "Rate rules reloaded");
        Ok(count)
    }

    /// Reload on a fixed interval until `cancel` fires
    pub fn spawn_reloader(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(
                source = store.source.name(),
                interval_ms = interval.as_millis() as u64,
                "Rate rule reloader started"
            );
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = store.reload().await {
                            warn!(
                                source = store.source.name(),
                                error = %e,
                                "Rate rule reload failed, keeping previous rules"
                            );
                        }
                    }
                }
            }
            info!("Rate rule reloader stopped");
        })
    }
}
