//! Counters store abstraction.
//!
//! Each operation is one atomic round trip: the Redis implementation runs a
//! Lua script, the in-memory implementation holds the key's map shard for the
//! whole read-modify-write.

use crate::error::StoreError;
use async_trait::async_trait;
use dashmap::DashMap;
use gateway_core::ClientId;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

/// Sliding-window key for a client and route
#[must_use]
pub fn request_key(client: &ClientId, route: &str) -> String {
    format!("rl_req:{client}:{route}")
}

/// Token-bucket key for a client and route
#[must_use]
pub fn token_key(client: &ClientId, route: &str) -> String {
    format!("rl_tok:{client}:{route}")
}

/// Result of a sliding-window hit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowOutcome {
    /// Whether the hit was recorded
    pub allowed: bool,
    /// Entries in the window after the operation
    pub count: u32,
}

/// Bucket parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketSpec {
    /// Maximum tokens
    pub capacity: f64,
    /// Tokens added per second
    pub refill_per_sec: f64,
    /// Key expiry in seconds
    pub ttl_secs: u64,
}

/// Result of a strict token take
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketOutcome {
    /// Whether the tokens were debited
    pub allowed: bool,
    /// Tokens left after the operation
    pub tokens: f64,
}

/// Result of a settlement
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SettleOutcome {
    /// Tokens left after the operation
    pub tokens: f64,
    /// Debit that could not be covered
    pub overdraft: f64,
}

/// Shared counters
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Prune entries older than `now_ms - window_ms`, then record `now_ms`
    /// unless the window already holds `limit` entries
    async fn hit_sliding_window(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        limit: u32,
    ) -> Result<WindowOutcome, StoreError>;

    /// Refill lazily, then debit `amount` only if the bucket holds that many
    async fn take_tokens(
        &self,
        key: &str,
        spec: BucketSpec,
        now_secs: u64,
        amount: f64,
    ) -> Result<BucketOutcome, StoreError>;

    /// Refill lazily, then debit `delta` (never below zero) or credit
    /// `-delta` (never above capacity)
    async fn settle_tokens(
        &self,
        key: &str,
        spec: BucketSpec,
        now_secs: u64,
        delta: f64,
    ) -> Result<SettleOutcome, StoreError>;

    /// Name for logs
    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy)]
struct BucketState {
    tokens: f64,
    last_refill: u64,
    expires_at: u64,
}

impl BucketState {
    fn refilled(existing: Option<Self>, spec: BucketSpec, now_secs: u64) -> Self {
        let expires_at = now_secs.saturating_add(spec.ttl_secs);
        // An expired bucket is gone in Redis too.
        let Some(state) = existing.filter(|s| s.expires_at > now_secs) else {
            return Self {
                tokens: spec.capacity,
                last_refill: now_secs,
                expires_at,
            };
        };
        let elapsed = now_secs.saturating_sub(state.last_refill) as f64;
        Self {
            tokens: (state.tokens + elapsed * spec.refill_per_sec).min(spec.capacity),
            last_refill: now_secs.max(state.last_refill),
            expires_at,
        }
    }
}

#[derive(Debug, Default)]
struct WindowState {
    hits: VecDeque<u64>,
    expires_at_ms: u64,
}

/// Minimum gap between sweeps of expired keys
const SWEEP_INTERVAL_MS: u64 = 10_000;

/// Single-process counters store.
///
/// Keys expire like their Redis counterparts: a window `window_ms` after its
/// last hit, a bucket `ttl_secs` after its last update. Expired keys are
/// swept at most once per [`SWEEP_INTERVAL_MS`] from the request path.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    windows: DashMap<String, WindowState>,
    buckets: DashMap<String, BucketState>,
    last_sweep_ms: AtomicU64,
}

impl MemoryCounterStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current bucket level, for inspection
    #[must_use]
    pub fn tokens(&self, key: &str) -> Option<f64> {
        self.buckets.get(key).map(|b| b.tokens)
    }

    /// Number of live window and bucket keys
    #[must_use]
    pub fn key_count(&self) -> usize {
        self.windows.len() + self.buckets.len()
    }

    /// Drop every key that has expired by `now_ms`
    pub fn sweep(&self, now_ms: u64) {
        let now_secs = now_ms / 1000;
        let windows_before = self.windows.len();
        let buckets_before = self.buckets.len();
        self.windows.retain(|_, w| w.expires_at_ms > now_ms);
        self.buckets.retain(|_, b| b.expires_at > now_secs);
        trace!(
            windows = windows_before - self.windows.len().min(windows_before),
            buckets = buckets_before - self.buckets.len().min(buckets_before),
            "Swept expired counters"
        );
    }

    // Must run before any entry guard is taken: retain locks every shard.
    fn maybe_sweep(&self, now_ms: u64) {
        let last = self.last_sweep_ms.load(Ordering::Relaxed);
        if now_ms.saturating_sub(last) < SWEEP_INTERVAL_MS {
            return;
        }
        if self
            .last_sweep_ms
            .compare_exchange(last, now_ms, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            self.sweep(now_ms);
        }
    }

    fn with_bucket<T>(
        &self,
        key: &str,
        spec: BucketSpec,
        now_secs: u64,
        apply: impl FnOnce(&mut BucketState) -> T,
    ) -> T {
        self.maybe_sweep(now_secs.saturating_mul(1000));
        let mut entry = self.buckets.entry(key.to_string()).or_insert(BucketState {
            tokens: spec.capacity,
            last_refill: now_secs,
            expires_at: now_secs.saturating_add(spec.ttl_secs),
        });
        let mut state = BucketState::refilled(Some(*entry.value()), spec, now_secs);
        let out = apply(&mut state);
        *entry.value_mut() = state;
        out
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn hit_sliding_window(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        limit: u32,
    ) -> Result<WindowOutcome, StoreError> {
        self.maybe_sweep(now_ms);

        let cutoff = now_ms.saturating_sub(window_ms);
        let mut entry = self.windows.entry(key.to_string()).or_default();
        let window = entry.value_mut();

        window.hits.retain(|&ts| ts >= cutoff);

        let count = u32::try_from(window.hits.len()).unwrap_or(u32::MAX);
        if count >= limit {
            return Ok(WindowOutcome {
                allowed: false,
                count,
            });
        }
        window.hits.push_back(now_ms);
        window.expires_at_ms = now_ms.saturating_add(window_ms);
        Ok(WindowOutcome {
            allowed: true,
            count: count + 1,
        })
    }

    async fn take_tokens(
        &self,
        key: &str,
        spec: BucketSpec,
        now_secs: u64,
        amount: f64,
    ) -> Result<BucketOutcome, StoreError> {
        let (allowed, tokens) = self.with_bucket(key, spec, now_secs, |state| {
            let allowed = state.tokens >= amount;
            if allowed {
                state.tokens -= amount;
            }
            (allowed, state.tokens)
        });
        Ok(BucketOutcome { allowed, tokens })
    }

    async fn settle_tokens(
        &self,
        key: &str,
        spec: BucketSpec,
        now_secs: u64,
        delta: f64,
    ) -> Result<SettleOutcome, StoreError> {
        let (tokens, overdraft) = self.with_bucket(key, spec, now_secs, |state| {
            let mut overdraft = 0.0;
            if delta > 0.0 {
                if delta > state.tokens {
                    overdraft = delta - state.tokens;
                }
                state.tokens = (state.tokens - delta).max(0.0);
            } else {
                state.tokens = (state.tokens - delta).min(spec.capacity);
            }
            (state.tokens, overdraft)
        });
        Ok(SettleOutcome { tokens, overdraft })
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: u64 = 1_700_000_000_000;

    fn spec() -> BucketSpec {
        BucketSpec {
            capacity: 10.0,
            refill_per_sec: 1.0,
            ttl_secs: 120,
        }
    }

    #[test]
    fn test_keys() {
        let client = ClientId::api_key("abc");
        assert_eq!(
            request_key(&client, "/v1/chat/completions"),
            "rl_req:key:abc:/v1/chat/completions"
        );
        assert_eq!(token_key(&client, "/v1/completions"), "rl_tok:key:abc:/v1/completions");
    }

    #[tokio::test]
    async fn test_window_never_exceeds_limit() {
        let store = MemoryCounterStore::new();
        let mut admitted = 0;
        for i in 0..10 {
            let outcome = store
                .hit_sliding_window("k", T0 + i, 60_000, 4)
                .await
                .expect("hit");
            if outcome.allowed {
                admitted += 1;
            }
            assert!(outcome.count <= 4);
        }
        assert_eq!(admitted, 4);
    }

    #[tokio::test]
    async fn test_window_prunes_old_entries() {
        let store = MemoryCounterStore::new();
        assert!(store.hit_sliding_window("k", T0, 60_000, 1).await.expect("hit").allowed);
        assert!(!store.hit_sliding_window("k", T0 + 30_000, 60_000, 1).await.expect("hit").allowed);
        // The entry at T0 is still inside [now - window, now].
        assert!(!store.hit_sliding_window("k", T0 + 60_000, 60_000, 1).await.expect("hit").allowed);
        assert!(store.hit_sliding_window("k", T0 + 60_001, 60_000, 1).await.expect("hit").allowed);
    }

    #[tokio::test]
    async fn test_bucket_starts_full_and_never_goes_negative() {
        let store = MemoryCounterStore::new();
        let now = T0 / 1000;

        let first = store.take_tokens("b", spec(), now, 8.0).await.expect("take");
        assert!(first.allowed);
        assert!((first.tokens - 2.0).abs() < f64::EPSILON);

        let denied = store.take_tokens("b", spec(), now, 3.0).await.expect("take");
        assert!(!denied.allowed);
        assert!(denied.tokens >= 0.0);
        assert!((denied.tokens - 2.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_bucket_refills_to_capacity() {
        let store = MemoryCounterStore::new();
        let now = T0 / 1000;
        store.take_tokens("b", spec(), now, 10.0).await.expect("take");

        let later = store.take_tokens("b", spec(), now + 3, 3.0).await.expect("take");
        assert!(later.allowed);
        assert!(later.tokens.abs() < f64::EPSILON);

        let much_later = store.take_tokens("b", spec(), now + 1000, 0.0).await.expect("take");
        assert!((much_later.tokens - 10.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_settle_clamps_both_ways() {
        let store = MemoryCounterStore::new();
        let now = T0 / 1000;
        store.take_tokens("b", spec(), now, 6.0).await.expect("take");

        let debit = store.settle_tokens("b", spec(), now, 7.0).await.expect("settle");
        assert!(debit.tokens.abs() < f64::EPSILON);
        assert!((debit.overdraft - 3.0).abs() < f64::EPSILON);

        let credit = store.settle_tokens("b", spec(), now, -50.0).await.expect("settle");
        assert!((credit.tokens - 10.0).abs() < f64::EPSILON);
        assert!(credit.overdraft.abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_idle_windows_are_evicted() {
        let store = MemoryCounterStore::new();
        for i in 0..10_000 {
            store
                .hit_sliding_window(&format!("client-{i}"), T0, 1_000, 5)
                .await
                .expect("hit");
        }
        assert_eq!(store.windows.len(), 10_000);

        store
            .hit_sliding_window("late", T0 + 10_000_000, 1_000, 5)
            .await
            .expect("hit");
        assert_eq!(store.windows.len(), 1);
        assert!(store.windows.contains_key("late"));
    }

    #[tokio::test]
    async fn test_live_window_survives_sweep() {
        let store = MemoryCounterStore::new();
        store.hit_sliding_window("long", T0, 60_000, 2).await.expect("hit");
        store.hit_sliding_window("short", T0, 1_000, 2).await.expect("hit");

        store.sweep(T0 + 30_000);
        assert!(store.windows.contains_key("long"));
        assert!(!store.windows.contains_key("short"));

        // The surviving entry still counts toward the limit.
        let outcome = store
            .hit_sliding_window("long", T0 + 30_000, 60_000, 2)
            .await
            .expect("hit");
        assert_eq!(outcome.count, 2);
    }

    #[tokio::test]
    async fn test_idle_buckets_expire_after_ttl() {
        let store = MemoryCounterStore::new();
        let now = T0 / 1000;
        for i in 0..100 {
            store
                .take_tokens(&format!("b-{i}"), spec(), now, 1.0)
                .await
                .expect("take");
        }
        assert_eq!(store.buckets.len(), 100);

        store.sweep((now + 60) * 1000);
        assert_eq!(store.buckets.len(), 100);

        store.take_tokens("fresh", spec(), now + 121, 1.0).await.expect("take");
        assert_eq!(store.key_count(), 1);
        assert!(store.tokens("b-0").is_none());
    }

    #[tokio::test]
    async fn test_expired_bucket_restarts_full() {
        let store = MemoryCounterStore::new();
        let now = T0 / 1000;
        let spec = BucketSpec {
            capacity: 10.0,
            refill_per_sec: 0.0,
            ttl_secs: 5,
        };
        store.take_tokens("b", spec, now, 10.0).await.expect("take");
        assert!(!store.take_tokens("b", spec, now + 4, 1.0).await.expect("take").allowed);
        // Each update pushes expiry out by the ttl.
        assert!(!store.take_tokens("b", spec, now + 8, 1.0).await.expect("take").allowed);

        let after = store.take_tokens("b", spec, now + 14, 1.0).await.expect("take");
        assert!(after.allowed);
        assert!((after.tokens - 9.0).abs() < f64::EPSILON);
    }
}
