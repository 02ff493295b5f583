//! Redis-backed counters store and rule source.
//!
//! Counter operations run as Lua scripts so prune/insert and refill/debit are
//! one atomic round trip per key across every gateway instance.

use crate::error::StoreError;
use crate::rules::{RateRule, RuleSet, RuleSource};
use crate::store::{BucketOutcome, BucketSpec, CounterStore, SettleOutcome, WindowOutcome};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Prefix of rule documents
pub const RULE_KEY_PREFIX: &str = "ratelimit:rule:";

const SLIDING_WINDOW_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local member = ARGV[4]

redis.call("ZREMRANGEBYSCORE", KEYS[1], "-inf", "(" .. (now - window))
local count = redis.call("ZCARD", KEYS[1])
if count >= limit then
  return {0, count}
end

redis.call("ZADD", KEYS[1], now, member)
redis.call("PEXPIRE", KEYS[1], window)
return {1, count + 1}
"#;

const TOKEN_BUCKET_SCRIPT: &str = r#"
local capacity = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local amount = tonumber(ARGV[4])
local mode = ARGV[5]
local ttl = tonumber(ARGV[6])

local state = redis.call("HMGET", KEYS[1], "tokens", "last_refill")
local tokens = tonumber(state[1])
local last = tonumber(state[2])
if tokens == nil or last == nil then
  tokens = capacity
  last = now
end

local elapsed = now - last
if elapsed < 0 then
  elapsed = 0
end
tokens = math.min(capacity, tokens + elapsed * rate)

-- mode "take": strict debit; mode "settle": clamped debit or credit
local allowed = 1
local overdraft = 0
if mode == "take" then
  if tokens < amount then
    allowed = 0
  else
    tokens = tokens - amount
  end
else
  if amount > 0 then
    if amount > tokens then
      overdraft = amount - tokens
    end
    tokens = math.max(0, tokens - amount)
  else
    tokens = math.min(capacity, tokens - amount)
  end
end

redis.call("HSET", KEYS[1], "tokens", tostring(tokens), "last_refill", math.max(now, last))
redis.call("EXPIRE", KEYS[1], ttl)
return {allowed, tostring(tokens), tostring(overdraft)}
"#;

/// Lazily connected, auto-reconnecting Redis handle shared by the store and
/// the rule source
#[derive(Clone)]
pub struct RedisHandle {
    client: redis::Client,
    conn: Arc<OnceCell<ConnectionManager>>,
}

impl std::fmt::Debug for RedisHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisHandle")
            .field("connected", &self.conn.initialized())
            .finish_non_exhaustive()
    }
}

impl RedisHandle {
    /// Parse `url`; no connection is made until first use
    pub fn open(url: impl AsRef<str>) -> Result<Self, StoreError> {
        Ok(Self {
            client: redis::Client::open(url.as_ref())?,
            conn: Arc::new(OnceCell::new()),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        let conn = self
            .conn
            .get_or_try_init(|| ConnectionManager::new(self.client.clone()))
            .await?;
        Ok(conn.clone())
    }
}

/// Counters store shared by every gateway instance
#[derive(Debug, Clone)]
pub struct RedisCounterStore {
    handle: RedisHandle,
}

impl RedisCounterStore {
    /// Create a store over `handle`
    #[must_use]
    pub fn new(handle: RedisHandle) -> Self {
        Self { handle }
    }

    async fn run_bucket(
        &self,
        key: &str,
        spec: BucketSpec,
        now_secs: u64,
        amount: f64,
        mode: &str,
    ) -> Result<(bool, f64, f64), StoreError> {
        let mut conn = self.handle.connection().await?;
        let (allowed, tokens, overdraft): (i64, String, String) =
            redis::Script::new(TOKEN_BUCKET_SCRIPT)
                .key(key)
                .arg(spec.capacity)
                .arg(spec.refill_per_sec)
                .arg(now_secs)
                .arg(amount)
                .arg(mode)
                .arg(spec.ttl_secs.max(1))
                .invoke_async(&mut conn)
                .await?;
        Ok((allowed == 1, parse_float(&tokens)?, parse_float(&overdraft)?))
    }
}

fn parse_float(raw: &str) -> Result<f64, StoreError> {
    raw.parse::<f64>()
        .map_err(|_| StoreError::Protocol(format!("not a number: {raw}")))
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn hit_sliding_window(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        limit: u32,
    ) -> Result<WindowOutcome, StoreError> {
        let member = format!("{now_ms}-{:016x}", rand::random::<u64>());
        let mut conn = self.handle.connection().await?;
        let (allowed, count): (i64, i64) = redis::Script::new(SLIDING_WINDOW_SCRIPT)
            .key(key)
            .arg(now_ms)
            .arg(window_ms.max(1))
            .arg(limit)
            .arg(member)
            .invoke_async(&mut conn)
            .await?;
        Ok(WindowOutcome {
            allowed: allowed == 1,
            count: u32::try_from(count).unwrap_or(u32::MAX),
        })
    }

    async fn take_tokens(
        &self,
        key: &str,
        spec: BucketSpec,
        now_secs: u64,
        amount: f64,
    ) -> Result<BucketOutcome, StoreError> {
        let (allowed, tokens, _) = self.run_bucket(key, spec, now_secs, amount, "take").await?;
        Ok(BucketOutcome { allowed, tokens })
    }

    async fn settle_tokens(
        &self,
        key: &str,
        spec: BucketSpec,
        now_secs: u64,
        delta: f64,
    ) -> Result<SettleOutcome, StoreError> {
        let (_, tokens, overdraft) = self.run_bucket(key, spec, now_secs, delta, "settle").await?;
        Ok(SettleOutcome { tokens, overdraft })
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

#[derive(Debug, Deserialize)]
struct RequestRuleDoc {
    requests_per_window: u32,
    window_seconds: u32,
    #[serde(default)]
    burst: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct TokenRuleDoc {
    tokens_per_window: u64,
    #[serde(default)]
    tokens_burst: Option<u64>,
    #[serde(default)]
    window_seconds: Option<u32>,
}

/// Which half of a rule a key holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RuleKind {
    Requests,
    Tokens,
}

/// Split `ratelimit:rule:<route>:<kind>` into route and kind
fn parse_rule_key(key: &str) -> Option<(&str, RuleKind)> {
    let rest = key.strip_prefix(RULE_KEY_PREFIX)?;
    let (route, kind) = rest.rsplit_once(':')?;
    let kind = match kind {
        "requests" => RuleKind::Requests,
        "tokens" => RuleKind::Tokens,
        _ => return None,
    };
    (!route.is_empty()).then_some((route, kind))
}

/// Assemble rules from raw `(key, json)` documents.
///
/// The route named `default` replaces the configured default rule.
fn assemble_rules(docs: Vec<(String, String)>) -> Result<RuleSet, StoreError> {
    let mut rules: HashMap<String, RateRule> = HashMap::new();
    for (key, raw) in docs {
        let Some((route, kind)) = parse_rule_key(&key) else {
            continue;
        };
        let rule = rules
            .entry(route.to_string())
            .or_insert_with(|| RateRule::unlimited(route));
        match kind {
            RuleKind::Requests => {
                let doc: RequestRuleDoc = serde_json::from_str(&raw)?;
                rule.requests_per_window = doc.requests_per_window;
                rule.window_seconds = doc.window_seconds;
                rule.burst = doc.burst;
            }
            RuleKind::Tokens => {
                let doc: TokenRuleDoc = serde_json::from_str(&raw)?;
                rule.tokens_per_window = doc.tokens_per_window;
                rule.tokens_burst = doc.tokens_burst;
                if let Some(window) = doc.window_seconds {
                    rule.window_seconds = window;
                }
            }
        }
    }

    let default = rules.remove("default");
    let mut routes: Vec<RateRule> = rules.into_values().collect();
    routes.sort_by(|a, b| a.route.cmp(&b.route));
    Ok(RuleSet { default, routes })
}

/// Loads rules stored under `ratelimit:rule:*`
#[derive(Debug, Clone)]
pub struct RedisRuleSource {
    handle: RedisHandle,
}

impl RedisRuleSource {
    /// Create a source over `handle`
    #[must_use]
    pub fn new(handle: RedisHandle) -> Self {
        Self { handle }
    }
}

#[async_trait]
impl RuleSource for RedisRuleSource {
    async fn load(&self) -> Result<RuleSet, StoreError> {
        let mut conn = self.handle.connection().await?;
        let pattern = format!("{RULE_KEY_PREFIX}*");

        let mut keys: Vec<String> = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        if keys.is_empty() {
            return Ok(RuleSet::default());
        }

        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await?;
        let docs = keys
            .into_iter()
            .zip(values)
            .filter_map(|(k, v)| v.map(|v| (k, v)))
            .collect();
        assemble_rules(docs)
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rule_key() {
        assert_eq!(
            parse_rule_key("ratelimit:rule:/v1/chat/completions:requests"),
            Some(("/v1/chat/completions", RuleKind::Requests))
        );
        assert_eq!(
            parse_rule_key("ratelimit:rule:default:tokens"),
            Some(("default", RuleKind::Tokens))
        );
        assert_eq!(parse_rule_key("ratelimit:rule:x:other"), None);
        assert_eq!(parse_rule_key("other:rule:x:tokens"), None);
    }

    #[test]
    fn test_assemble_rules_merges_halves() {
        let docs = vec![
            (
                "ratelimit:rule:/v1/chat/completions:requests".to_string(),
                r#"{"requests_per_window":2,"window_seconds":60}"#.to_string(),
            ),
            (
                "ratelimit:rule:/v1/chat/completions:tokens".to_string(),
                r#"{"tokens_per_window":6000,"tokens_burst":1000}"#.to_string(),
            ),
            (
                "ratelimit:rule:default:requests".to_string(),
                r#"{"requests_per_window":100,"window_seconds":60,"burst":20}"#.to_string(),
            ),
        ];
        let set = assemble_rules(docs).expect("valid docs");

        let default = set.default.expect("default present");
        assert_eq!(default.request_limit(), 20);

        assert_eq!(set.routes.len(), 1);
        let chat = &set.routes[0];
        assert_eq!(chat.requests_per_window, 2);
        assert_eq!(chat.tokens_per_window, 6000);
        assert_eq!(chat.token_capacity(), 1000);
    }

    #[test]
    fn test_assemble_rules_rejects_bad_json() {
        let docs = vec![(
            "ratelimit:rule:/a:requests".to_string(),
            "not json".to_string(),
        )];
        assert!(matches!(assemble_rules(docs), Err(StoreError::Json(_))));
    }
}
