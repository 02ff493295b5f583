//! Client identity resolution.
//!
//! A [`ClientId`] keys every admission counter. Precedence is API key, then
//! the subject of a verified bearer token, then the source address. Forwarded
//! headers only count when they come from a trusted proxy.

use crate::error::{GatewayError, GatewayResult};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;

/// Stable client key: `key:<api key>`, `user:<subject>` or `ip:<address>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    /// Client identified by API key
    #[must_use]
    pub fn api_key(key: &str) -> Self {
        Self(format!("key:{key}"))
    }

    /// Client identified by token subject
    #[must_use]
    pub fn user(subject: &str) -> Self {
        Self(format!("user:{subject}"))
    }

    /// Client identified by source address
    #[must_use]
    pub fn ip(address: &str) -> Self {
        Self(format!("ip:{address}"))
    }

    /// String form
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Credential material extracted from an inbound request
#[derive(Debug, Clone, Default)]
pub struct RequestCredentials {
    /// `X-API-Key` header
    pub api_key: Option<String>,
    /// `Authorization: Bearer` token
    pub bearer_token: Option<String>,
    /// `X-Forwarded-For` header
    pub forwarded_for: Option<String>,
    /// `X-Real-IP` header
    pub real_ip: Option<String>,
    /// Socket peer address
    pub peer_addr: Option<IpAddr>,
}

impl RequestCredentials {
    /// Source address as seen through `proxies`.
    ///
    /// Forwarded headers are only read when the socket peer is a trusted
    /// proxy; otherwise the peer itself is the source.
    #[must_use]
    pub fn source_address(&self, proxies: &TrustedProxies) -> Option<IpAddr> {
        let peer = self.peer_addr?;
        if !proxies.is_trusted(peer) {
            return Some(peer);
        }

        if let Some(forwarded) = self.forwarded_for.as_deref() {
            let hops: Vec<IpAddr> = forwarded
                .split(',')
                .filter_map(|hop| hop.trim().parse().ok())
                .collect();
            // Rightmost hop not added by one of our proxies.
            if let Some(client) = hops.iter().rev().find(|ip| !proxies.is_trusted(**ip)) {
                return Some(*client);
            }
            if let Some(first) = hops.first() {
                return Some(*first);
            }
        }

        self.real_ip
            .as_deref()
            .and_then(|v| v.trim().parse().ok())
            .or(Some(peer))
    }
}

/// Proxies allowed to set `X-Forwarded-For` and `X-Real-IP`
#[derive(Debug, Clone, Default)]
pub struct TrustedProxies {
    networks: Vec<IpNetwork>,
}

impl TrustedProxies {
    /// Trust nobody; the socket peer is always the source
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Parse addresses or CIDR networks
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> GatewayResult<Self> {
        let networks = entries
            .iter()
            .map(|entry| parse_network(entry.as_ref()))
            .collect::<GatewayResult<Vec<_>>>()?;
        Ok(Self { networks })
    }

    /// Whether `ip` belongs to a trusted proxy
    #[must_use]
    pub fn is_trusted(&self, ip: IpAddr) -> bool {
        self.networks.iter().any(|network| network.contains(ip))
    }

    /// Number of configured networks
    #[must_use]
    pub fn len(&self) -> usize {
        self.networks.len()
    }

    /// True when no proxy is trusted
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }
}

fn parse_network(entry: &str) -> GatewayResult<IpNetwork> {
    let entry = entry.trim();
    if let Ok(network) = entry.parse::<IpNetwork>() {
        return Ok(network);
    }
    entry
        .parse::<IpAddr>()
        .map(IpNetwork::from)
        .map_err(|_| GatewayError::configuration(format!("invalid trusted proxy: {entry}")))
}

/// Verifies bearer tokens and extracts their subject
pub trait TokenVerifier: Send + Sync {
    /// Subject of a valid token, `None` when the token does not verify
    fn subject(&self, token: &str) -> Option<String>;
}

/// Maps request credentials to a [`ClientId`]
pub trait ClientIdentityResolver: Send + Sync {
    /// Resolve the client key
    fn resolve(&self, credentials: &RequestCredentials) -> ClientId;
}

/// Default resolver: API key > verified token subject > opaque bearer key > address
#[derive(Clone, Default)]
pub struct DefaultIdentityResolver {
    verifier: Option<Arc<dyn TokenVerifier>>,
    proxies: TrustedProxies,
}

impl DefaultIdentityResolver {
    /// Create a resolver without token verification
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Verify bearer tokens with the given verifier
    #[must_use]
    pub fn with_verifier(mut self, verifier: Arc<dyn TokenVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Honour forwarded headers from these proxies
    #[must_use]
    pub fn with_trusted_proxies(mut self, proxies: TrustedProxies) -> Self {
        self.proxies = proxies;
        self
    }
}

impl std::fmt::Debug for DefaultIdentityResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefaultIdentityResolver")
            .field("verifier", &self.verifier.is_some())
            .field("trusted_proxies", &self.proxies.len())
            .finish()
    }
}

fn looks_like_jwt(token: &str) -> bool {
    token.split('.').count() == 3
}

impl ClientIdentityResolver for DefaultIdentityResolver {
    fn resolve(&self, credentials: &RequestCredentials) -> ClientId {
        if let Some(key) = credentials
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
        {
            return ClientId::api_key(key);
        }

        if let Some(token) = credentials
            .bearer_token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
        {
            if let Some(subject) = self.verifier.as_ref().and_then(|v| v.subject(token)) {
                return ClientId::user(&subject);
            }
            // Opaque bearer tokens are API keys.
            if !looks_like_jwt(token) {
                return ClientId::api_key(token);
            }
        }

        credentials
            .source_address(&self.proxies)
            .map_or_else(|| ClientId::ip("unknown"), |addr| ClientId::ip(&addr.to_string()))
    }
}
