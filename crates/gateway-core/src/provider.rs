//! Upstream provider description.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How the gateway talks to a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// OpenAI-compatible HTTP API
    #[default]
    Http,
    /// gRPC chat completion service
    Rpc,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http => write!(f, "http"),
            Self::Rpc => write!(f, "rpc"),
        }
    }
}

/// A configured upstream provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Unique provider name
    pub name: String,
    /// Base URL (`https://host:port`)
    pub base_address: String,
    /// Name of the secret holding the upstream credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_ref: Option<String>,
    /// Models this provider serves
    #[serde(default)]
    pub supported_models: Vec<String>,
    /// Transport used for calls
    #[serde(default)]
    pub transport_kind: TransportKind,
    /// Relative weight, reported only
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Live health flag maintained by the prober
    #[serde(default = "default_healthy")]
    pub is_healthy: bool,
    /// Last probe time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checked_at: Option<DateTime<Utc>>,
    /// Liveness endpoint; providers without one are never probed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe_address: Option<String>,
}

fn default_weight() -> u32 {
    1
}

fn default_healthy() -> bool {
    true
}

impl ProviderConfig {
    /// Create an HTTP provider serving the given models
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        base_address: impl Into<String>,
        supported_models: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            base_address: base_address.into(),
            credential_ref: None,
            supported_models,
            transport_kind: TransportKind::Http,
            weight: default_weight(),
            is_healthy: true,
            last_checked_at: None,
            probe_address: None,
        }
    }

    /// Whether the provider serves `model` (case-insensitive)
    #[must_use]
    pub fn supports(&self, model: &str) -> bool {
        self.supported_models
            .iter()
            .any(|m| m.eq_ignore_ascii_case(model))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supports_is_case_insensitive() {
        let provider = ProviderConfig::new("a", "http://a", vec!["GPT-4o".to_string()]);
        assert!(provider.supports("gpt-4o"));
        assert!(!provider.supports("gpt-4"));
    }

    #[test]
    fn test_deserialize_defaults() {
        let provider: ProviderConfig = serde_json::from_str(
            r#"{"name":"a","base_address":"http://a","supported_models":["m"]}"#,
        )
        .expect("parse");
        assert_eq!(provider.transport_kind, TransportKind::Http);
        assert_eq!(provider.weight, 1);
        assert!(provider.is_healthy);
        assert!(provider.probe_address.is_none());
    }
}
