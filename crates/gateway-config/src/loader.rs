//! File loading and environment overrides.

use crate::error::ConfigError;
use crate::model::GatewayConfig;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "GATEWAY_CONFIG";

/// Config file format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// YAML
    Yaml,
    /// TOML
    Toml,
    /// JSON
    Json,
}

impl ConfigFormat {
    /// Detect the format from a file extension
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        match ext.as_str() {
            "yaml" | "yml" => Ok(Self::Yaml),
            "toml" => Ok(Self::Toml),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::UnsupportedFormat(other.to_string())),
        }
    }
}

/// Parse configuration text without overrides or validation
pub fn parse_config(raw: &str, format: ConfigFormat) -> Result<GatewayConfig, ConfigError> {
    match format {
        ConfigFormat::Yaml => {
            serde_yaml::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))
        }
        ConfigFormat::Toml => toml::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string())),
        ConfigFormat::Json => {
            serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))
        }
    }
}

/// Load configuration.
///
/// The file is `path`, else `$GATEWAY_CONFIG`, else built-in defaults.
/// `GATEWAY_*` overrides are applied before validation.
pub async fn load_config(path: Option<&Path>) -> Result<GatewayConfig, ConfigError> {
    let path: Option<PathBuf> = path
        .map(Path::to_path_buf)
        .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));

    let mut config = match &path {
        Some(path) => {
            let raw = tokio::fs::read_to_string(path)
                .await
                .map_err(|source| ConfigError::Io {
                    path: path.clone(),
                    source,
                })?;
            let config = parse_config(&raw, ConfigFormat::from_path(path)?)?;
            info!(path = %path.display(), "Loaded configuration file");
            config
        }
        None => {
            debug!("No configuration file, using defaults");
            GatewayConfig::default()
        }
    };

    apply_env_overrides(&mut config, |var| std::env::var(var).ok())?;
    config.validate()?;
    Ok(config)
}

/// Apply `GATEWAY_*` overrides read through `lookup`
pub fn apply_env_overrides<F>(config: &mut GatewayConfig, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(host) = lookup("GATEWAY_HOST") {
        config.server.host = host;
    }
    if let Some(port) = lookup("GATEWAY_PORT") {
        config.server.port = parse_port("GATEWAY_PORT", &port)?;
    }
    if let Some(port) = lookup("GATEWAY_RPC_PORT") {
        config.server.rpc_port = if port.eq_ignore_ascii_case("off") {
            None
        } else {
            Some(parse_port("GATEWAY_RPC_PORT", &port)?)
        };
    }
    if let Some(url) = lookup("GATEWAY_REDIS_URL") {
        config.store.redis_url = (!url.is_empty()).then_some(url);
    }
    if let Some(level) = lookup("GATEWAY_LOG_LEVEL") {
        config.telemetry.log_level = level;
    }
    Ok(())
}

fn parse_port(var: &str, raw: &str) -> Result<u16, ConfigError> {
    raw.parse().map_err(|_| ConfigError::Env {
        var: var.to_string(),
        message: format!("{raw} is not a port number"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::UsageSinkKind;
    use gateway_core::TransportKind;
    use gateway_ratelimit::FailurePolicy;
    use std::collections::HashMap;
    use std::io::Write;
    use std::time::Duration;

    const YAML: &str = r#"
server:
  port: 9090
  request_timeout: 45s
rate_limit:
  failure_policy: fail_closed
  rules:
    - route: /v1/chat/completions
      requests_per_window: 2
      window_seconds: 60
resilience:
  retry:
    max_attempts: 5
    initial_delay: 50ms
usage:
  sink: http
  endpoint: http://ledger.internal/usage
providers:
  - name: primary
    base_address: https://api.example.com
    credential_ref: PRIMARY_KEY
    supported_models: [gpt-4o]
  - name: rpc-backend
    base_address: http://10.0.0.5:50051
    transport_kind: rpc
    supported_models: [llama-3]
"#;

    #[test]
    fn test_parse_yaml() {
        let config = parse_config(YAML, ConfigFormat::Yaml).expect("parse");
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.request_timeout, Duration::from_secs(45));
        assert_eq!(config.rate_limit.failure_policy, FailurePolicy::FailClosed);
        assert_eq!(config.rate_limit.rules[0].requests_per_window, 2);
        assert_eq!(config.resilience.retry.initial_delay, Duration::from_millis(50));
        assert_eq!(config.usage.sink, UsageSinkKind::Http);
        assert_eq!(config.providers[1].transport_kind, TransportKind::Rpc);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_toml() {
        let raw = r#"
[server]
port = 7000
stream_timeout = "3m"

[[providers]]
name = "primary"
base_address = "https://api.example.com"
supported_models = ["gpt-4o"]
"#;
        let config = parse_config(raw, ConfigFormat::Toml).expect("parse");
        assert_eq!(config.server.port, 7000);
        assert_eq!(config.server.stream_timeout, Duration::from_secs(180));
        assert_eq!(config.providers.len(), 1);
    }

    #[test]
    fn test_format_from_path() {
        assert_eq!(ConfigFormat::from_path(Path::new("a.yml")).ok(), Some(ConfigFormat::Yaml));
        assert_eq!(ConfigFormat::from_path(Path::new("a.TOML")).ok(), Some(ConfigFormat::Toml));
        assert!(ConfigFormat::from_path(Path::new("a.ini")).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("GATEWAY_HOST", "127.0.0.1"),
            ("GATEWAY_PORT", "9000"),
            ("GATEWAY_RPC_PORT", "off"),
            ("GATEWAY_REDIS_URL", "redis://cache:6379"),
            ("GATEWAY_LOG_LEVEL", "debug"),
        ]
        .into_iter()
        .collect();

        let mut config = GatewayConfig::default();
        apply_env_overrides(&mut config, |k| env.get(k).map(|v| (*v).to_string()))
            .expect("overrides");

        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.rpc_port, None);
        assert_eq!(config.store.redis_url.as_deref(), Some("redis://cache:6379"));
        assert_eq!(config.telemetry.log_level, "debug");
    }

    #[test]
    fn test_bad_port_override() {
        let mut config = GatewayConfig::default();
        let err = apply_env_overrides(&mut config, |k| {
            (k == "GATEWAY_PORT").then(|| "http".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::Env { .. }));
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .expect("tempfile");
        file.write_all(YAML.as_bytes()).expect("write");

        let config = load_config(Some(file.path())).await.expect("load");
        assert_eq!(config.providers.len(), 2);
    }

    #[tokio::test]
    async fn test_load_rejects_invalid_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .expect("tempfile");
        file.write_all(b"resilience:\n  retry:\n    max_attempts: 0\n")
            .expect("write");

        let err = load_config(Some(file.path())).await.unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let err = load_config(Some(Path::new("/nonexistent/gateway.yaml")))
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
