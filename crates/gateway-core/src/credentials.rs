//! Upstream credential lookup.

use crate::error::{GatewayError, GatewayResult};
use async_trait::async_trait;
use secrecy::SecretString;
use std::collections::HashMap;

/// Resolves a provider's `credential_ref` to the secret sent upstream
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Look up a credential
    ///
    /// # Errors
    /// Returns `GatewayError::Configuration` when the reference is unknown
    async fn get_credential(&self, credential_ref: &str) -> GatewayResult<SecretString>;
}

/// Reads credentials from environment variables named by the reference
#[derive(Debug, Clone, Default)]
pub struct EnvCredentialSource {
    prefix: Option<String>,
}

impl EnvCredentialSource {
    /// Create a source reading `credential_ref` verbatim
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepend `prefix` to every variable name
    #[must_use]
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: Some(prefix.into()),
        }
    }

    fn var_name(&self, credential_ref: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}{credential_ref}"),
            None => credential_ref.to_string(),
        }
    }
}

#[async_trait]
impl CredentialSource for EnvCredentialSource {
    async fn get_credential(&self, credential_ref: &str) -> GatewayResult<SecretString> {
        let name = self.var_name(credential_ref);
        std::env::var(&name)
            .map(SecretString::new)
            .map_err(|_| GatewayError::configuration(format!("credential '{name}' is not set")))
    }
}

/// Fixed credential table
#[derive(Debug, Clone, Default)]
pub struct StaticCredentialSource {
    secrets: HashMap<String, String>,
}

impl StaticCredentialSource {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a credential
    #[must_use]
    pub fn with(mut self, credential_ref: impl Into<String>, secret: impl Into<String>) -> Self {
        self.secrets.insert(credential_ref.into(), secret.into());
        self
    }
}

#[async_trait]
impl CredentialSource for StaticCredentialSource {
    async fn get_credential(&self, credential_ref: &str) -> GatewayResult<SecretString> {
        self.secrets
            .get(credential_ref)
            .cloned()
            .map(SecretString::new)
            .ok_or_else(|| {
                GatewayError::configuration(format!("credential '{credential_ref}' is not set"))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[tokio::test]
    async fn test_static_source() {
        let source = StaticCredentialSource::new().with("openai", "sk-1");
        let secret = source.get_credential("openai").await.expect("present");
        assert_eq!(secret.expose_secret(), "sk-1");
        assert!(source.get_credential("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_env_source_missing_variable() {
        let source = EnvCredentialSource::with_prefix("GATEWAY_TEST_UNSET_");
        let err = source.get_credential("NOPE").await.expect_err("unset");
        assert!(matches!(err, GatewayError::Configuration { .. }));
    }
}
