//! Mutual TLS material for upstream channels.

use gateway_core::{GatewayError, GatewayResult};
use std::path::Path;
use tonic::transport::{Certificate, ClientTlsConfig, Identity};
use tracing::info;

/// PEM trust anchor plus optional client identity
#[derive(Clone)]
pub struct TlsMaterial {
    ca_pem: Vec<u8>,
    identity: Option<(Vec<u8>, Vec<u8>)>,
    domain_name: Option<String>,
}

impl std::fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("mutual", &self.identity.is_some())
            .field("domain_name", &self.domain_name)
            .finish_non_exhaustive()
    }
}

impl TlsMaterial {
    /// Build from in-memory PEM
    #[must_use]
    pub fn from_pem(
        ca_pem: Vec<u8>,
        identity: Option<(Vec<u8>, Vec<u8>)>,
        domain_name: Option<String>,
    ) -> Self {
        Self {
            ca_pem,
            identity,
            domain_name,
        }
    }

    /// Read PEM files
    ///
    /// # Errors
    /// Returns `GatewayError::Configuration` if a file cannot be read
    pub async fn load(
        ca_path: &Path,
        cert_path: Option<&Path>,
        key_path: Option<&Path>,
        domain_name: Option<String>,
    ) -> GatewayResult<Self> {
        let ca_pem = read_pem(ca_path).await?;
        let identity = match (cert_path, key_path) {
            (Some(cert), Some(key)) => Some((read_pem(cert).await?, read_pem(key).await?)),
            (None, None) => None,
            _ => {
                return Err(GatewayError::configuration(
                    "client certificate and key must be configured together",
                ))
            }
        };
        info!(
            ca = %ca_path.display(),
            mutual = identity.is_some(),
            "Loaded upstream TLS material"
        );
        Ok(Self::from_pem(ca_pem, identity, domain_name))
    }

    /// Whether a client identity is presented
    #[must_use]
    pub fn is_mutual(&self) -> bool {
        self.identity.is_some()
    }

    /// Configure an HTTP client builder
    ///
    /// # Errors
    /// Returns `GatewayError::Configuration` for unparseable PEM
    pub fn apply_http(
        &self,
        mut builder: reqwest::ClientBuilder,
    ) -> GatewayResult<reqwest::ClientBuilder> {
        let ca = reqwest::Certificate::from_pem(&self.ca_pem)
            .map_err(|e| GatewayError::configuration(format!("invalid CA certificate: {e}")))?;
        builder = builder.use_rustls_tls().add_root_certificate(ca);

        if let Some((cert, key)) = &self.identity {
            // reqwest takes certificate and key as one PEM bundle
            let mut bundle = cert.clone();
            bundle.push(b'\n');
            bundle.extend_from_slice(key);
            let identity = reqwest::Identity::from_pem(&bundle)
                .map_err(|e| GatewayError::configuration(format!("invalid client identity: {e}")))?;
            builder = builder.identity(identity);
        }
        Ok(builder)
    }

    /// TLS settings for a gRPC channel
    #[must_use]
    pub fn rpc_config(&self) -> ClientTlsConfig {
        let mut config = ClientTlsConfig::new().ca_certificate(Certificate::from_pem(&self.ca_pem));
        if let Some((cert, key)) = &self.identity {
            config = config.identity(Identity::from_pem(cert, key));
        }
        if let Some(domain) = &self.domain_name {
            config = config.domain_name(domain.clone());
        }
        config
    }
}

async fn read_pem(path: &Path) -> GatewayResult<Vec<u8>> {
    tokio::fs::read(path).await.map_err(|e| {
        GatewayError::configuration(format!("failed to read {}: {e}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_file_is_configuration_error() {
        let err = TlsMaterial::load(Path::new("/nonexistent/ca.pem"), None, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Configuration { .. }));
    }

    #[tokio::test]
    async fn test_half_identity_rejected() {
        let dir = std::env::temp_dir();
        let ca = dir.join(format!("gateway-ca-{}.pem", uuid::Uuid::new_v4()));
        tokio::fs::write(&ca, b"-----BEGIN CERTIFICATE-----\n").await.expect("write");

        let err = TlsMaterial::load(&ca, Some(ca.as_path()), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Configuration { .. }));
        let _ = tokio::fs::remove_file(&ca).await;
    }

    #[test]
    fn test_mutual_flag() {
        let one_way = TlsMaterial::from_pem(b"ca".to_vec(), None, None);
        assert!(!one_way.is_mutual());

        let mutual = TlsMaterial::from_pem(
            b"ca".to_vec(),
            Some((b"cert".to_vec(), b"key".to_vec())),
            Some("upstream.internal".to_string()),
        );
        assert!(mutual.is_mutual());
        assert!(format!("{mutual:?}").contains("upstream.internal"));
    }
}
