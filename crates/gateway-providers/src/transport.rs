//! Transport abstraction.
//!
//! A transport performs exactly one upstream attempt. Retries, breakers and
//! deadlines are applied by the caller.

use crate::http::HttpTransport;
use crate::rpc::RpcTransport;
use crate::tls::TlsMaterial;
use async_trait::async_trait;
use gateway_core::{
    ChatRequest, ChatResponse, ChunkStream, CredentialSource, GatewayError, GatewayResult,
    ProviderConfig, TransportKind,
};
use std::sync::Arc;
use std::time::Duration;

/// One upstream call
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport kind
    fn kind(&self) -> TransportKind;

    /// Unary completion
    async fn complete(&self, request_id: &str, request: &ChatRequest)
        -> GatewayResult<ChatResponse>;

    /// Open a stream.
    ///
    /// Returns once the upstream has accepted the call, so setup failures
    /// surface here and can be retried. The stream yields content chunks
    /// only; it ends without a terminal chunk.
    async fn stream(&self, request_id: &str, request: &ChatRequest) -> GatewayResult<ChunkStream>;
}

/// Builds the transport for a provider at registration
pub trait TransportFactory: Send + Sync {
    /// Build a transport for `config`
    ///
    /// # Errors
    /// Returns error if the address or TLS material is unusable
    fn build(&self, config: &ProviderConfig) -> GatewayResult<Arc<dyn Transport>>;
}

/// Factory for the HTTP and RPC transports
#[derive(Clone)]
pub struct DefaultTransportFactory {
    http: reqwest::Client,
    credentials: Arc<dyn CredentialSource>,
    tls: Option<TlsMaterial>,
    connect_timeout: Duration,
}

impl std::fmt::Debug for DefaultTransportFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefaultTransportFactory")
            .field("tls", &self.tls)
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

impl DefaultTransportFactory {
    /// Create a factory sharing one HTTP connection pool
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be created
    pub fn new(
        credentials: Arc<dyn CredentialSource>,
        tls: Option<TlsMaterial>,
    ) -> GatewayResult<Self> {
        let connect_timeout = Duration::from_secs(10);
        let mut builder = reqwest::Client::builder()
            .pool_max_idle_per_host(100)
            .connect_timeout(connect_timeout)
            .tcp_nodelay(true);
        if let Some(tls) = &tls {
            builder = tls.apply_http(builder)?;
        }
        let http = builder
            .build()
            .map_err(|e| {
                GatewayError::configuration(format!("Failed to create HTTP client: {e}"))
            })?;

        Ok(Self {
            http,
            credentials,
            tls,
            connect_timeout,
        })
    }

    /// Shared HTTP client, also used for health probes
    #[must_use]
    pub fn http_client(&self) -> reqwest::Client {
        self.http.clone()
    }
}

impl TransportFactory for DefaultTransportFactory {
    fn build(&self, config: &ProviderConfig) -> GatewayResult<Arc<dyn Transport>> {
        match config.transport_kind {
            TransportKind::Http => Ok(Arc::new(HttpTransport::new(
                config,
                self.http.clone(),
                Arc::clone(&self.credentials),
            ))),
            TransportKind::Rpc => Ok(Arc::new(RpcTransport::connect_lazy(
                config,
                self.tls.as_ref(),
                self.connect_timeout,
                Arc::clone(&self.credentials),
            )?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_core::StaticCredentialSource;

    #[tokio::test]
    async fn test_factory_picks_transport_by_kind() {
        let factory =
            DefaultTransportFactory::new(Arc::new(StaticCredentialSource::new()), None)
                .expect("factory");

        let http = ProviderConfig::new("a", "http://localhost:1", vec!["m".to_string()]);
        assert_eq!(factory.build(&http).expect("http").kind(), TransportKind::Http);

        let mut rpc = ProviderConfig::new("b", "http://localhost:2", vec!["m".to_string()]);
        rpc.transport_kind = TransportKind::Rpc;
        assert_eq!(factory.build(&rpc).expect("rpc").kind(), TransportKind::Rpc);
    }

    #[tokio::test]
    async fn test_bad_rpc_address_rejected() {
        let factory =
            DefaultTransportFactory::new(Arc::new(StaticCredentialSource::new()), None)
                .expect("factory");
        let mut rpc = ProviderConfig::new("b", "not a uri", vec!["m".to_string()]);
        rpc.transport_kind = TransportKind::Rpc;
        assert!(factory.build(&rpc).is_err());
    }
}
