//! gRPC transport for `llmgateway.v1.ChatCompletion` backends.

use crate::proto::{self, COMPLETE_PATH, STREAM_COMPLETE_PATH};
use crate::tls::TlsMaterial;
use crate::transport::Transport;
use async_stream::try_stream;
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use gateway_core::{
    ChatRequest, ChatResponse, ChunkStream, CredentialSource, GatewayError, GatewayResult,
    ProviderConfig, TransportKind,
};
use secrecy::ExposeSecret;
use std::sync::Arc;
use std::time::Duration;
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::metadata::AsciiMetadataValue;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Status};
use tracing::debug;

/// gRPC transport for one provider
pub struct RpcTransport {
    provider: String,
    channel: Channel,
    credential_ref: Option<String>,
    credentials: Arc<dyn CredentialSource>,
}

impl std::fmt::Debug for RpcTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcTransport")
            .field("provider", &self.provider)
            .finish_non_exhaustive()
    }
}

impl RpcTransport {
    /// Create a transport whose channel connects on first use
    ///
    /// # Errors
    /// Returns `GatewayError::Configuration` for an invalid address or TLS
    /// settings
    pub fn connect_lazy(
        config: &ProviderConfig,
        tls: Option<&TlsMaterial>,
        connect_timeout: Duration,
        credentials: Arc<dyn CredentialSource>,
    ) -> GatewayResult<Self> {
        let address = config
            .base_address
            .replacen("grpc://", "http://", 1)
            .replacen("grpcs://", "https://", 1);

        let mut endpoint = Endpoint::from_shared(address).map_err(|e| {
            GatewayError::configuration(format!(
                "invalid RPC address for provider {}: {e}",
                config.name
            ))
        })?;
        endpoint = endpoint
            .connect_timeout(connect_timeout)
            .tcp_nodelay(true)
            .http2_keep_alive_interval(Duration::from_secs(30));

        if let Some(tls) = tls {
            endpoint = endpoint.tls_config(tls.rpc_config()).map_err(|e| {
                GatewayError::configuration(format!(
                    "invalid TLS settings for provider {}: {e}",
                    config.name
                ))
            })?;
        }

        Ok(Self {
            provider: config.name.clone(),
            channel: endpoint.connect_lazy(),
            credential_ref: config.credential_ref.clone(),
            credentials,
        })
    }

    async fn request<T>(&self, message: T) -> GatewayResult<tonic::Request<T>> {
        let mut request = tonic::Request::new(message);
        if let Some(credential_ref) = &self.credential_ref {
            let secret = self.credentials.get_credential(credential_ref).await?;
            let value: AsciiMetadataValue = format!("Bearer {}", secret.expose_secret())
                .parse()
                .map_err(|_| {
                    GatewayError::configuration(format!(
                        "credential for provider {} is not valid metadata",
                        self.provider
                    ))
                })?;
            request.metadata_mut().insert("authorization", value);
        }
        Ok(request)
    }

    async fn ready_client(&self) -> GatewayResult<tonic::client::Grpc<Channel>> {
        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready().await.map_err(|e| {
            GatewayError::transport(
                &self.provider,
                format!("channel not ready: {e}"),
                None,
                true,
            )
        })?;
        Ok(grpc)
    }
}

/// Map an upstream gRPC status to a gateway error
#[must_use]
pub fn status_to_error(provider: &str, status: &Status) -> GatewayError {
    let message = format!("{:?}: {}", status.code(), status.message());
    match status.code() {
        Code::Unavailable
        | Code::DeadlineExceeded
        | Code::ResourceExhausted
        | Code::Aborted
        | Code::Internal
        | Code::Unknown => GatewayError::transport(provider, message, None, true),
        Code::InvalidArgument | Code::OutOfRange | Code::FailedPrecondition => {
            GatewayError::transport(provider, message, Some(400), false)
        }
        Code::Unauthenticated => GatewayError::transport(provider, message, Some(401), false),
        Code::PermissionDenied => GatewayError::transport(provider, message, Some(403), false),
        Code::NotFound => GatewayError::transport(provider, message, Some(404), false),
        Code::Unimplemented => GatewayError::transport(provider, message, Some(501), false),
        Code::DataLoss => GatewayError::upstream_protocol(provider, message),
        Code::Cancelled | Code::AlreadyExists | Code::Ok => {
            GatewayError::transport(provider, message, None, false)
        }
    }
}

#[async_trait]
impl Transport for RpcTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Rpc
    }

    async fn complete(
        &self,
        request_id: &str,
        request: &ChatRequest,
    ) -> GatewayResult<ChatResponse> {
        debug!(provider = %self.provider, request_id = %request_id, "Sending RPC request");
        let message = proto::CompletionRequest::from_chat(request_id, request, false);
        let request_msg = self.request(message).await?;

        let mut grpc = self.ready_client().await?;
        let codec: ProstCodec<proto::CompletionRequest, proto::CompletionResponse> =
            ProstCodec::default();
        let response = grpc
            .unary(request_msg, PathAndQuery::from_static(COMPLETE_PATH), codec)
            .await
            .map_err(|status| status_to_error(&self.provider, &status))?;

        Ok(response.into_inner().into_chat(&request.model))
    }

    async fn stream(&self, request_id: &str, request: &ChatRequest) -> GatewayResult<ChunkStream> {
        let message = proto::CompletionRequest::from_chat(request_id, request, true);
        let request_msg = self.request(message).await?;

        let mut grpc = self.ready_client().await?;
        let codec: ProstCodec<proto::CompletionRequest, proto::CompletionChunk> =
            ProstCodec::default();
        let streaming = grpc
            .server_streaming(
                request_msg,
                PathAndQuery::from_static(STREAM_COMPLETE_PATH),
                codec,
            )
            .await
            .map_err(|status| status_to_error(&self.provider, &status))?
            .into_inner();

        Ok(upstream_chunks(
            self.provider.clone(),
            request_id.to_string(),
            streaming,
        ))
    }
}

/// Relay upstream chunks, failing a stream that closes before its final chunk
fn upstream_chunks<S>(provider: String, request_id: String, upstream: S) -> ChunkStream
where
    S: Stream<Item = Result<proto::CompletionChunk, Status>> + Send + 'static,
{
    let stream = try_stream! {
        let mut upstream = Box::pin(upstream);
        let mut finished = false;
        let mut count: u64 = 0;

        while let Some(item) = upstream.next().await {
            let wire = item.map_err(|status| status_to_error(&provider, &status))?;
            let last = wire.is_final;

            // The relay emits the terminal chunk itself
            let mut chunk = wire.into_stream_chunk();
            finished |= last || chunk.finish_reason.is_some();
            chunk.is_final = false;
            chunk.request_id.clone_from(&request_id);
            count += 1;
            yield chunk;

            if last {
                break;
            }
        }

        if !finished {
            debug!(
                provider = %provider,
                chunks = count,
                "Upstream stream closed without finishing"
            );
            Err(GatewayError::upstream_protocol(
                &provider,
                "stream ended without a final chunk",
            ))?;
        }
    };

    Box::pin(stream)
}
