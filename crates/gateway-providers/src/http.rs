//! OpenAI-compatible HTTP transport.
//!
//! Unary calls POST to `{base}/v1/chat/completions`; streaming calls use the
//! same path with `stream: true` and read server-sent events until `[DONE]`.

use crate::translate::{parse_chat_response, parse_chunk, status_error, UpstreamRequest};
use crate::transport::Transport;
use async_stream::try_stream;
use async_trait::async_trait;
use futures_util::StreamExt;
use gateway_core::{
    ChatRequest, ChatResponse, ChunkStream, CredentialSource, GatewayError, GatewayResult,
    ProviderConfig, StreamChunk, TransportKind,
};
use reqwest::{Client, RequestBuilder};
use reqwest_eventsource::{retry::Never, Event, EventSource};
use secrecy::ExposeSecret;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Header carrying the gateway request id upstream
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// HTTP transport for one provider
pub struct HttpTransport {
    provider: String,
    endpoint: String,
    credential_ref: Option<String>,
    client: Client,
    credentials: Arc<dyn CredentialSource>,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("provider", &self.provider)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl HttpTransport {
    /// Create a transport for `config`
    #[must_use]
    pub fn new(
        config: &ProviderConfig,
        client: Client,
        credentials: Arc<dyn CredentialSource>,
    ) -> Self {
        Self {
            provider: config.name.clone(),
            endpoint: completions_url(&config.base_address),
            credential_ref: config.credential_ref.clone(),
            client,
            credentials,
        }
    }

    /// Chat completions URL
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn request_builder(
        &self,
        request_id: &str,
        body: &UpstreamRequest<'_>,
    ) -> GatewayResult<RequestBuilder> {
        let mut builder = self
            .client
            .post(&self.endpoint)
            .header(REQUEST_ID_HEADER, request_id)
            .json(body);

        if let Some(credential_ref) = &self.credential_ref {
            let secret = self.credentials.get_credential(credential_ref).await?;
            builder = builder.bearer_auth(secret.expose_secret());
        }
        Ok(builder)
    }

    fn send_error(&self, err: &reqwest::Error) -> GatewayError {
        GatewayError::transport(
            &self.provider,
            format!("request failed: {err}"),
            err.status().map(|s| s.as_u16()),
            true,
        )
    }

    async fn stream_setup_error(&self, err: reqwest_eventsource::Error) -> GatewayError {
        use reqwest_eventsource::Error as SseError;
        match err {
            SseError::InvalidStatusCode(status, response) => {
                let body = response.text().await.unwrap_or_default();
                status_error(&self.provider, status.as_u16(), &body)
            }
            SseError::InvalidContentType(content_type, _) => GatewayError::upstream_protocol(
                &self.provider,
                format!("unexpected content type {content_type:?}"),
            ),
            SseError::Transport(e) => self.send_error(&e),
            other => GatewayError::transport(
                &self.provider,
                format!("stream setup failed: {other}"),
                None,
                true,
            ),
        }
    }
}

/// `{base}/v1/chat/completions`, tolerating a base that already ends in `/v1`
fn completions_url(base: &str) -> String {
    let base = base.trim_end_matches('/');
    if base.ends_with("/v1") {
        format!("{base}/chat/completions")
    } else {
        format!("{base}/v1/chat/completions")
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn complete(
        &self,
        request_id: &str,
        request: &ChatRequest,
    ) -> GatewayResult<ChatResponse> {
        let body = UpstreamRequest::from_chat(request, false);
        debug!(
            provider = %self.provider,
            request_id = %request_id,
            model = %request.model,
            "Sending upstream request"
        );

        let response = self
            .request_builder(request_id, &body)
            .await?
            .send()
            .await
            .map_err(|e| self.send_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(&self.provider, status.as_u16(), &body));
        }

        let bytes = response.bytes().await.map_err(|e| self.send_error(&e))?;
        parse_chat_response(&self.provider, &bytes, request)
    }

    async fn stream(&self, request_id: &str, request: &ChatRequest) -> GatewayResult<ChunkStream> {
        let body = UpstreamRequest::from_chat(request, true);
        let builder = self.request_builder(request_id, &body).await?;

        let mut es = EventSource::new(builder).map_err(|e| {
            GatewayError::internal(format!("Failed to create event source: {e}"))
        })?;
        es.set_retry_policy(Box::new(Never));

        // Wait for the upstream to accept the call
        match es.next().await {
            Some(Ok(Event::Open)) => {
                trace!(provider = %self.provider, "Upstream stream opened");
            }
            Some(Ok(Event::Message(_))) => {
                es.close();
                return Err(GatewayError::upstream_protocol(
                    &self.provider,
                    "event received before stream opened",
                ));
            }
            Some(Err(err)) => {
                es.close();
                return Err(self.stream_setup_error(err).await);
            }
            None => {
                return Err(GatewayError::transport(
                    &self.provider,
                    "stream closed during setup",
                    None,
                    true,
                ));
            }
        }

        let provider = self.provider.clone();
        let request_id = request_id.to_string();

        let stream = try_stream! {
            let mut index: u64 = 0;
            let mut finished = false;

            while let Some(event) = es.next().await {
                match event {
                    Ok(Event::Open) => {}
                    Ok(Event::Message(msg)) => {
                        let data = msg.data.trim();
                        if data == "[DONE]" {
                            finished = true;
                            break;
                        }

                        let piece = parse_chunk(&provider, data)?;
                        finished |= piece.finish_reason.is_some();
                        if piece.is_empty() {
                            continue;
                        }

                        yield StreamChunk {
                            request_id: request_id.clone(),
                            index,
                            text: piece.text,
                            is_final: false,
                            tokens_used_so_far: piece.total_tokens.unwrap_or(0),
                            finish_reason: piece.finish_reason,
                        };
                        index += 1;
                    }
                    Err(reqwest_eventsource::Error::StreamEnded) => break,
                    Err(e) => {
                        warn!(provider = %provider, error = %e, "Upstream stream interrupted");
                        Err(GatewayError::transport(
                            &provider,
                            format!("stream interrupted: {e}"),
                            None,
                            false,
                        ))?;
                    }
                }
            }

            es.close();

            if !finished {
                debug!(
                    provider = %provider,
                    chunks = index,
                    "Upstream stream closed without finishing"
                );
                Err(GatewayError::upstream_protocol(
                    &provider,
                    "stream ended without [DONE] or a finish reason",
                ))?;
            }
        };

        Ok(Box::pin(stream))
    }
}
