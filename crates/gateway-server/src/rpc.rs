//! Inbound gRPC service `llmgateway.v1.ChatCompletion`.
//!
//! Same pipeline as the HTTP surface. Streamed calls end with one chunk
//! whose `is_final` is set; a mid-stream failure ends the stream with an
//! error status instead.

use futures::StreamExt;
use gateway_core::{new_request_id, ApiFlavor, GatewayError, RequestCredentials};
use gateway_providers::proto::{
    self, COMPLETE_PATH, SERVICE_NAME, STREAM_COMPLETE_PATH,
};
use std::task::{Context, Poll};
use tonic::body::BoxBody;
use tonic::codec::ProstCodec;
use tonic::codegen::{empty_body, Body, BoxFuture, BoxStream, StdError};
use tonic::metadata::{AsciiMetadataValue, MetadataMap};
use tonic::{Code, Status};
use tracing::debug;

use crate::{
    extractors::bearer_token,
    pipeline::{self, PipelineOutcome},
    state::AppState,
};

/// Map a gateway error to a gRPC status
#[must_use]
pub fn to_status(err: &GatewayError) -> Status {
    let code = match err {
        GatewayError::RateLimitExceeded { .. } => Code::ResourceExhausted,
        GatewayError::UnsupportedModel { .. } | GatewayError::Validation { .. } => {
            Code::InvalidArgument
        }
        GatewayError::ProviderUnavailable { .. }
        | GatewayError::CircuitOpen { .. }
        | GatewayError::Transport { .. }
        | GatewayError::Store { .. } => Code::Unavailable,
        GatewayError::UpstreamProtocol { .. } => Code::DataLoss,
        GatewayError::Cancelled { .. } => Code::Cancelled,
        GatewayError::DeadlineExceeded { .. } => Code::DeadlineExceeded,
        GatewayError::Unauthorized { .. } => Code::Unauthenticated,
        GatewayError::NotFound { .. } => Code::NotFound,
        GatewayError::Conflict { .. } => Code::AlreadyExists,
        GatewayError::Configuration { .. } | GatewayError::Internal { .. } => Code::Internal,
    };

    let mut status = Status::new(code, err.client_message());
    if let Some(secs) = err.retry_after() {
        if let Ok(value) = AsciiMetadataValue::try_from(secs.to_string()) {
            status.metadata_mut().insert("retry-after", value);
        }
    }
    status
}

fn metadata_str(metadata: &MetadataMap, key: &str) -> Option<String> {
    metadata
        .get(key)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
}

fn credentials<T>(request: &tonic::Request<T>) -> RequestCredentials {
    let metadata = request.metadata();
    RequestCredentials {
        api_key: metadata_str(metadata, "x-api-key"),
        bearer_token: metadata_str(metadata, "authorization")
            .as_deref()
            .and_then(bearer_token)
            .map(String::from),
        forwarded_for: metadata_str(metadata, "x-forwarded-for"),
        real_ip: metadata_str(metadata, "x-real-ip"),
        peer_addr: request.remote_addr().map(|addr| addr.ip()),
    }
}

/// Unpack a request; the wire `stream` flag is ignored in favour of the
/// method called
fn prepare(
    request: tonic::Request<proto::CompletionRequest>,
    stream: bool,
) -> (String, RequestCredentials, gateway_core::ChatRequest) {
    let credentials = credentials(&request);
    let message = request.into_inner();
    let request_id = if message.request_id.trim().is_empty() {
        new_request_id()
    } else {
        message.request_id.clone()
    };
    let mut chat = message.into_chat();
    chat.stream = stream;
    (request_id, credentials, chat)
}

async fn complete(
    state: AppState,
    request: tonic::Request<proto::CompletionRequest>,
) -> Result<tonic::Response<proto::CompletionResponse>, Status> {
    let (request_id, credentials, chat) = prepare(request, false);
    let outcome = pipeline::execute(
        &state,
        ApiFlavor::Chat.route(),
        request_id.clone(),
        &credentials,
        chat,
    )
    .await
    .map_err(|e| to_status(&e))?;

    match outcome {
        PipelineOutcome::Complete { response, .. } => Ok(tonic::Response::new(
            proto::CompletionResponse::from_chat(&request_id, &response),
        )),
        PipelineOutcome::Stream { .. } => Err(Status::internal("unexpected stream")),
    }
}

type ChunkResponseStream = BoxStream<proto::CompletionChunk>;

async fn stream_complete(
    state: AppState,
    request: tonic::Request<proto::CompletionRequest>,
) -> Result<tonic::Response<ChunkResponseStream>, Status> {
    let (request_id, credentials, chat) = prepare(request, true);
    let outcome = pipeline::execute(
        &state,
        ApiFlavor::Chat.route(),
        request_id,
        &credentials,
        chat,
    )
    .await
    .map_err(|e| to_status(&e))?;

    match outcome {
        PipelineOutcome::Stream { stream, .. } => {
            let chunks = stream.map(|item| {
                item.map(|chunk| proto::CompletionChunk::from_stream_chunk(&chunk))
                    .map_err(|e| to_status(&e))
            });
            Ok(tonic::Response::new(Box::pin(chunks) as ChunkResponseStream))
        }
        PipelineOutcome::Complete { .. } => Err(Status::internal("unexpected unary response")),
    }
}

/// Tower service for the gRPC surface; mount with
/// `tonic::transport::Server::add_service`
#[derive(Debug, Clone)]
pub struct ChatCompletionServer {
    state: AppState,
}

impl ChatCompletionServer {
    /// Create the service
    #[must_use]
    pub fn new(state: AppState) -> Self {
        Self { state }
    }
}

struct CompleteSvc(AppState);

impl tonic::server::UnaryService<proto::CompletionRequest> for CompleteSvc {
    type Response = proto::CompletionResponse;
    type Future = BoxFuture<tonic::Response<Self::Response>, Status>;

    fn call(&mut self, request: tonic::Request<proto::CompletionRequest>) -> Self::Future {
        let state = self.0.clone();
        Box::pin(complete(state, request))
    }
}

struct StreamCompleteSvc(AppState);

impl tonic::server::ServerStreamingService<proto::CompletionRequest> for StreamCompleteSvc {
    type Response = proto::CompletionChunk;
    type ResponseStream = ChunkResponseStream;
    type Future = BoxFuture<tonic::Response<Self::ResponseStream>, Status>;

    fn call(&mut self, request: tonic::Request<proto::CompletionRequest>) -> Self::Future {
        let state = self.0.clone();
        Box::pin(stream_complete(state, request))
    }
}

impl<B> tonic::codegen::Service<http::Request<B>> for ChatCompletionServer
where
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = http::Response<BoxBody>;
    type Error = std::convert::Infallible;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        let state = self.state.clone();
        match req.uri().path() {
            COMPLETE_PATH => Box::pin(async move {
                let codec: ProstCodec<proto::CompletionResponse, proto::CompletionRequest> =
                    ProstCodec::default();
                let mut grpc = tonic::server::Grpc::new(codec);
                Ok(grpc.unary(CompleteSvc(state), req).await)
            }),
            STREAM_COMPLETE_PATH => Box::pin(async move {
                let codec: ProstCodec<proto::CompletionChunk, proto::CompletionRequest> =
                    ProstCodec::default();
                let mut grpc = tonic::server::Grpc::new(codec);
                Ok(grpc.server_streaming(StreamCompleteSvc(state), req).await)
            }),
            path => {
                debug!(path, "Unknown gRPC method");
                Box::pin(async move {
                    let mut response = http::Response::new(empty_body());
                    let headers = response.headers_mut();
                    headers.insert(
                        Status::GRPC_STATUS,
                        (Code::Unimplemented as i32).into(),
                    );
                    headers.insert(
                        http::header::CONTENT_TYPE,
                        tonic::metadata::GRPC_CONTENT_TYPE,
                    );
                    Ok(response)
                })
            }
        }
    }
}

impl tonic::server::NamedService for ChatCompletionServer {
    const NAME: &'static str = SERVICE_NAME;
}
