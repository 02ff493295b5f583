//! # Gateway Core
//!
//! Core types, traits, and error handling for the LLM Traffic Gateway.
//!
//! This crate provides the foundational types used throughout the gateway:
//! - Request, response and streaming chunk types
//! - Provider configuration
//! - Client identity resolution
//! - Collaborator traits (credentials, usage ledger)
//! - Per-call deadline and cancellation context
//! - Error types and handling

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod context;
pub mod credentials;
pub mod error;
pub mod identity;
pub mod provider;
pub mod request;
pub mod response;
pub mod streaming;
pub mod usage;

// Re-export commonly used types
pub use context::{new_request_id, CallContext};
pub use credentials::{CredentialSource, EnvCredentialSource, StaticCredentialSource};
pub use error::{GatewayError, GatewayResult};
pub use identity::{
    ClientId, ClientIdentityResolver, DefaultIdentityResolver, RequestCredentials, TokenVerifier,
    TrustedProxies,
};
pub use provider::{ProviderConfig, TransportKind};
pub use request::{
    ChatMessage, ChatRequest, CompletionRequest, ContentPart, MessageContent, MessageRole, Prompt,
};
pub use response::{
    ApiFlavor, ChatResponse, Choice, CompletionChoice, CompletionResponse, FinishReason,
    ModelObject, ModelsResponse, Usage,
};
pub use streaming::{ChatChunk, ChunkChoice, ChunkDelta, ChunkStream, CompletionChunk, StreamChunk};
pub use usage::{UsageEvent, UsageOutcome, UsageSink};
