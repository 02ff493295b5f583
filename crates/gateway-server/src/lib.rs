//! # Gateway Server
//!
//! HTTP and gRPC front end for the LLM Traffic Gateway.
//!
//! This crate provides:
//! - OpenAI-compatible chat and completion endpoints with SSE streaming
//! - Admin API for providers and circuit breakers
//! - The `llmgateway.v1.ChatCompletion` gRPC service
//! - JWT subject verification and admin token guard
//! - Graceful shutdown handling

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod admin;
pub mod auth;
pub mod error;
pub mod extractors;
pub mod handlers;
pub mod middleware;
pub mod pipeline;
pub mod routes;
pub mod rpc;
pub mod server;
pub mod state;

// Re-export main types
pub use auth::JwtSubjectVerifier;
pub use error::ApiError;
pub use routes::create_router;
pub use rpc::ChatCompletionServer;
pub use server::{shutdown_signal, Server, ServerConfig, ServerError};
pub use state::{AppState, AppStateBuilder};
