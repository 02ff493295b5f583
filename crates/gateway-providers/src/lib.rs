//! # Gateway Providers
//!
//! Upstream side of the LLM Traffic Gateway.
//!
//! This crate provides:
//! - The [`Transport`] trait with HTTP (OpenAI-compatible, SSE streaming)
//!   and gRPC implementations, chosen per provider at registration
//! - Translation between upstream bodies and gateway types
//! - The provider registry and model resolution
//! - The background health prober

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod health;
pub mod http;
pub mod proto;
pub mod registry;
pub mod rpc;
pub mod tls;
pub mod translate;
pub mod transport;

// Re-export main types
pub use health::HealthProber;
pub use http::HttpTransport;
pub use registry::{ProviderEntry, ProviderRegistry, ResolvedProvider};
pub use rpc::RpcTransport;
pub use tls::TlsMaterial;
pub use transport::{DefaultTransportFactory, Transport, TransportFactory};
