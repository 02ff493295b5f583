//! Custom Axum extractors for the gateway.

use async_trait::async_trait;
use axum::{
    extract::{ConnectInfo, FromRequestParts, Request},
    http::{header, request::Parts, HeaderMap},
};
use gateway_core::{new_request_id, RequestCredentials};
use serde::de::DeserializeOwned;
use std::net::SocketAddr;
use tracing::debug;

use crate::error::ApiError;

/// Request id header, read from clients and forwarded upstream
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Extract request ID from headers or generate one
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for RequestId
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let id = parts
            .headers
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map_or_else(new_request_id, String::from);

        Ok(Self(id))
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
}

/// Bearer token from an `Authorization` header value
pub fn bearer_token(value: &str) -> Option<&str> {
    value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Credential material used to resolve the client key
#[derive(Debug, Clone)]
pub struct ClientCredentials(pub RequestCredentials);

#[async_trait]
impl<S> FromRequestParts<S> for ClientCredentials
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let headers = &parts.headers;
        let bearer = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(bearer_token)
            .map(String::from);

        Ok(Self(RequestCredentials {
            api_key: header_str(headers, "x-api-key"),
            bearer_token: bearer,
            forwarded_for: header_str(headers, "x-forwarded-for"),
            real_ip: header_str(headers, "x-real-ip"),
            peer_addr: parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip()),
        }))
    }
}

/// JSON body extractor with better error handling
#[derive(Debug)]
pub struct JsonBody<T>(pub T);

#[async_trait]
impl<S, T> axum::extract::FromRequest<S> for JsonBody<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let bytes = axum::body::Bytes::from_request(req, state)
            .await
            .map_err(|e| ApiError::bad_request(format!("Failed to read request body: {e}")))?;

        let value: T = serde_json::from_slice(&bytes).map_err(|e| {
            debug!(error = %e, "JSON parse error");
            ApiError::bad_request(format!("Invalid JSON: {e}"))
        })?;

        Ok(Self(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use gateway_core::TrustedProxies;

    fn parts(builder: axum::http::request::Builder) -> Parts {
        builder.body(()).expect("valid request").into_parts().0
    }

    #[tokio::test]
    async fn test_request_id_from_header_or_generated() {
        let mut with = parts(Request::builder().header("x-request-id", "abc"));
        let RequestId(id) = RequestId::from_request_parts(&mut with, &()).await.expect("id");
        assert_eq!(id, "abc");

        let mut without = parts(Request::builder());
        let RequestId(id) = RequestId::from_request_parts(&mut without, &())
            .await
            .expect("id");
        assert!(id.starts_with("req-"));
    }

    #[tokio::test]
    async fn test_credentials_extraction() {
        let mut p = parts(
            Request::builder()
                .header("authorization", "Bearer sk-123")
                .header("x-forwarded-for", "203.0.113.7, 10.0.0.1"),
        );
        p.extensions
            .insert(ConnectInfo(SocketAddr::from(([10, 0, 0, 2], 4000))));

        let ClientCredentials(creds) = ClientCredentials::from_request_parts(&mut p, &())
            .await
            .expect("credentials");
        assert_eq!(creds.bearer_token.as_deref(), Some("sk-123"));
        assert_eq!(creds.api_key, None);
        let proxies = TrustedProxies::parse(&["10.0.0.0/8"]).expect("proxies");
        assert_eq!(
            creds.source_address(&proxies),
            Some("203.0.113.7".parse().expect("ip"))
        );
        assert_eq!(
            creds.source_address(&TrustedProxies::none()),
            Some("10.0.0.2".parse().expect("ip"))
        );
        assert_eq!(creds.peer_addr, Some("10.0.0.2".parse().expect("ip")));
    }

    #[test]
    fn test_bearer_token_parsing() {
        assert_eq!(bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(bearer_token("Bearer "), None);
        assert_eq!(bearer_token("Basic abc"), None);
    }
}
