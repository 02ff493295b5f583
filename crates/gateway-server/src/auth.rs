//! Authentication.
//!
//! - **JWT subjects**: bearer tokens verified with a shared secret (HS256) or
//!   an RSA public key (RS256); the `sub` claim keys the client
//! - **Admin token**: optional static bearer token guarding the admin API

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
};
use gateway_config::{JwtAlgorithm, JwtSection};
use gateway_core::{CredentialSource, GatewayError, GatewayResult, TokenVerifier};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use secrecy::ExposeSecret;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::{error::ApiError, extractors::bearer_token, state::AppState};

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
}

/// Verifies bearer JWTs and yields their subject
pub struct JwtSubjectVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl std::fmt::Debug for JwtSubjectVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtSubjectVerifier")
            .field("algorithms", &self.validation.algorithms)
            .finish_non_exhaustive()
    }
}

impl JwtSubjectVerifier {
    /// Create a verifier from key material.
    ///
    /// `key` is the shared secret for HS256 or a PEM public key for RS256.
    ///
    /// # Errors
    /// `Configuration` if the RSA key does not parse
    pub fn new(
        algorithm: JwtAlgorithm,
        key: &str,
        issuer: Option<&str>,
        audience: Option<&str>,
    ) -> GatewayResult<Self> {
        let (key, algorithm) = match algorithm {
            JwtAlgorithm::Hs256 => (DecodingKey::from_secret(key.as_bytes()), Algorithm::HS256),
            JwtAlgorithm::Rs256 => (
                DecodingKey::from_rsa_pem(key.as_bytes()).map_err(|e| {
                    GatewayError::configuration(format!("Invalid RSA public key: {e}"))
                })?,
                Algorithm::RS256,
            ),
        };

        let mut validation = Validation::new(algorithm);
        validation.set_required_spec_claims(&["exp", "sub"]);
        if let Some(issuer) = issuer {
            validation.set_issuer(&[issuer]);
        }
        match audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }

        Ok(Self { key, validation })
    }

    /// Build from configuration, resolving the key through `credentials`
    ///
    /// # Errors
    /// Returns error if the key cannot be resolved or parsed
    pub async fn from_config(
        section: &JwtSection,
        credentials: &dyn CredentialSource,
    ) -> GatewayResult<Self> {
        let key = credentials.get_credential(&section.key_ref).await?;
        Self::new(
            section.algorithm,
            key.expose_secret(),
            section.issuer.as_deref(),
            section.audience.as_deref(),
        )
    }
}

impl TokenVerifier for JwtSubjectVerifier {
    fn subject(&self, token: &str) -> Option<String> {
        match decode::<Claims>(token, &self.key, &self.validation) {
            Ok(data) => Some(data.claims.sub).filter(|s| !s.is_empty()),
            Err(e) => {
                debug!(error = %e, "JWT validation failed");
                None
            }
        }
    }
}

/// Reject admin calls without the configured bearer token
pub async fn admin_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let Some(expected) = &state.admin_token else {
        return next.run(request).await;
    };

    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token);

    match presented {
        Some(token) if token == expected.expose_secret() => next.run(request).await,
        Some(_) => {
            warn!(path = %request.uri().path(), "Rejected admin call with wrong token");
            ApiError::unauthorized("invalid admin token").into_response()
        }
        None => ApiError::unauthorized("admin token required").into_response(),
    }
}
