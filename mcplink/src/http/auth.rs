//! Bearer-token authorization hook for the HTTP server.
//!
//! The runtime doesn't validate tokens itself.  An [`Authorizer`] maps the request headers to a
//! [`Principal`] or refuses; refusals become `401` responses pointing the client at the
//! protected-resource metadata document.
use crate::session::Principal;
use axum::http::{header, HeaderMap};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Missing bearer token")]
    MissingToken,

    #[error("Invalid bearer token")]
    InvalidToken,
}

#[async_trait::async_trait]
pub trait Authorizer: Send + Sync + 'static {
    async fn authorize(&self, headers: &HeaderMap) -> Result<Principal, AuthError>;
}

/// Extract the token from an `Authorization: Bearer ...` header
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then(|| token.trim())
        .filter(|token| !token.is_empty())
}

/// Value of the `WWW-Authenticate` header sent with a `401`
pub fn challenge(resource_metadata_url: &str) -> String {
    format!("Bearer resource_metadata=\"{resource_metadata_url}\"")
}

/// Pull the metadata URL back out of a challenge, on the client side
pub fn resource_metadata_from_challenge(challenge: &str) -> Option<&str> {
    let (_, rest) = challenge.split_once("resource_metadata=\"")?;
    rest.split('"').next()
}

/// Body of the protected-resource metadata document
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProtectedResourceMetadata {
    pub resource: String,
    pub authorization_servers: Vec<String>,
}

/// Authorizer backed by a fixed table of tokens
#[derive(Clone, Debug, Default)]
pub struct StaticTokenAuthorizer {
    tokens: HashMap<String, Principal>,
}

impl StaticTokenAuthorizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, principal: Principal) -> Self {
        self.tokens.insert(token.into(), principal);
        self
    }
}

#[async_trait::async_trait]
impl Authorizer for StaticTokenAuthorizer {
    async fn authorize(&self, headers: &HeaderMap) -> Result<Principal, AuthError> {
        let token = bearer_token(headers).ok_or(AuthError::MissingToken)?;
        self.tokens
            .get(token)
            .cloned()
            .ok_or(AuthError::InvalidToken)
    }
}
