//! Access checks run before a client stream is created

use std::collections::{HashMap, HashSet};

use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use thiserror::Error;

use crate::config::AuthConfig;

/// What a client asks to read
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Resource {
    /// The aggregate stream
    Firehose,
    /// One application's stream
    App(String),
}

/// Why access was refused
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
pub enum AuthError {
    /// No token was presented
    #[error("missing access token")]
    MissingToken,
    /// The token does not grant the resource
    #[error("access token not permitted for this stream")]
    Forbidden,
}

/// Decides whether an identity may read a resource
pub trait Authorizer: Send + Sync + 'static {
    /// Check access for `identity` (the presented token, if any)
    ///
    /// # Errors
    ///
    /// Returns the reason access is denied.
    fn authorize(&self, identity: Option<&str>, resource: &Resource) -> Result<(), AuthError>;
}

/// Grants everything
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn authorize(&self, _identity: Option<&str>, _resource: &Resource) -> Result<(), AuthError> {
        Ok(())
    }
}

/// Checks tokens against fixed grants
#[derive(Clone, Debug, Default)]
pub struct StaticTokenAuthorizer {
    admin_tokens: HashSet<String>,
    app_tokens: HashMap<String, HashSet<String>>,
}

impl StaticTokenAuthorizer {
    /// Build from configured grants
    #[must_use]
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            admin_tokens: config.admin_tokens.iter().cloned().collect(),
            app_tokens: config
                .app_tokens
                .iter()
                .map(|(token, apps)| (token.clone(), apps.iter().cloned().collect()))
                .collect(),
        }
    }
}

impl Authorizer for StaticTokenAuthorizer {
    fn authorize(&self, identity: Option<&str>, resource: &Resource) -> Result<(), AuthError> {
        let token = identity
            .filter(|token| !token.is_empty())
            .ok_or(AuthError::MissingToken)?;

        if self.admin_tokens.contains(token) {
            return Ok(());
        }

        match resource {
            Resource::Firehose => Err(AuthError::Forbidden),
            Resource::App(app_id) => self
                .app_tokens
                .get(token)
                .filter(|apps| apps.contains(app_id))
                .map(|_| ())
                .ok_or(AuthError::Forbidden),
        }
    }
}

/// Pull the token from `Authorization: bearer <token>` or the
/// `access_token` query parameter, in that order
#[must_use]
pub fn extract_token(headers: &HeaderMap, access_token: Option<&str>) -> Option<String> {
    let from_header = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| {
            let (scheme, token) = value.trim().split_once(' ')?;
            scheme
                .eq_ignore_ascii_case("bearer")
                .then(|| token.trim().to_string())
        });

    from_header.or_else(|| access_token.map(ToString::to_string))
}
