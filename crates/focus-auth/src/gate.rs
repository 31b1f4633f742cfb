//! Session gate.
//!
//! Runs once, synchronously, before a connection is upgraded. A credential
//! that expires while its connection is open does not end the connection.

use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum_extra::extract::CookieJar;
use focus_protocol::Identity;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::credentials::{CredentialManager, TokenClass};
use crate::error::{AuthError, AuthResult, UnauthenticatedCause};

/// Cookie that carries the access credential unless configured otherwise.
pub const DEFAULT_ACCESS_COOKIE: &str = "access_token";

const BEARER_PREFIX: &str = "Bearer ";

/// Authenticates inbound requests from their access credential.
#[derive(Debug, Clone)]
pub struct SessionGate {
    credentials: Arc<CredentialManager>,
    access_cookie: String,
}

impl SessionGate {
    /// Create a gate reading the default access cookie.
    #[must_use]
    pub fn new(credentials: Arc<CredentialManager>) -> Self {
        Self::with_cookie(credentials, DEFAULT_ACCESS_COOKIE)
    }

    /// Create a gate reading the given access cookie.
    #[must_use]
    pub fn with_cookie(credentials: Arc<CredentialManager>, access_cookie: impl Into<String>) -> Self {
        Self {
            credentials,
            access_cookie: access_cookie.into(),
        }
    }

    /// The credential manager behind this gate.
    #[must_use]
    pub fn credentials(&self) -> &Arc<CredentialManager> {
        &self.credentials
    }

    /// Authenticate a request from its headers.
    ///
    /// The access cookie wins over an `Authorization: Bearer` header.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Unauthenticated`] when the credential is missing,
    /// empty, invalid, expired, or not an access credential.
    pub fn authenticate(&self, headers: &HeaderMap) -> AuthResult<Identity> {
        let token = self.extract_credential(headers).ok_or_else(|| {
            debug!("No access credential on request");
            AuthError::Unauthenticated(UnauthenticatedCause::Missing)
        })?;
        self.authenticate_token(&token)
    }

    /// Authenticate a bare access token.
    ///
    /// # Errors
    ///
    /// Same as [`SessionGate::authenticate`].
    pub fn authenticate_token(&self, token: &str) -> AuthResult<Identity> {
        if token.is_empty() {
            return Err(UnauthenticatedCause::Missing.into());
        }

        let claims = self.credentials.validate(token).map_err(|e| {
            warn!(error = %e, "Credential validation failed");
            AuthError::from(e)
        })?;

        if claims.token_type != TokenClass::Access {
            warn!(identity = %claims.sub, class = %claims.token_type, "Non-access credential at gate");
            return Err(UnauthenticatedCause::WrongClass {
                expected: TokenClass::Access,
                actual: claims.token_type,
            }
            .into());
        }

        debug!(identity = %claims.sub, "Credential validated");
        Ok(claims.sub)
    }

    /// Pull the access credential out of a request, cookie first.
    #[must_use]
    pub fn extract_credential(&self, headers: &HeaderMap) -> Option<String> {
        let jar = CookieJar::from_headers(headers);
        if let Some(cookie) = jar.get(&self.access_cookie) {
            if !cookie.value().is_empty() {
                return Some(cookie.value().to_string());
            }
        }

        headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix(BEARER_PREFIX))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(str::to_string)
    }
}
