//! Authentication errors.

use focus_protocol::Identity;
use thiserror::Error;

use crate::credentials::TokenClass;

/// Errors produced by the credential manager.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// Bad signature, wrong algorithm, or malformed token.
    #[error("invalid credential: {0}")]
    InvalidCredential(String),

    /// The credential's expiry has passed.
    #[error("credential expired")]
    Expired,

    /// Signing a new credential failed.
    #[error("failed to sign credential: {0}")]
    Signing(String),

    /// The manager was configured with unusable parameters.
    #[error("invalid credential configuration: {0}")]
    Config(&'static str),
}

/// Why a request was rejected as unauthenticated. Logged, never shown to clients.
#[derive(Debug, Error)]
pub enum UnauthenticatedCause {
    /// No credential in cookie or header, or an empty one.
    #[error("no credential presented")]
    Missing,

    /// A valid credential of the wrong class.
    #[error("expected {expected} credential, got {actual}")]
    WrongClass {
        /// Class the endpoint accepts.
        expected: TokenClass,
        /// Class that was presented.
        actual: TokenClass,
    },

    /// The credential failed validation.
    #[error(transparent)]
    Credential(#[from] CredentialError),

    /// The credential names a user the directory does not know.
    #[error("unknown identity {0}")]
    UnknownIdentity(Identity),
}

/// Errors surfaced by the session gate and refresh flow.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The request carries no usable credential.
    #[error("unauthenticated: {0}")]
    Unauthenticated(#[from] UnauthenticatedCause),

    /// The user directory could not answer.
    #[error("user directory error: {0}")]
    Directory(String),

    /// Issuing a replacement credential failed.
    #[error(transparent)]
    Issue(CredentialError),
}

impl AuthError {
    /// Whether this error should be reported to the client as 401.
    #[must_use]
    pub fn is_unauthenticated(&self) -> bool {
        matches!(self, AuthError::Unauthenticated(_))
    }
}

impl From<CredentialError> for AuthError {
    fn from(err: CredentialError) -> Self {
        AuthError::Unauthenticated(UnauthenticatedCause::Credential(err))
    }
}

/// Result type for auth operations.
pub type AuthResult<T> = Result<T, AuthError>;
