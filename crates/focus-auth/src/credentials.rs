//! Signed, time-bound credentials.
//!
//! Credentials are HS256 JWTs carrying `{sub, iat, exp, token_type}`. The
//! manager holds one process-wide secret and no mutable state, so it can be
//! shared freely across tasks.

use chrono::{DateTime, TimeZone, Utc};
use focus_protocol::Identity;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::debug;

use crate::error::CredentialError;

/// The only signing scheme issued or accepted.
pub const SIGNING_ALGORITHM: Algorithm = Algorithm::HS256;

/// Default access credential lifetime (15 minutes).
pub const DEFAULT_ACCESS_TTL: Duration = Duration::from_secs(900);

/// Default refresh credential lifetime (7 days).
pub const DEFAULT_REFRESH_TTL: Duration = Duration::from_secs(604_800);

/// Credential class. Determines the validity window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenClass {
    Access,
    Refresh,
}

impl fmt::Display for TokenClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenClass::Access => write!(f, "access"),
            TokenClass::Refresh => write!(f, "refresh"),
        }
    }
}

/// Claims carried by every credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject identity.
    pub sub: Identity,
    /// Issued at (Unix seconds).
    pub iat: i64,
    /// Expires at (Unix seconds). Always greater than `iat`.
    pub exp: i64,
    /// Credential class.
    pub token_type: TokenClass,
}

impl Claims {
    /// Expiry as a timestamp.
    #[must_use]
    pub fn expires_at(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.exp, 0)
            .single()
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// A freshly signed credential together with its claims.
#[derive(Debug, Clone)]
pub struct IssuedCredential {
    /// Encoded token.
    pub token: String,
    /// Claims that were signed.
    pub claims: Claims,
}

/// Access and refresh credentials issued together on login or refresh.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialPair {
    pub access_token: String,
    pub refresh_token: String,
    /// Access credential expiry.
    pub expires_at: DateTime<Utc>,
}

/// Issues and validates credentials.
pub struct CredentialManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl CredentialManager {
    /// Create a manager with the given secret and lifetimes.
    ///
    /// Lifetimes are truncated to whole seconds.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Config`] if the secret is empty or either
    /// lifetime is shorter than one second.
    pub fn new(
        secret: &[u8],
        access_ttl: Duration,
        refresh_ttl: Duration,
    ) -> Result<Self, CredentialError> {
        if secret.is_empty() {
            return Err(CredentialError::Config("secret must not be empty"));
        }
        if access_ttl.as_secs() == 0 || refresh_ttl.as_secs() == 0 {
            return Err(CredentialError::Config("lifetimes must be at least one second"));
        }

        let mut validation = Validation::new(SIGNING_ALGORITHM);
        validation.leeway = 0;
        validation.validate_exp = true;
        validation.validate_nbf = false;

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
            access_ttl: Duration::from_secs(access_ttl.as_secs()),
            refresh_ttl: Duration::from_secs(refresh_ttl.as_secs()),
        })
    }

    /// Issue an access credential.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Signing`] if signing fails.
    pub fn issue_access(&self, identity: &Identity) -> Result<IssuedCredential, CredentialError> {
        self.issue(identity, TokenClass::Access)
    }

    /// Issue a refresh credential.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Signing`] if signing fails.
    pub fn issue_refresh(&self, identity: &Identity) -> Result<IssuedCredential, CredentialError> {
        self.issue(identity, TokenClass::Refresh)
    }

    /// Issue an access and a refresh credential for the same identity.
    ///
    /// # Errors
    ///
    /// Returns [`CredentialError::Signing`] if signing fails.
    pub fn issue_pair(&self, identity: &Identity) -> Result<CredentialPair, CredentialError> {
        let access = self.issue_access(identity)?;
        let refresh = self.issue_refresh(identity)?;
        Ok(CredentialPair {
            expires_at: access.claims.expires_at(),
            access_token: access.token,
            refresh_token: refresh.token,
        })
    }

    /// Verify a token's signature, algorithm and expiry.
    ///
    /// Accepts both classes; callers that care check `token_type`.
    ///
    /// # Errors
    ///
    /// - [`CredentialError::Expired`] at or after the credential's expiry
    /// - [`CredentialError::InvalidCredential`] for anything else
    pub fn validate(&self, token: &str) -> Result<Claims, CredentialError> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => CredentialError::Expired,
                _ => CredentialError::InvalidCredential(e.to_string()),
            }
        })?;
        let claims = data.claims;

        // jsonwebtoken accepts exp == now; the credential is dead at its expiry instant.
        if claims.exp <= Utc::now().timestamp() {
            return Err(CredentialError::Expired);
        }
        if claims.sub.is_empty() {
            return Err(CredentialError::InvalidCredential("empty subject".into()));
        }
        if claims.exp <= claims.iat {
            return Err(CredentialError::InvalidCredential(
                "expiry not after issue time".into(),
            ));
        }

        Ok(claims)
    }

    /// Access credential lifetime.
    #[must_use]
    pub fn access_ttl(&self) -> Duration {
        self.access_ttl
    }

    /// Refresh credential lifetime.
    #[must_use]
    pub fn refresh_ttl(&self) -> Duration {
        self.refresh_ttl
    }

    /// Lifetime of the given class in whole seconds, for cookie `Max-Age`.
    #[must_use]
    pub fn ttl_secs(&self, class: TokenClass) -> i64 {
        let ttl = match class {
            TokenClass::Access => self.access_ttl,
            TokenClass::Refresh => self.refresh_ttl,
        };
        i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX)
    }

    fn issue(&self, identity: &Identity, class: TokenClass) -> Result<IssuedCredential, CredentialError> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: identity.clone(),
            iat: now,
            exp: now.saturating_add(self.ttl_secs(class)),
            token_type: class,
        };

        let token = encode(&Header::new(SIGNING_ALGORITHM), &claims, &self.encoding_key)
            .map_err(|e| CredentialError::Signing(e.to_string()))?;

        debug!(identity = %identity, class = %class, exp = claims.exp, "Issued credential");
        Ok(IssuedCredential { token, claims })
    }
}

impl fmt::Debug for CredentialManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialManager")
            .field("access_ttl", &self.access_ttl)
            .field("refresh_ttl", &self.refresh_ttl)
            .finish_non_exhaustive()
    }
}
