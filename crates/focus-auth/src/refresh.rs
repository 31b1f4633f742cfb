//! Credential rotation.

use tracing::{info, warn};

use crate::credentials::{CredentialManager, CredentialPair, TokenClass};
use crate::directory::UserDirectory;
use crate::error::{AuthError, AuthResult, UnauthenticatedCause};

/// Exchange a refresh credential for a fresh access/refresh pair.
///
/// The presented credential must be a valid refresh credential whose
/// subject the directory still knows.
///
/// # Errors
///
/// - [`AuthError::Unauthenticated`] if the credential is missing, invalid,
///   expired, of the wrong class, or names an unknown identity
/// - [`AuthError::Directory`] if the directory lookup fails
/// - [`AuthError::Issue`] if signing the new pair fails
pub async fn rotate(
    credentials: &CredentialManager,
    users: &dyn UserDirectory,
    refresh_token: &str,
) -> AuthResult<CredentialPair> {
    if refresh_token.is_empty() {
        return Err(UnauthenticatedCause::Missing.into());
    }

    let claims = credentials.validate(refresh_token)?;
    if claims.token_type != TokenClass::Refresh {
        return Err(UnauthenticatedCause::WrongClass {
            expected: TokenClass::Refresh,
            actual: claims.token_type,
        }
        .into());
    }

    if !users.exists(&claims.sub).await? {
        warn!(identity = %claims.sub, "Refresh for unknown identity");
        return Err(UnauthenticatedCause::UnknownIdentity(claims.sub).into());
    }

    let pair = credentials
        .issue_pair(&claims.sub)
        .map_err(AuthError::Issue)?;
    info!(identity = %claims.sub, "Rotated credentials");
    Ok(pair)
}
