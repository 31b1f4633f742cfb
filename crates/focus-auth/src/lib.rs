//! # focus-auth
//!
//! Credentials and the session gate for the focus realtime hub.
//!
//! - **CredentialManager** - issues and validates signed access/refresh credentials
//! - **SessionGate** - authenticates a request before it is upgraded
//! - **rotate** - exchanges a refresh credential for a new pair
//! - **UserDirectory** - seam to the external user store

pub mod credentials;
pub mod directory;
pub mod error;
pub mod gate;
pub mod refresh;

pub use credentials::{
    Claims, CredentialManager, CredentialPair, IssuedCredential, TokenClass, DEFAULT_ACCESS_TTL,
    DEFAULT_REFRESH_TTL,
};
pub use directory::{MemoryUserDirectory, UserDirectory};
pub use error::{AuthError, AuthResult, CredentialError, UnauthenticatedCause};
pub use gate::{SessionGate, DEFAULT_ACCESS_COOKIE};
pub use refresh::rotate;
