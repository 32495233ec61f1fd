//! Broker credential acquisition and refresh
//!
//! Broker sessions authenticate either with static credentials (a configured
//! username/password or a service account) or with a short-lived access token
//! obtained from an external issuer. Tokens are refreshed shortly before they
//! expire; the connection manager then rebuilds the session with the new
//! credential.

pub mod issuer;
pub mod provider;

pub use issuer::{IssuedToken, OidcTokenIssuer, OidcTokenIssuerConfig, TokenIssuer};
pub use provider::{needs_refresh, spawn_refresh_loop, CredentialProvider, CredentialState};

use thiserror::Error;

/// Username/password pair presented to the broker on connect
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new<U: Into<String>, P: Into<String>>(username: U, password: P) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn has_secret(&self) -> bool {
        !self.password.is_empty()
    }
}

// Never print the secret
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Token issuer errors
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    #[error("Token request failed: {0}")]
    Http(String),
    #[error("Token issuer returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Invalid token response: {0}")]
    InvalidResponse(String),
}
