//! Access token issuer client
//!
//! Requests tokens with the OAuth2 client-credentials grant from an
//! OpenID Connect realm endpoint.

use super::AuthError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Token returned by an issuer
#[derive(Clone, PartialEq)]
pub struct IssuedToken {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for IssuedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedToken")
            .field("access_token", &"***")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Source of access tokens
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    async fn issue_token(&self) -> Result<IssuedToken, AuthError>;
}

/// Connection settings for an OpenID Connect token endpoint
#[derive(Debug, Clone)]
pub struct OidcTokenIssuerConfig {
    /// Base URL of the identity server, e.g. `https://id.example.com`
    pub issuer_url: String,
    pub realm: String,
    pub client_id: String,
    pub client_secret: String,
    pub timeout: Duration,
}

impl OidcTokenIssuerConfig {
    pub fn token_url(&self) -> String {
        format!(
            "{}/realms/{}/protocol/openid-connect/token",
            self.issuer_url.trim_end_matches('/'),
            self.realm
        )
    }
}

// Upper bound keeps the expiry arithmetic in range
const MAX_TOKEN_LIFETIME_SECS: i64 = 365 * 24 * 3600;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

/// Client-credentials token issuer
pub struct OidcTokenIssuer {
    config: OidcTokenIssuerConfig,
    client: reqwest::Client,
}

impl OidcTokenIssuer {
    pub fn new(config: OidcTokenIssuerConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl TokenIssuer for OidcTokenIssuer {
    async fn issue_token(&self) -> Result<IssuedToken, AuthError> {
        let url = self.config.token_url();
        debug!(url = %url, client_id = %self.config.client_id, "Requesting access token");

        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
        ];

        let response = self
            .client
            .post(&url)
            .form(&form)
            .timeout(self.config.timeout)
            .send()
            .await
            .map_err(|e| AuthError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| AuthError::InvalidResponse(e.to_string()))?;

        if token.access_token.is_empty() {
            return Err(AuthError::InvalidResponse(
                "empty access_token".to_string(),
            ));
        }

        let lifetime = i64::try_from(token.expires_in)
            .unwrap_or(MAX_TOKEN_LIFETIME_SECS)
            .min(MAX_TOKEN_LIFETIME_SECS);
        Ok(IssuedToken {
            access_token: token.access_token,
            expires_at: Utc::now() + chrono::Duration::seconds(lifetime),
        })
    }
}
