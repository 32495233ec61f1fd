//! Credential provider and refresh policy
//!
//! The refresh routine is shared by the periodic timer and the reconnect path.
//! An in-flight flag ensures at most one token request runs at a time; a
//! caller that loses the race gets `None` and keeps the current credential.

use super::{Credentials, IssuedToken, TokenIssuer};
use crate::auth_span;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Last token obtained from the issuer
#[derive(Clone, Default, PartialEq)]
pub struct CredentialState {
    pub token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl CredentialState {
    pub fn from_token(token: &IssuedToken) -> Self {
        Self {
            token: Some(token.access_token.clone()),
            expires_at: Some(token.expires_at),
        }
    }

    /// Empty token recorded after a failed issuance
    pub fn empty() -> Self {
        Self {
            token: Some(String::new()),
            expires_at: None,
        }
    }

    pub fn has_token(&self) -> bool {
        self.token.as_deref().is_some_and(|t| !t.is_empty())
    }
}

impl std::fmt::Debug for CredentialState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialState")
            .field("has_token", &self.has_token())
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Refresh policy: a token is due once `expires_at - now <= margin`.
///
/// A state without a usable token is always due.
pub fn needs_refresh(state: &CredentialState, now: DateTime<Utc>, margin: Duration) -> bool {
    if !state.has_token() {
        return true;
    }
    match state.expires_at {
        Some(expires_at) => {
            let margin = chrono::Duration::from_std(margin)
                .unwrap_or_else(|_| chrono::Duration::days(365));
            expires_at - now <= margin
        }
        None => false,
    }
}

enum CredentialMode {
    /// No credentials presented on connect
    Anonymous,
    /// Fixed username/password, never refreshed
    Static(Credentials),
    /// Short-lived token presented as password for `username`
    Issued {
        issuer: Arc<dyn TokenIssuer>,
        username: String,
    },
}

/// Owns the credential state used by the connection manager
pub struct CredentialProvider {
    mode: CredentialMode,
    state: RwLock<CredentialState>,
    refreshing: AtomicBool,
    margin: Duration,
}

/// Clears the in-flight flag when the refresh finishes or unwinds
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl CredentialProvider {
    pub fn anonymous() -> Self {
        Self::with_mode(CredentialMode::Anonymous, Duration::ZERO)
    }

    /// Static credentials; no refresh loop is ever started for these
    pub fn static_credentials(credentials: Credentials) -> Self {
        Self::with_mode(CredentialMode::Static(credentials), Duration::ZERO)
    }

    /// Token credentials obtained from `issuer`, refreshed `margin` before expiry
    pub fn issued<U: Into<String>>(
        issuer: Arc<dyn TokenIssuer>,
        username: U,
        margin: Duration,
    ) -> Self {
        Self::with_mode(
            CredentialMode::Issued {
                issuer,
                username: username.into(),
            },
            margin,
        )
    }

    fn with_mode(mode: CredentialMode, margin: Duration) -> Self {
        Self {
            mode,
            state: RwLock::new(CredentialState::default()),
            refreshing: AtomicBool::new(false),
            margin,
        }
    }

    /// Whether a refresh loop makes sense for this provider
    pub fn is_refreshable(&self) -> bool {
        matches!(self.mode, CredentialMode::Issued { .. })
    }

    pub fn refresh_margin(&self) -> Duration {
        self.margin
    }

    pub async fn state(&self) -> CredentialState {
        self.state.read().await.clone()
    }

    /// Request a token from the issuer and record it.
    ///
    /// Issuance failures are logged and produce an empty token rather than an
    /// error. Static and anonymous providers return an empty state untouched.
    pub async fn get_token(&self) -> CredentialState {
        let CredentialMode::Issued { issuer, .. } = &self.mode else {
            return CredentialState::default();
        };

        let issued = issuer
            .issue_token()
            .instrument(auth_span!(trigger = "initial"))
            .await;
        let state = match issued {
            Ok(token) => {
                info!(expires_at = %token.expires_at, "Obtained broker access token");
                CredentialState::from_token(&token)
            }
            Err(e) => {
                error!(
                    error = %crate::error::sanitize_error_message(&e.to_string()),
                    "Failed to obtain broker access token"
                );
                CredentialState::empty()
            }
        };

        *self.state.write().await = state.clone();
        state
    }

    /// Credentials for the current state, without contacting the issuer
    pub async fn credentials(&self) -> Option<Credentials> {
        match &self.mode {
            CredentialMode::Anonymous => None,
            CredentialMode::Static(credentials) => Some(credentials.clone()),
            CredentialMode::Issued { username, .. } => {
                let token = self.state.read().await.token.clone().unwrap_or_default();
                Some(Credentials::new(username.clone(), token))
            }
        }
    }

    /// Credentials for the first connection attempt.
    ///
    /// An empty token is logged and still returned; the broker rejects it and
    /// the failure enters the reconnect path.
    pub async fn initial_credentials(&self) -> Option<Credentials> {
        if self.is_refreshable() && !self.state.read().await.has_token() {
            let state = self.get_token().await;
            if !state.has_token() {
                error!("Connecting with an empty access token; the broker is expected to reject it");
            }
        }
        self.credentials().await
    }

    /// Refresh when the current token is within the refresh margin
    pub async fn refresh_if_needed(&self) -> Option<Credentials> {
        if !self.is_refreshable() {
            return None;
        }
        let due = needs_refresh(&*self.state.read().await, Utc::now(), self.margin);
        if !due {
            return None;
        }
        self.refresh().await
    }

    /// Refresh regardless of expiry; used on the reconnect path
    pub async fn force_refresh(&self) -> Option<Credentials> {
        if !self.is_refreshable() {
            return None;
        }
        self.refresh().await
    }

    async fn refresh(&self) -> Option<Credentials> {
        if self
            .refreshing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Credential refresh already in flight, skipping");
            return None;
        }
        let _guard = InFlightGuard(&self.refreshing);

        let CredentialMode::Issued { issuer, .. } = &self.mode else {
            return None;
        };

        let issued = issuer
            .issue_token()
            .instrument(auth_span!(trigger = "refresh"))
            .await;
        match issued {
            Ok(token) => {
                info!(expires_at = %token.expires_at, "Refreshed broker access token");
                *self.state.write().await = CredentialState::from_token(&token);
                self.credentials().await
            }
            Err(e) => {
                warn!(
                    error = %crate::error::sanitize_error_message(&e.to_string()),
                    "Credential refresh failed, keeping current token"
                );
                None
            }
        }
    }
}

/// Periodically refresh the token and hand fresh credentials to the
/// connection manager.
///
/// Returns `None` for providers that never refresh.
pub fn spawn_refresh_loop(
    provider: Arc<CredentialProvider>,
    interval: Duration,
    rotations: mpsc::Sender<Credentials>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Option<JoinHandle<()>> {
    if !provider.is_refreshable() {
        return None;
    }

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        debug!("Credential refresh loop stopping");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Some(credentials) = provider.refresh_if_needed().await {
                        if rotations.send(credentials).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }))
}
