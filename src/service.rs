//! Dispatcher bootstrap
//!
//! [`DispatchService`] wires the pieces together: credentials, the broker
//! connection, the subscription registry fed by providers, the dispatcher
//! task and the publisher.

use crate::auth::{CredentialProvider, Credentials, OidcTokenIssuer, OidcTokenIssuerConfig};
use crate::config::{ConfigError, DispatcherConfig};
use crate::dispatch::{Dispatcher, StructuredTopics};
use crate::error::DispatchResult;
use crate::events::NotificationBus;
use crate::publish::Publisher;
use crate::registry::{
    EntryInfo, RegistrySettings, SubscribeSummary, SubscriptionDescriptor, SubscriptionProvider,
    SubscriptionRegistry,
};
use crate::transport::mqtt::{FatalHook, ReconnectPolicy};
use crate::transport::{BrokerTransport, ConnectionState, MqttConnectionManager};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

/// Pick the credential source described by `config`.
///
/// Service account variables take precedence over token issuance; without an
/// `[auth]` section the static broker variables are used, or no credentials.
pub fn credential_provider_from_config(
    config: &DispatcherConfig,
) -> Result<CredentialProvider, ConfigError> {
    let Some(auth) = &config.auth else {
        return Ok(match config.get_broker_username() {
            Some(username) => {
                let password = config.get_broker_password().unwrap_or_default();
                CredentialProvider::static_credentials(Credentials::new(username, password))
            }
            None => CredentialProvider::anonymous(),
        });
    };

    if let Some((username, password)) = auth.service_account() {
        info!(username = %username, "Using service account credentials");
        return Ok(CredentialProvider::static_credentials(Credentials::new(
            username, password,
        )));
    }

    let (Some(issuer_url), Some(realm), Some(client_id)) =
        (&auth.issuer_url, &auth.realm, &auth.client_id)
    else {
        return Err(ConfigError::InvalidConfig(
            "service account variables are unset and no token issuer is configured".to_string(),
        ));
    };

    let issuer = OidcTokenIssuer::new(OidcTokenIssuerConfig {
        issuer_url: issuer_url.clone(),
        realm: realm.clone(),
        client_id: client_id.clone(),
        client_secret: auth.client_secret()?,
        timeout: auth.request_timeout(),
    });
    info!(client_id = %client_id, realm = %realm, "Using issued access tokens");
    Ok(CredentialProvider::issued(
        Arc::new(issuer),
        client_id.clone(),
        auth.refresh_margin(),
    ))
}

/// Running dispatcher
pub struct DispatchService {
    connection: Arc<MqttConnectionManager>,
    registry: Arc<SubscriptionRegistry>,
    publisher: Publisher,
    dispatcher_task: Mutex<Option<JoinHandle<()>>>,
}

impl DispatchService {
    /// Start with the default fatal hook, which exits the process
    pub async fn start(
        config: DispatcherConfig,
        providers: Vec<Arc<dyn SubscriptionProvider>>,
    ) -> DispatchResult<Self> {
        Self::start_with_hook(config, providers, FatalHook::process_exit()).await
    }

    /// Validate `config`, register every provider's subscriptions, connect
    /// and subscribe.
    pub async fn start_with_hook(
        config: DispatcherConfig,
        providers: Vec<Arc<dyn SubscriptionProvider>>,
        fatal: FatalHook,
    ) -> DispatchResult<Self> {
        config.validate()?;

        let credentials = Arc::new(credential_provider_from_config(&config)?);
        let refresh_interval = config
            .auth
            .as_ref()
            .map(|auth| auth.refresh_interval())
            .unwrap_or(DEFAULT_REFRESH_INTERVAL);

        let registry = Arc::new(SubscriptionRegistry::new(RegistrySettings::from_config(
            &config,
        )));
        let registered = registry.discover(&providers).await?;

        let structured = StructuredTopics::new(&config.dispatcher.structured_topics)?;
        let (inbound_tx, inbound_rx) = mpsc::channel(config.broker.channel_capacity);
        let dispatcher = Arc::new(Dispatcher::new(registry.clone(), structured));
        let dispatcher_task = dispatcher.spawn(inbound_rx);

        let connection = Arc::new(MqttConnectionManager::new(
            config.broker.clone(),
            ReconnectPolicy::from_config(&config),
            credentials,
            refresh_interval,
            inbound_tx,
            fatal,
        ));

        if let Err(e) = connection.connect().await {
            connection.shutdown().await;
            dispatcher_task.abort();
            return Err(e.into());
        }

        let summary = registry.subscribe_all(connection.as_ref()).await;
        info!(
            client_id = %connection.client_id(),
            entries = registered,
            wire_topics = summary.subscribed.len(),
            "Dispatcher started"
        );

        let publisher = Publisher::new(
            connection.clone(),
            NotificationBus::default(),
            config.is_test_mode(),
        );

        Ok(Self {
            connection,
            registry,
            publisher,
            dispatcher_task: Mutex::new(Some(dispatcher_task)),
        })
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    pub fn notifications(&self) -> &NotificationBus {
        self.publisher.notifications()
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.connection_state()
    }

    pub async fn registry_snapshot(&self) -> Vec<EntryInfo> {
        self.registry.snapshot().await
    }

    /// Register a descriptor after startup and subscribe its new wire topics
    pub async fn register(&self, descriptor: SubscriptionDescriptor) -> DispatchResult<SubscribeSummary> {
        self.registry.register(descriptor).await?;
        Ok(self.registry.subscribe_all(self.connection.as_ref()).await)
    }

    /// Unsubscribe everything, close the session and stop dispatching.
    ///
    /// Handler invocations already running are left to finish.
    pub async fn shutdown(&self) {
        let unsubscribed = self.registry.shutdown(self.connection.as_ref()).await;
        self.connection.shutdown().await;

        if let Some(task) = self.dispatcher_task.lock().await.take() {
            if tokio::time::timeout(Duration::from_secs(2), task).await.is_err() {
                warn!("Dispatcher task did not stop within timeout");
            }
        }
        info!(unsubscribed = unsubscribed, "Dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthSection;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn auth_section() -> AuthSection {
        AuthSection {
            issuer_url: Some("https://id.example.com".to_string()),
            realm: Some("fleet".to_string()),
            client_id: Some("dispatcher".to_string()),
            client_secret_env: Some("TOPIC_DISPATCH_TEST_SERVICE_SECRET".to_string()),
            service_username_env: None,
            service_password_env: None,
            refresh_interval_secs: 10,
            refresh_margin_secs: 60,
            request_timeout_ms: 5000,
        }
    }

    #[test]
    fn test_no_auth_no_env_is_anonymous() {
        let config = DispatcherConfig::test_config();
        let provider = credential_provider_from_config(&config).unwrap();
        assert!(!provider.is_refreshable());
    }

    #[tokio::test]
    async fn test_broker_env_credentials_are_static() {
        std::env::set_var("TOPIC_DISPATCH_TEST_BROKER_USER", "svc");
        std::env::set_var("TOPIC_DISPATCH_TEST_BROKER_PASS", "pw");
        let mut config = DispatcherConfig::test_config();
        config.broker.username_env = Some("TOPIC_DISPATCH_TEST_BROKER_USER".to_string());
        config.broker.password_env = Some("TOPIC_DISPATCH_TEST_BROKER_PASS".to_string());

        let provider = credential_provider_from_config(&config).unwrap();

        assert_eq!(provider.credentials().await, Some(Credentials::new("svc", "pw")));
    }

    #[tokio::test]
    async fn test_service_account_bypasses_issuer() {
        std::env::set_var("TOPIC_DISPATCH_TEST_SA_USER", "robot");
        std::env::set_var("TOPIC_DISPATCH_TEST_SA_PASS", "secret");
        let mut config = DispatcherConfig::test_config();
        config.auth = Some(AuthSection {
            service_username_env: Some("TOPIC_DISPATCH_TEST_SA_USER".to_string()),
            service_password_env: Some("TOPIC_DISPATCH_TEST_SA_PASS".to_string()),
            ..auth_section()
        });

        let provider = credential_provider_from_config(&config).unwrap();

        assert!(!provider.is_refreshable());
        assert_eq!(
            provider.credentials().await,
            Some(Credentials::new("robot", "secret"))
        );
    }

    #[test]
    fn test_issuer_requires_client_secret() {
        std::env::remove_var("TOPIC_DISPATCH_TEST_MISSING_SECRET");
        let mut config = DispatcherConfig::test_config();
        config.auth = Some(AuthSection {
            client_secret_env: Some("TOPIC_DISPATCH_TEST_MISSING_SECRET".to_string()),
            ..auth_section()
        });

        assert!(matches!(
            credential_provider_from_config(&config),
            Err(ConfigError::EnvVarNotFound(_))
        ));
    }

    #[test]
    fn test_issuer_provider_is_refreshable() {
        std::env::set_var("TOPIC_DISPATCH_TEST_SERVICE_SECRET", "s3cret");
        let mut config = DispatcherConfig::test_config();
        config.auth = Some(auth_section());

        let provider = credential_provider_from_config(&config).unwrap();

        assert!(provider.is_refreshable());
        assert_eq!(provider.refresh_margin(), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_start_fails_and_fires_fatal_hook_once_when_broker_unreachable() {
        let mut config = DispatcherConfig::test_config();
        config.broker.url = "mqtt://127.0.0.1:1".to_string();
        config.reconnect.max_retries = 1;
        config.reconnect.delay_ms = 10;
        let fatal_calls = Arc::new(AtomicUsize::new(0));
        let counter = fatal_calls.clone();

        let result = DispatchService::start_with_hook(
            config,
            Vec::new(),
            FatalHook::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(fatal_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let mut config = DispatcherConfig::test_config();
        config.broker.url = "http://localhost".to_string();

        let result = DispatchService::start_with_hook(
            config,
            Vec::new(),
            FatalHook::new(|_| {}),
        )
        .await;

        assert!(result.is_err());
    }
}
