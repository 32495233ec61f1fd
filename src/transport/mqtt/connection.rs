//! Pure connection state management for the MQTT connection manager
//!
//! Connection states, the reconnection policy, transport errors and the
//! translation of broker settings into client options.

use crate::auth::Credentials;
use crate::config::{BrokerSection, DispatcherConfig};
use rumqttc::v5::MqttOptions;
use rumqttc::Transport as RumqttcTransport;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Connection state of the broker session
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Initial state, first session being established
    Connecting,
    /// Session acknowledged by the broker
    Connected,
    /// Waiting to rebuild the session (attempt number)
    Reconnecting(u32),
    /// Session lost with reason
    Offline(String),
    /// Closed by shutdown or after the retry bound was reached
    Closed,
}

/// Reconnection policy
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Consecutive connection errors tolerated before the process exits
    pub max_retries: u32,
    /// Delay before each reconnection attempt
    pub delay: Duration,
    /// Stop reconnecting after the first attempt
    pub test_mode: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            delay: Duration::from_secs(2),
            test_mode: false,
        }
    }
}

impl ReconnectPolicy {
    pub fn from_config(config: &DispatcherConfig) -> Self {
        Self {
            max_retries: config.reconnect.max_retries,
            delay: config.reconnect_delay(),
            test_mode: config.is_test_mode(),
        }
    }

    /// Upper bound on the time the whole retry budget can take
    pub fn max_total_time(&self) -> Duration {
        self.delay.saturating_mul(self.max_retries)
    }
}

/// MQTT transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Publishing failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription failed")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),
    #[error("Connection is closing")]
    Closing,
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },
    #[error("Connection failed: {0}")]
    ConnectionFailedStr(String),
}

impl MqttError {
    /// Errors caused by a session that is down or being rebuilt
    pub fn is_transient(&self) -> bool {
        match self {
            MqttError::ConnectionClosed(_) => true,
            MqttError::NotConnected { state } => !matches!(state, ConnectionState::Closed),
            _ => false,
        }
    }
}

/// Invoked once when the reconnection bound is reached
#[derive(Clone)]
pub struct FatalHook(Arc<dyn Fn(&str) + Send + Sync>);

impl FatalHook {
    pub fn new<F>(hook: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        Self(Arc::new(hook))
    }

    /// Terminate the process with a non-zero status
    pub fn process_exit() -> Self {
        Self::new(|reason| {
            tracing::error!(reason = %reason, "Broker connection unrecoverable, exiting");
            std::process::exit(1);
        })
    }

    pub fn trigger(&self, reason: &str) {
        (self.0)(reason)
    }
}

impl Default for FatalHook {
    fn default() -> Self {
        Self::process_exit()
    }
}

impl fmt::Debug for FatalHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FatalHook")
    }
}

/// Client id unique to this process
pub fn generate_client_id(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4().simple())
}

/// Build client options from broker settings and the current credential
pub fn configure_mqtt_options(
    client_id: &str,
    broker: &BrokerSection,
    credentials: Option<&Credentials>,
) -> Result<MqttOptions, MqttError> {
    let url = Url::parse(&broker.url).map_err(|_| MqttError::InvalidBrokerUrl(broker.url.clone()))?;

    let host = url
        .host_str()
        .ok_or_else(|| MqttError::InvalidBrokerUrl(broker.url.clone()))?;
    let tls = matches!(url.scheme(), "mqtts" | "ssl");
    let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

    let mut mqtt_options = MqttOptions::new(client_id, host, port);

    if tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if let Some(credentials) = credentials {
        mqtt_options.set_credentials(&credentials.username, &credentials.password);
    }

    mqtt_options.set_keep_alive(Duration::from_secs(broker.keep_alive_secs));
    mqtt_options.set_max_packet_size(Some(broker.max_packet_kb * 1024));
    mqtt_options.set_clean_start(true);

    Ok(mqtt_options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn broker(url: &str) -> BrokerSection {
        BrokerSection {
            url: url.to_string(),
            client_id_prefix: "td".to_string(),
            username_env: None,
            password_env: None,
            keep_alive_secs: 60,
            max_packet_kb: 256,
            channel_capacity: 64,
        }
    }

    #[test]
    fn test_reconnect_policy_default() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.delay, Duration::from_secs(2));
        assert!(!policy.test_mode);
        assert_eq!(policy.max_total_time(), Duration::from_secs(10));
    }

    #[test]
    fn test_policy_from_config() {
        let config = DispatcherConfig::test_config();
        let policy = ReconnectPolicy::from_config(&config);
        assert!(policy.test_mode);
        assert_eq!(policy.max_retries, 5);
    }

    #[test]
    fn test_configure_mqtt_options() {
        let creds = Credentials::new("dispatcher", "token");
        let options =
            configure_mqtt_options("td-1", &broker("mqtt://localhost:1883"), Some(&creds)).unwrap();

        assert_eq!(options.client_id(), "td-1");
        assert_eq!(options.broker_address(), ("localhost".to_string(), 1883));
        assert_eq!(options.keep_alive(), Duration::from_secs(60));
    }

    #[test]
    fn test_default_tls_port() {
        let options = configure_mqtt_options("td-1", &broker("mqtts://broker.example.com"), None)
            .unwrap();
        assert_eq!(options.broker_address().1, 8883);
    }

    #[test]
    fn test_invalid_broker_url() {
        let result = configure_mqtt_options("td-1", &broker("invalid-url"), None);
        assert!(matches!(result, Err(MqttError::InvalidBrokerUrl(_))));
    }

    #[test]
    fn test_transient_errors() {
        assert!(MqttError::ConnectionClosed("eof".to_string()).is_transient());
        assert!(MqttError::NotConnected {
            state: ConnectionState::Offline("io".to_string())
        }
        .is_transient());
        assert!(!MqttError::NotConnected {
            state: ConnectionState::Closed
        }
        .is_transient());
        assert!(!MqttError::Closing.is_transient());
        assert!(!MqttError::SubscriptionFailed("denied".to_string().into()).is_transient());
    }

    #[test]
    fn test_client_ids_are_unique() {
        let a = generate_client_id("td");
        let b = generate_client_id("td");
        assert!(a.starts_with("td-"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_fatal_hook_invokes_closure() {
        let count = Arc::new(AtomicU32::new(0));
        let seen = count.clone();
        let hook = FatalHook::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        hook.trigger("gone");
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
