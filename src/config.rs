//! Dispatcher configuration
//!
//! Loaded from a TOML file. Secrets are never stored in the file; the file
//! names the environment variables holding them and they are resolved when
//! the connection is built.

use crate::topic;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatcherConfig {
    pub broker: BrokerSection,
    /// Token issuer or service account settings (optional)
    pub auth: Option<AuthSection>,
    #[serde(default)]
    pub subscriptions: SubscriptionSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
    #[serde(default)]
    pub dispatcher: DispatchSection,
    #[serde(default)]
    pub runtime: RuntimeSection,
}

/// Broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    /// Broker URL, `mqtt://host:port` or `mqtts://host:port`
    pub url: String,
    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,
    /// Environment variable containing a static username
    pub username_env: Option<String>,
    /// Environment variable containing a static password
    pub password_env: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_max_packet_kb")]
    pub max_packet_kb: u32,
    /// Capacity of the client request and inbound message channels
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

/// Token issuer and service account settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthSection {
    pub issuer_url: Option<String>,
    pub realm: Option<String>,
    pub client_id: Option<String>,
    /// Environment variable containing the client secret
    pub client_secret_env: Option<String>,
    /// Environment variables with service account credentials; when both
    /// resolve, token issuance is bypassed
    pub service_username_env: Option<String>,
    pub service_password_env: Option<String>,
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
    #[serde(default = "default_refresh_margin")]
    pub refresh_margin_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
}

/// Subscription routing settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubscriptionSection {
    /// Prefix every subscription with `$queue/`
    #[serde(default)]
    pub queue: bool,
    /// Prefix every subscription with `$share/<group>/`
    pub share_group: Option<String>,
    #[serde(default = "default_subscribe_retry_delay")]
    pub subscribe_retry_delay_ms: u64,
}

impl Default for SubscriptionSection {
    fn default() -> Self {
        Self {
            queue: false,
            share_group: None,
            subscribe_retry_delay_ms: default_subscribe_retry_delay(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_reconnect_delay")]
    pub delay_ms: u64,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            delay_ms: default_reconnect_delay(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DispatchSection {
    /// Templates whose JSON payloads get the topic's application id injected
    #[serde(default)]
    pub structured_topics: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RuntimeSection {
    #[serde(default)]
    pub mode: RuntimeMode,
}

/// Test mode keeps automated runs deterministic: reconnection stops after the
/// first attempt and publishes racing a closing connection are ignored
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeMode {
    #[default]
    Production,
    Test,
}

fn default_client_id_prefix() -> String {
    "topic-dispatch".to_string()
}

fn default_keep_alive() -> u64 {
    60
}

fn default_max_packet_kb() -> u32 {
    256
}

fn default_channel_capacity() -> usize {
    64
}

fn default_refresh_interval() -> u64 {
    10
}

fn default_refresh_margin() -> u64 {
    60
}

fn default_request_timeout() -> u64 {
    5000
}

fn default_subscribe_retry_delay() -> u64 {
    5000
}

fn default_max_retries() -> u32 {
    5
}

fn default_reconnect_delay() -> u64 {
    2000
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl DispatcherConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: DispatcherConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_broker_url(&self.broker.url)?;

        if self.reconnect.max_retries == 0 {
            return Err(ConfigError::InvalidConfig(
                "reconnect.max_retries must be greater than 0".to_string(),
            ));
        }

        if self.broker.channel_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "broker.channel_capacity must be greater than 0".to_string(),
            ));
        }

        if let Some(auth) = &self.auth {
            auth.validate()?;
        }

        for template in &self.dispatcher.structured_topics {
            topic::compile(template).map_err(|e| ConfigError::InvalidConfig(e.to_string()))?;
        }

        Ok(())
    }

    pub fn is_test_mode(&self) -> bool {
        self.runtime.mode == RuntimeMode::Test
    }

    /// Static broker username from the environment
    pub fn get_broker_username(&self) -> Option<String> {
        get_env_var_optional(self.broker.username_env.as_ref())
    }

    /// Static broker password from the environment
    pub fn get_broker_password(&self) -> Option<String> {
        get_env_var_optional(self.broker.password_env.as_ref())
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect.delay_ms)
    }

    pub fn subscribe_retry_delay(&self) -> Duration {
        Duration::from_millis(self.subscriptions.subscribe_retry_delay_ms)
    }

    /// Create a configuration for unit tests
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[broker]
url = "mqtt://localhost:1883"

[runtime]
mode = "test"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

impl AuthSection {
    fn validate(&self) -> Result<(), ConfigError> {
        let service_account =
            self.service_username_env.is_some() && self.service_password_env.is_some();
        let client_credentials = self.issuer_url.is_some()
            && self.realm.is_some()
            && self.client_id.is_some()
            && self.client_secret_env.is_some();

        if !service_account && !client_credentials {
            return Err(ConfigError::InvalidConfig(
                "[auth] requires either service_username_env/service_password_env or \
                 issuer_url, realm, client_id and client_secret_env"
                    .to_string(),
            ));
        }

        if self.refresh_interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "auth.refresh_interval_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Service account credentials, when both variables resolve
    pub fn service_account(&self) -> Option<(String, String)> {
        let username = get_env_var_optional(self.service_username_env.as_ref())?;
        let password = get_env_var_optional(self.service_password_env.as_ref())?;
        Some((username, password))
    }

    /// Client secret for the token issuer
    pub fn client_secret(&self) -> Result<String, ConfigError> {
        let name = self.client_secret_env.as_deref().ok_or_else(|| {
            ConfigError::InvalidConfig("auth.client_secret_env is not set".to_string())
        })?;
        get_env_var_required(name)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn refresh_margin(&self) -> Duration {
        Duration::from_secs(self.refresh_margin_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn validate_broker_url(raw: &str) -> Result<(), ConfigError> {
    let url = url::Url::parse(raw).map_err(|_| ConfigError::InvalidBrokerUrl(raw.to_string()))?;
    match url.scheme() {
        "mqtt" | "mqtts" | "tcp" | "ssl" => {}
        other => {
            return Err(ConfigError::InvalidBrokerUrl(format!(
                "{raw}: unsupported scheme '{other}'"
            )))
        }
    }
    if url.host_str().is_none() {
        return Err(ConfigError::InvalidBrokerUrl(raw.to_string()));
    }
    Ok(())
}

fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
    env_var_name.and_then(|name| std::env::var(name).ok())
}

fn get_env_var_required(env_var_name: &str) -> Result<String, ConfigError> {
    std::env::var(env_var_name).map_err(|_| ConfigError::EnvVarNotFound(env_var_name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[broker]
url = "mqtts://broker.example.com:8883"
client_id_prefix = "fleet"
keep_alive_secs = 30

[auth]
issuer_url = "https://id.example.com"
realm = "fleet"
client_id = "dispatcher"
client_secret_env = "DISPATCHER_CLIENT_SECRET"
refresh_interval_secs = 5

[subscriptions]
queue = true
share_group = "workers"

[reconnect]
max_retries = 3
delay_ms = 500

[dispatcher]
structured_topics = ["platform/:appId/#"]

[runtime]
mode = "test"
"#;

        let config = DispatcherConfig::from_toml_str(toml_content).unwrap();
        assert_eq!(config.broker.client_id_prefix, "fleet");
        assert_eq!(config.broker.keep_alive_secs, 30);
        assert_eq!(config.broker.max_packet_kb, 256);
        let auth = config.auth.as_ref().unwrap();
        assert_eq!(auth.refresh_interval(), Duration::from_secs(5));
        assert_eq!(auth.refresh_margin(), Duration::from_secs(60));
        assert!(config.subscriptions.queue);
        assert_eq!(config.subscriptions.share_group.as_deref(), Some("workers"));
        assert_eq!(config.reconnect.max_retries, 3);
        assert_eq!(config.reconnect_delay(), Duration::from_millis(500));
        assert!(config.is_test_mode());
    }

    #[test]
    fn test_minimal_config_defaults() {
        let config = DispatcherConfig::from_toml_str(
            r#"
[broker]
url = "mqtt://localhost:1883"
"#,
        )
        .unwrap();

        assert_eq!(config.broker.client_id_prefix, "topic-dispatch");
        assert!(config.auth.is_none());
        assert!(!config.subscriptions.queue);
        assert_eq!(config.subscribe_retry_delay(), Duration::from_secs(5));
        assert_eq!(config.reconnect.max_retries, 5);
        assert_eq!(config.reconnect_delay(), Duration::from_secs(2));
        assert!(config.dispatcher.structured_topics.is_empty());
        assert_eq!(config.runtime.mode, RuntimeMode::Production);
    }

    #[test]
    fn test_invalid_broker_scheme() {
        let result = DispatcherConfig::from_toml_str(
            r#"
[broker]
url = "http://localhost:1883"
"#,
        );
        assert!(matches!(result, Err(ConfigError::InvalidBrokerUrl(_))));
    }

    #[test]
    fn test_zero_retries_rejected() {
        let result = DispatcherConfig::from_toml_str(
            r#"
[broker]
url = "mqtt://localhost:1883"

[reconnect]
max_retries = 0
"#,
        );
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_incomplete_auth_rejected() {
        let result = DispatcherConfig::from_toml_str(
            r#"
[broker]
url = "mqtt://localhost:1883"

[auth]
issuer_url = "https://id.example.com"
"#,
        );
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_invalid_structured_topic_rejected() {
        let result = DispatcherConfig::from_toml_str(
            r#"
[broker]
url = "mqtt://localhost:1883"

[dispatcher]
structured_topics = ["platform/#/status"]
"#,
        );
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_service_account_requires_both_variables() {
        let auth = AuthSection {
            issuer_url: None,
            realm: None,
            client_id: None,
            client_secret_env: None,
            service_username_env: Some("TD_TEST_SVC_USER_UNSET".to_string()),
            service_password_env: Some("TD_TEST_SVC_PASS_UNSET".to_string()),
            refresh_interval_secs: 10,
            refresh_margin_secs: 60,
            request_timeout_ms: 5000,
        };
        assert!(auth.validate().is_ok());
        assert!(auth.service_account().is_none());
        assert!(matches!(
            auth.client_secret(),
            Err(ConfigError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_test_config_helper() {
        let config = DispatcherConfig::test_config();
        assert!(config.is_test_mode());
        assert!(config.validate().is_ok());
    }
}
