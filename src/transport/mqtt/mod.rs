//! MQTT connection management
//!
//! Pure functions are separated from I/O so the reconnection rules can be
//! tested without a broker.
//!
//! - [`connection`] - connection states, reconnect policy and client options
//! - [`message_handler`] - routing of event loop events
//! - [`health_monitor`] - retry budget and state transitions
//! - [`client`] - the connection manager and its supervisor task
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use topic_dispatch::auth::CredentialProvider;
//! use topic_dispatch::config::DispatcherConfig;
//! use topic_dispatch::transport::mqtt::{FatalHook, MqttConnectionManager, ReconnectPolicy};
//!
//! # tokio_test::block_on(async {
//! let config = DispatcherConfig::from_toml_str("[broker]\nurl = \"mqtt://localhost:1883\"\n")?;
//! let (inbound_tx, _inbound_rx) = tokio::sync::mpsc::channel(64);
//! let manager = MqttConnectionManager::new(
//!     config.broker.clone(),
//!     ReconnectPolicy::from_config(&config),
//!     Arc::new(CredentialProvider::anonymous()),
//!     std::time::Duration::from_secs(10),
//!     inbound_tx,
//!     FatalHook::process_exit(),
//! );
//! manager.connect().await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;

pub use client::MqttConnectionManager;
pub use connection::{
    configure_mqtt_options, generate_client_id, ConnectionState, FatalHook, MqttError,
    ReconnectPolicy,
};
pub use health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision, RetryBudget};
pub use message_handler::{EventRoute, MessageHandler};
