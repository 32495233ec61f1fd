//! Broker transport layer
//!
//! [`BrokerTransport`] is the seam between the subscription registry and
//! publisher on one side and the broker session on the other. The MQTT
//! implementation lives in [`mqtt`]; tests substitute
//! [`crate::testing::MockTransport`].

use bytes::Bytes;
use rumqttc::v5::mqttbytes::QoS;

pub mod mqtt;

pub use mqtt::{ConnectionState, MqttConnectionManager, MqttError};

/// Inbound message as delivered by the broker
#[derive(Debug, Clone, PartialEq)]
pub struct RawPacket {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    pub pkid: u16,
}

impl RawPacket {
    pub fn new<T: Into<String>, P: Into<Bytes>>(topic: T, payload: P) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtLeastOnce,
            retain: false,
            dup: false,
            pkid: 0,
        }
    }
}

/// Broker operations used by the registry and publisher
#[async_trait::async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Subscribe to a wire-level topic filter
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), MqttError>;

    /// Remove a wire-level subscription
    async fn unsubscribe(&self, topic: &str) -> Result<(), MqttError>;

    /// Write a message to a concrete topic
    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), MqttError>;

    /// Current session state
    fn connection_state(&self) -> ConnectionState;

    /// Whether shutdown has started
    fn is_closing(&self) -> bool;
}
