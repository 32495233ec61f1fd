//! Outgoing publishes
//!
//! A publish names a topic template. When the payload is a JSON object with
//! an `appId` and the template has placeholders, the placeholders are filled
//! from the payload's fields before writing. Delivery is fire-and-forget:
//! transport failures are logged and reported as `None`.

use crate::events::{Notification, NotificationBus};
use crate::mqtt_span;
use crate::topic::{TopicTemplate, TopicValue, TopicVariableArgs};
use crate::transport::{BrokerTransport, MqttError};
use bytes::Bytes;
use rumqttc::v5::mqttbytes::QoS;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, warn, Instrument};

const APP_ID: &str = "appId";
const RECORD: &str = "record";
const SCOPE_SEGMENT: usize = 2;

/// Outgoing payload
#[derive(Debug, Clone, PartialEq)]
pub enum PublishPayload {
    Binary(Bytes),
    Json(Value),
}

impl PublishPayload {
    /// Serialize any value into a JSON payload
    pub fn json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_value(value).map(Self::Json)
    }

    fn as_object(&self) -> Option<&Map<String, Value>> {
        match self {
            PublishPayload::Json(Value::Object(map)) => Some(map),
            _ => None,
        }
    }

    fn to_bytes(&self) -> Result<Bytes, serde_json::Error> {
        match self {
            PublishPayload::Binary(bytes) => Ok(bytes.clone()),
            PublishPayload::Json(value) => serde_json::to_vec(value).map(Bytes::from),
        }
    }
}

impl From<Value> for PublishPayload {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

impl From<Bytes> for PublishPayload {
    fn from(bytes: Bytes) -> Self {
        Self::Binary(bytes)
    }
}

impl From<Vec<u8>> for PublishPayload {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Binary(Bytes::from(bytes))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PublishOptions {
    pub qos: QoS,
    pub retain: bool,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            qos: QoS::AtLeastOnce,
            retain: false,
        }
    }
}

/// Result of a successful publish
#[derive(Debug, Clone, PartialEq)]
pub struct PublishReceipt {
    pub wire_topic: String,
    /// Template as passed to [`Publisher::publish`]
    pub template: String,
    /// Values harvested from the payload
    pub args: TopicVariableArgs,
    /// Whether placeholders were filled from the payload
    pub expanded: bool,
}

/// Collect placeholder values from a payload object.
///
/// Top-level string and number fields are used as is. A nested `record`
/// object contributes `id` as `<scope>Id`, where the scope is the template's
/// third segment, plus `sessionId` and `agentId`. Top-level fields win.
pub fn harvest_args(template: &TopicTemplate, object: &Map<String, Value>) -> TopicVariableArgs {
    let mut args = TopicVariableArgs::new();

    for (key, value) in object {
        if let Some(value) = TopicValue::from_json(value) {
            args.insert(key.clone(), value);
        }
    }

    let Some(Value::Object(record)) = object.get(RECORD) else {
        return args;
    };

    if let (Some(scope), Some(id)) = (
        template.segment(SCOPE_SEGMENT),
        record.get("id").and_then(TopicValue::from_json),
    ) {
        args.insert_missing(format!("{scope}Id"), id);
    }
    for key in ["sessionId", "agentId"] {
        if let Some(value) = record.get(key).and_then(TopicValue::from_json) {
            args.insert_missing(key, value);
        }
    }

    args
}

/// Publishes on a shared broker transport
#[derive(Clone)]
pub struct Publisher {
    transport: Arc<dyn BrokerTransport>,
    bus: NotificationBus,
    test_mode: bool,
}

impl Publisher {
    pub fn new(transport: Arc<dyn BrokerTransport>, bus: NotificationBus, test_mode: bool) -> Self {
        Self {
            transport,
            bus,
            test_mode,
        }
    }

    pub fn notifications(&self) -> &NotificationBus {
        &self.bus
    }

    /// Publish `payload` on `template`.
    ///
    /// Unresolved placeholders are logged and the write is attempted anyway.
    /// Returns `None` when the transport failed.
    pub async fn publish<P: Into<PublishPayload>>(
        &self,
        template: &str,
        payload: P,
        options: PublishOptions,
    ) -> Option<PublishReceipt> {
        let payload = payload.into();
        let parsed = TopicTemplate::new(template);

        let object = payload
            .as_object()
            .filter(|map| map.contains_key(APP_ID) && parsed.has_placeholders());

        let (wire_topic, args, expanded) = match object {
            Some(map) => {
                let args = harvest_args(&parsed, map);
                let expansion = parsed.fill(&args);
                if !expansion.is_complete() {
                    warn!(
                        template = %template,
                        unresolved = ?expansion.unresolved,
                        "Unresolved topic placeholders, publishing anyway"
                    );
                }
                (expansion.topic, args, true)
            }
            None => {
                if parsed.has_placeholders() {
                    warn!(template = %template, "Publishing template with unresolved placeholders");
                }
                (parsed.logical().to_string(), TopicVariableArgs::new(), false)
            }
        };

        let bytes = match payload.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(topic = %wire_topic, error = %e, "Failed to serialize payload");
                return None;
            }
        };

        let span = mqtt_span!(operation = "publish", topic = %wire_topic);
        let result = self
            .transport
            .publish(&wire_topic, bytes, options.qos, options.retain)
            .instrument(span)
            .await;

        if let Err(e) = result {
            self.log_failure(&wire_topic, &e);
            return None;
        }
        debug!(topic = %wire_topic, "Published");

        if expanded {
            self.bus.emit(Notification::Published {
                template: template.to_string(),
                wire_topic: wire_topic.clone(),
                payload,
            });
        }

        Some(PublishReceipt {
            wire_topic,
            template: template.to_string(),
            args,
            expanded,
        })
    }

    fn log_failure(&self, topic: &str, error: &MqttError) {
        let closing = matches!(error, MqttError::Closing) || self.transport.is_closing();
        if self.test_mode && closing {
            debug!(topic = %topic, "Publish skipped, connection closing");
        } else {
            warn!(topic = %topic, error = %error, "Publish failed");
        }
    }
}
