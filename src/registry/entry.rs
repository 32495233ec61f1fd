//! Registered subscriptions and payload decoding

use super::handler::MessageHandler;
use crate::topic::{CompiledMatcher, PathParams, TopicTemplate, TopicVariableArgs};
use bytes::Bytes;
use rumqttc::v5::mqttbytes::QoS;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Decoded message payload handed to handlers
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    Text(String),
    Binary(Bytes),
}

impl Payload {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_json_mut(&mut self) -> Option<&mut Value> {
        match self {
            Payload::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            _ => None,
        }
    }
}

/// Caller-supplied payload decoder
pub type CustomDecoder = Arc<dyn Fn(&[u8]) -> Result<Payload, String> + Send + Sync>;

/// How an entry turns raw bytes into a [`Payload`]
#[derive(Clone, Default)]
pub enum PayloadTransform {
    /// UTF-8 JSON
    #[default]
    Json,
    /// UTF-8 text
    Text,
    Custom(CustomDecoder),
}

impl PayloadTransform {
    pub fn custom<F>(decoder: F) -> Self
    where
        F: Fn(&[u8]) -> Result<Payload, String> + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(decoder))
    }

    pub fn decode(&self, raw: &[u8]) -> Result<Payload, String> {
        match self {
            PayloadTransform::Json => serde_json::from_slice(raw)
                .map(Payload::Json)
                .map_err(|e| format!("invalid JSON: {e}")),
            PayloadTransform::Text => std::str::from_utf8(raw)
                .map(|s| Payload::Text(s.to_string()))
                .map_err(|e| format!("invalid UTF-8: {e}")),
            PayloadTransform::Custom(decoder) => decoder(raw),
        }
    }

    pub fn is_json(&self) -> bool {
        matches!(self, PayloadTransform::Json)
    }
}

impl fmt::Debug for PayloadTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadTransform::Json => f.write_str("Json"),
            PayloadTransform::Text => f.write_str("Text"),
            PayloadTransform::Custom(_) => f.write_str("Custom"),
        }
    }
}

/// Value supplied at a handler argument position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// Decoded payload
    Payload,
    /// Inbound topic string
    Topic,
    /// Undecoded packet
    RawPacket,
    /// Values captured by the topic matcher
    PathParams,
}

/// Binding of a handler argument position to a value kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamSpec {
    pub index: usize,
    pub kind: ParamKind,
}

impl ParamSpec {
    pub fn new(index: usize, kind: ParamKind) -> Self {
        Self { index, kind }
    }
}

/// One handler bound to one topic template
pub struct SubscriptionEntry {
    pub(crate) template: TopicTemplate,
    pub(crate) wire_topic: String,
    pub(crate) matcher: CompiledMatcher,
    pub(crate) defaults: TopicVariableArgs,
    pub(crate) transform: PayloadTransform,
    pub(crate) params: Vec<ParamSpec>,
    pub(crate) qos: QoS,
    pub(crate) handler: Arc<dyn MessageHandler>,
    pub(crate) owner: String,
}

impl SubscriptionEntry {
    pub fn template(&self) -> &TopicTemplate {
        &self.template
    }

    pub fn wire_topic(&self) -> &str {
        &self.wire_topic
    }

    pub fn matcher(&self) -> &CompiledMatcher {
        &self.matcher
    }

    pub fn transform(&self) -> &PayloadTransform {
        &self.transform
    }

    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    pub fn qos(&self) -> QoS {
        self.qos
    }

    pub fn handler(&self) -> &Arc<dyn MessageHandler> {
        &self.handler
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Match an inbound topic and return the captured parameters.
    ///
    /// Placeholders narrowed by a default value only accept that value.
    pub fn match_topic(&self, topic: &str) -> Option<PathParams> {
        let params = self.matcher.captures(topic)?;
        for (name, value) in self.defaults.iter() {
            if let Some(captured) = params.get(name) {
                if captured != value.to_string() {
                    return None;
                }
            }
        }
        Some(params)
    }
}

impl fmt::Debug for SubscriptionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionEntry")
            .field("template", &self.template.as_str())
            .field("wire_topic", &self.wire_topic)
            .field("transform", &self.transform)
            .field("params", &self.params)
            .field("owner", &self.owner)
            .finish()
    }
}
