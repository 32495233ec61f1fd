//! Context enrichment for recognized application topics

use crate::topic::{compile, CompiledMatcher, TopicError};
use serde_json::Value;

const APP_ID: &str = "appId";

/// Recognized templates whose JSON payloads receive the topic's
/// application id
#[derive(Debug, Clone, Default)]
pub struct StructuredTopics {
    matchers: Vec<CompiledMatcher>,
}

impl StructuredTopics {
    pub fn new<I, S>(templates: I) -> Result<Self, TopicError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let matchers = templates
            .into_iter()
            .map(|t| compile(t.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { matchers })
    }

    pub fn is_empty(&self) -> bool {
        self.matchers.is_empty()
    }

    /// Insert `appId` captured from `topic` into a JSON object payload.
    ///
    /// An `appId` already present in the payload is kept. Returns whether the
    /// payload was changed.
    pub fn enrich(&self, topic: &str, payload: &mut Value) -> bool {
        let Value::Object(map) = payload else {
            return false;
        };

        let app_id = self
            .matchers
            .iter()
            .find_map(|m| m.captures(topic))
            .and_then(|params| params.get(APP_ID).map(str::to_string));

        match app_id {
            Some(app_id) if !map.contains_key(APP_ID) => {
                map.insert(APP_ID.to_string(), Value::String(app_id));
                true
            }
            _ => false,
        }
    }
}
