//! Topic template expansion
//!
//! Subscribe-time expansion maps every unresolved `:name` placeholder to the
//! `+` wildcard. Publish-time expansion keeps unresolved placeholders in place
//! and reports them, so the caller can decide whether to write anyway.

use super::matcher::{compile, strip_routing_prefix, CompiledMatcher, RoutingPrefix};
use super::{TopicError, QUEUE_PREFIX, SHARE_PREFIX};
use serde_json::{Number, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Concrete value substituted for a placeholder
#[derive(Debug, Clone, PartialEq)]
pub enum TopicValue {
    Str(String),
    Num(Number),
}

impl TopicValue {
    /// Convert a JSON scalar into a topic value; other JSON kinds are not
    /// usable as topic segments
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(Self::Str(s.clone())),
            Value::Number(n) => Some(Self::Num(n.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for TopicValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopicValue::Str(s) => f.write_str(s),
            TopicValue::Num(n) => write!(f, "{n}"),
        }
    }
}

impl From<&str> for TopicValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for TopicValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<i64> for TopicValue {
    fn from(value: i64) -> Self {
        Self::Num(Number::from(value))
    }
}

impl From<u64> for TopicValue {
    fn from(value: u64) -> Self {
        Self::Num(Number::from(value))
    }
}

/// Placeholder name to value mapping
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TopicVariableArgs {
    values: BTreeMap<String, TopicValue>,
}

impl TopicVariableArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with<K: Into<String>, V: Into<TopicValue>>(mut self, name: K, value: V) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert<K: Into<String>, V: Into<TopicValue>>(&mut self, name: K, value: V) {
        self.values.insert(name.into(), value.into());
    }

    /// Insert only when `name` has no value yet
    pub fn insert_missing<K: Into<String>>(&mut self, name: K, value: TopicValue) {
        self.values.entry(name.into()).or_insert(value);
    }

    pub fn get(&self, name: &str) -> Option<&TopicValue> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &TopicValue)> {
        self.values.iter()
    }

    /// Overlay `other` on top of `self`
    pub fn merged(mut self, other: &TopicVariableArgs) -> Self {
        for (k, v) in other.iter() {
            self.values.insert(k.clone(), v.clone());
        }
        self
    }
}

/// Result of a best-effort expansion
#[derive(Debug, Clone, PartialEq)]
pub struct Expansion {
    pub topic: String,
    /// Placeholder names that had no value and were left in place
    pub unresolved: Vec<String>,
}

impl Expansion {
    pub fn is_complete(&self) -> bool {
        self.unresolved.is_empty()
    }
}

/// A declared topic template
#[derive(Debug, Clone, PartialEq)]
pub struct TopicTemplate {
    raw: String,
    prefix: RoutingPrefix,
    logical: String,
}

impl TopicTemplate {
    pub fn new<S: Into<String>>(raw: S) -> Self {
        let raw = raw.into();
        let (prefix, logical) = strip_routing_prefix(&raw);
        let logical = logical.to_string();
        Self {
            raw,
            prefix,
            logical,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn logical(&self) -> &str {
        &self.logical
    }

    pub fn routing_prefix(&self) -> &RoutingPrefix {
        &self.prefix
    }

    /// Logical segment at `index`
    pub fn segment(&self, index: usize) -> Option<&str> {
        self.logical.split('/').nth(index)
    }

    /// Placeholder names in declaration order
    pub fn placeholders(&self) -> Vec<&str> {
        self.logical
            .split('/')
            .filter_map(|s| s.strip_prefix(':'))
            .filter(|name| !name.is_empty())
            .collect()
    }

    pub fn has_placeholders(&self) -> bool {
        !self.placeholders().is_empty()
    }

    pub fn compile(&self) -> Result<CompiledMatcher, TopicError> {
        compile(&self.raw)
    }

    /// Subscribe-time expansion of the logical topic.
    ///
    /// Placeholders without a value become `+`. Fails if a `:` survives the
    /// substitution.
    pub fn expand(&self, args: &TopicVariableArgs) -> Result<String, TopicError> {
        let topic = self
            .logical
            .split('/')
            .map(|segment| match placeholder_name(segment) {
                Some(name) => args
                    .get(name)
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "+".to_string()),
                None => segment.to_string(),
            })
            .collect::<Vec<_>>()
            .join("/");

        if topic.contains(':') {
            return Err(TopicError::UnresolvedPlaceholder { topic });
        }
        Ok(topic)
    }

    /// Publish-time expansion of the logical topic; never fails
    pub fn fill(&self, args: &TopicVariableArgs) -> Expansion {
        let mut unresolved = Vec::new();
        let topic = self
            .logical
            .split('/')
            .map(|segment| match placeholder_name(segment) {
                Some(name) => match args.get(name) {
                    Some(v) => v.to_string(),
                    None => {
                        unresolved.push(name.to_string());
                        segment.to_string()
                    }
                },
                None => segment.to_string(),
            })
            .collect::<Vec<_>>()
            .join("/");

        Expansion { topic, unresolved }
    }
}

impl fmt::Display for TopicTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn placeholder_name(segment: &str) -> Option<&str> {
    segment.strip_prefix(':').filter(|name| !name.is_empty())
}

/// Subscribe-time expansion of a raw template string
pub fn expand(template: &str, args: &TopicVariableArgs) -> Result<String, TopicError> {
    TopicTemplate::new(template).expand(args)
}

/// Re-apply broker routing hints to a logical topic.
///
/// A share group takes precedence over the queue flag.
pub fn apply_routing_prefix(topic: &str, queue: bool, share_group: Option<&str>) -> String {
    match share_group {
        Some(group) if !group.is_empty() => format!("{SHARE_PREFIX}{group}/{topic}"),
        _ if queue => format!("{QUEUE_PREFIX}{topic}"),
        _ => topic.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_expand_defaults_placeholders_to_wildcard() {
        let template = TopicTemplate::new("platform/:appId/monitoring/:sessionId");

        assert_eq!(
            template.expand(&TopicVariableArgs::new()).unwrap(),
            "platform/+/monitoring/+"
        );

        let args = TopicVariableArgs::new().with("appId", "app1");
        assert_eq!(template.expand(&args).unwrap(), "platform/app1/monitoring/+");
    }

    #[test]
    fn test_expand_strips_routing_prefix() {
        let template = TopicTemplate::new("$share/g1/jobs/:id");
        assert_eq!(template.expand(&TopicVariableArgs::new()).unwrap(), "jobs/+");
        assert_eq!(template.routing_prefix(), &RoutingPrefix::Share("g1".to_string()));
    }

    #[test]
    fn test_expand_rejects_remaining_colon() {
        let args = TopicVariableArgs::new().with("appId", "urn:app");
        let result = expand("platform/:appId/status", &args);

        assert!(matches!(
            result,
            Err(TopicError::UnresolvedPlaceholder { .. })
        ));
    }

    #[test]
    fn test_numeric_values_are_rendered() {
        let args = TopicVariableArgs::new().with("robotId", 17i64);
        assert_eq!(expand("robots/:robotId", &args).unwrap(), "robots/17");
    }

    #[test]
    fn test_fill_reports_unresolved_placeholders() {
        let template = TopicTemplate::new("platform/:appId/:agentId/events");
        let args = TopicVariableArgs::new().with("appId", "a1");

        let expansion = template.fill(&args);
        assert_eq!(expansion.topic, "platform/a1/:agentId/events");
        assert_eq!(expansion.unresolved, vec!["agentId".to_string()]);
        assert!(!expansion.is_complete());
    }

    #[test]
    fn test_placeholders_and_segments() {
        let template = TopicTemplate::new("$queue/platform/:appId/monitoring/record");
        assert_eq!(template.placeholders(), vec!["appId"]);
        assert_eq!(template.segment(2), Some("monitoring"));
        assert_eq!(template.segment(9), None);
        assert!(template.has_placeholders());
        assert!(!TopicTemplate::new("a/b").has_placeholders());
    }

    #[test]
    fn test_apply_routing_prefix() {
        assert_eq!(apply_routing_prefix("a/+", false, None), "a/+");
        assert_eq!(apply_routing_prefix("a/+", true, None), "$queue/a/+");
        assert_eq!(apply_routing_prefix("a/+", true, Some("g")), "$share/g/a/+");
        assert_eq!(apply_routing_prefix("a/+", false, Some("")), "a/+");
    }

    #[test]
    fn test_args_merge_overrides() {
        let base = TopicVariableArgs::new().with("a", "1").with("b", "2");
        let overlay = TopicVariableArgs::new().with("b", "3");
        let merged = base.merged(&overlay);

        assert_eq!(merged.get("a"), Some(&TopicValue::from("1")));
        assert_eq!(merged.get("b"), Some(&TopicValue::from("3")));
    }

    proptest! {
        #[test]
        fn fully_supplied_expansion_has_no_colon(
            names in prop::collection::btree_set("[a-z]{1,6}", 1..4),
            value in "[a-zA-Z0-9_-]{1,8}",
        ) {
            let template = names
                .iter()
                .map(|n| format!("lit/:{n}"))
                .collect::<Vec<_>>()
                .join("/");
            let mut args = TopicVariableArgs::new();
            for n in &names {
                args.insert(n.as_str(), value.as_str());
            }

            let topic = expand(&template, &args).unwrap();
            prop_assert!(!topic.contains(':'));

            let filled = TopicTemplate::new(template.as_str()).fill(&args);
            prop_assert!(filled.is_complete());
            prop_assert_eq!(filled.topic, topic);
        }
    }
}
