//! Topic pattern compiler
//!
//! Compiles a topic template into an anchored regular expression. Every
//! placeholder and `+` segment becomes a single-segment capture group and a
//! trailing `#` becomes an optional capture of the remaining segments.
//!
//! Matching never keeps state between calls: `regex::Regex` searches are pure
//! functions of the pattern and the input, so a `CompiledMatcher` may be shared
//! across entries and tasks and matched any number of times.

use super::TopicError;
use regex::Regex;

/// Broker queue subscription prefix
pub const QUEUE_PREFIX: &str = "$queue/";
/// Broker shared subscription prefix, followed by `<group>/`
pub const SHARE_PREFIX: &str = "$share/";

/// Routing hint carried in front of a topic template
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingPrefix {
    None,
    Queue,
    Share(String),
}

/// Split a template into its routing prefix and logical topic.
///
/// A `$queue/` prefix and a `$share/<group>/` prefix may both be present, in
/// that order. When both are present the share group wins.
pub fn strip_routing_prefix(template: &str) -> (RoutingPrefix, &str) {
    let mut prefix = RoutingPrefix::None;
    let mut rest = template;

    if let Some(stripped) = rest.strip_prefix(QUEUE_PREFIX) {
        prefix = RoutingPrefix::Queue;
        rest = stripped;
    }

    if let Some(stripped) = rest.strip_prefix(SHARE_PREFIX) {
        if let Some((group, topic)) = stripped.split_once('/') {
            if !group.is_empty() {
                prefix = RoutingPrefix::Share(group.to_string());
                rest = topic;
            }
        }
    }

    (prefix, rest)
}

/// What a capture group of a compiled matcher stands for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureSlot {
    /// `:name` placeholder
    Named(String),
    /// `+` single-level wildcard
    SingleLevel,
    /// trailing `#` multi-level wildcard
    MultiLevel,
}

/// Anchored matcher derived from a topic template
#[derive(Debug, Clone)]
pub struct CompiledMatcher {
    template: String,
    prefix: RoutingPrefix,
    logical: String,
    regex: Regex,
    slots: Vec<CaptureSlot>,
}

/// Compile a topic template into a matcher
pub fn compile(template: &str) -> Result<CompiledMatcher, TopicError> {
    let (prefix, logical) = strip_routing_prefix(template);
    if logical.is_empty() {
        return Err(TopicError::invalid(template, "empty topic"));
    }

    let segments: Vec<&str> = logical.split('/').collect();
    let last = segments.len() - 1;
    let mut pattern = String::with_capacity(logical.len() * 2 + 2);
    let mut slots = Vec::new();
    pattern.push('^');

    for (index, segment) in segments.iter().enumerate() {
        if *segment == "#" {
            if index != last {
                return Err(TopicError::invalid(
                    template,
                    "'#' is only allowed as the final segment",
                ));
            }
            if index == 0 {
                pattern.push_str("(.*)");
            } else {
                // `/#` also matches the parent topic itself
                pattern.push_str("(?:/(.*))?");
            }
            slots.push(CaptureSlot::MultiLevel);
            continue;
        }

        if index > 0 {
            pattern.push('/');
        }

        if *segment == "+" {
            pattern.push_str("([^/]*)");
            slots.push(CaptureSlot::SingleLevel);
        } else if let Some(name) = segment.strip_prefix(':') {
            if name.is_empty() {
                return Err(TopicError::invalid(template, "placeholder without a name"));
            }
            pattern.push_str("([^/]*)");
            slots.push(CaptureSlot::Named(name.to_string()));
        } else if segment.contains('+') || segment.contains('#') {
            return Err(TopicError::invalid(
                template,
                format!("wildcard must occupy a whole segment, found '{segment}'"),
            ));
        } else {
            pattern.push_str(&regex::escape(segment));
        }
    }

    pattern.push('$');

    let regex = Regex::new(&pattern).map_err(|e| TopicError::Regex {
        template: template.to_string(),
        message: e.to_string(),
    })?;

    Ok(CompiledMatcher {
        template: template.to_string(),
        prefix,
        logical: logical.to_string(),
        regex,
        slots,
    })
}

impl CompiledMatcher {
    /// Original template, including any routing prefix
    pub fn template(&self) -> &str {
        &self.template
    }

    /// Template without its routing prefix
    pub fn logical(&self) -> &str {
        &self.logical
    }

    pub fn routing_prefix(&self) -> &RoutingPrefix {
        &self.prefix
    }

    pub fn slots(&self) -> &[CaptureSlot] {
        &self.slots
    }

    /// Regular expression source, useful in diagnostics
    pub fn pattern(&self) -> &str {
        self.regex.as_str()
    }

    pub fn is_match(&self, topic: &str) -> bool {
        self.regex.is_match(topic)
    }

    /// Match `topic` and return the capture values in declaration order.
    ///
    /// The whole-match group is skipped. A trailing `#` that matched nothing
    /// yields an empty string.
    pub fn captures(&self, topic: &str) -> Option<PathParams> {
        let caps = self.regex.captures(topic)?;
        let params = self
            .slots
            .iter()
            .enumerate()
            .map(|(i, slot)| PathParam {
                name: match slot {
                    CaptureSlot::Named(name) => Some(name.clone()),
                    _ => None,
                },
                value: caps
                    .get(i + 1)
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_default(),
            })
            .collect();
        Some(PathParams { params })
    }
}

/// One captured path segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathParam {
    /// Placeholder name, `None` for `+` and `#` captures
    pub name: Option<String>,
    pub value: String,
}

/// Ordered capture values extracted from a matched topic
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathParams {
    params: Vec<PathParam>,
}

impl PathParams {
    /// Value of the named placeholder
    pub fn get(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|p| p.name.as_deref() == Some(name))
            .map(|p| p.value.as_str())
    }

    /// Value of the capture at `index`, named or not
    pub fn positional(&self, index: usize) -> Option<&str> {
        self.params.get(index).map(|p| p.value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &PathParam> {
        self.params.iter()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}
