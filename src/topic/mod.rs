//! Topic templates and matchers
//!
//! Topic templates are `/`-separated patterns authored by handlers and
//! publishers. A segment starting with `:` is a named placeholder, `+`
//! matches exactly one segment and a final `#` matches the remaining
//! segments. Templates may carry a `$queue/` or `$share/<group>/` routing
//! prefix which selects broker delivery semantics but is not part of the
//! logical topic.

pub mod matcher;
pub mod template;

pub use matcher::{
    compile, strip_routing_prefix, CaptureSlot, CompiledMatcher, PathParam, PathParams,
    RoutingPrefix, QUEUE_PREFIX, SHARE_PREFIX,
};
pub use template::{
    apply_routing_prefix, expand, Expansion, TopicTemplate, TopicValue, TopicVariableArgs,
};

use thiserror::Error;

/// Errors raised while compiling or expanding topic templates
#[derive(Debug, Error, PartialEq)]
pub enum TopicError {
    #[error("Unresolved placeholder in topic '{topic}'")]
    UnresolvedPlaceholder { topic: String },
    #[error("Invalid topic template '{template}': {reason}")]
    InvalidTemplate { template: String, reason: String },
    #[error("Failed to build matcher for '{template}': {message}")]
    Regex { template: String, message: String },
}

impl TopicError {
    pub(crate) fn invalid<T: Into<String>, R: Into<String>>(template: T, reason: R) -> Self {
        Self::InvalidTemplate {
            template: template.into(),
            reason: reason.into(),
        }
    }
}
