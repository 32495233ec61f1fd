//! Registration table entries
//!
//! Services declare their subscriptions as a list of descriptors which the
//! bootstrap feeds into the registry.

use super::entry::{ParamKind, ParamSpec, PayloadTransform};
use super::handler::MessageHandler;
use crate::topic::{TopicValue, TopicVariableArgs};
use rumqttc::v5::mqttbytes::QoS;
use std::sync::Arc;

/// Subscription metadata for one handler
#[derive(Clone)]
pub struct SubscriptionDescriptor {
    pub(crate) owner: String,
    pub(crate) templates: Vec<String>,
    pub(crate) defaults: TopicVariableArgs,
    pub(crate) queue: bool,
    pub(crate) share_group: Option<String>,
    pub(crate) transform: PayloadTransform,
    pub(crate) params: Vec<ParamSpec>,
    pub(crate) qos: QoS,
    pub(crate) handler: Arc<dyn MessageHandler>,
}

impl SubscriptionDescriptor {
    /// Handler for `template`, receiving the decoded JSON payload as its only
    /// argument unless parameters are declared
    pub fn new<O: Into<String>, T: Into<String>>(
        owner: O,
        template: T,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        Self {
            owner: owner.into(),
            templates: vec![template.into()],
            defaults: TopicVariableArgs::new(),
            queue: false,
            share_group: None,
            transform: PayloadTransform::Json,
            params: Vec::new(),
            qos: QoS::AtLeastOnce,
            handler,
        }
    }

    /// Bind the same handler to an additional template
    pub fn also<T: Into<String>>(mut self, template: T) -> Self {
        self.templates.push(template.into());
        self
    }

    /// Fixed value for a placeholder instead of the `+` wildcard
    pub fn with_default<K: Into<String>, V: Into<TopicValue>>(mut self, name: K, value: V) -> Self {
        self.defaults.insert(name, value);
        self
    }

    pub fn defaults(mut self, args: TopicVariableArgs) -> Self {
        self.defaults = args;
        self
    }

    /// Load-shared delivery through `$queue/`
    pub fn queue(mut self) -> Self {
        self.queue = true;
        self
    }

    /// Shared subscription group; overrides the global group
    pub fn share_group<G: Into<String>>(mut self, group: G) -> Self {
        self.share_group = Some(group.into());
        self
    }

    pub fn transform(mut self, transform: PayloadTransform) -> Self {
        self.transform = transform;
        self
    }

    /// Append an argument of `kind` at the next position
    pub fn param(mut self, kind: ParamKind) -> Self {
        let index = self.params.len();
        self.params.push(ParamSpec::new(index, kind));
        self
    }

    /// Replace the argument bindings
    pub fn params(mut self, params: Vec<ParamSpec>) -> Self {
        self.params = params;
        self
    }

    pub fn qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn templates(&self) -> &[String] {
        &self.templates
    }

    /// Declared bindings, or the decoded payload alone
    pub(crate) fn effective_params(&self) -> Vec<ParamSpec> {
        if self.params.is_empty() {
            vec![ParamSpec::new(0, ParamKind::Payload)]
        } else {
            self.params.clone()
        }
    }
}

impl std::fmt::Debug for SubscriptionDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionDescriptor")
            .field("owner", &self.owner)
            .field("templates", &self.templates)
            .field("queue", &self.queue)
            .field("share_group", &self.share_group)
            .field("transform", &self.transform)
            .field("params", &self.params)
            .finish()
    }
}

/// A service exposing its subscriptions.
///
/// Handlers returned here typically capture the provider itself so they run
/// bound to the owning instance.
pub trait SubscriptionProvider: Send + Sync {
    fn owner(&self) -> &str;

    fn subscriptions(self: Arc<Self>) -> Vec<SubscriptionDescriptor>;
}
