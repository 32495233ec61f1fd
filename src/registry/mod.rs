//! Subscription registry
//!
//! Holds every registered handler with its compiled matcher. Wire topics
//! shared by several entries are subscribed once; each entry is still
//! dispatched to independently.

pub mod descriptor;
pub mod entry;
pub mod handler;

pub use descriptor::{SubscriptionDescriptor, SubscriptionProvider};
pub use entry::{
    CustomDecoder, ParamKind, ParamSpec, Payload, PayloadTransform, SubscriptionEntry,
};
pub use handler::{handler_fn, FnHandler, MessageHandler};

use crate::config::DispatcherConfig;
use crate::error::{DispatchError, DispatchResult};
use crate::mqtt_span;
use crate::topic::{apply_routing_prefix, PathParams, RoutingPrefix, TopicTemplate};
use crate::transport::{BrokerTransport, MqttError};
use rumqttc::v5::mqttbytes::QoS;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn, Instrument};

/// Registry-wide routing settings
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrySettings {
    /// Prefix every wire topic with `$queue/`
    pub queue: bool,
    /// Global shared subscription group
    pub share_group: Option<String>,
    /// Delay before the single retry of a transiently failed subscribe
    pub subscribe_retry_delay: Duration,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            queue: false,
            share_group: None,
            subscribe_retry_delay: Duration::from_secs(5),
        }
    }
}

impl RegistrySettings {
    pub fn from_config(config: &DispatcherConfig) -> Self {
        Self {
            queue: config.subscriptions.queue,
            share_group: config.subscriptions.share_group.clone(),
            subscribe_retry_delay: config.subscribe_retry_delay(),
        }
    }
}

/// Outcome of [`SubscriptionRegistry::subscribe_all`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscribeSummary {
    pub subscribed: Vec<String>,
    pub failed: Vec<String>,
}

/// Diagnostic view of one entry
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntryInfo {
    pub owner: String,
    pub template: String,
    pub wire_topic: String,
}

pub struct SubscriptionRegistry {
    settings: RegistrySettings,
    entries: RwLock<Vec<Arc<SubscriptionEntry>>>,
    subscribed: Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl SubscriptionRegistry {
    pub fn new(settings: RegistrySettings) -> Self {
        Self {
            settings,
            entries: RwLock::new(Vec::new()),
            subscribed: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &RegistrySettings {
        &self.settings
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Add one entry per template of `descriptor`.
    ///
    /// Fails without registering anything if a template does not compile or
    /// a placeholder cannot be expanded.
    pub async fn register(
        &self,
        descriptor: SubscriptionDescriptor,
    ) -> DispatchResult<Vec<Arc<SubscriptionEntry>>> {
        if self.is_closed() {
            return Err(DispatchError::internal_error("registry is shut down"));
        }

        let params = descriptor.effective_params();
        let mut created = Vec::with_capacity(descriptor.templates.len());

        for raw in &descriptor.templates {
            let template = TopicTemplate::new(raw.as_str());
            let matcher = template.compile()?;
            let logical = template.expand(&descriptor.defaults)?;

            let (queue, share_group) = match template.routing_prefix() {
                RoutingPrefix::Queue => (true, None),
                RoutingPrefix::Share(group) => (false, Some(group.clone())),
                RoutingPrefix::None => (false, None),
            };
            let share_group = descriptor
                .share_group
                .clone()
                .or(share_group)
                .or_else(|| self.settings.share_group.clone());
            let queue = descriptor.queue || queue || self.settings.queue;
            let wire_topic = apply_routing_prefix(&logical, queue, share_group.as_deref());

            created.push(Arc::new(SubscriptionEntry {
                template,
                wire_topic,
                matcher,
                defaults: descriptor.defaults.clone(),
                transform: descriptor.transform.clone(),
                params: params.clone(),
                qos: descriptor.qos,
                handler: descriptor.handler.clone(),
                owner: descriptor.owner.clone(),
            }));
        }

        let mut entries = self.entries.write().await;
        for entry in &created {
            debug!(
                owner = %entry.owner(),
                template = %entry.template(),
                wire_topic = %entry.wire_topic(),
                "Registered subscription"
            );
            entries.push(entry.clone());
        }
        Ok(created)
    }

    /// Register every descriptor exposed by `providers`
    pub async fn discover(&self, providers: &[Arc<dyn SubscriptionProvider>]) -> DispatchResult<usize> {
        let mut count = 0;
        for provider in providers {
            let owner = provider.owner().to_string();
            let descriptors = provider.clone().subscriptions();
            info!(owner = %owner, descriptors = descriptors.len(), "Discovered subscriptions");
            for descriptor in descriptors {
                count += self.register(descriptor).await?.len();
            }
        }
        Ok(count)
    }

    pub async fn entries(&self) -> Vec<Arc<SubscriptionEntry>> {
        self.entries.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Distinct wire topics in registration order, with the highest QoS
    /// requested for each
    pub async fn wire_topics(&self) -> Vec<(String, QoS)> {
        let entries = self.entries.read().await;
        let mut topics: Vec<(String, QoS)> = Vec::new();
        for entry in entries.iter() {
            match topics.iter_mut().find(|(t, _)| t == entry.wire_topic()) {
                Some((_, qos)) => *qos = max_qos(*qos, entry.qos()),
                None => topics.push((entry.wire_topic().to_string(), entry.qos())),
            }
        }
        topics
    }

    /// Entries accepting `topic`, with their captured parameters
    pub async fn matching(&self, topic: &str) -> Vec<(Arc<SubscriptionEntry>, PathParams)> {
        if self.is_closed() {
            return Vec::new();
        }
        self.entries
            .read()
            .await
            .iter()
            .filter_map(|entry| entry.match_topic(topic).map(|params| (entry.clone(), params)))
            .collect()
    }

    pub async fn snapshot(&self) -> Vec<EntryInfo> {
        self.entries
            .read()
            .await
            .iter()
            .map(|entry| EntryInfo {
                owner: entry.owner().to_string(),
                template: entry.template().to_string(),
                wire_topic: entry.wire_topic().to_string(),
            })
            .collect()
    }

    /// Issue one broker subscribe per distinct wire topic.
    ///
    /// A transient failure is retried once after the configured delay; any
    /// other failure is logged and left alone.
    pub async fn subscribe_all(&self, transport: &dyn BrokerTransport) -> SubscribeSummary {
        let mut summary = SubscribeSummary::default();

        for (topic, qos) in self.wire_topics().await {
            if self.subscribed.lock().await.contains(&topic) {
                continue;
            }

            let span = mqtt_span!(operation = "subscribe", wire_topic = %topic);
            match self
                .subscribe_with_retry(transport, &topic, qos)
                .instrument(span)
                .await
            {
                Ok(()) => {
                    self.subscribed.lock().await.push(topic.clone());
                    summary.subscribed.push(topic);
                }
                Err(e) => {
                    let failure = DispatchError::subscription(topic.as_str(), e.to_string());
                    error!(error = %failure.sanitized(), "Subscription failed");
                    summary.failed.push(topic);
                }
            }
        }

        info!(
            subscribed = summary.subscribed.len(),
            failed = summary.failed.len(),
            "Subscriptions issued"
        );
        summary
    }

    async fn subscribe_with_retry(
        &self,
        transport: &dyn BrokerTransport,
        topic: &str,
        qos: QoS,
    ) -> Result<(), MqttError> {
        match transport.subscribe(topic, qos).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_transient() => {
                warn!(
                    error = %e,
                    retry_in_ms = self.settings.subscribe_retry_delay.as_millis() as u64,
                    "Subscribe hit a closed connection, retrying once"
                );
                tokio::time::sleep(self.settings.subscribe_retry_delay).await;
                transport.subscribe(topic, qos).await
            }
            Err(e) => Err(e),
        }
    }

    /// Stop dispatching, unsubscribe every wire topic and drop all entries
    pub async fn shutdown(&self, transport: &dyn BrokerTransport) -> usize {
        self.closed.store(true, Ordering::Release);

        let topics: Vec<String> = self.subscribed.lock().await.drain(..).collect();
        let mut removed = 0;
        for topic in &topics {
            match transport.unsubscribe(topic).await {
                Ok(()) => removed += 1,
                Err(e) => debug!(wire_topic = %topic, error = %e, "Unsubscribe failed during shutdown"),
            }
        }

        let dropped = {
            let mut entries = self.entries.write().await;
            let count = entries.len();
            entries.clear();
            count
        };
        info!(unsubscribed = removed, entries = dropped, "Subscription registry released");
        removed
    }
}

fn max_qos(a: QoS, b: QoS) -> QoS {
    fn rank(q: QoS) -> u8 {
        match q {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }
    if rank(b) > rank(a) {
        b
    } else {
        a
    }
}
