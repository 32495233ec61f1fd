//! Inbound message dispatch
//!
//! Every inbound message is matched against all registry entries. Each
//! matching entry decodes the payload with its own transform, so one entry's
//! failure never affects the others.
//!
//! Invocations go through one ordered lane per entry: a worker task starts
//! them in arrival order, each on its own task so a panic stays contained.
//! The dispatcher only enqueues and never waits for handlers.

pub mod args;
pub mod structured;

pub use args::{HandlerArg, HandlerArgs};
pub use structured::StructuredTopics;

use crate::dispatch_span;
use crate::error::DispatchError;
use crate::registry::{SubscriptionEntry, SubscriptionRegistry};
use crate::transport::RawPacket;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, Instrument};

/// Outcome of dispatching one message
#[derive(Debug, Default)]
pub struct DispatchReport {
    /// Entries whose matcher accepted the topic
    pub matched: usize,
    /// Entries skipped because their transform rejected the payload
    pub decode_failures: usize,
    /// Completion signals of the queued handler invocations
    pub invocations: Vec<oneshot::Receiver<()>>,
}

impl DispatchReport {
    pub fn invoked(&self) -> usize {
        self.invocations.len()
    }

    /// Wait until every queued invocation finished, failed or panicked
    pub async fn join(self) {
        for done in self.invocations {
            let _ = done.await;
        }
    }
}

/// Queued handler call
struct Invocation {
    args: HandlerArgs,
    topic: String,
    done: oneshot::Sender<()>,
}

pub struct Dispatcher {
    registry: Arc<SubscriptionRegistry>,
    structured: StructuredTopics,
    lanes: Mutex<HashMap<usize, mpsc::UnboundedSender<Invocation>>>,
}

impl Dispatcher {
    pub fn new(registry: Arc<SubscriptionRegistry>, structured: StructuredTopics) -> Self {
        Self {
            registry,
            structured,
            lanes: Mutex::new(HashMap::new()),
        }
    }

    /// Dispatch one inbound message to every matching entry
    pub async fn on_message(&self, packet: RawPacket) -> DispatchReport {
        let matches = self.registry.matching(&packet.topic).await;
        let mut report = DispatchReport {
            matched: matches.len(),
            ..DispatchReport::default()
        };

        if matches.is_empty() {
            debug!(topic = %packet.topic, "No subscription matched");
            return report;
        }

        for (entry, params) in matches {
            let mut payload = match entry.transform().decode(&packet.payload) {
                Ok(payload) => payload,
                Err(message) => {
                    let failure = DispatchError::decode(packet.topic.as_str(), message);
                    error!(
                        owner = %entry.owner(),
                        template = %entry.template(),
                        error = %failure.sanitized(),
                        "Skipping entry"
                    );
                    report.decode_failures += 1;
                    continue;
                }
            };

            if entry.transform().is_json() {
                if let Some(value) = payload.as_json_mut() {
                    self.structured.enrich(&packet.topic, value);
                }
            }

            let args = HandlerArgs::build(entry.params(), &payload, &packet, &params);
            report
                .invocations
                .push(self.enqueue(entry, args, packet.topic.clone()).await);
        }

        report
    }

    /// Queue an invocation on the entry's lane, starting the lane if needed
    async fn enqueue(
        &self,
        entry: Arc<SubscriptionEntry>,
        args: HandlerArgs,
        topic: String,
    ) -> oneshot::Receiver<()> {
        let (done, finished) = oneshot::channel();
        let mut invocation = Invocation { args, topic, done };
        let key = Arc::as_ptr(&entry) as usize;

        let mut lanes = self.lanes.lock().await;
        if let Some(lane) = lanes.get(&key) {
            match lane.send(invocation) {
                Ok(()) => return finished,
                Err(mpsc::error::SendError(returned)) => invocation = returned,
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::drain_lane(entry, rx));
        let _ = tx.send(invocation);
        lanes.insert(key, tx);
        finished
    }

    /// Start queued invocations one after another in arrival order
    async fn drain_lane(
        entry: Arc<SubscriptionEntry>,
        mut queue: mpsc::UnboundedReceiver<Invocation>,
    ) {
        while let Some(Invocation { args, topic, done }) = queue.recv().await {
            let handler = entry.handler().clone();
            let span = dispatch_span!(owner = %entry.owner(), topic = %topic);
            let outcome =
                tokio::spawn(async move { handler.handle(args).await }.instrument(span)).await;

            match outcome {
                Ok(Ok(())) => {
                    debug!(owner = %entry.owner(), topic = %topic, "Handler completed");
                }
                Ok(Err(e)) => {
                    error!(
                        owner = %entry.owner(),
                        topic = %topic,
                        error = %e.sanitized(),
                        "Handler failed"
                    );
                }
                Err(join_error) if join_error.is_panic() => {
                    error!(owner = %entry.owner(), topic = %topic, "Handler panicked");
                }
                Err(_) => {
                    debug!(owner = %entry.owner(), topic = %topic, "Handler cancelled");
                }
            }
            let _ = done.send(());
        }
    }

    /// Dispatch messages in arrival order until the channel closes or the
    /// registry shuts down.
    ///
    /// Lanes are released on exit; invocations already queued still run.
    pub async fn run(self: Arc<Self>, mut inbound: mpsc::Receiver<RawPacket>) {
        debug!("Dispatcher started");
        while let Some(packet) = inbound.recv().await {
            if self.registry.is_closed() {
                debug!(topic = %packet.topic, "Registry closed, dropping message");
                break;
            }
            self.on_message(packet).await;
        }
        self.lanes.lock().await.clear();
        debug!("Dispatcher stopped");
    }

    /// Spawn [`Dispatcher::run`] on a new task
    pub fn spawn(self: Arc<Self>, inbound: mpsc::Receiver<RawPacket>) -> JoinHandle<()> {
        tokio::spawn(self.run(inbound))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DispatchError;
    use crate::registry::{
        MessageHandler, ParamKind, PayloadTransform, RegistrySettings, SubscriptionDescriptor,
    };
    use crate::testing::RecordingHandler;
    use serde_json::json;

    struct PanickingHandler;

    #[async_trait::async_trait]
    impl MessageHandler for PanickingHandler {
        async fn handle(&self, _args: HandlerArgs) -> Result<(), DispatchError> {
            panic!("handler bug")
        }
    }

    async fn registry() -> Arc<SubscriptionRegistry> {
        Arc::new(SubscriptionRegistry::new(RegistrySettings::default()))
    }

    #[tokio::test]
    async fn test_overlapping_templates_fan_out() {
        // Arrange
        let registry = registry().await;
        let (specific, mut specific_rx) = RecordingHandler::new();
        let (wide, mut wide_rx) = RecordingHandler::new();
        registry
            .register(SubscriptionDescriptor::new("a", "app/:id/status", Arc::new(specific)))
            .await
            .unwrap();
        registry
            .register(SubscriptionDescriptor::new("b", "app/+/#", Arc::new(wide)))
            .await
            .unwrap();
        let dispatcher = Dispatcher::new(registry, StructuredTopics::default());

        // Act
        let report = dispatcher
            .on_message(RawPacket::new("app/42/status", r#"{"ok":true}"#))
            .await;
        assert_eq!(report.matched, 2);
        report.join().await;

        // Assert
        assert_eq!(specific_rx.recv().await.unwrap().json(), Some(&json!({"ok": true})));
        assert!(wide_rx.recv().await.is_some());
        assert!(specific_rx.try_recv().is_err());
        assert!(wide_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_decode_failure_isolated_per_entry() {
        let registry = registry().await;
        let (json_handler, mut json_rx) = RecordingHandler::new();
        let (text_handler, mut text_rx) = RecordingHandler::new();
        registry
            .register(SubscriptionDescriptor::new("json", "logs/:svc", Arc::new(json_handler)))
            .await
            .unwrap();
        registry
            .register(
                SubscriptionDescriptor::new("text", "logs/:svc", Arc::new(text_handler))
                    .transform(PayloadTransform::Text),
            )
            .await
            .unwrap();
        let dispatcher = Dispatcher::new(registry, StructuredTopics::default());

        let report = dispatcher.on_message(RawPacket::new("logs/api", "plain line")).await;

        assert_eq!(report.matched, 2);
        assert_eq!(report.decode_failures, 1);
        assert_eq!(report.invoked(), 1);
        report.join().await;
        assert_eq!(
            text_rx.recv().await.unwrap().payload().and_then(|p| p.as_text()),
            Some("plain line")
        );
        assert!(json_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_handler_failure_does_not_stop_others() {
        let registry = registry().await;
        let (failing, mut failing_rx) = RecordingHandler::failing();
        let (healthy, mut healthy_rx) = RecordingHandler::new();
        registry
            .register(SubscriptionDescriptor::new("bad", "x/y", Arc::new(failing)))
            .await
            .unwrap();
        registry
            .register(SubscriptionDescriptor::new(
                "panics",
                "x/y",
                Arc::new(PanickingHandler),
            ))
            .await
            .unwrap();
        registry
            .register(SubscriptionDescriptor::new("good", "x/y", Arc::new(healthy)))
            .await
            .unwrap();
        let dispatcher = Dispatcher::new(registry, StructuredTopics::default());

        let report = dispatcher.on_message(RawPacket::new("x/y", "{}")).await;
        assert_eq!(report.invoked(), 3);
        report.join().await;

        assert!(failing_rx.recv().await.is_some());
        assert!(healthy_rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_structured_topic_enrichment() {
        let registry = registry().await;
        let (handler, mut rx) = RecordingHandler::new();
        registry
            .register(
                SubscriptionDescriptor::new("monitoring", "platform/:appId/monitoring/record", Arc::new(handler))
                    .param(ParamKind::Payload)
                    .param(ParamKind::Topic),
            )
            .await
            .unwrap();
        let structured = StructuredTopics::new(["platform/:appId/monitoring/record"]).unwrap();
        let dispatcher = Dispatcher::new(registry, structured);

        dispatcher
            .on_message(RawPacket::new("platform/app1/monitoring/record", r#"{"v":1}"#))
            .await
            .join()
            .await;

        let args = rx.recv().await.unwrap();
        assert_eq!(args.json(), Some(&json!({"v": 1, "appId": "app1"})));
        assert_eq!(args.topic(), Some("platform/app1/monitoring/record"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_run_preserves_arrival_order_per_topic() {
        // Arrange
        let registry = registry().await;
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        registry
            .register(
                SubscriptionDescriptor::new(
                    "seq",
                    "seq/topic",
                    crate::registry::handler_fn(move |args: HandlerArgs| {
                        let sink = sink.clone();
                        async move {
                            let n: u32 = args
                                .payload()
                                .and_then(|p| p.as_text())
                                .and_then(|text| text.parse().ok())
                                .ok_or_else(|| DispatchError::handler("not a number"))?;
                            sink.lock().unwrap().push(n);
                            tokio::task::yield_now().await;
                            Ok::<(), DispatchError>(())
                        }
                    }),
                )
                .transform(PayloadTransform::Text)
                .param(ParamKind::Payload),
            )
            .await
            .unwrap();
        let dispatcher = Arc::new(Dispatcher::new(registry, StructuredTopics::default()));
        let (tx, inbound) = mpsc::channel(64);
        let task = dispatcher.spawn(inbound);

        // Act
        for n in 0..2000u32 {
            tx.send(RawPacket::new("seq/topic", n.to_string())).await.unwrap();
        }
        drop(tx);
        task.await.unwrap();

        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(10);
        while seen.lock().unwrap().len() < 2000 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        // Assert
        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen, (0..2000).collect::<Vec<u32>>());
    }

    #[tokio::test]
    async fn test_slow_handler_does_not_block_dispatch() {
        let registry = registry().await;
        let gate = Arc::new(tokio::sync::Notify::new());
        let waiting = gate.clone();
        registry
            .register(SubscriptionDescriptor::new(
                "slow",
                "slow/topic",
                crate::registry::handler_fn(move |_args: HandlerArgs| {
                    let waiting = waiting.clone();
                    async move {
                        waiting.notified().await;
                        Ok::<(), DispatchError>(())
                    }
                }),
            ))
            .await
            .unwrap();
        let dispatcher = Dispatcher::new(registry, StructuredTopics::default());

        let first = dispatcher.on_message(RawPacket::new("slow/topic", "{}")).await;
        let second = dispatcher.on_message(RawPacket::new("slow/topic", "{}")).await;
        assert_eq!(first.invoked() + second.invoked(), 2);

        gate.notify_one();
        first.join().await;
        gate.notify_one();
        second.join().await;
    }

    #[tokio::test]
    async fn test_no_match_reports_zero() {
        let dispatcher = Dispatcher::new(registry().await, StructuredTopics::default());
        let report = dispatcher.on_message(RawPacket::new("nobody/listens", "{}")).await;
        assert_eq!(report.matched, 0);
        assert_eq!(report.invoked(), 0);
    }
}
