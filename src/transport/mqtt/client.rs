//! Impure I/O for the broker connection
//!
//! [`MqttConnectionManager`] owns the broker session. A supervisor task polls
//! the event loop, forwards inbound publishes, rebuilds the session on errors
//! and credential rotation, and re-issues tracked subscriptions after every
//! acknowledged session.

use super::connection::{
    configure_mqtt_options, generate_client_id, ConnectionState, FatalHook, MqttError,
    ReconnectPolicy,
};
use super::health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision, RetryBudget};
use super::message_handler::{EventRoute, MessageHandler};
use crate::auth::{spawn_refresh_loop, CredentialProvider, Credentials};
use crate::config::BrokerSection;
use crate::transport::{BrokerTransport, RawPacket};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::v5::{mqttbytes::QoS, AsyncClient, EventLoop};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

type SharedClient = Arc<Mutex<Option<AsyncClient>>>;
/// Wire topics with the QoS they were granted at
type SubscribedTopics = Arc<Mutex<Vec<(String, QoS)>>>;

/// Broker session owner
pub struct MqttConnectionManager {
    client_id: String,
    broker: BrokerSection,
    policy: ReconnectPolicy,
    credentials: Arc<CredentialProvider>,
    refresh_interval: Duration,
    client: SharedClient,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    closing: Arc<AtomicBool>,
    subscribed_topics: SubscribedTopics,
    inbound_tx: Mutex<Option<mpsc::Sender<RawPacket>>>,
    fatal: FatalHook,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MqttConnectionManager {
    pub fn new(
        broker: BrokerSection,
        policy: ReconnectPolicy,
        credentials: Arc<CredentialProvider>,
        refresh_interval: Duration,
        inbound_tx: mpsc::Sender<RawPacket>,
        fatal: FatalHook,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            client_id: generate_client_id(&broker.client_id_prefix),
            broker,
            policy,
            credentials,
            refresh_interval,
            client: Arc::new(Mutex::new(None)),
            state_tx,
            state_rx,
            shutdown_tx,
            closing: Arc::new(AtomicBool::new(false)),
            subscribed_topics: Arc::new(Mutex::new(Vec::new())),
            inbound_tx: Mutex::new(Some(inbound_tx)),
            fatal,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Subscribe to connection state changes
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Wire topics re-issued after every reconnect
    pub async fn tracked_subscriptions(&self) -> Vec<(String, QoS)> {
        self.subscribed_topics.lock().await.clone()
    }

    fn create_connection(
        client_id: &str,
        broker: &BrokerSection,
        credentials: Option<&Credentials>,
    ) -> Result<(AsyncClient, EventLoop), MqttError> {
        let mqtt_options = configure_mqtt_options(client_id, broker, credentials)?;
        Ok(AsyncClient::new(mqtt_options, broker.channel_capacity))
    }

    /// Establish the session and start the supervisor.
    ///
    /// Returns once the broker acknowledged a session. Connection errors in
    /// the meantime go through the reconnect path; the call fails when the
    /// supervisor gives up or the confirmation times out.
    pub async fn connect(&self) -> Result<(), MqttError> {
        let inbound_tx = self.inbound_tx.lock().await.take().ok_or_else(|| {
            MqttError::ConnectionFailedStr("Connection already started".to_string())
        })?;

        let credentials = self.credentials.initial_credentials().await;
        let (client, event_loop) =
            Self::create_connection(&self.client_id, &self.broker, credentials.as_ref())?;
        *self.client.lock().await = Some(client);

        info!(
            client_id = %self.client_id,
            broker = %self.broker.url,
            authenticated = credentials.is_some(),
            "Connecting to broker"
        );

        let (rotations_tx, rotations_rx) = mpsc::channel(4);
        let supervisor = Supervisor {
            client_id: self.client_id.clone(),
            broker: self.broker.clone(),
            budget: RetryBudget::new(self.policy.clone()),
            credentials: self.credentials.clone(),
            client: self.client.clone(),
            state_tx: self.state_tx.clone(),
            shutdown_rx: self.shutdown_tx.subscribe(),
            closing: self.closing.clone(),
            subscribed_topics: self.subscribed_topics.clone(),
            inbound_tx,
            rotations_rx,
            fatal: self.fatal.clone(),
        };

        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(supervisor.run(event_loop)));
        if let Some(handle) = spawn_refresh_loop(
            self.credentials.clone(),
            self.refresh_interval,
            rotations_tx,
            self.shutdown_tx.subscribe(),
        ) {
            tasks.push(handle);
        }
        drop(tasks);

        let timeout = HealthMonitor::calculate_connection_timeout(&self.policy);
        Self::wait_for_connection_confirmation(self.state_rx.clone(), timeout).await
    }

    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<ConnectionState>,
        timeout: Duration,
    ) -> Result<(), MqttError> {
        let timeout_result = tokio::time::timeout(timeout, async {
            loop {
                match &*state_rx.borrow_and_update() {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Closed => {
                        return Err(MqttError::ConnectionFailedStr(
                            "Connection closed before acknowledgement".to_string(),
                        ));
                    }
                    _ => {}
                }
                if state_rx.changed().await.is_err() {
                    return Err(MqttError::ConnectionFailedStr(
                        "State channel closed".to_string(),
                    ));
                }
            }
        })
        .await;

        match timeout_result {
            Ok(result) => result,
            Err(_) => Err(MqttError::ConnectionFailedStr(
                "ConnAck timeout - no connection confirmation received".to_string(),
            )),
        }
    }

    async fn current_client(&self) -> Result<AsyncClient, MqttError> {
        self.client
            .lock()
            .await
            .clone()
            .ok_or_else(|| MqttError::NotConnected {
                state: self.connection_state(),
            })
    }

    /// Stop the supervisor, end the session and release the inbound channel.
    ///
    /// Connection errors raised after this point are not propagated.
    pub async fn shutdown(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(client_id = %self.client_id, "Shutting down broker connection");

        let _ = self.shutdown_tx.send(true);
        if let Some(client) = self.client.lock().await.take() {
            if let Err(e) = client.try_disconnect() {
                debug!(error = %e, "Disconnect request not delivered");
            }
        }
        self.inbound_tx.lock().await.take();

        let handles: Vec<_> = self.tasks.lock().await.drain(..).collect();
        for handle in handles {
            if tokio::time::timeout(Duration::from_secs(2), handle)
                .await
                .is_err()
            {
                warn!("Connection task did not stop within timeout");
            }
        }

        let _ = self.state_tx.send(ConnectionState::Closed);
    }
}

#[async_trait]
impl BrokerTransport for MqttConnectionManager {
    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), MqttError> {
        let state = self.connection_state();
        if !HealthMonitor::can_subscribe(&state) {
            return Err(MqttError::NotConnected { state });
        }

        let client = self.current_client().await?;
        client
            .subscribe(topic, qos)
            .await
            .map_err(|e| MqttError::SubscriptionFailed(Box::new(e)))?;

        let mut topics = self.subscribed_topics.lock().await;
        match topics.iter().position(|tracked| tracked.0 == topic) {
            Some(index) => topics[index].1 = qos,
            None => topics.push((topic.to_string(), qos)),
        }
        debug!(topic = %topic, "Subscribed");
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), MqttError> {
        self.subscribed_topics
            .lock()
            .await
            .retain(|tracked| tracked.0 != topic);

        let state = self.connection_state();
        if !HealthMonitor::can_subscribe(&state) {
            return Err(MqttError::NotConnected { state });
        }

        let client = self.current_client().await?;
        client
            .unsubscribe(topic)
            .await
            .map_err(|e| MqttError::SubscriptionFailed(Box::new(e)))?;
        debug!(topic = %topic, "Unsubscribed");
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), MqttError> {
        if self.is_closing() {
            return Err(MqttError::Closing);
        }
        let state = self.connection_state();
        if !HealthMonitor::can_publish(&state) {
            return Err(MqttError::NotConnected { state });
        }

        let client = self.current_client().await?;
        client
            .publish(topic, qos, retain, payload)
            .await
            .map_err(|e| MqttError::PublishFailed(Box::new(e)))
    }

    fn connection_state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }
}

/// What the supervisor loop does next
enum LoopControl {
    Continue,
    Replace(EventLoop),
    Stop,
}

/// Event loop owner running on its own task
struct Supervisor {
    client_id: String,
    broker: BrokerSection,
    budget: RetryBudget,
    credentials: Arc<CredentialProvider>,
    client: SharedClient,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_rx: watch::Receiver<bool>,
    closing: Arc<AtomicBool>,
    subscribed_topics: SubscribedTopics,
    inbound_tx: mpsc::Sender<RawPacket>,
    rotations_rx: mpsc::Receiver<Credentials>,
    fatal: FatalHook,
}

impl Supervisor {
    async fn run(mut self, mut event_loop: EventLoop) {
        info!(client_id = %self.client_id, "Starting broker supervisor");

        loop {
            let control = tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping broker supervisor");
                        LoopControl::Stop
                    } else {
                        LoopControl::Continue
                    }
                }

                Some(credentials) = self.rotations_rx.recv() => self.rotate(credentials).await,

                event_result = event_loop.poll() => match event_result {
                    Ok(event) => {
                        let route = MessageHandler::route_mqtt_event(&event);
                        self.process_event_route(route).await
                    }
                    Err(e) => self.handle_connection_error(e.to_string()).await,
                }
            };

            match control {
                LoopControl::Continue => {}
                LoopControl::Replace(new_loop) => event_loop = new_loop,
                LoopControl::Stop => break,
            }
        }

        if !self.closing.load(Ordering::Acquire) {
            self.transition(ConnectionEvent::Closed);
        }
        info!(client_id = %self.client_id, "Broker supervisor stopped");
    }

    fn transition(&self, event: ConnectionEvent) {
        let current = self.state_tx.borrow().clone();
        let next = HealthMonitor::determine_next_state(&current, event);
        if current != next {
            HealthMonitor::log_state_transition(&current, &next);
        }
        let _ = self.state_tx.send(next);
    }

    async fn process_event_route(&mut self, route: EventRoute) -> LoopControl {
        match route {
            EventRoute::ConnectionAcknowledged => {
                self.transition(ConnectionEvent::ConnAckReceived);
                self.budget.reset();
                self.resubscribe().await;
                LoopControl::Continue
            }
            EventRoute::MessageReceived(packet) => {
                debug!(topic = %packet.topic, bytes = packet.payload.len(), "Inbound message");
                if self.inbound_tx.send(packet).await.is_err() {
                    debug!("Inbound receiver dropped, message discarded");
                }
                LoopControl::Continue
            }
            EventRoute::Disconnected => {
                self.handle_connection_error("Broker disconnected".to_string())
                    .await
            }
            EventRoute::SubscriptionConfirmed {
                packet_id,
                rejected,
            } => {
                if rejected > 0 {
                    warn!(packet_id = packet_id, rejected = rejected, "Broker rejected subscription");
                } else {
                    debug!(packet_id = packet_id, "Subscription confirmed");
                }
                LoopControl::Continue
            }
            EventRoute::InfrastructureEvent(event) => {
                debug!(target: "mqtt_transport", "MQTT event: {}", event);
                LoopControl::Continue
            }
            EventRoute::OutgoingEvent => LoopControl::Continue,
        }
    }

    async fn handle_connection_error(&mut self, reason: String) -> LoopControl {
        if self.closing.load(Ordering::Acquire) {
            debug!(reason = %reason, "Connection error during shutdown ignored");
            return LoopControl::Stop;
        }

        error!(
            reason = %crate::error::sanitize_error_message(&reason),
            "Broker connection error"
        );
        self.transition(ConnectionEvent::NetworkError(reason.clone()));

        match HealthMonitor::on_connection_error(&mut self.budget, &self.fatal, &reason) {
            ReconnectionDecision::Retry { attempt, delay } => {
                self.transition(ConnectionEvent::ReconnectionStarted(attempt));
                if !Self::interruptible_sleep(self.shutdown_rx.clone(), delay).await {
                    return LoopControl::Stop;
                }

                let credentials = match self.credentials.force_refresh().await {
                    Some(fresh) => Some(fresh),
                    None => self.credentials.credentials().await,
                };
                self.replace_session(credentials.as_ref()).await
            }
            ReconnectionDecision::Suppressed | ReconnectionDecision::Fatal { .. } => {
                LoopControl::Stop
            }
        }
    }

    /// Returns false when shutdown was requested during the delay
    async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay: Duration) -> bool {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("Shutdown signal received during reconnection delay, stopping");
                    return false;
                }
                true
            }
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Force the session down and rebuild it with rotated credentials
    async fn rotate(&self, credentials: Credentials) -> LoopControl {
        info!("Broker credential rotated, rebuilding session");
        self.transition(ConnectionEvent::CredentialRotated);
        self.replace_session(Some(&credentials)).await
    }

    /// End the current session and build a new one with `credentials`.
    ///
    /// Options that cannot be built will not build on a later attempt either,
    /// so a failure here goes straight to the fatal hook.
    async fn replace_session(&self, credentials: Option<&Credentials>) -> LoopControl {
        match MqttConnectionManager::create_connection(&self.client_id, &self.broker, credentials) {
            Ok((new_client, new_event_loop)) => {
                let mut guard = self.client.lock().await;
                if let Some(old) = guard.replace(new_client) {
                    let _ = old.try_disconnect();
                }
                info!("Created new broker session");
                LoopControl::Replace(new_event_loop)
            }
            Err(e) => {
                let reason = e.to_string();
                error!(error = %reason, "Failed to create broker session");
                self.fatal.trigger(&reason);
                LoopControl::Stop
            }
        }
    }

    /// Re-issue tracked subscriptions on the current client.
    ///
    /// Runs on a separate task so the event loop keeps being polled while the
    /// requests are queued.
    async fn resubscribe(&self) {
        let topics = self.subscribed_topics.lock().await.clone();
        if topics.is_empty() {
            return;
        }
        let Some(client) = self.client.lock().await.clone() else {
            return;
        };

        tokio::spawn(async move {
            for (topic, qos) in topics {
                match client.subscribe(topic.as_str(), qos).await {
                    Ok(()) => debug!(target: "mqtt_transport", qos = ?qos, "Re-subscribed to: {}", topic),
                    Err(e) => error!("Failed to re-subscribe to {}: {}", topic, e),
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTokenIssuer;
    use std::sync::atomic::AtomicUsize;

    fn broker() -> BrokerSection {
        BrokerSection {
            url: "mqtt://127.0.0.1:1".to_string(),
            client_id_prefix: "td-test".to_string(),
            username_env: None,
            password_env: None,
            keep_alive_secs: 5,
            max_packet_kb: 64,
            channel_capacity: 8,
        }
    }

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy {
            max_retries: 3,
            delay: Duration::from_millis(10),
            test_mode: false,
        }
    }

    fn manager(fatal: FatalHook) -> (MqttConnectionManager, mpsc::Receiver<RawPacket>) {
        manager_with(Arc::new(CredentialProvider::anonymous()), fatal)
    }

    fn manager_with(
        credentials: Arc<CredentialProvider>,
        fatal: FatalHook,
    ) -> (MqttConnectionManager, mpsc::Receiver<RawPacket>) {
        let (tx, rx) = mpsc::channel(8);
        let manager = MqttConnectionManager::new(
            broker(),
            policy(),
            credentials,
            Duration::from_secs(10),
            tx,
            fatal,
        );
        (manager, rx)
    }

    fn token_provider(issuer: Arc<MockTokenIssuer>) -> Arc<CredentialProvider> {
        Arc::new(CredentialProvider::issued(
            issuer,
            "dispatcher",
            Duration::from_secs(60),
        ))
    }

    /// Supervisor over an unpolled session, plus the ends tests drive it with
    struct Harness {
        supervisor: Supervisor,
        rotations_tx: mpsc::Sender<Credentials>,
        state_rx: watch::Receiver<ConnectionState>,
        shutdown_tx: watch::Sender<bool>,
        _event_loop: EventLoop,
        _inbound_rx: mpsc::Receiver<RawPacket>,
    }

    fn harness(credentials: Arc<CredentialProvider>, fatal: FatalHook) -> Harness {
        let (client, event_loop) =
            MqttConnectionManager::create_connection("td-test-harness", &broker(), None).unwrap();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connected);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (inbound_tx, inbound_rx) = mpsc::channel(8);
        let (rotations_tx, rotations_rx) = mpsc::channel(4);

        let supervisor = Supervisor {
            client_id: "td-test-harness".to_string(),
            broker: broker(),
            budget: RetryBudget::new(policy()),
            credentials,
            client: Arc::new(Mutex::new(Some(client))),
            state_tx,
            shutdown_rx,
            closing: Arc::new(AtomicBool::new(false)),
            subscribed_topics: Arc::new(Mutex::new(Vec::new())),
            inbound_tx,
            rotations_rx,
            fatal,
        };

        Harness {
            supervisor,
            rotations_tx,
            state_rx,
            shutdown_tx,
            _event_loop: event_loop,
            _inbound_rx: inbound_rx,
        }
    }

    #[tokio::test]
    async fn test_operations_rejected_before_connect() {
        let (manager, _rx) = manager(FatalHook::new(|_| {}));

        assert_eq!(manager.connection_state(), ConnectionState::Connecting);
        let result = manager.subscribe("a/b", QoS::AtLeastOnce).await;
        assert!(matches!(result, Err(MqttError::NotConnected { .. })));

        let result = manager
            .publish("a/b", Bytes::from_static(b"x"), QoS::AtLeastOnce, false)
            .await;
        assert!(matches!(result, Err(MqttError::NotConnected { .. })));
    }

    #[tokio::test]
    async fn test_publish_rejected_while_closing() {
        let (manager, _rx) = manager(FatalHook::new(|_| {}));
        manager.shutdown().await;

        assert!(manager.is_closing());
        assert_eq!(manager.connection_state(), ConnectionState::Closed);
        let result = manager
            .publish("a/b", Bytes::from_static(b"x"), QoS::AtLeastOnce, false)
            .await;
        assert!(matches!(result, Err(MqttError::Closing)));
    }

    #[tokio::test]
    async fn test_unreachable_broker_hits_fatal_hook_once() {
        let fired = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let seen = fired.clone();
        let (manager, _rx) = manager(FatalHook::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        let result = manager.connect().await;

        assert!(result.is_err());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(manager.connection_state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_connect_twice_is_rejected() {
        let (manager, _rx) = manager(FatalHook::new(|_| {}));
        let _ = manager.connect().await;

        let second = manager.connect().await;
        assert!(matches!(second, Err(MqttError::ConnectionFailedStr(_))));
    }

    #[tokio::test]
    async fn test_tracked_subscriptions_keep_requested_qos() {
        // Arrange
        let (manager, _rx) = manager(FatalHook::new(|_| {}));
        let (client, _event_loop) =
            MqttConnectionManager::create_connection(manager.client_id(), &broker(), None)
                .unwrap();
        *manager.client.lock().await = Some(client);
        manager.state_tx.send(ConnectionState::Connected).unwrap();

        // Act
        manager.subscribe("fleet/+/status", QoS::ExactlyOnce).await.unwrap();
        manager.subscribe("alerts/global", QoS::AtMostOnce).await.unwrap();
        manager.subscribe("fleet/+/status", QoS::ExactlyOnce).await.unwrap();

        // Assert
        assert_eq!(
            manager.tracked_subscriptions().await,
            vec![
                ("fleet/+/status".to_string(), QoS::ExactlyOnce),
                ("alerts/global".to_string(), QoS::AtMostOnce),
            ]
        );

        manager.unsubscribe("alerts/global").await.unwrap();
        assert_eq!(
            manager.tracked_subscriptions().await,
            vec![("fleet/+/status".to_string(), QoS::ExactlyOnce)]
        );
    }

    #[tokio::test]
    async fn test_reconnect_refreshes_token_before_each_retry() {
        // Arrange
        let issuer = Arc::new(MockTokenIssuer::expiring_in(Duration::from_secs(3600)));
        let calls_at_fatal = Arc::new(AtomicUsize::new(0));
        let fatal = {
            let issuer = issuer.clone();
            let calls_at_fatal = calls_at_fatal.clone();
            FatalHook::new(move |_| calls_at_fatal.store(issuer.calls(), Ordering::SeqCst))
        };
        let provider = token_provider(issuer.clone());
        let (manager, _rx) = manager_with(provider.clone(), fatal);

        // Act
        let result = manager.connect().await;

        // Assert: one initial token, then one refresh per retry before the bound
        assert!(result.is_err());
        let retries = policy().max_retries as usize - 1;
        assert_eq!(calls_at_fatal.load(Ordering::SeqCst), 1 + retries);
        assert_eq!(
            provider.credentials().await,
            Some(Credentials::new("dispatcher", format!("token-{}", 1 + retries)))
        );
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_rotation_from_refresh_loop_rebuilds_session() {
        // Arrange: a token inside the refresh margin is rotated on every tick
        let issuer = Arc::new(MockTokenIssuer::expiring_in(Duration::from_secs(30)));
        let provider = token_provider(issuer.clone());
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let mut harness = harness(
            provider.clone(),
            FatalHook::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let refresh = spawn_refresh_loop(
            provider,
            Duration::from_millis(20),
            harness.rotations_tx.clone(),
            harness.shutdown_tx.subscribe(),
        )
        .unwrap();

        // Act
        let rotated = tokio::time::timeout(
            Duration::from_secs(2),
            harness.supervisor.rotations_rx.recv(),
        )
        .await
        .unwrap()
        .unwrap();
        let control = harness.supervisor.rotate(rotated.clone()).await;

        // Assert
        assert_eq!(rotated.username, "dispatcher");
        assert!(rotated.password.starts_with("token-"));
        assert!(issuer.calls() >= 1);
        assert!(matches!(control, LoopControl::Replace(_)));
        assert_eq!(*harness.state_rx.borrow(), ConnectionState::Reconnecting(0));
        assert!(harness.supervisor.client.lock().await.is_some());
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        drop(harness);
        tokio::time::timeout(Duration::from_secs(2), refresh)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_unbuildable_session_is_fatal_without_retry() {
        // Arrange
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let mut harness = harness(
            Arc::new(CredentialProvider::anonymous()),
            FatalHook::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        harness.supervisor.broker.url = "not a broker url".to_string();

        // Act
        let control = harness.supervisor.replace_session(None).await;

        // Assert
        assert!(matches!(control, LoopControl::Stop));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(harness.supervisor.budget.consecutive_errors(), 0);
    }
}
