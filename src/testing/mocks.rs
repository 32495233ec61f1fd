//! Mock implementations for testing
//!
//! A broker transport that records every call and a token issuer with
//! scripted results, so the registry, publisher and credential provider can
//! be exercised without a broker or identity server.

use crate::auth::{AuthError, IssuedToken, TokenIssuer};
use crate::dispatch::HandlerArgs;
use crate::error::DispatchError;
use crate::registry::MessageHandler;
use crate::transport::{BrokerTransport, ConnectionState, MqttError};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use rumqttc::v5::mqttbytes::QoS;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Message written through [`MockTransport::publish`]
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

impl PublishedMessage {
    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.payload).ok()
    }
}

/// Scripted transport failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    /// Connection closed underneath the call
    Transient,
    /// Broker refused the request
    Rejected,
    /// Connection is shutting down
    Closing,
}

impl MockFailure {
    fn to_error(self) -> MqttError {
        match self {
            MockFailure::Transient => MqttError::ConnectionClosed("connection closed".to_string()),
            MockFailure::Rejected => MqttError::SubscriptionFailed("not authorized".into()),
            MockFailure::Closing => MqttError::Closing,
        }
    }
}

/// Recording broker transport
#[derive(Debug)]
pub struct MockTransport {
    subscribe_calls: Mutex<Vec<String>>,
    unsubscribe_calls: Mutex<Vec<String>>,
    active: Mutex<Vec<String>>,
    published: Mutex<Vec<PublishedMessage>>,
    subscribe_failures: Mutex<HashMap<String, VecDeque<MockFailure>>>,
    publish_failure: Mutex<Option<MockFailure>>,
    closing: AtomicBool,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self {
            subscribe_calls: Mutex::new(Vec::new()),
            unsubscribe_calls: Mutex::new(Vec::new()),
            active: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
            subscribe_failures: Mutex::new(HashMap::new()),
            publish_failure: Mutex::new(None),
            closing: AtomicBool::new(false),
        }
    }
}

impl MockTransport {
    /// Connected transport that accepts everything
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next subscribe to `topic`; calls queue up
    pub fn fail_next_subscribe(&self, topic: &str, failure: MockFailure) {
        lock(&self.subscribe_failures)
            .entry(topic.to_string())
            .or_default()
            .push_back(failure);
    }

    /// Fail every publish until cleared with `None`
    pub fn fail_publishes(&self, failure: Option<MockFailure>) {
        *lock(&self.publish_failure) = failure;
    }

    pub fn set_closing(&self, closing: bool) {
        self.closing.store(closing, Ordering::Release);
    }

    pub fn subscribe_calls(&self) -> Vec<String> {
        lock(&self.subscribe_calls).clone()
    }

    pub fn unsubscribe_calls(&self) -> Vec<String> {
        lock(&self.unsubscribe_calls).clone()
    }

    /// Wire topics currently subscribed
    pub fn active_subscriptions(&self) -> Vec<String> {
        lock(&self.active).clone()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.published).clone()
    }

    pub fn clear_history(&self) {
        lock(&self.subscribe_calls).clear();
        lock(&self.unsubscribe_calls).clear();
        lock(&self.published).clear();
    }
}

#[async_trait]
impl BrokerTransport for MockTransport {
    async fn subscribe(&self, topic: &str, _qos: QoS) -> Result<(), MqttError> {
        lock(&self.subscribe_calls).push(topic.to_string());

        let scripted = lock(&self.subscribe_failures)
            .get_mut(topic)
            .and_then(|queue| queue.pop_front());
        if let Some(failure) = scripted {
            return Err(failure.to_error());
        }

        let mut active = lock(&self.active);
        if !active.iter().any(|t| t == topic) {
            active.push(topic.to_string());
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), MqttError> {
        lock(&self.unsubscribe_calls).push(topic.to_string());
        lock(&self.active).retain(|t| t != topic);
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> Result<(), MqttError> {
        if let Some(failure) = *lock(&self.publish_failure) {
            return Err(failure.to_error());
        }

        lock(&self.published).push(PublishedMessage {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
        });
        Ok(())
    }

    fn connection_state(&self) -> ConnectionState {
        if self.is_closing() {
            ConnectionState::Closed
        } else {
            ConnectionState::Connected
        }
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }
}

/// Token issuer with scripted results
///
/// Successful tokens are numbered `token-1`, `token-2`, ... in call order.
#[derive(Debug)]
pub struct MockTokenIssuer {
    lifetime: Duration,
    failure: Option<AuthError>,
    delay: Duration,
    calls: AtomicUsize,
}

impl MockTokenIssuer {
    /// Issue tokens valid for `lifetime`
    pub fn expiring_in(lifetime: Duration) -> Self {
        Self {
            lifetime,
            failure: None,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    /// Fail every request with `error`
    pub fn failing(error: AuthError) -> Self {
        Self {
            failure: Some(error),
            ..Self::expiring_in(Duration::ZERO)
        }
    }

    /// Hold each response for `delay`
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenIssuer for MockTokenIssuer {
    async fn issue_token(&self) -> Result<IssuedToken, AuthError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if let Some(error) = &self.failure {
            return Err(error.clone());
        }

        let lifetime = chrono::Duration::from_std(self.lifetime)
            .unwrap_or_else(|_| chrono::Duration::days(1));
        Ok(IssuedToken {
            access_token: format!("token-{n}"),
            expires_at: Utc::now() + lifetime,
        })
    }
}

/// Handler forwarding every invocation to a channel
pub struct RecordingHandler {
    tx: mpsc::UnboundedSender<HandlerArgs>,
    fail: bool,
}

impl RecordingHandler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<HandlerArgs>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, fail: false }, rx)
    }

    /// Record the call, then return an error
    pub fn failing() -> (Self, mpsc::UnboundedReceiver<HandlerArgs>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, fail: true }, rx)
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(&self, args: HandlerArgs) -> Result<(), DispatchError> {
        let _ = self.tx.send(args);
        if self.fail {
            return Err(DispatchError::handler("scripted handler failure"));
        }
        Ok(())
    }
}
