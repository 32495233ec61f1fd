//! In-process notifications
//!
//! The publisher announces every template-expanded publish on a
//! [`NotificationBus`], keyed by the logical template rather than the wire
//! topic. [`EventWaiter`] waits for named notifications with a deadline.

use crate::publish::PublishPayload;
use std::collections::BTreeSet;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Notification carried on the bus
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// A logical event was written to the broker
    Published {
        /// Template as declared by the publisher
        template: String,
        wire_topic: String,
        payload: PublishPayload,
    },
}

impl Notification {
    /// Name used to wait for this notification
    pub fn name(&self) -> &str {
        match self {
            Notification::Published { template, .. } => template,
        }
    }
}

/// Broadcast channel for [`Notification`]s
#[derive(Debug, Clone)]
pub struct NotificationBus {
    tx: broadcast::Sender<Notification>,
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl NotificationBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Deliver to every current subscriber; returns how many received it
    pub fn emit(&self, notification: Notification) -> usize {
        match self.tx.send(notification) {
            Ok(receivers) => receivers,
            Err(_) => {
                debug!("Notification dropped, no subscribers");
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    /// Waiter observing notifications emitted from now on
    pub fn waiter(&self) -> EventWaiter {
        EventWaiter {
            rx: self.tx.subscribe(),
        }
    }
}

/// Completion rule for [`EventWaiter::wait_for`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    /// Done after the first awaited notification
    AtLeastOne,
    /// Done once every awaited name was seen
    All,
}

#[derive(Debug, Error)]
pub enum WaitError {
    #[error("Timed out after receiving {} of the awaited notifications", received.len())]
    Timeout { received: Vec<Notification> },
    #[error("Notification bus closed")]
    Closed,
}

/// Waits for named notifications
pub struct EventWaiter {
    rx: broadcast::Receiver<Notification>,
}

impl EventWaiter {
    /// Collect notifications named in `names` until `mode` is satisfied.
    ///
    /// The deadline is checked before every receive: a notification still
    /// queued when the deadline passes does not count, the timeout wins.
    pub async fn wait_for(
        &mut self,
        names: &[&str],
        mode: WaitMode,
        timeout: Duration,
    ) -> Result<Vec<Notification>, WaitError> {
        let deadline = Instant::now() + timeout;
        let wanted: BTreeSet<&str> = names.iter().copied().collect();
        let mut seen: BTreeSet<String> = BTreeSet::new();
        let mut received = Vec::new();

        if wanted.is_empty() {
            return Ok(received);
        }

        loop {
            if Instant::now() >= deadline {
                return Err(WaitError::Timeout { received });
            }

            let notification = match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Err(_) => return Err(WaitError::Timeout { received }),
                Ok(Ok(notification)) => notification,
                Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    warn!(skipped = skipped, "Event waiter lagged behind the bus");
                    continue;
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => return Err(WaitError::Closed),
            };

            if !wanted.contains(notification.name()) {
                continue;
            }
            seen.insert(notification.name().to_string());
            received.push(notification);

            let done = match mode {
                WaitMode::AtLeastOne => true,
                WaitMode::All => seen.len() == wanted.len(),
            };
            if done {
                return Ok(received);
            }
        }
    }
}
