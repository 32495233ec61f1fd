//! Pure reconnection logic for the MQTT connection manager
//!
//! Tracks consecutive connection errors against the retry bound and maps
//! connection events to state transitions.

use super::connection::{ConnectionState, FatalHook, ReconnectPolicy};
use std::time::Duration;
use tracing::{error, info, warn};

/// Decision taken after a connection error
#[derive(Debug, Clone, PartialEq)]
pub enum ReconnectionDecision {
    /// Rebuild the session after `delay`
    Retry { attempt: u32, delay: Duration },
    /// Stop reconnecting without exiting
    Suppressed,
    /// Retry bound reached
    Fatal { attempts: u32 },
}

/// Consecutive connection error counter
#[derive(Debug, Clone)]
pub struct RetryBudget {
    policy: ReconnectPolicy,
    consecutive_errors: u32,
    attempts_made: u32,
    exhausted: bool,
}

impl RetryBudget {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            consecutive_errors: 0,
            attempts_made: 0,
            exhausted: false,
        }
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    /// Record one connection error.
    ///
    /// `Fatal` is returned exactly once, on the error that reaches
    /// `max_retries`; every later call is `Suppressed`.
    pub fn record_error(&mut self) -> ReconnectionDecision {
        if self.exhausted {
            return ReconnectionDecision::Suppressed;
        }

        self.consecutive_errors += 1;
        if self.consecutive_errors >= self.policy.max_retries {
            self.exhausted = true;
            return ReconnectionDecision::Fatal {
                attempts: self.consecutive_errors,
            };
        }

        if self.policy.test_mode && self.attempts_made >= 1 {
            return ReconnectionDecision::Suppressed;
        }

        self.attempts_made += 1;
        ReconnectionDecision::Retry {
            attempt: self.consecutive_errors,
            delay: self.policy.delay,
        }
    }

    /// Successful session; the error count starts over
    pub fn reset(&mut self) {
        self.consecutive_errors = 0;
    }
}

/// Connection events that trigger state transitions
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// ConnAck received from broker
    ConnAckReceived,
    /// Broker initiated disconnect
    DisconnectedByBroker,
    /// Network or protocol error
    NetworkError(String),
    /// Reconnection attempt scheduled
    ReconnectionStarted(u32),
    /// Credential rotated, session being rebuilt
    CredentialRotated,
    /// Shutdown or retry bound reached
    Closed,
}

/// Pure health monitoring and reconnection decision logic
pub struct HealthMonitor;

impl HealthMonitor {
    /// Record a connection error and fire the fatal hook when the bound is hit
    pub fn on_connection_error(
        budget: &mut RetryBudget,
        fatal: &FatalHook,
        reason: &str,
    ) -> ReconnectionDecision {
        let decision = budget.record_error();
        match &decision {
            ReconnectionDecision::Retry { attempt, delay } => {
                warn!(
                    attempt = attempt,
                    max_retries = budget.policy().max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "Connection error, scheduling reconnect"
                );
            }
            ReconnectionDecision::Suppressed => {
                warn!("Reconnection suppressed");
            }
            ReconnectionDecision::Fatal { attempts } => {
                error!(
                    attempts = attempts,
                    reason = %reason,
                    "Maximum reconnection attempts reached"
                );
                fatal.trigger(reason);
            }
        }
        decision
    }

    /// Time `connect` waits for the first acknowledged session
    pub fn calculate_connection_timeout(policy: &ReconnectPolicy) -> Duration {
        policy.max_total_time() + Duration::from_secs(30)
    }

    /// Determine next state after connection event (pure function)
    pub fn determine_next_state(
        current_state: &ConnectionState,
        event: ConnectionEvent,
    ) -> ConnectionState {
        match event {
            ConnectionEvent::ConnAckReceived => ConnectionState::Connected,
            ConnectionEvent::DisconnectedByBroker => {
                ConnectionState::Offline("Broker disconnected".to_string())
            }
            ConnectionEvent::NetworkError(error) => ConnectionState::Offline(error),
            ConnectionEvent::ReconnectionStarted(attempt) => ConnectionState::Reconnecting(attempt),
            ConnectionEvent::CredentialRotated => match current_state {
                ConnectionState::Reconnecting(attempt) => ConnectionState::Reconnecting(*attempt),
                _ => ConnectionState::Reconnecting(0),
            },
            ConnectionEvent::Closed => ConnectionState::Closed,
        }
    }

    pub fn can_publish(state: &ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }

    pub fn can_subscribe(state: &ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }

    /// Log connection state transition
    pub fn log_state_transition(from: &ConnectionState, to: &ConnectionState) {
        match (from, to) {
            (ConnectionState::Connecting, ConnectionState::Connected) => {
                info!("Broker connection established");
            }
            (ConnectionState::Connected, ConnectionState::Offline(reason)) => {
                warn!(reason = %reason, "Broker connection lost");
            }
            (ConnectionState::Reconnecting(_), ConnectionState::Connected) => {
                info!("Reconnection successful");
            }
            (_, ConnectionState::Reconnecting(attempt)) => {
                info!(attempt = attempt, "Reconnecting to broker");
            }
            (_, ConnectionState::Closed) => {
                info!("Broker connection closed");
            }
            _ => {
                info!("Broker connection state: {:?} -> {:?}", from, to);
            }
        }
    }
}
