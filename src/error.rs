//! Error types for the dispatcher
//!
//! Each subsystem owns its error enum; [`DispatchError`] wraps them for the
//! service surface. Messages that may carry secrets go through
//! [`sanitize_error_message`] before they are logged.

use crate::auth::AuthError;
use crate::config::ConfigError;
use crate::topic::TopicError;
use crate::transport::mqtt::MqttError;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Top-level error for dispatcher operations
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Topic error: {0}")]
    Topic(#[from] TopicError),

    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("Transport error: {0}")]
    Transport(#[from] MqttError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to decode payload on {topic}: {message}")]
    Decode { topic: String, message: String },

    #[error("Handler failed: {message}")]
    Handler { message: String },

    #[error("Subscription to {topic} failed: {message}")]
    Subscription { topic: String, message: String },

    #[error("Internal error: {message}")]
    InternalError { message: String },
}

impl DispatchError {
    /// Create payload decode error
    pub fn decode<T: Into<String>, S: Into<String>>(topic: T, message: S) -> Self {
        Self::Decode {
            topic: topic.into(),
            message: message.into(),
        }
    }

    /// Create handler error
    pub fn handler<S: Into<String>>(message: S) -> Self {
        Self::Handler {
            message: message.into(),
        }
    }

    /// Create subscription error
    pub fn subscription<T: Into<String>, S: Into<String>>(topic: T, message: S) -> Self {
        Self::Subscription {
            topic: topic.into(),
            message: message.into(),
        }
    }

    /// Create internal error
    pub fn internal_error<S: Into<String>>(message: S) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }

    /// Whether retrying the failed operation may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            DispatchError::Transport(e) => e.is_transient(),
            DispatchError::Auth(AuthError::Http(_)) => true,
            _ => false,
        }
    }

    /// Error text safe to log
    pub fn sanitized(&self) -> String {
        sanitize_error_message(&self.to_string())
    }
}

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").expect("valid secret pattern")
});

static SENSITIVE_PATH_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+")
        .expect("valid path pattern")
});

const MAX_MESSAGE_LEN: usize = 500;

/// Redact credentials and sensitive paths, and bound the message length
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = SECRET_PATTERN
        .replace_all(message, "${1}=***")
        .to_string();

    sanitized = SENSITIVE_PATH_PATTERN
        .replace_all(&sanitized, "/***REDACTED***/")
        .to_string();

    if sanitized.len() > MAX_MESSAGE_LEN {
        let truncate_suffix = "...[truncated]";
        let mut cut = MAX_MESSAGE_LEN - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

/// Result type for dispatcher operations
pub type DispatchResult<T> = Result<T, DispatchError>;
