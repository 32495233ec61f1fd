//! Topic Dispatch
//!
//! A topic-routing dispatcher on top of a single shared MQTT v5 connection.
//!
//! # Overview
//!
//! Handlers declare parameterized topic templates such as
//! `robotics/status/:appId`. The crate provides:
//! - Template compilation into anchored matchers with named captures
//! - A subscription registry that subscribes each wire topic once and fans
//!   inbound messages out to every matching handler
//! - Token credentials refreshed ahead of expiry and rotated into the session
//! - Bounded reconnection with a single fatal exit path
//! - A publisher that fills template placeholders from payload fields and
//!   announces logical publishes on an in-process notification bus
//!
//! # Quick Start
//!
//! ```rust
//! use topic_dispatch::topic::{compile, TopicTemplate, TopicVariableArgs};
//!
//! let matcher = compile("robotics/status/:appId").unwrap();
//! let params = matcher.captures("robotics/status/app1").unwrap();
//! assert_eq!(params.get("appId"), Some("app1"));
//!
//! // Subscribe-time expansion turns unresolved placeholders into wildcards
//! let template = TopicTemplate::new("platform/:appId/monitoring/record");
//! let wire = template.expand(&TopicVariableArgs::new()).unwrap();
//! assert_eq!(wire, "platform/+/monitoring/record");
//! ```

pub mod auth;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod observability;
pub mod publish;
pub mod registry;
pub mod service;
pub mod testing;
pub mod topic;
pub mod transport;

pub use config::*;
pub use dispatch::{Dispatcher, HandlerArg, HandlerArgs};
pub use error::{DispatchError, DispatchResult};
pub use events::{EventWaiter, Notification, NotificationBus, WaitMode};
pub use publish::{PublishOptions, PublishPayload, PublishReceipt, Publisher};
pub use registry::{
    handler_fn, MessageHandler, ParamKind, Payload, PayloadTransform, SubscriptionDescriptor,
    SubscriptionProvider, SubscriptionRegistry,
};
pub use service::DispatchService;
pub use transport::{BrokerTransport, ConnectionState, RawPacket};
