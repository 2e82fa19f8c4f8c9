//! `simbridge-middleware` – rosbridge publishing plumbing
//!
//! Carries simulation payloads to a rosbridge v2 server without caring where
//! they were captured.
//!
//! # Modules
//!
//! - [`codec`] – Pure encoders/decoders for rosbridge JSON operations.
//! - [`transport`] – Websocket seam (`tokio-tungstenite`) plus an in-memory
//!   transport for tests and dry runs.
//! - [`connection`] – Persistent, auto-reconnecting [`BridgeConnection`] with
//!   per-generation outbound queues.
//! - [`publisher`] – [`TopicPublisher`]: advertise-once-per-generation,
//!   non-blocking publish with drop accounting.
//! - [`bus`] – Broadcast event bus reporting state changes, drops and
//!   capture ticks.

pub mod bus;
pub mod codec;
pub mod connection;
pub mod publisher;
pub mod transport;

pub use bus::{EventBus, EventKind, Lane, PipelineEvent, SourceSubscriber};
pub use codec::{DataLayout, ImageWireOptions, OutboundMessage};
pub use connection::{BridgeConnection, ConnectionConfig, ReconnectPolicy, SessionHandle};
pub use publisher::{DropReason, Payload, PublishOutcome, TopicPublisher};
pub use transport::{Connector, WsConnector};
