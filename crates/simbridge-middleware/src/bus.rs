//! Observability bus for the publishing pipeline.
//!
//! Uses [`tokio::sync::broadcast`] channels so every subscriber sees every
//! event without any subscriber blocking the pipeline.  Events are
//! fire-and-forget: emitting with no subscribers is a normal condition.
//!
//! # Lanes
//!
//! | Lane | Typical traffic |
//! |---|---|
//! | [`Lane::Connection`] | Connection state transitions |
//! | [`Lane::Publication`] | Advertisements and dropped messages |
//! | [`Lane::Capture`] | Skipped and failed capture ticks |

use chrono::{DateTime, Utc};
use serde::Serialize;
use simbridge_types::{BridgeError, ConnectionState};
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;

use crate::publisher::DropReason;

/// Default channel capacity (events buffered before slow subscribers lag).
const DEFAULT_CAPACITY: usize = 256;

/// Routing lane of a [`PipelineEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    Connection,
    Publication,
    Capture,
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum EventKind {
    ConnectionState {
        state: ConnectionState,
        generation: u64,
    },
    Advertised {
        topic: String,
        generation: u64,
    },
    MessageDropped {
        topic: String,
        reason: DropReason,
    },
    /// A tick fired while the previous capture of the stream was in flight,
    /// or while the connection was down for a connection-gated stream.
    TickSkipped {
        stream: String,
        reason: String,
    },
    TickFailed {
        stream: String,
        error: BridgeError,
    },
}

impl EventKind {
    pub fn lane(&self) -> Lane {
        match self {
            EventKind::ConnectionState { .. } => Lane::Connection,
            EventKind::Advertised { .. } | EventKind::MessageDropped { .. } => Lane::Publication,
            EventKind::TickSkipped { .. } | EventKind::TickFailed { .. } => Lane::Capture,
        }
    }
}

/// One event on the bus.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g. `"simbridge-middleware::connection"`
    pub source: String,
    pub kind: EventKind,
}

impl PipelineEvent {
    pub fn new(source: impl Into<String>, kind: EventKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            kind,
        }
    }
}

/// Shared event bus.  Clone it cheaply; all clones share the same channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    all: broadcast::Sender<PipelineEvent>,
    connection: broadcast::Sender<PipelineEvent>,
    publication: broadcast::Sender<PipelineEvent>,
    capture: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    /// Create a bus; `capacity` applies to every channel independently.
    pub fn new(capacity: usize) -> Self {
        let (all, _) = broadcast::channel(capacity);
        let (connection, _) = broadcast::channel(capacity);
        let (publication, _) = broadcast::channel(capacity);
        let (capture, _) = broadcast::channel(capacity);
        Self {
            all,
            connection,
            publication,
            capture,
        }
    }

    /// Emit `event` on its lane and on the global channel.
    ///
    /// Returns the number of receivers that were handed the event; `0` when
    /// nobody is listening.
    pub fn emit(&self, event: PipelineEvent) -> usize {
        let lane = self.lane_sender(event.kind.lane()).send(event.clone()).unwrap_or(0);
        lane + self.all.send(event).unwrap_or(0)
    }

    /// Convenience wrapper around [`emit`][Self::emit].
    pub fn emit_kind(&self, source: impl Into<String>, kind: EventKind) -> usize {
        self.emit(PipelineEvent::new(source, kind))
    }

    /// Subscribe to every event.
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.all.subscribe()
    }

    /// Subscribe to one [`Lane`].
    pub fn subscribe_to(&self, lane: Lane) -> broadcast::Receiver<PipelineEvent> {
        self.lane_sender(lane).subscribe()
    }

    /// Subscribe to events whose `source` starts with `prefix`.
    pub fn subscribe_source(&self, prefix: impl Into<String>) -> SourceSubscriber {
        SourceSubscriber {
            prefix: prefix.into(),
            receiver: self.all.subscribe(),
        }
    }

    fn lane_sender(&self, lane: Lane) -> &broadcast::Sender<PipelineEvent> {
        match lane {
            Lane::Connection => &self.connection,
            Lane::Publication => &self.publication,
            Lane::Capture => &self.capture,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// A subscriber that only delivers events whose `source` starts with a prefix.
pub struct SourceSubscriber {
    prefix: String,
    receiver: broadcast::Receiver<PipelineEvent>,
}

impl SourceSubscriber {
    /// Wait for the next matching event.  `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<PipelineEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.source.starts_with(&self.prefix) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(prefix = %self.prefix, lagged_by = n, "SourceSubscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn dropped(topic: &str) -> EventKind {
        EventKind::MessageDropped {
            topic: topic.to_string(),
            reason: DropReason::NotConnected,
        }
    }

    #[tokio::test]
    async fn emit_reaches_global_and_lane_subscribers() -> Result<(), Box<dyn std::error::Error>> {
        let bus = EventBus::default();
        let mut all = bus.subscribe();
        let mut publication = bus.subscribe_to(Lane::Publication);

        let delivered = bus.emit_kind("simbridge-middleware::publisher", dropped("/t"));
        assert_eq!(delivered, 2);

        assert_eq!(all.recv().await?.kind, dropped("/t"));
        assert_eq!(publication.recv().await?.kind, dropped("/t"));
        Ok(())
    }

    #[test]
    fn emit_without_subscribers_is_not_an_error() {
        let bus = EventBus::default();
        assert_eq!(bus.emit_kind("test", dropped("/t")), 0);
    }

    #[tokio::test]
    async fn lane_subscriber_ignores_other_lanes() {
        let bus = EventBus::default();
        let mut capture = bus.subscribe_to(Lane::Capture);

        bus.emit_kind(
            "simbridge-middleware::connection",
            EventKind::ConnectionState {
                state: ConnectionState::Open,
                generation: 1,
            },
        );

        let result = tokio::time::timeout(Duration::from_millis(50), capture.recv()).await;
        assert!(result.is_err(), "capture lane must not see connection events");
    }

    #[tokio::test]
    async fn source_subscriber_filters_by_prefix() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe_source("simbridge-runtime::scheduler");

        bus.emit_kind("simbridge-middleware::publisher", dropped("/a"));
        bus.emit_kind(
            "simbridge-runtime::scheduler/front_rgb",
            EventKind::TickSkipped {
                stream: "front_rgb".to_string(),
                reason: "capture in flight".to_string(),
            },
        );

        let event = sub.recv().await.expect("matching event");
        assert_eq!(event.source, "simbridge-runtime::scheduler/front_rgb");
    }

    #[test]
    fn events_serialize_to_json() -> Result<(), serde_json::Error> {
        let event = PipelineEvent::new("simbridge-middleware::publisher", dropped("/t"));
        let value = serde_json::to_value(&event)?;
        assert_eq!(value["id"], event.id.to_string());
        assert!(value["timestamp"].as_str().is_some_and(|t| t.ends_with('Z')));
        assert_eq!(value["source"], "simbridge-middleware::publisher");
        assert_eq!(value["kind"]["MessageDropped"]["reason"], "not_connected");
        Ok(())
    }

    #[test]
    fn kinds_map_to_lanes() {
        assert_eq!(dropped("/t").lane(), Lane::Publication);
        assert_eq!(
            EventKind::TickFailed {
                stream: "s".to_string(),
                error: BridgeError::NotConnected,
            }
            .lane(),
            Lane::Capture
        );
    }
}
