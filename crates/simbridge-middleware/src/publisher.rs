//! [`TopicPublisher`] – one logical ROS topic bound to a [`BridgeConnection`].
//!
//! The publisher owns the "advertise once per connection generation" rule:
//! the advertise for a generation and every publish after it go through the
//! same [`SessionHandle`](crate::connection::SessionHandle), so a publish can
//! never reach a session on which the topic has not been advertised.
//!
//! Publishing never blocks and never fails because of the network.  While the
//! connection is down, or its outbound queue is full, messages are dropped
//! and counted; warnings about drops are rate limited to one per second per
//! topic.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use simbridge_types::{
    BridgeError, Frame, ObjectSample, Stamp, SystemClock, TopicDescriptor, WallClock,
};
use tracing::{debug, info, warn};

use crate::bus::EventKind;
use crate::codec::{self, ImageWireOptions};
use crate::connection::BridgeConnection;

/// Default `header.frame_id`.
pub const DEFAULT_FRAME_ID: &str = "camera";

const SOURCE: &str = "simbridge-middleware::publisher";

/// What can be published on a topic.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Image(Frame),
    ObjectInfo(ObjectSample),
}

/// Why a message was not sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    NotConnected,
    Backpressure,
}

impl From<&BridgeError> for DropReason {
    fn from(error: &BridgeError) -> Self {
        match error {
            BridgeError::Backpressure => DropReason::Backpressure,
            _ => DropReason::NotConnected,
        }
    }
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DropReason::NotConnected => write!(f, "not connected"),
            DropReason::Backpressure => write!(f, "outbound queue full"),
        }
    }
}

/// Result of [`TopicPublisher::publish`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Queued on the session of `generation`; `advertised` is true when an
    /// advertise was queued in front of it.
    Sent { generation: u64, advertised: bool },
    Dropped(DropReason),
}

struct TopicState {
    /// Generation on which the topic was last advertised.
    advertised: Option<u64>,
    last_stamp_ms: i64,
}

/// Publishes payloads on one topic.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use simbridge_middleware::connection::{BridgeConnection, ConnectionConfig};
/// use simbridge_middleware::publisher::TopicPublisher;
/// use simbridge_middleware::transport::WsConnector;
/// use simbridge_types::{COMPRESSED_IMAGE_TYPE, TopicDescriptor};
///
/// let connection = BridgeConnection::new(ConnectionConfig::default(), Arc::new(WsConnector));
/// let publisher = TopicPublisher::new(
///     TopicDescriptor::new("/unity_camera_1/rgb/compressed", COMPRESSED_IMAGE_TYPE),
///     connection,
/// )
/// .with_frame_id("unity_camera_1");
/// ```
pub struct TopicPublisher {
    topic: TopicDescriptor,
    connection: Arc<BridgeConnection>,
    frame_id: String,
    wire: ImageWireOptions,
    clock: Arc<dyn WallClock>,
    state: Mutex<TopicState>,
    sent: AtomicU64,
    dropped: AtomicU64,
    drop_warnings: DefaultDirectRateLimiter,
}

impl TopicPublisher {
    pub fn new(topic: TopicDescriptor, connection: Arc<BridgeConnection>) -> Self {
        Self {
            topic,
            connection,
            frame_id: DEFAULT_FRAME_ID.to_string(),
            wire: ImageWireOptions::default(),
            clock: Arc::new(SystemClock),
            state: Mutex::new(TopicState {
                advertised: None,
                last_stamp_ms: i64::MIN,
            }),
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            drop_warnings: RateLimiter::direct(Quota::per_second(NonZeroU32::MIN)),
        }
    }

    pub fn with_frame_id(mut self, frame_id: impl Into<String>) -> Self {
        self.frame_id = frame_id.into();
        self
    }

    pub fn with_wire_options(mut self, wire: ImageWireOptions) -> Self {
        self.wire = wire;
        self
    }

    /// Replace the clock used for `header.stamp`.
    pub fn with_clock(mut self, clock: Arc<dyn WallClock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn topic(&self) -> &TopicDescriptor {
        &self.topic
    }

    /// Messages queued for sending so far (advertisements excluded).
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Messages dropped because the connection was down or congested.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Advertise the topic on the live generation unless already done.
    ///
    /// Returns `true` when an advertise was queued by this call.
    ///
    /// # Errors
    ///
    /// [`BridgeError::NotConnected`] or [`BridgeError::Backpressure`] when the
    /// advertise could not be queued.
    pub fn ensure_advertised(&self) -> Result<bool, BridgeError> {
        let session = self.connection.session()?;
        let mut state = self.lock();
        if state.advertised == Some(session.generation()) {
            return Ok(false);
        }
        let advertise = codec::encode_advertise(self.topic.name(), self.topic.message_type())?;
        session.send(advertise)?;
        state.advertised = Some(session.generation());
        self.note_advertised(session.generation());
        Ok(true)
    }

    /// Encode and queue `payload`, advertising first if owed.
    ///
    /// # Errors
    ///
    /// Only encoding failures ([`BridgeError::Encoding`],
    /// [`BridgeError::Serialization`]) are returned as errors; connection
    /// problems yield [`PublishOutcome::Dropped`].
    pub fn publish(&self, payload: &Payload) -> Result<PublishOutcome, BridgeError> {
        let session = match self.connection.session() {
            Ok(session) => session,
            Err(e) => return Ok(self.record_drop(DropReason::from(&e))),
        };
        let generation = session.generation();

        // Held until the publish is queued so advertise and publish of this
        // topic keep their order.
        let mut state = self.lock();
        let body = self.encode(payload, &mut state)?;

        let advertised = state.advertised != Some(generation);
        if advertised {
            let advertise = codec::encode_advertise(self.topic.name(), self.topic.message_type())?;
            if let Err(e) = session.send(advertise) {
                return Ok(self.record_drop(DropReason::from(&e)));
            }
            state.advertised = Some(generation);
            self.note_advertised(generation);
        }

        match session.send(body) {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                Ok(PublishOutcome::Sent {
                    generation,
                    advertised,
                })
            }
            Err(e) => Ok(self.record_drop(DropReason::from(&e))),
        }
    }

    /// Withdraw the advertisement from the live generation.
    ///
    /// Returns `true` when an unadvertise was queued.
    pub fn unadvertise(&self) -> Result<bool, BridgeError> {
        let Ok(session) = self.connection.session() else {
            return Ok(false);
        };
        let mut state = self.lock();
        if state.advertised != Some(session.generation()) {
            return Ok(false);
        }
        session.send(codec::encode_unadvertise(self.topic.name())?)?;
        state.advertised = None;
        debug!(topic = %self.topic.name(), "topic unadvertised");
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    fn encode(&self, payload: &Payload, state: &mut TopicState) -> Result<String, BridgeError> {
        match payload {
            Payload::Image(frame) => {
                // Never let a backwards clock step move a topic's stamp back.
                let now = self.clock.now_millis().max(state.last_stamp_ms);
                state.last_stamp_ms = now;
                codec::encode_image_publish(
                    self.topic.name(),
                    frame,
                    &self.frame_id,
                    Stamp::from_millis(now),
                    &self.wire,
                )
            }
            Payload::ObjectInfo(sample) => {
                codec::encode_object_info_publish(self.topic.name(), sample)
            }
        }
    }

    fn note_advertised(&self, generation: u64) {
        info!(
            topic = %self.topic.name(),
            message_type = %self.topic.message_type(),
            generation,
            "topic advertised"
        );
        self.connection.bus().emit_kind(
            SOURCE,
            EventKind::Advertised {
                topic: self.topic.name().to_string(),
                generation,
            },
        );
    }

    fn record_drop(&self, reason: DropReason) -> PublishOutcome {
        let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        if self.drop_warnings.check().is_ok() {
            warn!(topic = %self.topic.name(), %reason, dropped, "message dropped");
        }
        self.connection.bus().emit_kind(
            SOURCE,
            EventKind::MessageDropped {
                topic: self.topic.name().to_string(),
                reason,
            },
        );
        PublishOutcome::Dropped(reason)
    }

    fn lock(&self) -> MutexGuard<'_, TopicState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
