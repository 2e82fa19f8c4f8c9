//! [`CaptureScheduler`] – one periodic capture task per stream.
//!
//! Each tick of a stream:
//!
//! 1. **Coalesce** – if the previous capture is still in flight the tick is
//!    skipped and a [`EventKind::TickSkipped`] event is emitted.  A stream
//!    never has more than one capture outstanding.
//! 2. **Gate** – streams with `publish_only_when_connected` also skip while
//!    the connection is not open, without touching the frame source.
//! 3. **Capture** – a task requests the frame (or object batch), encodes it on
//!    the blocking pool and hands it to the stream's [`TopicPublisher`].
//!
//! Failures are contained to their tick: they are logged, counted and
//! emitted as [`EventKind::TickFailed`]; the loop keeps going.
//!
//! Ticks use fixed-delay pacing ([`MissedTickBehavior::Delay`]): a late tick
//! pushes the following ones back instead of firing a burst to catch up.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use simbridge_hal::{FrameSource, SceneSource};
use simbridge_middleware::{
    BridgeConnection, EventBus, EventKind, ImageWireOptions, Payload, PublishOutcome,
    TopicPublisher,
};
use simbridge_perception::{DistanceMode, Pose, Quaternion, Vec3, camera_distances};
use simbridge_types::{
    BridgeError, COMPRESSED_IMAGE_TYPE, ConnectionState, Frame, IMAGE_TYPE, OBJECT_INFO_TYPE,
    ObjectSample, RawImage, TopicDescriptor, WallClock,
};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::encode::{DEFAULT_JPEG_QUALITY, DepthOutput, encode_camera, encode_depth};

/// Default capture rate.
pub const DEFAULT_RATE_HZ: f64 = 10.0;

/// Default bound on waiting for in-flight captures at shutdown.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Where a camera sits relative to the tracked objects' parent frame.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CameraMount {
    /// Metres.
    pub position: [f64; 3],
    /// Euler angles in degrees.
    #[serde(default)]
    pub rotation_deg: [f64; 3],
}

impl CameraMount {
    pub fn pose(&self) -> Pose {
        let [x, y, z] = self.rotation_deg;
        Pose::new(Vec3::from(self.position), Quaternion::from_euler_degrees(x, y, z))
    }
}

/// What a stream captures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamKind {
    /// RGBA frames published as JPEG `CompressedImage`s.
    Camera {
        #[serde(default = "default_jpeg_quality")]
        jpeg_quality: u8,
    },
    /// Depth frames published as PNG or raw `mono16`.
    Depth {
        #[serde(default)]
        depth_output: DepthOutput,
    },
    /// Scene objects published as `ObjectInfo`, one message per object.
    Objects {
        /// Publish each object on `<topic>/<object name>`.
        #[serde(default)]
        per_object_topic: bool,
        /// Cameras the per-object distances are measured from.
        #[serde(default)]
        cameras: Vec<CameraMount>,
        #[serde(default)]
        distance_mode: DistanceMode,
    },
}

fn default_jpeg_quality() -> u8 {
    DEFAULT_JPEG_QUALITY
}

fn default_rate_hz() -> f64 {
    DEFAULT_RATE_HZ
}

/// One capture stream.  `name` doubles as the frame-source stream id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub name: String,
    pub topic: String,
    #[serde(default = "default_rate_hz")]
    pub rate_hz: f64,
    #[serde(flatten)]
    pub kind: StreamKind,
    /// Overrides the pipeline's `header.frame_id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_id: Option<String>,
    #[serde(flatten)]
    pub wire: ImageWireOptions,
    /// Skip capturing entirely while the connection is not open.
    #[serde(default)]
    pub publish_only_when_connected: bool,
}

impl StreamConfig {
    fn new(
        name: impl Into<String>,
        topic: impl Into<String>,
        rate_hz: f64,
        kind: StreamKind,
    ) -> Self {
        Self {
            name: name.into(),
            topic: topic.into(),
            rate_hz,
            kind,
            frame_id: None,
            wire: ImageWireOptions::default(),
            publish_only_when_connected: false,
        }
    }

    /// A JPEG camera stream at the default quality.
    pub fn camera(name: impl Into<String>, topic: impl Into<String>, rate_hz: f64) -> Self {
        Self::new(
            name,
            topic,
            rate_hz,
            StreamKind::Camera {
                jpeg_quality: DEFAULT_JPEG_QUALITY,
            },
        )
    }

    pub fn depth(
        name: impl Into<String>,
        topic: impl Into<String>,
        rate_hz: f64,
        output: DepthOutput,
    ) -> Self {
        Self::new(name, topic, rate_hz, StreamKind::Depth { depth_output: output })
    }

    /// An object stream on a shared topic with no cameras.
    pub fn objects(name: impl Into<String>, topic: impl Into<String>, rate_hz: f64) -> Self {
        Self::new(
            name,
            topic,
            rate_hz,
            StreamKind::Objects {
                per_object_topic: false,
                cameras: Vec::new(),
                distance_mode: DistanceMode::default(),
            },
        )
    }

    /// ROS message type published by this stream.
    pub fn message_type(&self) -> &'static str {
        match &self.kind {
            StreamKind::Camera { .. } => COMPRESSED_IMAGE_TYPE,
            StreamKind::Depth { depth_output } if depth_output.is_compressed() => {
                COMPRESSED_IMAGE_TYPE
            }
            StreamKind::Depth { .. } => IMAGE_TYPE,
            StreamKind::Objects { .. } => OBJECT_INFO_TYPE,
        }
    }

    /// Time between ticks.
    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.rate_hz)
    }

    /// Reject configurations the scheduler cannot run.
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.name.trim().is_empty() {
            return Err(BridgeError::Config("stream name must not be empty".to_string()));
        }
        if self.topic.trim().is_empty() {
            return Err(BridgeError::Config(format!(
                "stream '{}': topic must not be empty",
                self.name
            )));
        }
        // Upper bound keeps `period()` representable.
        if !self.rate_hz.is_finite() || self.rate_hz <= 0.0 || self.rate_hz > 1_000.0 {
            return Err(BridgeError::Config(format!(
                "stream '{}': rate_hz must be in (0, 1000], got {}",
                self.name, self.rate_hz
            )));
        }
        if let StreamKind::Camera { jpeg_quality } = self.kind {
            if !(1..=100).contains(&jpeg_quality) {
                return Err(BridgeError::Config(format!(
                    "stream '{}': jpeg_quality must be 1-100, got {jpeg_quality}",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Collaborators and statistics
// ─────────────────────────────────────────────────────────────────────────────

/// Everything a scheduler needs besides its own configuration.
#[derive(Clone)]
pub struct CaptureContext {
    pub connection: Arc<BridgeConnection>,
    pub frames: Arc<dyn FrameSource>,
    pub scene: Arc<dyn SceneSource>,
    pub clock: Arc<dyn WallClock>,
    /// Default `header.frame_id`.
    pub frame_id: String,
}

/// Per-stream counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamStats {
    pub ticks: u64,
    /// Captures that completed without error.
    pub captures: u64,
    pub skipped: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    ticks: AtomicU64,
    captures: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

/// Clears the in-flight flag when the capture task ends, however it ends.
struct InFlight(Arc<AtomicBool>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Publishing sink
// ─────────────────────────────────────────────────────────────────────────────

struct PublisherFactory {
    connection: Arc<BridgeConnection>,
    clock: Arc<dyn WallClock>,
    frame_id: String,
    wire: ImageWireOptions,
}

impl PublisherFactory {
    fn build(&self, topic: String, message_type: &str) -> Arc<TopicPublisher> {
        Arc::new(
            TopicPublisher::new(
                TopicDescriptor::new(topic, message_type),
                Arc::clone(&self.connection),
            )
            .with_frame_id(self.frame_id.clone())
            .with_wire_options(self.wire.clone())
            .with_clock(Arc::clone(&self.clock)),
        )
    }
}

enum Sink {
    Topic(Arc<TopicPublisher>),
    /// One lazily created publisher per object topic; names that sanitise
    /// to the same segment share it.
    PerObject {
        base: String,
        factory: PublisherFactory,
        publishers: Mutex<HashMap<String, Arc<TopicPublisher>>>,
    },
}

impl Sink {
    fn publisher_for(&self, object: &str) -> Arc<TopicPublisher> {
        match self {
            Sink::Topic(publisher) => Arc::clone(publisher),
            Sink::PerObject {
                base,
                factory,
                publishers,
            } => {
                let topic = format!("{base}/{}", topic_segment(object));
                let mut publishers = publishers.lock().unwrap_or_else(|e| e.into_inner());
                Arc::clone(
                    publishers
                        .entry(topic)
                        .or_insert_with_key(|topic| factory.build(topic.clone(), OBJECT_INFO_TYPE)),
                )
            }
        }
    }

    fn publishers(&self) -> Vec<Arc<TopicPublisher>> {
        match self {
            Sink::Topic(publisher) => vec![Arc::clone(publisher)],
            Sink::PerObject { publishers, .. } => publishers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .values()
                .cloned()
                .collect(),
        }
    }
}

/// Segment used for objects whose name has no usable characters.
const UNNAMED_SEGMENT: &str = "unnamed";

/// ROS graph names only allow `[A-Za-z0-9_]` within a segment.
fn topic_segment(name: &str) -> String {
    if !name.chars().any(|c| c.is_ascii_alphanumeric()) {
        return UNNAMED_SEGMENT.to_string();
    }
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Capture
// ─────────────────────────────────────────────────────────────────────────────

struct Capture {
    name: String,
    kind: StreamKind,
    cameras: Vec<Pose>,
    frames: Arc<dyn FrameSource>,
    scene: Arc<dyn SceneSource>,
    sink: Sink,
}

impl Capture {
    /// One capture; returns the number of messages queued.
    async fn run_once(&self) -> Result<usize, BridgeError> {
        match &self.kind {
            StreamKind::Camera { jpeg_quality } => {
                let quality = *jpeg_quality;
                let raw = self.frames.request_frame(&self.name).await?;
                let captured_at = Utc::now();
                let frame = self
                    .encode_off_thread(raw, move |raw| encode_camera(raw, quality, captured_at))
                    .await?;
                self.publish_frame(frame)
            }
            StreamKind::Depth { depth_output } => {
                let output = *depth_output;
                let raw = self.frames.request_frame(&self.name).await?;
                let captured_at = Utc::now();
                let frame = self
                    .encode_off_thread(raw, move |raw| encode_depth(raw, output, captured_at))
                    .await?;
                self.publish_frame(frame)
            }
            StreamKind::Objects { distance_mode, .. } => {
                let objects = self.scene.sample_objects().await?;
                let mut queued = 0;
                let mut first_error = None;
                for object in objects {
                    let position = Vec3::from(object.position);
                    let distances = camera_distances(position, &self.cameras, *distance_mode);
                    let publisher = self.sink.publisher_for(&object.name);
                    let sample = ObjectSample {
                        name: object.name,
                        position: object.position,
                        distances,
                    };
                    match publisher.publish(&Payload::ObjectInfo(sample)) {
                        Ok(outcome) => {
                            queued += usize::from(matches!(outcome, PublishOutcome::Sent { .. }))
                        }
                        Err(e) => {
                            first_error.get_or_insert(e);
                        }
                    }
                }
                first_error.map_or(Ok(queued), Err)
            }
        }
    }

    fn publish_frame(&self, frame: Frame) -> Result<usize, BridgeError> {
        let outcome = self.sink.publisher_for(&self.name).publish(&Payload::Image(frame))?;
        Ok(usize::from(matches!(outcome, PublishOutcome::Sent { .. })))
    }

    /// Run `encode` on the blocking pool, then give the buffer back to the
    /// frame source.
    async fn encode_off_thread<F>(&self, raw: RawImage, encode: F) -> Result<Frame, BridgeError>
    where
        F: FnOnce(&RawImage) -> Result<Frame, BridgeError> + Send + 'static,
    {
        let (raw, encoded) = tokio::task::spawn_blocking(move || {
            let encoded = encode(&raw);
            (raw, encoded)
        })
        .await
        .map_err(|e| BridgeError::Resource(format!("encoder task failed: {e}")))?;
        self.frames.recycle(raw);
        encoded
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Scheduler
// ─────────────────────────────────────────────────────────────────────────────

/// Periodic capture loop for one stream.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use simbridge_runtime::scheduler::{CaptureContext, CaptureScheduler, StreamConfig};
///
/// # fn run(context: CaptureContext, shutdown: tokio::sync::watch::Receiver<bool>) {
/// let stream = StreamConfig::camera("front_rgb", "/unity_camera_1/rgb/compressed", 15.0);
/// let scheduler = Arc::new(CaptureScheduler::new(stream, &context).expect("valid stream"));
/// let handle = scheduler.spawn(shutdown);
/// # }
/// ```
pub struct CaptureScheduler {
    name: String,
    period: Duration,
    gate_on_connection: bool,
    drain_timeout: Duration,
    capture: Arc<Capture>,
    connection: Arc<BridgeConnection>,
    bus: EventBus,
    source: String,
    in_flight: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

impl CaptureScheduler {
    /// Build a scheduler for `config`.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Config`] when the stream configuration is invalid.
    pub fn new(config: StreamConfig, context: &CaptureContext) -> Result<Self, BridgeError> {
        config.validate()?;
        let message_type = config.message_type();
        let period = config.period();

        let factory = PublisherFactory {
            connection: Arc::clone(&context.connection),
            clock: Arc::clone(&context.clock),
            frame_id: config.frame_id.clone().unwrap_or_else(|| context.frame_id.clone()),
            wire: config.wire.clone(),
        };
        let (sink, cameras) = match &config.kind {
            StreamKind::Objects {
                per_object_topic: true,
                cameras,
                ..
            } => (
                Sink::PerObject {
                    base: config.topic.trim_end_matches('/').to_string(),
                    factory,
                    publishers: Mutex::new(HashMap::new()),
                },
                cameras.iter().map(CameraMount::pose).collect(),
            ),
            StreamKind::Objects { cameras, .. } => (
                Sink::Topic(factory.build(config.topic.clone(), message_type)),
                cameras.iter().map(CameraMount::pose).collect(),
            ),
            StreamKind::Camera { .. } | StreamKind::Depth { .. } => {
                (Sink::Topic(factory.build(config.topic.clone(), message_type)), Vec::new())
            }
        };

        Ok(Self {
            source: format!("simbridge-runtime::scheduler/{}", config.name),
            name: config.name.clone(),
            period,
            gate_on_connection: config.publish_only_when_connected,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            capture: Arc::new(Capture {
                name: config.name,
                kind: config.kind,
                cameras,
                frames: Arc::clone(&context.frames),
                scene: Arc::clone(&context.scene),
                sink,
            }),
            bus: context.connection.bus().clone(),
            connection: Arc::clone(&context.connection),
            in_flight: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(Counters::default()),
        })
    }

    /// Bound on waiting for the in-flight capture once shutdown fires.
    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn stats(&self) -> StreamStats {
        StreamStats {
            ticks: self.counters.ticks.load(Ordering::Relaxed),
            captures: self.counters.captures.load(Ordering::Relaxed),
            skipped: self.counters.skipped.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Publishers created so far (per-object streams create them lazily).
    pub fn publishers(&self) -> Vec<Arc<TopicPublisher>> {
        self.capture.sink.publishers()
    }

    /// Run [`run`][Self::run] on a new task.
    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move { scheduler.run(shutdown).await })
    }

    /// Tick until `shutdown` becomes `true`, then wait (bounded) for the
    /// in-flight capture.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tasks = JoinSet::new();
        info!(
            stream = %self.name,
            period_ms = self.period.as_millis() as u64,
            "capture stream started"
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => break,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(stream = %self.name, error = %e, "capture task aborted");
                    }
                }
                _ = ticker.tick() => self.on_tick(&mut tasks),
            }
        }

        if !tasks.is_empty() {
            let drained = tokio::time::timeout(self.drain_timeout, async {
                while tasks.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!(stream = %self.name, "in-flight capture did not finish; aborting it");
                tasks.abort_all();
            }
        }
        info!(stream = %self.name, stats = ?self.stats(), "capture stream stopped");
    }

    fn on_tick(&self, tasks: &mut JoinSet<()>) {
        self.counters.ticks.fetch_add(1, Ordering::Relaxed);

        if self.in_flight.load(Ordering::Acquire) {
            self.skip("capture in flight");
            return;
        }
        if self.gate_on_connection && self.connection.state() != ConnectionState::Open {
            self.skip("not connected");
            return;
        }

        self.in_flight.store(true, Ordering::Release);
        let guard = InFlight(Arc::clone(&self.in_flight));
        let capture = Arc::clone(&self.capture);
        let counters = Arc::clone(&self.counters);
        let bus = self.bus.clone();
        let source = self.source.clone();

        tasks.spawn(async move {
            let _guard = guard;
            match capture.run_once().await {
                Ok(queued) => {
                    counters.captures.fetch_add(1, Ordering::Relaxed);
                    debug!(stream = %capture.name, queued, "capture published");
                }
                Err(error) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(stream = %capture.name, %error, "capture failed");
                    bus.emit_kind(
                        source,
                        EventKind::TickFailed {
                            stream: capture.name.clone(),
                            error,
                        },
                    );
                }
            }
        });
    }

    fn skip(&self, reason: &str) {
        self.counters.skipped.fetch_add(1, Ordering::Relaxed);
        debug!(stream = %self.name, reason, "tick skipped");
        self.bus.emit_kind(
            self.source.clone(),
            EventKind::TickSkipped {
                stream: self.name.clone(),
                reason: reason.to_string(),
            },
        );
    }
}

async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}
