//! Simulated collaborators for headless runs and tests.
//!
//! [`SimFrameSource`] renders synthetic frames into buffers taken from a
//! [`RenderTargetPool`]; [`SimScene`] reports objects moving at constant
//! velocity.  Together they let the whole pipeline run without a simulator.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use simbridge_hal::render_pool::RenderTargetPool;
//! use simbridge_hal::sim::{SimFrameSource, SimPattern};
//! use simbridge_types::PixelFormat;
//!
//! let pool = Arc::new(RenderTargetPool::new());
//! let source = SimFrameSource::new(pool)
//!     .with_stream("front_rgb", 640, 480, PixelFormat::Rgba8)
//!     .with_pattern("front_depth", 640, 480, PixelFormat::RFloat, SimPattern::Solid(2.5));
//! assert_eq!(source.stream_ids().len(), 2);
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use simbridge_types::{BridgeError, PixelFormat, RawImage};
use tracing::trace;

use crate::render_pool::RenderTargetPool;
use crate::source::{FrameSource, SceneObject, SceneSource};

// ────────────────────────────────────────────────────────────────────────────
// Frame source
// ────────────────────────────────────────────────────────────────────────────

/// What a simulated stream draws.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SimPattern {
    /// A pattern that shifts by one pixel every frame.
    Sweep,
    /// Every pixel the same: grey level in `[0, 1]` for colour streams,
    /// metres for depth streams.
    Solid(f32),
}

#[derive(Debug, Clone)]
struct SimStream {
    width: u32,
    height: u32,
    format: PixelFormat,
    pattern: SimPattern,
}

/// A simulated multi-stream camera rig.
pub struct SimFrameSource {
    streams: HashMap<String, SimStream>,
    pool: Arc<RenderTargetPool>,
    latency: Duration,
    rendered: AtomicU64,
}

impl SimFrameSource {
    /// Create a rig with no streams, rendering into `pool`.
    pub fn new(pool: Arc<RenderTargetPool>) -> Self {
        Self {
            streams: HashMap::new(),
            pool,
            latency: Duration::ZERO,
            rendered: AtomicU64::new(0),
        }
    }

    /// Register a stream drawing [`SimPattern::Sweep`].
    pub fn with_stream(
        self,
        id: impl Into<String>,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Self {
        self.with_pattern(id, width, height, format, SimPattern::Sweep)
    }

    /// Register a stream drawing `pattern`.  Replaces a stream with the same id.
    pub fn with_pattern(
        mut self,
        id: impl Into<String>,
        width: u32,
        height: u32,
        format: PixelFormat,
        pattern: SimPattern,
    ) -> Self {
        self.streams.insert(
            id.into(),
            SimStream {
                width,
                height,
                format,
                pattern,
            },
        );
        self
    }

    /// Delay every frame request by `latency`, like a GPU readback would.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn stream_ids(&self) -> Vec<&str> {
        self.streams.keys().map(String::as_str).collect()
    }

    /// Frames rendered so far across all streams.
    pub fn rendered(&self) -> u64 {
        self.rendered.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl FrameSource for SimFrameSource {
    async fn request_frame(&self, stream_id: &str) -> Result<RawImage, BridgeError> {
        let stream = self
            .streams
            .get(stream_id)
            .ok_or_else(|| BridgeError::Resource(format!("unknown stream '{stream_id}'")))?;

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let frame_no = self.rendered.fetch_add(1, Ordering::Relaxed);
        let mut target = self.pool.acquire(stream.width, stream.height, stream.format);
        draw(&mut target, stream.pattern, frame_no);
        trace!(stream_id, frame_no, "rendered simulated frame");
        Ok(target)
    }

    fn recycle(&self, image: RawImage) {
        self.pool.release(image);
    }
}

fn draw(target: &mut RawImage, pattern: SimPattern, frame_no: u64) {
    let width = target.width as usize;
    let shift = frame_no as usize;
    let pixel_size = target.format.bytes_per_pixel();

    for (i, pixel) in target.data.chunks_exact_mut(pixel_size).enumerate() {
        let (x, y) = (i % width.max(1), i / width.max(1));
        let sweep = (x + y + shift) % 256;
        match (target.format, pattern) {
            (PixelFormat::Rgba8, SimPattern::Sweep) => {
                pixel.copy_from_slice(&[sweep as u8, (y % 256) as u8, (shift % 256) as u8, 255]);
            }
            (PixelFormat::Rgba8, SimPattern::Solid(level)) => {
                let grey = (level.clamp(0.0, 1.0) * 255.0).round() as u8;
                pixel.copy_from_slice(&[grey, grey, grey, 255]);
            }
            (PixelFormat::R16, SimPattern::Sweep) => {
                let mm = 500 + (x + y + shift) as u16 % 4000;
                pixel.copy_from_slice(&mm.to_le_bytes());
            }
            (PixelFormat::R16, SimPattern::Solid(metres)) => {
                let mm = (metres * 1000.0).round().clamp(0.0, u16::MAX as f32) as u16;
                pixel.copy_from_slice(&mm.to_le_bytes());
            }
            (PixelFormat::RFloat, SimPattern::Sweep) => {
                let metres = 0.5 + ((x + y + shift) % 400) as f32 / 100.0;
                pixel.copy_from_slice(&metres.to_le_bytes());
            }
            (PixelFormat::RFloat, SimPattern::Solid(metres)) => {
                pixel.copy_from_slice(&metres.to_le_bytes());
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Scene
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct SimObject {
    name: String,
    origin: [f64; 3],
    /// Displacement per sample.
    velocity: [f64; 3],
}

/// Tracked objects moving at constant velocity, one step per sample.
#[derive(Default)]
pub struct SimScene {
    objects: Vec<SimObject>,
    samples: AtomicU64,
}

impl SimScene {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a stationary object.
    pub fn with_object(self, name: impl Into<String>, position: [f64; 3]) -> Self {
        self.with_moving_object(name, position, [0.0; 3])
    }

    /// Add an object that moves by `velocity` metres per sample.
    pub fn with_moving_object(
        mut self,
        name: impl Into<String>,
        origin: [f64; 3],
        velocity: [f64; 3],
    ) -> Self {
        self.objects.push(SimObject {
            name: name.into(),
            origin,
            velocity,
        });
        self
    }
}

#[async_trait]
impl SceneSource for SimScene {
    async fn sample_objects(&self) -> Result<Vec<SceneObject>, BridgeError> {
        let step = self.samples.fetch_add(1, Ordering::Relaxed) as f64;
        Ok(self
            .objects
            .iter()
            .map(|o| SceneObject {
                name: o.name.clone(),
                position: [
                    o.origin[0] + o.velocity[0] * step,
                    o.origin[1] + o.velocity[1] * step,
                    o.origin[2] + o.velocity[2] * step,
                ],
            })
            .collect())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
