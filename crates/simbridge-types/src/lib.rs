use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// ROS message type for JPEG/PNG frames.
pub const COMPRESSED_IMAGE_TYPE: &str = "sensor_msgs/msg/CompressedImage";
/// ROS message type for raw (uncompressed) frames.
pub const IMAGE_TYPE: &str = "sensor_msgs/msg/Image";
/// ROS message type for per-object pose records.
pub const OBJECT_INFO_TYPE: &str = "unity_object_info_msg/msg/ObjectInfo";

/// Lifecycle of a single rosbridge connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
    /// The last connect attempt or the live session failed.
    Faulted,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Faulted => "faulted",
        };
        f.write_str(s)
    }
}

/// A named, typed ROS topic. The pairing never changes once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopicDescriptor {
    name: String,
    message_type: String,
}

impl TopicDescriptor {
    pub fn new(name: impl Into<String>, message_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message_type: message_type.into(),
        }
    }

    /// ROS topic path, e.g. `"/unity_camera_0/rgb/compressed"`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// ROS message type string, e.g. `"sensor_msgs/msg/CompressedImage"`.
    pub fn message_type(&self) -> &str {
        &self.message_type
    }
}

/// Pixel layout of a buffer handed over by the frame source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    /// 8-bit RGBA, 4 bytes per pixel.
    Rgba8,
    /// 16-bit single channel, native (little-endian) byte order.
    R16,
    /// 32-bit float single channel (depth in metres).
    RFloat,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgba8 => 4,
            PixelFormat::R16 => 2,
            PixelFormat::RFloat => 4,
        }
    }
}

/// An unencoded buffer as read back from the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct RawImage {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Vec<u8>,
}

impl RawImage {
    /// Byte length implied by the dimensions and format.
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_pixel()
    }
}

/// How the bytes of a [`Frame`] are encoded on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImageEncoding {
    Jpeg,
    Png,
    /// Raw `mono16`, little-endian.
    Raw16,
    /// Raw `mono8`.
    Raw8,
}

impl ImageEncoding {
    /// Bytes per sample for raw encodings, `None` for compressed ones.
    pub fn bytes_per_sample(self) -> Option<usize> {
        match self {
            ImageEncoding::Raw16 => Some(2),
            ImageEncoding::Raw8 => Some(1),
            ImageEncoding::Jpeg | ImageEncoding::Png => None,
        }
    }

    pub fn is_compressed(self) -> bool {
        self.bytes_per_sample().is_none()
    }
}

/// One wire-ready image produced by a capture tick.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub captured_at: DateTime<Utc>,
    pub width: u32,
    pub height: u32,
    pub encoding: ImageEncoding,
    pub data: Vec<u8>,
}

/// Position and auxiliary distances of one scene object for one tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectSample {
    pub name: String,
    pub position: [f64; 3],
    /// Distances in millimetres, one per configured camera, in camera order.
    pub distances: Vec<f64>,
}

/// A ROS `builtin_interfaces/Time` value as rosbridge expects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Stamp {
    pub secs: u64,
    pub nsecs: u32,
}

impl Stamp {
    /// Split a Unix-epoch millisecond reading. Negative readings clamp to zero.
    pub fn from_millis(ms: i64) -> Self {
        let ms = u64::try_from(ms).unwrap_or(0);
        Self {
            secs: ms / 1000,
            nsecs: ((ms % 1000) * 1_000_000) as u32,
        }
    }
}

/// Source of wall-clock time used for message stamps.
pub trait WallClock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_millis(&self) -> i64;
}

/// [`WallClock`] backed by the system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl WallClock for SystemClock {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Error type shared by every SimBridge crate.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BridgeError {
    #[error("Transport Error: {0}")]
    Transport(String),

    #[error("Not Connected: connection is not open")]
    NotConnected,

    #[error("Backpressure: outbound queue is full")]
    Backpressure,

    #[error("Connect already in progress")]
    ConnectInProgress,

    #[error("Connection closed")]
    Closed,

    #[error("Encoding Error: {0}")]
    Encoding(String),

    #[error("Resource Exhausted: {0}")]
    Resource(String),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Serialization Error: {0}")]
    Serialization(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamp_split_matches_integer_division() {
        for ms in [0_i64, 1, 999, 1000, 1001, 1_700_000_000_123, i64::MAX] {
            let stamp = Stamp::from_millis(ms);
            assert_eq!(stamp.secs, (ms / 1000) as u64);
            assert_eq!(stamp.nsecs as i64, (ms % 1000) * 1_000_000);
            assert!(stamp.nsecs < 1_000_000_000);
        }
    }

    #[test]
    fn negative_millis_clamp_to_zero() {
        assert_eq!(Stamp::from_millis(-5), Stamp { secs: 0, nsecs: 0 });
    }

    #[test]
    fn stamp_ordering_follows_time() {
        assert!(Stamp::from_millis(1_999) < Stamp::from_millis(2_000));
        assert!(Stamp::from_millis(2_001) > Stamp::from_millis(2_000));
    }

    #[test]
    fn raw_image_expected_len() {
        let img = RawImage {
            width: 4,
            height: 3,
            format: PixelFormat::R16,
            data: vec![0; 24],
        };
        assert_eq!(img.expected_len(), img.data.len());
    }

    #[test]
    fn encoding_sample_sizes() {
        assert_eq!(ImageEncoding::Raw16.bytes_per_sample(), Some(2));
        assert_eq!(ImageEncoding::Raw8.bytes_per_sample(), Some(1));
        assert!(ImageEncoding::Jpeg.is_compressed());
        assert!(ImageEncoding::Png.is_compressed());
    }

    #[test]
    fn topic_descriptor_accessors() {
        let topic = TopicDescriptor::new("/t", "X");
        assert_eq!(topic.name(), "/t");
        assert_eq!(topic.message_type(), "X");
    }

    #[test]
    fn bridge_error_display() {
        assert!(BridgeError::NotConnected.to_string().contains("Not Connected"));
        let err = BridgeError::Encoding("width mismatch".to_string());
        assert!(err.to_string().contains("width mismatch"));
    }

    #[test]
    fn bridge_error_roundtrip() {
        let err = BridgeError::Transport("refused".to_string());
        let json = serde_json::to_string(&err).unwrap();
        let back: BridgeError = serde_json::from_str(&json).unwrap();
        assert_eq!(err, back);
    }
}
