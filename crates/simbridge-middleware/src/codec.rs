//! rosbridge v2 wire codec.
//!
//! Pure functions that turn SimBridge payloads into rosbridge JSON operation
//! messages, and decode inbound operations for observability.  Nothing in
//! this module performs I/O or holds state.
//!
//! | Operation | Shape |
//! |---|---|
//! | advertise | `{"op":"advertise","topic":..,"type":..}` |
//! | unadvertise | `{"op":"unadvertise","topic":..}` |
//! | publish | `{"op":"publish","topic":..,"msg":{..}}` |
//!
//! Numbers are written by `serde_json`, so output never depends on the
//! process locale and never contains `NaN` or `Infinity`; non-finite values
//! are rejected with [`BridgeError::Encoding`] before serialisation.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use simbridge_types::{BridgeError, Frame, ImageEncoding, ObjectSample, Stamp};

/// A rosbridge operation message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum OutboundMessage {
    Advertise {
        topic: String,
        #[serde(rename = "type")]
        message_type: String,
    },
    Publish {
        topic: String,
        msg: Value,
    },
    Unadvertise {
        topic: String,
    },
}

/// Result of [`decode_operation`].
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Known(OutboundMessage),
    /// A `status` report from the rosbridge server.
    Status { level: String, msg: String },
    /// Any other `op`, or a known `op` with an unexpected shape.
    Unknown(String),
}

/// How image bytes are written into the `data` field.
///
/// The two layouts are not wire-compatible: a subscriber decoding base64 will
/// reject an integer array and vice versa.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataLayout {
    /// Standard base64 string (what rosbridge itself emits for `uint8[]`).
    #[default]
    Base64,
    /// Literal JSON array of integers.
    IntArray,
}

/// Per-topic options for image publishes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageWireOptions {
    #[serde(default)]
    pub data_layout: DataLayout,
    /// Replaces the `format` label of compressed images, e.g.
    /// `"16UC1; compressedDepth"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format_override: Option<String>,
}

#[derive(Serialize)]
struct PublishEnvelope<'a, M: Serialize> {
    op: &'static str,
    topic: &'a str,
    msg: M,
}

#[derive(Serialize)]
struct Header<'a> {
    stamp: Stamp,
    frame_id: &'a str,
}

#[derive(Serialize)]
#[serde(untagged)]
enum ImageData<'a> {
    Base64(String),
    IntArray(&'a [u8]),
}

#[derive(Serialize)]
struct CompressedImageMsg<'a> {
    header: Header<'a>,
    format: &'a str,
    data: ImageData<'a>,
}

#[derive(Serialize)]
struct RawImageMsg<'a> {
    header: Header<'a>,
    height: u32,
    width: u32,
    encoding: &'static str,
    is_bigendian: u8,
    step: u32,
    data: ImageData<'a>,
}

#[derive(Serialize)]
struct Point {
    x: f64,
    y: f64,
    z: f64,
}

#[derive(Serialize)]
struct ObjectInfoMsg<'a> {
    name: &'a str,
    position: Point,
    distances: &'a [f64],
}

/// Encode an `advertise` operation.
pub fn encode_advertise(topic: &str, message_type: &str) -> Result<String, BridgeError> {
    to_json(&OutboundMessage::Advertise {
        topic: topic.to_string(),
        message_type: message_type.to_string(),
    })
}

/// Encode an `unadvertise` operation.
pub fn encode_unadvertise(topic: &str) -> Result<String, BridgeError> {
    to_json(&OutboundMessage::Unadvertise {
        topic: topic.to_string(),
    })
}

/// Encode a `publish` of `frame` as a `CompressedImage` (JPEG/PNG) or raw
/// `Image` (mono8/mono16) body.
///
/// # Errors
///
/// [`BridgeError::Encoding`] when a raw frame's buffer length does not equal
/// `width * height * bytes_per_sample`, when a dimension is zero, or when a
/// compressed frame is empty.
pub fn encode_image_publish(
    topic: &str,
    frame: &Frame,
    frame_id: &str,
    stamp: Stamp,
    options: &ImageWireOptions,
) -> Result<String, BridgeError> {
    let header = Header { stamp, frame_id };

    match frame.encoding {
        ImageEncoding::Jpeg | ImageEncoding::Png => {
            if frame.data.is_empty() {
                return Err(BridgeError::Encoding(format!(
                    "empty {:?} frame for {topic}",
                    frame.encoding
                )));
            }
            let default_format = if frame.encoding == ImageEncoding::Jpeg {
                "jpeg"
            } else {
                "png"
            };
            let format = options.format_override.as_deref().unwrap_or(default_format);
            to_json(&PublishEnvelope {
                op: "publish",
                topic,
                msg: CompressedImageMsg {
                    header,
                    format,
                    data: image_data(&frame.data, options.data_layout),
                },
            })
        }
        ImageEncoding::Raw16 | ImageEncoding::Raw8 => {
            let (encoding, bytes_per_sample) = if frame.encoding == ImageEncoding::Raw16 {
                ("mono16", 2)
            } else {
                ("mono8", 1)
            };
            validate_raw(topic, frame, bytes_per_sample)?;
            to_json(&PublishEnvelope {
                op: "publish",
                topic,
                msg: RawImageMsg {
                    header,
                    height: frame.height,
                    width: frame.width,
                    encoding,
                    is_bigendian: 0,
                    step: frame.width * bytes_per_sample,
                    data: image_data(&frame.data, options.data_layout),
                },
            })
        }
    }
}

/// Encode a `publish` of one object-info record.
///
/// # Errors
///
/// [`BridgeError::Encoding`] when the position or any distance is NaN or
/// infinite.
pub fn encode_object_info_publish(
    topic: &str,
    sample: &ObjectSample,
) -> Result<String, BridgeError> {
    if let Some(v) = sample.position.iter().find(|v| !v.is_finite()) {
        return Err(BridgeError::Encoding(format!(
            "non-finite position component {v} for object '{}'",
            sample.name
        )));
    }
    if let Some(v) = sample.distances.iter().find(|v| !v.is_finite()) {
        return Err(BridgeError::Encoding(format!(
            "non-finite distance {v} for object '{}'",
            sample.name
        )));
    }

    let [x, y, z] = sample.position;
    to_json(&PublishEnvelope {
        op: "publish",
        topic,
        msg: ObjectInfoMsg {
            name: &sample.name,
            position: Point { x, y, z },
            distances: &sample.distances,
        },
    })
}

/// Decode one inbound text frame.
///
/// # Errors
///
/// [`BridgeError::Serialization`] when `text` is not a JSON object.
pub fn decode_operation(text: &str) -> Result<Operation, BridgeError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| BridgeError::Serialization(e.to_string()))?;
    if !value.is_object() {
        return Err(BridgeError::Serialization(
            "rosbridge operation must be a JSON object".to_string(),
        ));
    }

    let op = value
        .get("op")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    if op == "status" {
        let field = |name: &str| {
            value
                .get(name)
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string()
        };
        return Ok(Operation::Status {
            level: field("level"),
            msg: field("msg"),
        });
    }

    match serde_json::from_value::<OutboundMessage>(value) {
        Ok(message) => Ok(Operation::Known(message)),
        Err(_) => Ok(Operation::Unknown(op)),
    }
}

fn validate_raw(topic: &str, frame: &Frame, bytes_per_sample: u32) -> Result<(), BridgeError> {
    if frame.width == 0 || frame.height == 0 {
        return Err(BridgeError::Encoding(format!(
            "zero-sized {}x{} frame for {topic}",
            frame.width, frame.height
        )));
    }
    let expected = frame.width as usize * frame.height as usize * bytes_per_sample as usize;
    if frame.data.len() != expected {
        return Err(BridgeError::Encoding(format!(
            "{topic}: {}x{} {:?} frame needs {expected} bytes, got {}",
            frame.width,
            frame.height,
            frame.encoding,
            frame.data.len()
        )));
    }
    Ok(())
}

fn image_data(bytes: &[u8], layout: DataLayout) -> ImageData<'_> {
    match layout {
        DataLayout::Base64 => ImageData::Base64(STANDARD.encode(bytes)),
        DataLayout::IntArray => ImageData::IntArray(bytes),
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<String, BridgeError> {
    serde_json::to_string(value).map_err(|e| BridgeError::Serialization(e.to_string()))
}
