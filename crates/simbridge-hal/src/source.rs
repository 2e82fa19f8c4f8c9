//! Collaborator traits implemented by the simulator integration.

use async_trait::async_trait;
use simbridge_types::{BridgeError, RawImage};

/// Something that renders frames on demand, e.g. a simulator camera with GPU
/// readback.
///
/// Implementations register under one or more stream identifiers such as
/// `"front_rgb"` or `"front_depth"`.
#[async_trait]
pub trait FrameSource: Send + Sync {
    /// Render and read back the next frame of `stream_id`.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Resource`] if the stream is unknown or the
    /// readback failed.  The caller skips the tick.
    async fn request_frame(&self, stream_id: &str) -> Result<RawImage, BridgeError>;

    /// Hand a buffer back once it has been encoded.  The default drops it.
    fn recycle(&self, image: RawImage) {
        drop(image);
    }
}

/// Named scene object position for one tick, in metres, in the parent frame
/// shared with the camera poses.
#[derive(Debug, Clone, PartialEq)]
pub struct SceneObject {
    pub name: String,
    pub position: [f64; 3],
}

/// Something that reports the tracked scene objects.
#[async_trait]
pub trait SceneSource: Send + Sync {
    /// Current position of every tracked object.
    async fn sample_objects(&self) -> Result<Vec<SceneObject>, BridgeError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use simbridge_types::PixelFormat;

    struct MockCamera;

    #[async_trait]
    impl FrameSource for MockCamera {
        async fn request_frame(&self, stream_id: &str) -> Result<RawImage, BridgeError> {
            match stream_id {
                "front_rgb" => Ok(RawImage {
                    width: 2,
                    height: 2,
                    format: PixelFormat::Rgba8,
                    data: vec![0u8; 2 * 2 * 4],
                }),
                other => Err(BridgeError::Resource(format!("unknown stream {other}"))),
            }
        }
    }

    #[tokio::test]
    async fn mock_camera_request_frame() {
        let camera = MockCamera;
        let frame = camera.request_frame("front_rgb").await.unwrap();
        assert_eq!(frame.width, 2);
        assert_eq!(frame.data.len(), frame.expected_len());
        camera.recycle(frame);

        assert!(matches!(
            camera.request_frame("rear").await,
            Err(BridgeError::Resource(_))
        ));
    }
}
