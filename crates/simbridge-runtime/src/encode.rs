//! Raw buffer → wire frame encoding.
//!
//! JPEG and PNG compression go through the `image` crate.  These functions
//! are CPU bound; the scheduler runs them on the blocking pool.
//!
//! Depth frames arrive either as `R16` millimetres or as `RFloat` metres.
//! Metres are converted to millimetres and clamped to `[0, 65535]`; `NaN`
//! becomes `0`.

use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder};
use serde::{Deserialize, Serialize};
use simbridge_types::{BridgeError, Frame, ImageEncoding, PixelFormat, RawImage};

/// Default JPEG quality for camera streams.
pub const DEFAULT_JPEG_QUALITY: u8 = 50;

/// Wire representation of a depth stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepthOutput {
    /// 16-bit greyscale PNG in a `CompressedImage`.
    #[default]
    Png16,
    /// 8-bit greyscale PNG holding the high byte of each millimetre sample.
    Png8,
    /// Uncompressed `mono16` `Image`.
    Raw16,
}

impl DepthOutput {
    pub fn is_compressed(self) -> bool {
        !matches!(self, DepthOutput::Raw16)
    }
}

/// Encode an `Rgba8` frame as JPEG at `quality` (1–100).  Alpha is dropped.
pub fn encode_camera(
    image: &RawImage,
    quality: u8,
    captured_at: DateTime<Utc>,
) -> Result<Frame, BridgeError> {
    check_buffer(image)?;
    if image.format != PixelFormat::Rgba8 {
        return Err(BridgeError::Encoding(format!(
            "camera frames must be Rgba8, got {:?}",
            image.format
        )));
    }
    let rgb: Vec<u8> = image
        .data
        .chunks_exact(4)
        .flat_map(|rgba| [rgba[0], rgba[1], rgba[2]])
        .collect();

    let mut data = Vec::new();
    JpegEncoder::new_with_quality(&mut data, quality.clamp(1, 100))
        .encode(&rgb, image.width, image.height, ExtendedColorType::Rgb8)
        .map_err(|e| BridgeError::Encoding(format!("jpeg: {e}")))?;

    Ok(Frame {
        captured_at,
        width: image.width,
        height: image.height,
        encoding: ImageEncoding::Jpeg,
        data,
    })
}

/// Encode a depth frame per `output`.
pub fn encode_depth(
    image: &RawImage,
    output: DepthOutput,
    captured_at: DateTime<Utc>,
) -> Result<Frame, BridgeError> {
    let millimetres = depth_to_millimetres(image)?;
    let (encoding, data) = match output {
        DepthOutput::Raw16 => (
            ImageEncoding::Raw16,
            millimetres.iter().flat_map(|mm| mm.to_le_bytes()).collect(),
        ),
        DepthOutput::Png16 => {
            // `write_image` takes 16-bit samples in native byte order.
            let samples: Vec<u8> = millimetres.iter().flat_map(|mm| mm.to_ne_bytes()).collect();
            (
                ImageEncoding::Png,
                encode_png(&samples, image.width, image.height, ExtendedColorType::L16)?,
            )
        }
        DepthOutput::Png8 => {
            let samples: Vec<u8> = millimetres.iter().map(|mm| (mm >> 8) as u8).collect();
            (
                ImageEncoding::Png,
                encode_png(&samples, image.width, image.height, ExtendedColorType::L8)?,
            )
        }
    };
    Ok(Frame {
        captured_at,
        width: image.width,
        height: image.height,
        encoding,
        data,
    })
}

/// Depth samples in millimetres, row-major.
pub fn depth_to_millimetres(image: &RawImage) -> Result<Vec<u16>, BridgeError> {
    check_buffer(image)?;
    match image.format {
        PixelFormat::R16 => Ok(image
            .data
            .chunks_exact(2)
            .map(|b| u16::from_le_bytes([b[0], b[1]]))
            .collect()),
        PixelFormat::RFloat => Ok(image
            .data
            .chunks_exact(4)
            .map(|b| metres_to_millimetres(f32::from_le_bytes([b[0], b[1], b[2], b[3]])))
            .collect()),
        PixelFormat::Rgba8 => Err(BridgeError::Encoding(
            "depth frames must be R16 or RFloat, got Rgba8".to_string(),
        )),
    }
}

/// Metres → millimetres, truncated and clamped to the `u16` range.
pub fn metres_to_millimetres(metres: f32) -> u16 {
    if metres.is_nan() {
        return 0;
    }
    (metres * 1000.0).clamp(0.0, u16::MAX as f32) as u16
}

fn encode_png(
    samples: &[u8],
    width: u32,
    height: u32,
    color: ExtendedColorType,
) -> Result<Vec<u8>, BridgeError> {
    let mut data = Vec::new();
    PngEncoder::new(&mut data)
        .write_image(samples, width, height, color)
        .map_err(|e| BridgeError::Encoding(format!("png: {e}")))?;
    Ok(data)
}

fn check_buffer(image: &RawImage) -> Result<(), BridgeError> {
    if image.width == 0 || image.height == 0 {
        return Err(BridgeError::Encoding(format!(
            "zero-sized frame {}x{}",
            image.width, image.height
        )));
    }
    if image.data.len() != image.expected_len() {
        return Err(BridgeError::Encoding(format!(
            "{}x{} {:?} frame needs {} bytes, got {}",
            image.width,
            image.height,
            image.format,
            image.expected_len(),
            image.data.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::ImageFormat;

    fn raw(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> RawImage {
        RawImage {
            width,
            height,
            format,
            data,
        }
    }

    #[test]
    fn white_rgba_survives_jpeg() {
        let white = raw(2, 2, PixelFormat::Rgba8, vec![255; 16]);
        let frame = encode_camera(&white, DEFAULT_JPEG_QUALITY, Utc::now()).unwrap();
        assert_eq!(frame.encoding, ImageEncoding::Jpeg);
        assert_eq!(&frame.data[..2], &[0xFF, 0xD8]);

        let decoded = image::load_from_memory_with_format(&frame.data, ImageFormat::Jpeg)
            .unwrap()
            .to_rgb8();
        assert_eq!(decoded.dimensions(), (2, 2));
        let pixels = decoded.as_raw();
        let mean = pixels.iter().map(|&v| v as f64).sum::<f64>() / pixels.len() as f64;
        assert!(mean > 250.0, "mean {mean}");
    }

    #[test]
    fn camera_rejects_depth_formats() {
        let depth = raw(1, 1, PixelFormat::R16, vec![0, 0]);
        assert!(matches!(
            encode_camera(&depth, 50, Utc::now()),
            Err(BridgeError::Encoding(_))
        ));
    }

    #[test]
    fn mismatched_buffer_is_rejected() {
        let short = raw(2, 2, PixelFormat::Rgba8, vec![0; 15]);
        assert!(matches!(
            encode_camera(&short, 50, Utc::now()),
            Err(BridgeError::Encoding(_))
        ));
        let empty = raw(0, 2, PixelFormat::R16, vec![]);
        assert!(matches!(
            encode_depth(&empty, DepthOutput::Raw16, Utc::now()),
            Err(BridgeError::Encoding(_))
        ));
    }

    #[test]
    fn metres_convert_with_clamping() {
        assert_eq!(metres_to_millimetres(1.5), 1500);
        assert_eq!(metres_to_millimetres(-0.2), 0);
        assert_eq!(metres_to_millimetres(70.0), 65535);
        assert_eq!(metres_to_millimetres(f32::INFINITY), 65535);
        assert_eq!(metres_to_millimetres(f32::NAN), 0);
    }

    #[test]
    fn rfloat_depth_becomes_little_endian_mono16() {
        let data: Vec<u8> = [0.25_f32, 1.0, 100.0]
            .iter()
            .flat_map(|m| m.to_le_bytes())
            .collect();
        let frame =
            encode_depth(&raw(3, 1, PixelFormat::RFloat, data), DepthOutput::Raw16, Utc::now())
                .unwrap();
        assert_eq!(frame.encoding, ImageEncoding::Raw16);
        assert_eq!(frame.data, vec![250, 0, 0xE8, 0x03, 0xFF, 0xFF]);
    }

    #[test]
    fn png16_round_trips_millimetres() {
        let mm: [u16; 4] = [0, 1500, 40_000, 65535];
        let data: Vec<u8> = mm.iter().flat_map(|v| v.to_le_bytes()).collect();
        let frame =
            encode_depth(&raw(2, 2, PixelFormat::R16, data), DepthOutput::Png16, Utc::now())
                .unwrap();
        assert_eq!(frame.encoding, ImageEncoding::Png);

        let decoded = image::load_from_memory_with_format(&frame.data, ImageFormat::Png).unwrap();
        let luma = decoded.as_luma16().expect("16-bit greyscale png");
        assert_eq!(luma.as_raw().as_slice(), &mm);
    }

    #[test]
    fn png8_keeps_the_high_byte() {
        let data: Vec<u8> = [0x1234_u16, 0xFF00].iter().flat_map(|v| v.to_le_bytes()).collect();
        let frame =
            encode_depth(&raw(2, 1, PixelFormat::R16, data), DepthOutput::Png8, Utc::now())
                .unwrap();

        let decoded = image::load_from_memory_with_format(&frame.data, ImageFormat::Png).unwrap();
        let luma = decoded.as_luma8().expect("8-bit greyscale png");
        assert_eq!(luma.as_raw().as_slice(), &[0x12, 0xFF]);
    }

    #[test]
    fn rgba_is_not_depth() {
        assert!(depth_to_millimetres(&raw(1, 1, PixelFormat::Rgba8, vec![0; 4])).is_err());
    }
}
