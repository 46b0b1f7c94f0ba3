//! JPEG frame encoding and data URL packaging
//!
//! Frames leave the device as RGB24, are compressed to JPEG at a configurable
//! quality to bound the payload size, and travel as base64 data URLs.

use crate::error::MediaError;
use crate::frame::{RawFrame, VideoResolution};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use framelink_core::{split_data_url, JPEG_DATA_URL_PREFIX};
use image::codecs::jpeg::JpegEncoder;
use image::{ImageBuffer, Rgb};
use tracing::trace;

/// Mid-range quality; keeps a VGA frame around a few tens of kilobytes
pub const DEFAULT_JPEG_QUALITY: u8 = 50;

/// A compressed frame ready to send
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    /// JPEG bytes
    pub data: Bytes,
    /// Dimensions of the encoded image
    pub resolution: VideoResolution,
    /// Quality the frame was encoded at
    pub quality: u8,
}

impl EncodedFrame {
    /// `data:image/jpeg;base64,...`
    pub fn to_data_url(&self) -> String {
        let mut url = String::with_capacity(JPEG_DATA_URL_PREFIX.len() + self.data.len() * 4 / 3 + 4);
        url.push_str(JPEG_DATA_URL_PREFIX);
        STANDARD.encode_string(&self.data, &mut url);
        url
    }

    /// Size of the JPEG payload in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// RGB24 to JPEG encoder
#[derive(Debug, Clone, Copy)]
pub struct FrameEncoder {
    quality: u8,
}

impl Default for FrameEncoder {
    fn default() -> Self {
        Self {
            quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

impl FrameEncoder {
    /// Create an encoder; quality is 1 (smallest) to 100 (best)
    pub fn new(quality: u8) -> Result<Self, MediaError> {
        if !(1..=100).contains(&quality) {
            return Err(MediaError::InvalidConfiguration {
                message: format!("JPEG quality must be within 1..=100, got {}", quality),
            });
        }
        Ok(Self { quality })
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    /// Compress one frame
    pub fn encode(&self, frame: &RawFrame) -> Result<EncodedFrame, MediaError> {
        let resolution = frame.resolution;
        if resolution.width == 0 || resolution.height == 0 {
            return Err(MediaError::EncodingFailed {
                codec: "JPEG".to_string(),
                reason: format!("cannot encode a {} frame", resolution),
            });
        }

        let image: ImageBuffer<Rgb<u8>, &[u8]> =
            ImageBuffer::from_raw(resolution.width, resolution.height, frame.data.as_slice())
                .ok_or(MediaError::InvalidFrameData {
                    expected: resolution.pixel_count() as usize * 3,
                    actual: frame.data.len(),
                })?;

        let mut buffer = Vec::with_capacity(frame.data.len() / 8);
        JpegEncoder::new_with_quality(&mut buffer, self.quality)
            .encode_image(&image)
            .map_err(|e| MediaError::EncodingFailed {
                codec: "JPEG".to_string(),
                reason: e.to_string(),
            })?;

        trace!(%resolution, quality = self.quality, bytes = buffer.len(), "frame encoded");

        Ok(EncodedFrame {
            data: Bytes::from(buffer),
            resolution,
            quality: self.quality,
        })
    }
}

/// What the receiving side learns from a frame data URL
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    /// Image dimensions
    pub resolution: VideoResolution,
    /// Mean luma, 0 (black) to 255 (white)
    pub mean_brightness: f64,
    /// Size of the compressed image
    pub encoded_len: usize,
}

/// Decode an image data URL and measure it
pub fn decode_data_url(data_url: &str) -> Result<DecodedFrame, MediaError> {
    let decoding_failed = |reason: String| MediaError::DecodingFailed {
        codec: "JPEG".to_string(),
        reason,
    };

    let (media_type, payload) =
        split_data_url(data_url).ok_or_else(|| decoding_failed("not a base64 data URL".to_string()))?;
    if !media_type.starts_with("image/") {
        return Err(decoding_failed(format!("unexpected media type {}", media_type)));
    }

    let bytes = STANDARD
        .decode(payload.trim())
        .map_err(|e| decoding_failed(format!("invalid base64: {}", e)))?;
    let image = image::load_from_memory(&bytes).map_err(|e| decoding_failed(e.to_string()))?;

    let luma = image.to_luma8();
    let pixels = luma.as_raw();
    let sum: u64 = pixels.iter().map(|&p| p as u64).sum();
    let mean_brightness = if pixels.is_empty() {
        0.0
    } else {
        sum as f64 / pixels.len() as f64
    };

    Ok(DecodedFrame {
        resolution: VideoResolution::new(luma.width(), luma.height()),
        mean_brightness,
        encoded_len: bytes.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_frame(width: u32, height: u32, value: u8) -> RawFrame {
        let resolution = VideoResolution::new(width, height);
        RawFrame::rgb(resolution, vec![value; (width * height * 3) as usize]).unwrap()
    }

    #[test]
    fn test_quality_bounds() {
        assert!(FrameEncoder::new(0).is_err());
        assert!(FrameEncoder::new(101).is_err());
        assert_eq!(FrameEncoder::new(80).unwrap().quality(), 80);
        assert_eq!(FrameEncoder::default().quality(), DEFAULT_JPEG_QUALITY);
    }

    #[test]
    fn test_encode_produces_jpeg() {
        let encoded = FrameEncoder::default().encode(&solid_frame(64, 48, 200)).unwrap();

        assert!(!encoded.is_empty());
        assert_eq!(encoded.resolution, VideoResolution::new(64, 48));
        // JPEG SOI marker
        assert_eq!(&encoded.data[..2], &[0xFF, 0xD8]);
        assert!(encoded.to_data_url().starts_with(JPEG_DATA_URL_PREFIX));
    }

    #[test]
    fn test_lower_quality_is_smaller() {
        // A noisy frame, so quality actually matters
        let resolution = VideoResolution::new(64, 64);
        let data: Vec<u8> = (0..64 * 64 * 3).map(|i| ((i * 7919) % 251) as u8).collect();
        let frame = RawFrame::rgb(resolution, data).unwrap();

        let small = FrameEncoder::new(10).unwrap().encode(&frame).unwrap();
        let large = FrameEncoder::new(95).unwrap().encode(&frame).unwrap();
        assert!(small.len() < large.len());
    }

    #[test]
    fn test_decode_measures_frame() {
        let encoded = FrameEncoder::new(90).unwrap().encode(&solid_frame(32, 16, 128)).unwrap();
        let decoded = decode_data_url(&encoded.to_data_url()).unwrap();

        assert_eq!(decoded.resolution, VideoResolution::new(32, 16));
        assert_eq!(decoded.encoded_len, encoded.len());
        assert!((decoded.mean_brightness - 128.0).abs() < 4.0);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_data_url("hello").is_err());
        assert!(decode_data_url("data:text/plain;base64,aGk=").is_err());
        assert!(decode_data_url("data:image/jpeg;base64,!!!").is_err());
        assert!(decode_data_url("data:image/jpeg;base64,aGVsbG8=").is_err());
    }
}
