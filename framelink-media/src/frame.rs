//! Raw video frames as sampled from a capture device

use crate::error::MediaError;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Video resolution information
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VideoResolution {
    pub width: u32,
    pub height: u32,
}

impl VideoResolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub const VGA: Self = Self::new(640, 480);
    pub const HD: Self = Self::new(1280, 720);
    pub const FULL_HD: Self = Self::new(1920, 1080);

    pub fn pixel_count(&self) -> u32 {
        self.width * self.height
    }

    pub fn aspect_ratio(&self) -> f64 {
        self.width as f64 / self.height as f64
    }
}

impl std::fmt::Display for VideoResolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// One uncompressed RGB24 frame
#[derive(Debug, Clone)]
pub struct RawFrame {
    /// Frame dimensions
    pub resolution: VideoResolution,
    /// Packed RGB pixels, row major, no padding
    pub data: Vec<u8>,
    /// When the device produced the frame
    pub captured_at: Instant,
}

impl RawFrame {
    /// Wrap RGB24 pixels, checking the buffer matches the resolution
    pub fn rgb(resolution: VideoResolution, data: Vec<u8>) -> Result<Self, MediaError> {
        let expected = resolution.pixel_count() as usize * 3;
        if data.len() != expected {
            return Err(MediaError::InvalidFrameData {
                expected,
                actual: data.len(),
            });
        }

        Ok(Self {
            resolution,
            data,
            captured_at: Instant::now(),
        })
    }

    pub fn width(&self) -> u32 {
        self.resolution.width
    }

    pub fn height(&self) -> u32 {
        self.resolution.height
    }
}
