//! Synthetic capture backend
//!
//! Produces a moving test pattern without touching any hardware. Used when the
//! crate is built without camera support and throughout the test suites, which
//! can also configure it to refuse permission or to report no cameras.

use super::{select_device, CaptureConstraints, CaptureDevice, DeviceFactory, DeviceInfo, FacingMode};
use crate::error::{MediaError, MediaResult};
use crate::frame::{RawFrame, VideoResolution};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Factory for [`SyntheticDevice`]s
#[derive(Debug)]
pub struct SyntheticDeviceFactory {
    devices: Vec<DeviceInfo>,
    deny_permission: bool,
    opened: AtomicUsize,
}

impl Default for SyntheticDeviceFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticDeviceFactory {
    /// A front and a rear synthetic camera
    pub fn new() -> Self {
        Self::with_devices(vec![
            DeviceInfo::new("synthetic_front", "Synthetic Front Camera").with_facing(FacingMode::User),
            DeviceInfo::new("synthetic_rear", "Synthetic Rear Camera")
                .with_facing(FacingMode::Environment),
        ])
    }

    pub fn with_devices(devices: Vec<DeviceInfo>) -> Self {
        Self {
            devices,
            deny_permission: false,
            opened: AtomicUsize::new(0),
        }
    }

    /// Every open fails as if the user refused camera access
    pub fn permission_denied() -> Self {
        Self {
            deny_permission: true,
            ..Self::new()
        }
    }

    /// No cameras attached
    pub fn without_devices() -> Self {
        Self::with_devices(Vec::new())
    }

    /// How many devices have been opened so far
    pub fn opened_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeviceFactory for SyntheticDeviceFactory {
    async fn enumerate(&self) -> MediaResult<Vec<DeviceInfo>> {
        Ok(self.devices.clone())
    }

    async fn open(&self, constraints: &CaptureConstraints) -> MediaResult<Arc<dyn CaptureDevice>> {
        if self.deny_permission {
            return Err(MediaError::PermissionDenied {
                operation: "camera access".to_string(),
            });
        }

        let info = select_device(&self.devices, constraints).ok_or_else(|| {
            MediaError::DeviceNotFound {
                device_id: constraints
                    .device_id
                    .clone()
                    .unwrap_or_else(|| "any".to_string()),
            }
        })?;

        self.opened.fetch_add(1, Ordering::SeqCst);
        debug!(device = %info.id, resolution = %constraints.ideal_resolution, "opened synthetic camera");

        Ok(Arc::new(SyntheticDevice::new(
            info.clone(),
            constraints.ideal_resolution,
        )))
    }
}

/// A camera that draws a scrolling gradient
#[derive(Debug)]
pub struct SyntheticDevice {
    info: DeviceInfo,
    resolution: VideoResolution,
    active: AtomicBool,
    frames: AtomicU64,
}

impl SyntheticDevice {
    pub fn new(info: DeviceInfo, resolution: VideoResolution) -> Self {
        Self {
            info,
            resolution,
            active: AtomicBool::new(true),
            frames: AtomicU64::new(0),
        }
    }

    /// Frames produced since the device was opened
    pub fn frames_produced(&self) -> u64 {
        self.frames.load(Ordering::SeqCst)
    }

    fn render(&self, phase: u64) -> Vec<u8> {
        let VideoResolution { width, height } = self.resolution;
        let mut data = Vec::with_capacity(self.resolution.pixel_count() as usize * 3);
        let shift = ((phase * 8) % width.max(1) as u64) as u32;

        for y in 0..height {
            for x in 0..width {
                let r = ((x + shift) % width * 255 / width) as u8;
                let g = (y * 255 / height) as u8;
                let b = (phase % 256) as u8;
                data.extend_from_slice(&[r, g, b]);
            }
        }
        data
    }
}

#[async_trait]
impl CaptureDevice for SyntheticDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn resolution(&self) -> VideoResolution {
        self.resolution
    }

    async fn grab_frame(&self) -> MediaResult<RawFrame> {
        if !self.active.load(Ordering::SeqCst) {
            return Err(MediaError::CaptureNotActive);
        }
        let phase = self.frames.fetch_add(1, Ordering::SeqCst);
        RawFrame::rgb(self.resolution, self.render(phase))
    }

    async fn stop(&self) -> MediaResult<()> {
        if self.active.swap(false, Ordering::SeqCst) {
            debug!(device = %self.info.id, frames = self.frames_produced(), "synthetic camera stopped");
        }
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_prefers_rear_camera() {
        let factory = SyntheticDeviceFactory::new();
        let device = factory.open(&CaptureConstraints::default()).await.unwrap();

        assert_eq!(device.info().id, "synthetic_rear");
        assert_eq!(device.resolution(), VideoResolution::VGA);
        assert_eq!(factory.opened_count(), 1);
    }

    #[tokio::test]
    async fn test_frames_until_stopped() {
        let device = SyntheticDevice::new(
            DeviceInfo::new("t", "Test"),
            VideoResolution::new(16, 8),
        );

        let first = device.grab_frame().await.unwrap();
        let second = device.grab_frame().await.unwrap();
        assert_eq!(first.data.len(), 16 * 8 * 3);
        assert_ne!(first.data, second.data);
        assert_eq!(device.frames_produced(), 2);

        device.stop().await.unwrap();
        device.stop().await.unwrap();
        assert!(!device.is_active());
        assert!(matches!(
            device.grab_frame().await,
            Err(MediaError::CaptureNotActive)
        ));
    }

    #[tokio::test]
    async fn test_failure_modes() {
        let denied = SyntheticDeviceFactory::permission_denied();
        assert!(matches!(
            denied.open(&CaptureConstraints::default()).await,
            Err(MediaError::PermissionDenied { .. })
        ));

        let empty = SyntheticDeviceFactory::without_devices();
        assert!(matches!(
            empty.open(&CaptureConstraints::default()).await,
            Err(MediaError::DeviceNotFound { .. })
        ));
        assert_eq!(empty.opened_count(), 0);
    }
}
