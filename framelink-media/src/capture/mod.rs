//! Camera capture backends
//!
//! A [`DeviceFactory`] opens a [`CaptureDevice`] matching a set of
//! [`CaptureConstraints`]. The session controller only ever talks to these two
//! traits, so the platform backend and the synthetic backend used in tests and
//! headless environments are interchangeable.

#[cfg(feature = "native")]
pub mod native;
pub mod synthetic;

#[cfg(feature = "native")]
pub use native::{NativeDevice, NativeDeviceFactory};
pub use synthetic::{SyntheticDevice, SyntheticDeviceFactory};

use crate::error::MediaResult;
use crate::frame::{RawFrame, VideoResolution};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Which way the camera should point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FacingMode {
    /// Rear camera, pointing at the scene
    #[default]
    Environment,
    /// Front camera, pointing at the user
    User,
    /// No preference
    Any,
}

impl FacingMode {
    fn label_hints(&self) -> &'static [&'static str] {
        match self {
            FacingMode::Environment => &["back", "rear", "environment", "world"],
            FacingMode::User => &["front", "user", "face", "facetime"],
            FacingMode::Any => &[],
        }
    }
}

/// What the caller would like from the camera
///
/// Everything here is a preference. A device that cannot honour the ideal
/// resolution still opens at whatever it supports, and a missing
/// environment-facing camera falls back to the first device available. Only
/// an explicit `device_id` is binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureConstraints {
    /// Preferred frame size
    pub ideal_resolution: VideoResolution,
    /// Preferred camera orientation
    pub facing: FacingMode,
    /// Open exactly this device
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            ideal_resolution: VideoResolution::VGA,
            facing: FacingMode::Environment,
            device_id: None,
        }
    }
}

impl CaptureConstraints {
    pub fn with_resolution(mut self, resolution: VideoResolution) -> Self {
        self.ideal_resolution = resolution;
        self
    }

    pub fn with_facing(mut self, facing: FacingMode) -> Self {
        self.facing = facing;
        self
    }

    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }
}

/// Video device information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Backend-specific identifier
    pub id: String,
    /// Human readable name
    pub name: String,
    /// Known orientation, when the backend reports one
    pub facing: Option<FacingMode>,
}

impl DeviceInfo {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            facing: None,
        }
    }

    pub fn with_facing(mut self, facing: FacingMode) -> Self {
        self.facing = Some(facing);
        self
    }

    /// Whether this device points the requested way, by report or by name
    pub fn faces(&self, facing: FacingMode) -> bool {
        if facing == FacingMode::Any {
            return true;
        }
        if let Some(reported) = self.facing {
            return reported == facing;
        }
        let name = self.name.to_lowercase();
        facing.label_hints().iter().any(|hint| name.contains(hint))
    }
}

/// Pick the device that best matches the constraints
///
/// Returns `None` only when there are no devices, or when a specific
/// `device_id` was requested and is not present.
pub fn select_device<'a>(
    devices: &'a [DeviceInfo],
    constraints: &CaptureConstraints,
) -> Option<&'a DeviceInfo> {
    if let Some(id) = &constraints.device_id {
        return devices.iter().find(|d| &d.id == id);
    }

    devices
        .iter()
        .find(|d| d.faces(constraints.facing))
        .or_else(|| devices.first())
}

/// A live camera producing frames on demand
#[async_trait]
pub trait CaptureDevice: Send + Sync + std::fmt::Debug {
    fn info(&self) -> &DeviceInfo;

    /// Resolution the device actually delivers
    fn resolution(&self) -> VideoResolution;

    /// Sample the current frame
    async fn grab_frame(&self) -> MediaResult<RawFrame>;

    /// Release the camera. Stopping twice is not an error.
    async fn stop(&self) -> MediaResult<()>;

    fn is_active(&self) -> bool;
}

/// Opens capture devices
#[async_trait]
pub trait DeviceFactory: Send + Sync {
    /// List the cameras this backend can see
    async fn enumerate(&self) -> MediaResult<Vec<DeviceInfo>>;

    /// Acquire a camera matching the constraints
    async fn open(&self, constraints: &CaptureConstraints) -> MediaResult<Arc<dyn CaptureDevice>>;
}

/// Get the appropriate device factory for this build
///
/// Without the `native` feature there is no camera access at all, and the
/// synthetic test-pattern backend is returned instead.
pub fn platform_device_factory() -> Arc<dyn DeviceFactory> {
    #[cfg(feature = "native")]
    {
        Arc::new(NativeDeviceFactory::new())
    }
    #[cfg(not(feature = "native"))]
    {
        tracing::warn!("built without native camera support, using synthetic capture");
        Arc::new(SyntheticDeviceFactory::new())
    }
}
