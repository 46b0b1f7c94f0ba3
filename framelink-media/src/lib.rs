//! # Framelink Media
//!
//! Camera capture and frame encoding for Framelink.
//! This crate opens a camera matching the caller's constraints, samples RGB
//! frames on demand and compresses them to JPEG data URLs for transmission.

#![warn(clippy::all)]

pub mod capture;
pub mod encoder;
pub mod error;
pub mod frame;

// Re-export main types
#[cfg(feature = "native")]
pub use capture::{NativeDevice, NativeDeviceFactory};
pub use capture::{
    platform_device_factory, select_device, CaptureConstraints, CaptureDevice, DeviceFactory,
    DeviceInfo, FacingMode, SyntheticDevice, SyntheticDeviceFactory,
};
pub use encoder::{decode_data_url, DecodedFrame, EncodedFrame, FrameEncoder, DEFAULT_JPEG_QUALITY};
pub use error::{MediaError, MediaResult};
pub use frame::{RawFrame, VideoResolution};
