//! Media error types and handling
//!
//! Capture and encoding failures, with a conversion into the session-level
//! [`FramelinkError`] taxonomy.

use framelink_core::{DeviceErrorKind, FramelinkError};
use thiserror::Error;

/// Main error type for capture and encoding operations
#[derive(Error, Debug)]
pub enum MediaError {
    /// Invalid configuration provided
    #[error("Invalid configuration: {message}")]
    InvalidConfiguration {
        /// Error message
        message: String,
    },

    /// Encoding operation failed
    #[error("Encoding failed: {codec} - {reason}")]
    EncodingFailed {
        /// Codec name
        codec: String,
        /// Failure reason
        reason: String,
    },

    /// Decoding operation failed
    #[error("Decoding failed: {codec} - {reason}")]
    DecodingFailed {
        /// Codec name
        codec: String,
        /// Failure reason
        reason: String,
    },

    /// Invalid frame data error
    #[error("Invalid frame data: expected {expected} bytes, got {actual}")]
    InvalidFrameData {
        /// Expected data size
        expected: usize,
        /// Actual data size
        actual: usize,
    },

    /// Device enumeration failed
    #[error("Device enumeration failed: {reason}")]
    DeviceEnumerationFailed {
        /// Failure reason
        reason: String,
    },

    /// Device not found error
    #[error("Device not found: {device_id}")]
    DeviceNotFound {
        /// Device identifier
        device_id: String,
    },

    /// Device exists but could not be opened or read
    #[error("Device unavailable: {device_id} - {reason}")]
    DeviceUnavailable {
        /// Device identifier
        device_id: String,
        /// Failure reason
        reason: String,
    },

    /// Capture not active error
    #[error("Capture not active")]
    CaptureNotActive,

    /// Permission denied error
    #[error("Permission denied: {operation}")]
    PermissionDenied {
        /// Operation that was denied
        operation: String,
    },
}

/// Result type alias for media operations
pub type MediaResult<T> = Result<T, MediaError>;

impl MediaError {
    /// Device failure class, for errors that are about the device at all
    pub fn device_kind(&self) -> Option<DeviceErrorKind> {
        match self {
            MediaError::PermissionDenied { .. } => Some(DeviceErrorKind::PermissionDenied),
            MediaError::DeviceNotFound { .. } => Some(DeviceErrorKind::NotFound),
            MediaError::DeviceEnumerationFailed { .. }
            | MediaError::DeviceUnavailable { .. }
            | MediaError::CaptureNotActive => Some(DeviceErrorKind::Unavailable),
            _ => None,
        }
    }
}

impl From<MediaError> for FramelinkError {
    fn from(error: MediaError) -> Self {
        match error.device_kind() {
            Some(kind) => FramelinkError::Device {
                kind,
                message: error.to_string(),
            },
            None => match error {
                MediaError::InvalidConfiguration { message } => {
                    FramelinkError::InvalidConfiguration { message }
                }
                other => FramelinkError::Encoding {
                    reason: other.to_string(),
                },
            },
        }
    }
}
