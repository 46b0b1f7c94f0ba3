//! Error types for Framelink

use std::time::Duration;
use thiserror::Error;

/// Why a capture device could not be acquired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceErrorKind {
    /// The user or the platform refused camera access
    PermissionDenied,
    /// No capture device is attached
    NotFound,
    /// A device exists but could not be opened or read
    Unavailable,
}

impl std::fmt::Display for DeviceErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            DeviceErrorKind::PermissionDenied => "permission denied",
            DeviceErrorKind::NotFound => "no device",
            DeviceErrorKind::Unavailable => "device unavailable",
        };
        f.write_str(text)
    }
}

/// Main error type for Framelink operations
#[derive(Error, Debug)]
pub enum FramelinkError {
    /// Capture device acquisition or read failed
    #[error("Device error ({kind}): {message}")]
    Device {
        /// Failure class
        kind: DeviceErrorKind,
        /// Human readable detail
        message: String,
    },

    /// Connection handshake failed or the connection dropped
    #[error("Connection to {endpoint} failed: {reason}")]
    Connection {
        /// Endpoint that was dialed
        endpoint: String,
        /// Reason for connection failure
        reason: String,
    },

    /// Handshake did not complete in time
    #[error("Connection to {endpoint} timed out after {duration:?}")]
    ConnectionTimeout {
        /// Endpoint that was dialed
        endpoint: String,
        /// Configured handshake timeout
        duration: Duration,
    },

    /// A single outbound message could not be sent
    #[error("Transmission failed: {reason}")]
    Transmission {
        /// Reason for the failure
        reason: String,
    },

    /// Malformed or unexpected inbound message
    #[error("Protocol error: {reason}")]
    Protocol {
        /// What was wrong with the message
        reason: String,
    },

    /// Operation called in the wrong session state
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state
        expected: String,
        /// Actual state
        actual: String,
    },

    /// Invalid configuration provided
    #[error("Invalid configuration: {message}")]
    InvalidConfiguration {
        /// Error message
        message: String,
    },

    /// Frame could not be encoded
    #[error("Encoding failed: {reason}")]
    Encoding {
        /// Reason for failure
        reason: String,
    },

    /// The session was stopped while the operation was in flight
    #[error("Operation cancelled: session was stopped")]
    Cancelled,

    /// Server start failed
    #[error("Failed to start server on {address}: {source}")]
    ServerStartFailed {
        /// Address that failed to bind
        address: std::net::SocketAddr,
        /// Underlying error
        source: std::io::Error,
    },
}

/// Result type alias for Framelink operations
pub type FramelinkResult<T> = Result<T, FramelinkError>;

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Camera acquisition and reads
    Device,
    /// Handshake and connection loss
    Connection,
    /// Per-message send failures
    Transmission,
    /// Inbound message validation
    Protocol,
    /// Controller state machine misuse
    State,
    /// Configuration and parameter errors
    Configuration,
    /// Frame encoding
    Codec,
    /// Server-side (peer) failures
    System,
}

impl FramelinkError {
    /// Shorthand for a device error
    pub fn device(kind: DeviceErrorKind, message: impl Into<String>) -> Self {
        FramelinkError::Device {
            kind,
            message: message.into(),
        }
    }

    /// Shorthand for a protocol error
    pub fn protocol(reason: impl Into<String>) -> Self {
        FramelinkError::Protocol {
            reason: reason.into(),
        }
    }

    /// Get error code for programmatic handling
    pub fn error_code(&self) -> &'static str {
        match self {
            FramelinkError::Device { .. } => "DEVICE_ERROR",
            FramelinkError::Connection { .. } => "CONNECTION_FAILED",
            FramelinkError::ConnectionTimeout { .. } => "CONNECTION_TIMEOUT",
            FramelinkError::Transmission { .. } => "TRANSMISSION_FAILED",
            FramelinkError::Protocol { .. } => "PROTOCOL_ERROR",
            FramelinkError::InvalidState { .. } => "INVALID_STATE",
            FramelinkError::InvalidConfiguration { .. } => "INVALID_CONFIGURATION",
            FramelinkError::Encoding { .. } => "ENCODING_FAILED",
            FramelinkError::Cancelled => "CANCELLED",
            FramelinkError::ServerStartFailed { .. } => "SERVER_START_FAILED",
        }
    }

    /// Check if error is recoverable
    ///
    /// Nothing a session produces is fatal to the host; only a broken
    /// configuration or a server that cannot bind needs operator action.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            FramelinkError::InvalidConfiguration { .. } | FramelinkError::ServerStartFailed { .. }
        )
    }

    /// Get error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            FramelinkError::Device { .. } => ErrorCategory::Device,
            FramelinkError::Connection { .. } => ErrorCategory::Connection,
            FramelinkError::ConnectionTimeout { .. } => ErrorCategory::Connection,
            FramelinkError::Transmission { .. } => ErrorCategory::Transmission,
            FramelinkError::Protocol { .. } => ErrorCategory::Protocol,
            FramelinkError::InvalidState { .. } => ErrorCategory::State,
            FramelinkError::Cancelled => ErrorCategory::State,
            FramelinkError::InvalidConfiguration { .. } => ErrorCategory::Configuration,
            FramelinkError::Encoding { .. } => ErrorCategory::Codec,
            FramelinkError::ServerStartFailed { .. } => ErrorCategory::System,
        }
    }

    /// Guidance suitable for showing to the person holding the camera
    pub fn user_guidance(&self) -> Option<&'static str> {
        match self {
            FramelinkError::Device {
                kind: DeviceErrorKind::PermissionDenied,
                ..
            } => Some("Camera access denied. Please enable camera permissions and try again."),
            FramelinkError::Device { .. } => Some("Camera unavailable. Check that a camera is connected."),
            FramelinkError::Connection { .. } | FramelinkError::ConnectionTimeout { .. } => {
                Some("Connection error. Make sure the analysis server is running.")
            }
            _ => None,
        }
    }
}
