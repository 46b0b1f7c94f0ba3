//! # Framelink Core
//!
//! Wire protocol, error taxonomy and transport for Framelink capture sessions.
//! This crate knows nothing about cameras or timers; it defines what goes over
//! the connection to the analysis peer and how that connection is opened.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod protocol;
pub mod transport;

// Re-export main types
pub use error::{DeviceErrorKind, ErrorCategory, FramelinkError, FramelinkResult};
pub use protocol::{
    split_data_url, AnalysisPayload, FrameEnvelope, InboundMessage, MessageKind,
    OutboundMessage, JPEG_DATA_URL_PREFIX,
};
pub use transport::{
    CloseCode, Connection, Connector, Established, TransportEvent, WebSocketConnection,
    WebSocketConnector,
};
