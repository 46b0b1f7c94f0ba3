//! # Framelink - Live Camera Capture Sessions
//!
//! Framelink opens a camera, connects to a remote analysis peer over a
//! WebSocket and streams JPEG frames to it at a fixed cadence, while results
//! flow back and are handed to registered handlers.
//!
//! ## Key Features
//!
//! - **Latest frame wins**: ticks with no open connection are skipped, never queued
//! - **Ordered teardown**: timers, pending reconnect, connection, then camera
//! - **Bounded reconnection**: one scheduled attempt per drop, with a give-up signal
//! - **Pluggable seams**: camera backends and transports are traits
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use framelink::{CaptureController, MessageKind, SessionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     framelink::init_logging("info")?;
//!
//!     let controller = CaptureController::with_defaults(SessionConfig::analysis())?;
//!     controller.on_message(MessageKind::Analysis, |result| {
//!         println!("frame {:?}: {:?}", result.frame_number, result.message);
//!     });
//!
//!     controller.start().await?;
//!     controller.connect("ws://localhost:8000/ws").await?;
//!
//!     let mut events = controller.events();
//!     while let Ok(event) = events.recv().await {
//!         println!("Session event: {:?}", event);
//!     }
//!
//!     controller.stop().await;
//!     Ok(())
//! }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

// Re-export core types for easy access
pub use framelink_core::{
    AnalysisPayload, CloseCode, Connection, Connector, DeviceErrorKind, Established, ErrorCategory,
    FrameEnvelope, FramelinkError, FramelinkResult, InboundMessage, MessageKind, OutboundMessage,
    TransportEvent, WebSocketConnector,
};

pub use framelink_media::{
    platform_device_factory, CaptureConstraints, CaptureDevice, DeviceFactory, DeviceInfo,
    FacingMode, FrameEncoder, RawFrame, SyntheticDeviceFactory, VideoResolution,
};

pub use framelink_diagnostics::{init_logging, DiagnosticCategory, DiagnosticLog, DiagnosticRecord};

// Public API modules
pub mod config;
pub mod dispatch;
pub mod event;
pub mod results;
pub mod session;

// Re-export main API types
pub use config::{ReconnectPolicy, SessionConfig, DEFAULT_ENDPOINT};
pub use dispatch::{Inbound, MessageDispatcher, ResultHandler};
pub use event::{SessionEvent, SessionState, TeardownReport, TeardownStep};
pub use results::{AnalysisResult, ResultLog};
pub use session::{CaptureController, SessionStats};
