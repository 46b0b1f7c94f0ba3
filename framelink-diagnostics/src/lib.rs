//! # Framelink Diagnostics
//!
//! Logging setup and in-memory diagnostic records for Framelink.
//! Recoverable failures that a session swallows (a frame that failed to send,
//! a message the peer should not have sent) are logged through `tracing` and
//! also kept here so an application can show or export them.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod debug_logger;
pub mod diagnostic_log;

// Re-export main types
pub use debug_logger::{init_logging, DEFAULT_LOG_FILTER};
pub use diagnostic_log::{
    DiagnosticCategory, DiagnosticLog, DiagnosticRecord, DEFAULT_DIAGNOSTIC_CAPACITY,
};
