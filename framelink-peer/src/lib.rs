//! # Framelink Peer
//!
//! Reference analysis peer for Framelink capture sessions.
//! Accepts WebSocket clients, decodes each JPEG frame they stream and replies
//! with a per-frame `analysis` message (resolution, mean brightness, running
//! frame rate). Used by the integration tests and as a local stand-in for a
//! real analysis backend.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod server;

// Re-export main types
pub use server::{AnalysisPeer, ClientInfo, PeerConfig, PeerHandle, PeerStats, DEFAULT_PEER_PORT};
