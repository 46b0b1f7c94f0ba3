//! Session states, lifecycle events and the teardown report

use crate::results::AnalysisResult;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Where a capture session is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No session
    #[default]
    Idle,
    /// Camera open, not connected
    Capturing,
    /// Camera open and frames flowing to the peer
    Streaming,
    /// Connection dropped unexpectedly; a reconnect is pending or in flight
    Reconnecting,
}

impl SessionState {
    /// Lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Capturing => "capturing",
            SessionState::Streaming => "streaming",
            SessionState::Reconnecting => "reconnecting",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step of session teardown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeardownStep {
    /// Frame timer aborted and joined
    FrameTimerStopped,
    /// Keep-alive timer aborted and joined
    KeepAliveStopped,
    /// Pending reconnect cancelled
    ReconnectCancelled,
    /// Connection closed with the normal closure code
    ConnectionClosed,
    /// Camera released
    DeviceReleased,
}

/// What `stop()` actually did, in execution order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeardownReport {
    /// Session that was torn down, if there was one
    pub session_id: Option<Uuid>,
    /// Steps executed, in order
    pub steps: Vec<TeardownStep>,
}

impl TeardownReport {
    pub(crate) fn for_session(session_id: Uuid) -> Self {
        Self {
            session_id: Some(session_id),
            steps: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, step: TeardownStep) {
        self.steps.push(step);
    }

    /// Whether there was nothing to tear down
    pub fn is_empty(&self) -> bool {
        self.session_id.is_none() && self.steps.is_empty()
    }

    /// Whether a given step ran
    pub fn contains(&self, step: TeardownStep) -> bool {
        self.steps.contains(&step)
    }
}

/// Something observable that happened to a session
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The session moved between states
    StateChanged {
        /// Previous state
        from: SessionState,
        /// New state
        to: SessionState,
    },
    /// A camera was opened and a new session created
    Started {
        /// New session id
        session_id: Uuid,
    },
    /// Connected to the peer
    Connected {
        /// Peer endpoint
        endpoint: String,
    },
    /// A frame went out
    FrameSent {
        /// Sequence number of the frame, starting at 1
        sequence: u64,
        /// Encoded JPEG size
        bytes: usize,
    },
    /// A frame could not be captured, encoded or sent
    FrameFailed {
        /// What went wrong
        reason: String,
    },
    /// A result arrived from the peer
    ResultReceived(AnalysisResult),
    /// The connection to the peer ended
    Disconnected {
        /// WebSocket close code
        code: u16,
        /// Close reason or transport error
        reason: String,
    },
    /// A reconnect will be tried after a delay
    ReconnectScheduled {
        /// Attempt number, starting at 1
        attempt: u32,
        /// Wait before the attempt
        delay: Duration,
    },
    /// A reconnect attempt is starting
    ReconnectAttempt {
        /// Attempt number, starting at 1
        attempt: u32,
    },
    /// Reconnected; streaming resumes
    Reconnected {
        /// Attempts it took
        attempts: u32,
    },
    /// Gave up reconnecting; the session is being torn down
    ReconnectExhausted {
        /// Attempts made
        attempts: u32,
    },
    /// The session was torn down
    Stopped(TeardownReport),
}

impl SessionEvent {
    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            SessionEvent::StateChanged { .. } => "state_changed",
            SessionEvent::Started { .. } => "started",
            SessionEvent::Connected { .. } => "connected",
            SessionEvent::FrameSent { .. } => "frame_sent",
            SessionEvent::FrameFailed { .. } => "frame_failed",
            SessionEvent::ResultReceived(_) => "result_received",
            SessionEvent::Disconnected { .. } => "disconnected",
            SessionEvent::ReconnectScheduled { .. } => "reconnect_scheduled",
            SessionEvent::ReconnectAttempt { .. } => "reconnect_attempt",
            SessionEvent::Reconnected { .. } => "reconnected",
            SessionEvent::ReconnectExhausted { .. } => "reconnect_exhausted",
            SessionEvent::Stopped(_) => "stopped",
        }
    }

    /// Check if this is a connection-related event
    pub fn is_connection_event(&self) -> bool {
        matches!(
            self,
            SessionEvent::Connected { .. }
                | SessionEvent::Disconnected { .. }
                | SessionEvent::ReconnectScheduled { .. }
                | SessionEvent::ReconnectAttempt { .. }
                | SessionEvent::Reconnected { .. }
                | SessionEvent::ReconnectExhausted { .. }
        )
    }

    /// Check if this is a frame-related event
    pub fn is_frame_event(&self) -> bool {
        matches!(
            self,
            SessionEvent::FrameSent { .. } | SessionEvent::FrameFailed { .. }
        )
    }
}
