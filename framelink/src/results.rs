//! Analysis results received from the peer and the bounded projection kept
//! for display

use chrono::{DateTime, Utc};
use framelink_core::{AnalysisPayload, InboundMessage, MessageKind};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

/// One result message from the analysis peer; immutable once received
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisResult {
    /// What kind of message this was
    pub kind: MessageKind,
    /// Frame the result describes, for `analysis` results
    pub frame_number: Option<u64>,
    /// Human readable line
    pub message: Option<String>,
    /// Full analysis fields, for `analysis` results
    pub analysis: Option<AnalysisPayload>,
    /// When this side received it
    pub received_at: DateTime<Utc>,
}

impl AnalysisResult {
    /// Build a result from a parsed message
    ///
    /// Returns `None` for messages that are not results (`ping`, unknown kinds).
    pub fn from_message(message: InboundMessage) -> Option<Self> {
        let received_at = Utc::now();
        let result = match message {
            InboundMessage::Status { message } => Self {
                kind: MessageKind::Status,
                frame_number: None,
                message: Some(message),
                analysis: None,
                received_at,
            },
            InboundMessage::Analysis(payload) => Self {
                kind: MessageKind::Analysis,
                frame_number: Some(payload.frame_number),
                message: payload.message.clone().or_else(|| payload.description.clone()),
                analysis: Some(payload),
                received_at,
            },
            InboundMessage::Error { message } => Self {
                kind: MessageKind::Error,
                frame_number: None,
                message: Some(message),
                analysis: None,
                received_at,
            },
            InboundMessage::Pong => Self {
                kind: MessageKind::Pong,
                frame_number: None,
                message: None,
                analysis: None,
                received_at,
            },
            InboundMessage::Ping | InboundMessage::Unknown { .. } => return None,
        };
        Some(result)
    }

    /// Confidence reported by the peer
    pub fn confidence(&self) -> Option<f64> {
        self.analysis.as_ref().and_then(|a| a.confidence)
    }

    /// Peer-side processing time
    pub fn processing_time(&self) -> Option<Duration> {
        self.analysis.as_ref().and_then(|a| a.processing_time)
    }

    /// Whether the peer reported a failure
    pub fn is_error(&self) -> bool {
        self.kind == MessageKind::Error
    }
}

/// Most recent results, newest first
#[derive(Debug)]
pub struct ResultLog {
    results: Mutex<VecDeque<AnalysisResult>>,
    capacity: usize,
}

impl ResultLog {
    /// Keep at most `capacity` results (at least one)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            results: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Record a result, evicting the oldest when full
    pub fn push(&self, result: AnalysisResult) {
        let mut results = self.results.lock();
        results.push_front(result);
        results.truncate(self.capacity);
    }

    /// The newest result
    pub fn latest(&self) -> Option<AnalysisResult> {
        self.results.lock().front().cloned()
    }

    /// Up to `count` results, newest first
    pub fn recent(&self, count: usize) -> Vec<AnalysisResult> {
        self.results.lock().iter().take(count).cloned().collect()
    }

    /// Everything held, newest first
    pub fn all(&self) -> Vec<AnalysisResult> {
        self.results.lock().iter().cloned().collect()
    }

    /// Number of results held
    pub fn len(&self) -> usize {
        self.results.lock().len()
    }

    /// Whether nothing has been received
    pub fn is_empty(&self) -> bool {
        self.results.lock().is_empty()
    }

    /// Maximum number of results held
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Forget every result
    pub fn clear(&self) {
        self.results.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn analysis(frame_number: u64) -> AnalysisResult {
        let mut payload = AnalysisPayload::new(frame_number);
        payload.description = Some(format!("frame {}", frame_number));
        AnalysisResult::from_message(InboundMessage::Analysis(payload)).unwrap()
    }

    #[test]
    fn test_from_message() {
        let result = analysis(7);
        assert_eq!(result.kind, MessageKind::Analysis);
        assert_eq!(result.frame_number, Some(7));
        assert_eq!(result.message.as_deref(), Some("frame 7"));

        let error = AnalysisResult::from_message(InboundMessage::Error {
            message: "model not loaded".to_string(),
        })
        .unwrap();
        assert!(error.is_error());
        assert!(error.frame_number.is_none());

        assert!(AnalysisResult::from_message(InboundMessage::Ping).is_none());
        assert!(AnalysisResult::from_message(InboundMessage::Unknown {
            kind: "detection".to_string(),
            body: json!({"type": "detection"}),
        })
        .is_none());
    }

    #[test]
    fn test_log_keeps_newest_first() {
        let log = ResultLog::new(3);
        for frame in 1..=5 {
            log.push(analysis(frame));
        }

        assert_eq!(log.len(), 3);
        assert_eq!(log.latest().unwrap().frame_number, Some(5));
        let frames: Vec<_> = log.all().iter().map(|r| r.frame_number.unwrap()).collect();
        assert_eq!(frames, vec![5, 4, 3]);
        assert_eq!(log.recent(2).len(), 2);

        log.clear();
        assert!(log.is_empty());
        assert!(log.latest().is_none());
    }
}
