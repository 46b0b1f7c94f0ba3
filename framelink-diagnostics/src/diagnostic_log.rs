//! Bounded in-memory record of swallowed failures and protocol oddities

use chrono::{DateTime, Utc};
use framelink_core::{ErrorCategory, FramelinkError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Records kept when no capacity is given
pub const DEFAULT_DIAGNOSTIC_CAPACITY: usize = 256;

/// What kind of event a record describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticCategory {
    /// Peer sent a message with a `type` we do not handle
    UnknownMessageKind,
    /// Peer sent something that is not a valid message
    MalformedMessage,
    /// A frame or probe could not be sent
    TransmissionFailure,
    /// Camera failed to open, produce a frame or release
    DeviceFailure,
    /// Connecting or reconnecting to the peer failed
    ConnectionFailure,
    /// Reconnection gave up
    ReconnectExhausted,
}

impl DiagnosticCategory {
    /// Category an error naturally falls into
    pub fn for_error(error: &FramelinkError) -> Self {
        match error.category() {
            ErrorCategory::Device => DiagnosticCategory::DeviceFailure,
            ErrorCategory::Connection => DiagnosticCategory::ConnectionFailure,
            ErrorCategory::Protocol => DiagnosticCategory::MalformedMessage,
            ErrorCategory::Transmission
            | ErrorCategory::Codec
            | ErrorCategory::State
            | ErrorCategory::Configuration
            | ErrorCategory::System => DiagnosticCategory::TransmissionFailure,
        }
    }
}

/// One diagnostic entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticRecord {
    /// When it was recorded
    pub at: DateTime<Utc>,
    /// What kind of event
    pub category: DiagnosticCategory,
    /// Free-form detail
    pub detail: String,
}

/// Fixed-capacity diagnostic log; the oldest record is dropped when full
#[derive(Debug)]
pub struct DiagnosticLog {
    records: Mutex<VecDeque<DiagnosticRecord>>,
    capacity: usize,
}

impl Default for DiagnosticLog {
    fn default() -> Self {
        Self::new(DEFAULT_DIAGNOSTIC_CAPACITY)
    }
}

impl DiagnosticLog {
    /// Create a log holding at most `capacity` records (at least one)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Append a record
    pub fn record(&self, category: DiagnosticCategory, detail: impl Into<String>) {
        let record = DiagnosticRecord {
            at: Utc::now(),
            category,
            detail: detail.into(),
        };

        let mut records = self.records.lock();
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Append a record for an error, categorised by its kind
    pub fn record_error(&self, error: &FramelinkError) {
        self.record(DiagnosticCategory::for_error(error), error.to_string());
    }

    /// Snapshot, oldest first
    pub fn records(&self) -> Vec<DiagnosticRecord> {
        self.records.lock().iter().cloned().collect()
    }

    /// Number of records in a category
    pub fn count(&self, category: DiagnosticCategory) -> usize {
        self.records
            .lock()
            .iter()
            .filter(|r| r.category == category)
            .count()
    }

    /// Total number of records held
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether the log is empty
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Maximum number of records held
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop every record
    pub fn clear(&self) {
        self.records.lock().clear();
    }

    /// Export as a JSON array
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.records())
    }
}
