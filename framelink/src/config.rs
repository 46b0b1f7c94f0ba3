//! Configuration types and defaults

use framelink_core::{FrameEnvelope, FramelinkError, FramelinkResult};
use framelink_media::{CaptureConstraints, DEFAULT_JPEG_QUALITY};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Endpoint used when none is configured
pub const DEFAULT_ENDPOINT: &str = "ws://localhost:8000/ws";

/// Reconnection after an unexpected drop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Wait before each attempt
    #[serde(rename = "delay_ms", with = "millis")]
    pub delay: Duration,
    /// Attempts without an analysis result in between before giving up
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(3000),
            max_attempts: 5,
        }
    }
}

/// Capture session configuration
///
/// Durations serialize as whole milliseconds (`frame_interval_ms` and so on),
/// and every field is optional when loading from JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Analysis peer to stream to
    pub endpoint: String,
    /// Time between frames
    #[serde(rename = "frame_interval_ms", with = "millis")]
    pub frame_interval: Duration,
    /// Time between liveness probes
    #[serde(rename = "keep_alive_interval_ms", with = "millis")]
    pub keep_alive_interval: Duration,
    /// JPEG quality, 1 to 100
    pub jpeg_quality: u8,
    /// How frames are wrapped on the wire
    pub frame_envelope: FrameEnvelope,
    /// Which camera to open and at what size
    pub constraints: CaptureConstraints,
    /// Reconnection policy
    pub reconnect: ReconnectPolicy,
    /// Handshake deadline for each connection attempt
    #[serde(rename = "connect_timeout_ms", with = "millis")]
    pub connect_timeout: Duration,
    /// Analysis results kept for display
    pub result_history: usize,
    /// Buffered session events per subscriber
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::continuous()
    }
}

impl SessionConfig {
    /// Five frames a second, for live feedback
    pub fn continuous() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            frame_interval: Duration::from_millis(200),
            keep_alive_interval: Duration::from_secs(30),
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            frame_envelope: FrameEnvelope::DataUrl,
            constraints: CaptureConstraints::default(),
            reconnect: ReconnectPolicy::default(),
            connect_timeout: Duration::from_secs(10),
            result_history: 10,
            event_capacity: 100,
        }
    }

    /// One frame every three seconds, for slow per-frame analysis
    pub fn analysis() -> Self {
        Self {
            frame_interval: Duration::from_millis(3000),
            ..Self::continuous()
        }
    }

    /// Load from JSON and validate
    pub fn from_json(json: &str) -> FramelinkResult<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| FramelinkError::InvalidConfiguration {
                message: format!("invalid session config: {}", e),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> FramelinkResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| FramelinkError::InvalidConfiguration {
            message: format!("cannot serialize session config: {}", e),
        })
    }

    /// Check every field is usable
    pub fn validate(&self) -> FramelinkResult<()> {
        let invalid = |message: String| Err(FramelinkError::InvalidConfiguration { message });

        if !(self.endpoint.starts_with("ws://") || self.endpoint.starts_with("wss://")) {
            return invalid(format!(
                "endpoint must be a ws:// or wss:// URL, got {:?}",
                self.endpoint
            ));
        }
        if self.frame_interval.is_zero() {
            return invalid("frame interval must be greater than zero".to_string());
        }
        if self.keep_alive_interval.is_zero() {
            return invalid("keep-alive interval must be greater than zero".to_string());
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return invalid(format!(
                "JPEG quality must be within 1..=100, got {}",
                self.jpeg_quality
            ));
        }
        let resolution = self.constraints.ideal_resolution;
        if resolution.width == 0 || resolution.height == 0 {
            return invalid(format!("capture resolution {} is empty", resolution));
        }
        if self.reconnect.max_attempts == 0 {
            return invalid("reconnect policy needs at least one attempt".to_string());
        }
        if self.connect_timeout.is_zero() {
            return invalid("connect timeout must be greater than zero".to_string());
        }
        if self.result_history == 0 {
            return invalid("result history must hold at least one result".to_string());
        }
        if self.event_capacity == 0 {
            return invalid("event capacity must be at least one".to_string());
        }
        Ok(())
    }

    /// Stream to another peer
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Change the frame cadence
    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    /// Change the liveness probe cadence
    pub fn with_keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    /// Change the JPEG quality
    pub fn with_jpeg_quality(mut self, quality: u8) -> Self {
        self.jpeg_quality = quality;
        self
    }

    /// Change how frames are wrapped
    pub fn with_frame_envelope(mut self, envelope: FrameEnvelope) -> Self {
        self.frame_envelope = envelope;
        self
    }

    /// Change camera selection
    pub fn with_constraints(mut self, constraints: CaptureConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    /// Change the reconnection policy
    pub fn with_reconnect(mut self, delay: Duration, max_attempts: u32) -> Self {
        self.reconnect = ReconnectPolicy {
            delay,
            max_attempts,
        };
        self
    }

    /// Change the handshake deadline
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Change how many results are kept
    pub fn with_result_history(mut self, capacity: usize) -> Self {
        self.result_history = capacity;
        self
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use framelink_media::{FacingMode, VideoResolution};

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.endpoint, "ws://localhost:8000/ws");
        assert_eq!(config.frame_interval, Duration::from_millis(200));
        assert_eq!(config.keep_alive_interval, Duration::from_secs(30));
        assert_eq!(config.jpeg_quality, 50);
        assert_eq!(config.frame_envelope, FrameEnvelope::DataUrl);
        assert_eq!(config.constraints.facing, FacingMode::Environment);
        assert_eq!(config.constraints.ideal_resolution, VideoResolution::VGA);
        assert_eq!(config.reconnect.delay, Duration::from_millis(3000));
        assert_eq!(config.reconnect.max_attempts, 5);
        assert_eq!(config.result_history, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_analysis_preset() {
        let config = SessionConfig::analysis();
        assert_eq!(config.frame_interval, Duration::from_millis(3000));
        assert_eq!(config.keep_alive_interval, SessionConfig::continuous().keep_alive_interval);
    }

    #[test]
    fn test_validation_failures() {
        let cases = [
            SessionConfig::default().with_endpoint("http://localhost:8000/ws"),
            SessionConfig::default().with_frame_interval(Duration::ZERO),
            SessionConfig::default().with_keep_alive_interval(Duration::ZERO),
            SessionConfig::default().with_jpeg_quality(0),
            SessionConfig::default().with_reconnect(Duration::from_secs(1), 0),
            SessionConfig::default().with_connect_timeout(Duration::ZERO),
            SessionConfig::default().with_result_history(0),
        ];

        for config in cases {
            assert!(
                matches!(
                    config.validate(),
                    Err(FramelinkError::InvalidConfiguration { .. })
                ),
                "{:?} should be rejected",
                config
            );
        }
    }

    #[test]
    fn test_from_json_partial() {
        let config = SessionConfig::from_json(
            r#"{
                "endpoint": "wss://vision.example.com/ws",
                "frame_interval_ms": 500,
                "reconnect": { "max_attempts": 2 },
                "frame_envelope": "json"
            }"#,
        )
        .unwrap();

        assert_eq!(config.endpoint, "wss://vision.example.com/ws");
        assert_eq!(config.frame_interval, Duration::from_millis(500));
        assert_eq!(config.reconnect.max_attempts, 2);
        assert_eq!(config.reconnect.delay, Duration::from_millis(3000));
        assert_eq!(config.frame_envelope, FrameEnvelope::Json);
        assert_eq!(config.jpeg_quality, 50);
    }

    #[test]
    fn test_from_json_rejects_invalid() {
        assert!(SessionConfig::from_json("{\"jpeg_quality\": 0}").is_err());
        assert!(SessionConfig::from_json("not json").is_err());
    }

    #[test]
    fn test_json_keeps_millis() {
        let json = SessionConfig::analysis().to_json().unwrap();
        assert!(json.contains("\"frame_interval_ms\": 3000"));
        assert_eq!(SessionConfig::from_json(&json).unwrap(), SessionConfig::analysis());
    }
}
