//! Wire protocol between a capture session and the remote analysis peer
//!
//! Every message is a single WebSocket text message. Frames travel as JPEG
//! data URLs (optionally wrapped in a `{"type":"frame"}` object); everything
//! else is a JSON object tagged by its `type` field, with kind-specific fields
//! under `data`.

use crate::error::{FramelinkError, FramelinkResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::time::Duration;

/// Prefix of a JPEG frame encoded as a data URL
pub const JPEG_DATA_URL_PREFIX: &str = "data:image/jpeg;base64,";

/// How outbound frames are wrapped on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameEnvelope {
    /// The bare data URL is the whole message body
    #[default]
    DataUrl,
    /// `{"type":"frame","data":"<data url>"}`
    Json,
}

/// Messages sent by the capture side
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    /// One encoded video frame
    Frame {
        /// `data:image/jpeg;base64,...`
        data_url: String,
    },
    /// Liveness probe
    Ping,
    /// Reply to a peer ping
    Pong,
    /// Ask the peer to end the session
    Close,
}

impl OutboundMessage {
    /// Render the message as the text body sent over the connection
    pub fn to_text(&self, envelope: FrameEnvelope) -> String {
        match (self, envelope) {
            (OutboundMessage::Frame { data_url }, FrameEnvelope::DataUrl) => data_url.clone(),
            (OutboundMessage::Frame { data_url }, FrameEnvelope::Json) => {
                json!({ "type": "frame", "data": data_url }).to_string()
            }
            (OutboundMessage::Ping, _) => json!({ "type": "ping" }).to_string(),
            (OutboundMessage::Pong, _) => json!({ "type": "pong" }).to_string(),
            (OutboundMessage::Close, _) => json!({ "type": "close" }).to_string(),
        }
    }

    /// Parse a message received from a capture client
    ///
    /// Accepts both the bare data-URL form and the JSON envelope.
    pub fn parse(text: &str) -> FramelinkResult<Self> {
        let text = text.trim();
        if text.is_empty() {
            return Err(FramelinkError::protocol("empty message"));
        }

        if text.starts_with("data:image/") {
            return Ok(OutboundMessage::Frame {
                data_url: text.to_string(),
            });
        }

        if !text.starts_with('{') {
            let preview: String = text.chars().take(50).collect();
            return Err(FramelinkError::protocol(format!(
                "unrecognised message format: {}",
                preview
            )));
        }

        let object = parse_object(text)?;
        match message_type(&object)? {
            "frame" => {
                let data_url = object
                    .get("data")
                    .and_then(Value::as_str)
                    .ok_or_else(|| FramelinkError::protocol("frame message without \"data\""))?;
                Ok(OutboundMessage::Frame {
                    data_url: data_url.to_string(),
                })
            }
            "ping" => Ok(OutboundMessage::Ping),
            "pong" => Ok(OutboundMessage::Pong),
            "close" => Ok(OutboundMessage::Close),
            other => Err(FramelinkError::protocol(format!(
                "unknown message type: {}",
                other
            ))),
        }
    }
}

/// Split a data URL into its media type and base64 payload
pub fn split_data_url(data_url: &str) -> Option<(&str, &str)> {
    let rest = data_url.strip_prefix("data:")?;
    let (header, payload) = rest.split_once(',')?;
    let media_type = header.strip_suffix(";base64")?;
    Some((media_type, payload))
}

/// Kinds of result the peer reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Informational status line
    Status,
    /// Per-frame analysis
    Analysis,
    /// Peer-side failure report
    Error,
    /// Keep-alive reply
    Pong,
}

impl MessageKind {
    /// Wire tag of the kind
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Status => "status",
            MessageKind::Analysis => "analysis",
            MessageKind::Error => "error",
            MessageKind::Pong => "pong",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of an `analysis` message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisPayload {
    /// Peer-side sequence number of the analysed frame
    #[serde(deserialize_with = "lenient::unsigned")]
    pub frame_number: u64,
    /// Short human readable line
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Longer description of what the peer saw
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Confidence in [0, 1]
    #[serde(
        default,
        deserialize_with = "lenient::float",
        skip_serializing_if = "Option::is_none"
    )]
    pub confidence: Option<f64>,
    /// Time the peer spent on this frame
    #[serde(
        default,
        with = "lenient::seconds",
        skip_serializing_if = "Option::is_none"
    )]
    pub processing_time: Option<Duration>,
    /// Time since the peer accepted the connection
    #[serde(
        default,
        with = "lenient::seconds",
        skip_serializing_if = "Option::is_none"
    )]
    pub session_duration: Option<Duration>,
    /// Rolling average of frames per second seen by the peer
    #[serde(
        default,
        deserialize_with = "lenient::float",
        skip_serializing_if = "Option::is_none"
    )]
    pub fps_average: Option<f64>,
    /// Peer-side timestamp, kept verbatim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl AnalysisPayload {
    /// Minimal payload for a frame number
    pub fn new(frame_number: u64) -> Self {
        Self {
            frame_number,
            message: None,
            description: None,
            confidence: None,
            processing_time: None,
            session_duration: None,
            fps_average: None,
            timestamp: None,
        }
    }

    fn validate(&self) -> FramelinkResult<()> {
        if let Some(confidence) = self.confidence {
            if !(0.0..=1.0).contains(&confidence) {
                return Err(FramelinkError::protocol(format!(
                    "confidence {} outside [0, 1]",
                    confidence
                )));
            }
        }
        if let Some(fps) = self.fps_average {
            if !fps.is_finite() || fps < 0.0 {
                return Err(FramelinkError::protocol(format!(
                    "invalid average frame rate {}",
                    fps
                )));
            }
        }
        Ok(())
    }
}

/// Messages received from the analysis peer
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Informational status
    Status {
        /// Status line
        message: String,
    },
    /// Analysis of one frame
    Analysis(AnalysisPayload),
    /// Peer-side error report
    Error {
        /// Error line
        message: String,
    },
    /// Reply to our ping
    Pong,
    /// Peer asking whether we are still there
    Ping,
    /// Any other `type`; kept so it can be logged
    Unknown {
        /// The unrecognised tag
        kind: String,
        /// The whole message
        body: Value,
    },
}

impl InboundMessage {
    /// Parse a text message from the peer
    pub fn parse(text: &str) -> FramelinkResult<Self> {
        let object = parse_object(text)?;
        let kind = message_type(&object)?;

        match kind {
            "status" => Ok(InboundMessage::Status {
                message: lookup_str(&object, "message").unwrap_or_default(),
            }),
            "analysis" => {
                let body = match object.get("data") {
                    Some(Value::Object(data)) => Value::Object(data.clone()),
                    _ => Value::Object(object.clone()),
                };
                let payload: AnalysisPayload = serde_json::from_value(body).map_err(|e| {
                    FramelinkError::protocol(format!("malformed analysis payload: {}", e))
                })?;
                payload.validate()?;
                Ok(InboundMessage::Analysis(payload))
            }
            "error" => Ok(InboundMessage::Error {
                message: lookup_str(&object, "message")
                    .unwrap_or_else(|| "unspecified peer error".to_string()),
            }),
            "pong" => Ok(InboundMessage::Pong),
            "ping" => Ok(InboundMessage::Ping),
            other => Ok(InboundMessage::Unknown {
                kind: other.to_string(),
                body: Value::Object(object.clone()),
            }),
        }
    }

    /// Result kind carried by this message, if it is a result at all
    pub fn kind(&self) -> Option<MessageKind> {
        match self {
            InboundMessage::Status { .. } => Some(MessageKind::Status),
            InboundMessage::Analysis(_) => Some(MessageKind::Analysis),
            InboundMessage::Error { .. } => Some(MessageKind::Error),
            InboundMessage::Pong => Some(MessageKind::Pong),
            InboundMessage::Ping | InboundMessage::Unknown { .. } => None,
        }
    }

    /// Render the message the way the peer sends it
    pub fn to_text(&self) -> String {
        let timestamp = chrono::Utc::now().to_rfc3339();
        let value = match self {
            InboundMessage::Status { message } => json!({
                "type": "status",
                "data": { "message": message },
                "timestamp": timestamp,
            }),
            InboundMessage::Analysis(payload) => json!({
                "type": "analysis",
                "data": payload,
                "timestamp": timestamp,
            }),
            InboundMessage::Error { message } => json!({
                "type": "error",
                "message": message,
                "timestamp": timestamp,
            }),
            InboundMessage::Pong => json!({
                "type": "pong",
                "data": { "timestamp": timestamp },
            }),
            InboundMessage::Ping => json!({ "type": "ping" }),
            InboundMessage::Unknown { body, .. } => body.clone(),
        };
        value.to_string()
    }
}

fn parse_object(text: &str) -> FramelinkResult<Map<String, Value>> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(object)) => Ok(object),
        Ok(_) => Err(FramelinkError::protocol("expected a JSON object")),
        Err(e) => Err(FramelinkError::protocol(format!("invalid JSON: {}", e))),
    }
}

fn message_type(object: &Map<String, Value>) -> FramelinkResult<&str> {
    object
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| FramelinkError::protocol("missing \"type\" field"))
}

/// Look a field up under `data` first, then at the top level
fn lookup_str(object: &Map<String, Value>, key: &str) -> Option<String> {
    object
        .get("data")
        .and_then(|data| data.get(key))
        .or_else(|| object.get(key))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Peers send numbers both as JSON numbers and as strings like `"2.00"` or `"1.2s"`
mod lenient {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};
    use serde_json::Value;
    use std::time::Duration;

    fn number(value: &Value) -> Option<f64> {
        match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().trim_end_matches('s').trim().parse().ok(),
            _ => None,
        }
    }

    pub fn float<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
        match Option::<Value>::deserialize(deserializer)? {
            None | Some(Value::Null) => Ok(None),
            Some(value) => number(&value)
                .map(Some)
                .ok_or_else(|| D::Error::custom(format!("expected a number, got {}", value))),
        }
    }

    pub fn unsigned<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        let value = Value::deserialize(deserializer)?;
        match &value {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
        .ok_or_else(|| D::Error::custom(format!("expected an unsigned integer, got {}", value)))
    }

    pub mod seconds {
        use super::*;

        pub fn serialize<S: Serializer>(
            value: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(duration) => serializer.serialize_f64(duration.as_secs_f64()),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            match super::float(deserializer)? {
                None => Ok(None),
                Some(secs) => Duration::try_from_secs_f64(secs)
                    .map(Some)
                    .map_err(|e| D::Error::custom(format!("invalid duration {}: {}", secs, e))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_envelopes() {
        let frame = OutboundMessage::Frame {
            data_url: format!("{}AAAA", JPEG_DATA_URL_PREFIX),
        };

        assert_eq!(
            frame.to_text(FrameEnvelope::DataUrl),
            "data:image/jpeg;base64,AAAA"
        );

        let wrapped: Value = serde_json::from_str(&frame.to_text(FrameEnvelope::Json)).unwrap();
        assert_eq!(wrapped["type"], "frame");
        assert_eq!(wrapped["data"], "data:image/jpeg;base64,AAAA");

        assert_eq!(OutboundMessage::Ping.to_text(FrameEnvelope::DataUrl), r#"{"type":"ping"}"#);
    }

    #[test]
    fn test_outbound_parse_accepts_both_frame_forms() {
        let bare = OutboundMessage::parse("data:image/jpeg;base64,AAAA").unwrap();
        let wrapped =
            OutboundMessage::parse(r#"{"type":"frame","data":"data:image/jpeg;base64,AAAA"}"#)
                .unwrap();
        assert_eq!(bare, wrapped);

        assert_eq!(
            OutboundMessage::parse(r#"{"type":"ping"}"#).unwrap(),
            OutboundMessage::Ping
        );
        assert_eq!(
            OutboundMessage::parse(r#"{"type":"close"}"#).unwrap(),
            OutboundMessage::Close
        );
        assert!(OutboundMessage::parse("   ").is_err());
        assert!(OutboundMessage::parse("hello").is_err());
        assert!(OutboundMessage::parse(r#"{"type":"frame"}"#).is_err());
    }

    #[test]
    fn test_split_data_url() {
        let (media_type, payload) = split_data_url("data:image/jpeg;base64,QUJD").unwrap();
        assert_eq!(media_type, "image/jpeg");
        assert_eq!(payload, "QUJD");

        assert!(split_data_url("image/jpeg;base64,QUJD").is_none());
        assert!(split_data_url("data:image/jpeg,QUJD").is_none());
    }

    #[test]
    fn test_parse_analysis_with_string_numbers() {
        // Shape produced by the frame-enumerating backend
        let text = r#"{
            "type": "analysis",
            "data": {
                "frame_number": 3,
                "timestamp": "12:00:01.250",
                "session_duration": "1.5s",
                "fps_average": "2.00",
                "message": "Frame #3 received",
                "description": "Frame 3 - Session: 1.5s - FPS: 2.00",
                "confidence": 0.0,
                "processing_time": 0.001
            }
        }"#;

        let message = InboundMessage::parse(text).unwrap();
        assert_eq!(message.kind(), Some(MessageKind::Analysis));

        match message {
            InboundMessage::Analysis(payload) => {
                assert_eq!(payload.frame_number, 3);
                assert_eq!(payload.session_duration, Some(Duration::from_millis(1500)));
                assert_eq!(payload.fps_average, Some(2.0));
                assert_eq!(payload.confidence, Some(0.0));
                assert_eq!(payload.processing_time, Some(Duration::from_millis(1)));
                assert_eq!(payload.message.as_deref(), Some("Frame #3 received"));
            }
            other => panic!("Expected analysis, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_bad_analysis() {
        let missing_frame = r#"{"type":"analysis","data":{"message":"hi"}}"#;
        assert!(InboundMessage::parse(missing_frame).is_err());

        let bad_confidence = r#"{"type":"analysis","data":{"frame_number":1,"confidence":1.5}}"#;
        let err = InboundMessage::parse(bad_confidence).unwrap_err();
        assert!(err.to_string().contains("confidence"));

        let bad_number = r#"{"type":"analysis","data":{"frame_number":1,"fps_average":"fast"}}"#;
        assert!(InboundMessage::parse(bad_number).is_err());
    }

    #[test]
    fn test_parse_error_message_locations() {
        let top_level = InboundMessage::parse(r#"{"type":"error","message":"model unavailable"}"#)
            .unwrap();
        assert_eq!(
            top_level,
            InboundMessage::Error {
                message: "model unavailable".to_string()
            }
        );

        let nested =
            InboundMessage::parse(r#"{"type":"error","data":{"message":"bad frame"}}"#).unwrap();
        assert_eq!(
            nested,
            InboundMessage::Error {
                message: "bad frame".to_string()
            }
        );
    }

    #[test]
    fn test_parse_unknown_and_malformed() {
        let unknown = InboundMessage::parse(r#"{"type":"detection","detections":[]}"#).unwrap();
        match &unknown {
            InboundMessage::Unknown { kind, body } => {
                assert_eq!(kind, "detection");
                assert!(body.get("detections").is_some());
            }
            other => panic!("Expected unknown, got {:?}", other),
        }
        assert_eq!(unknown.kind(), None);

        assert!(InboundMessage::parse("not json").is_err());
        assert!(InboundMessage::parse("[1, 2]").is_err());
        assert!(InboundMessage::parse(r#"{"data":{}}"#).is_err());
    }

    #[test]
    fn test_peer_rendering_parses_back() {
        let mut payload = AnalysisPayload::new(7);
        payload.confidence = Some(0.25);
        payload.session_duration = Some(Duration::from_secs(2));

        let text = InboundMessage::Analysis(payload.clone()).to_text();
        assert_eq!(
            InboundMessage::parse(&text).unwrap(),
            InboundMessage::Analysis(payload)
        );

        let pong = InboundMessage::Pong.to_text();
        assert_eq!(InboundMessage::parse(&pong).unwrap(), InboundMessage::Pong);
    }
}
