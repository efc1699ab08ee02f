//! Outbound message definitions.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ProtoError;

/// Error codes surfaced to clients in [`ServerMessage::Error`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// A non-binary data message arrived where a frame was expected.
    InvalidMessage,
    /// The frame is not a well-formed image.
    InvalidFrame,
    /// The frame exceeds the configured size limit.
    FrameTooLarge,
    /// The requested pipeline is unknown.
    InvalidPipeline,
    /// The pipeline failed while processing a frame.
    PipelineFailure,
    /// An unexpected server-side error.
    InternalError,
}

/// Coarse grouping of [`ErrorCode`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Rejected before a session exists.
    ConnectionSetup,
    /// The client broke the stream protocol.
    Protocol,
    /// The pipeline failed.
    Execution,
    /// Anything the server did not anticipate.
    Unexpected,
}

impl ErrorCode {
    /// All error codes, in declaration order.
    pub const ALL: [Self; 6] = [
        Self::InvalidMessage,
        Self::InvalidFrame,
        Self::FrameTooLarge,
        Self::InvalidPipeline,
        Self::PipelineFailure,
        Self::InternalError,
    ];

    /// Wire representation of the code.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidMessage => "invalid_message",
            Self::InvalidFrame => "invalid_frame",
            Self::FrameTooLarge => "frame_too_large",
            Self::InvalidPipeline => "invalid_pipeline",
            Self::PipelineFailure => "pipeline_failure",
            Self::InternalError => "internal_error",
        }
    }

    /// Category this code belongs to.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidPipeline => ErrorCategory::ConnectionSetup,
            Self::InvalidMessage | Self::InvalidFrame | Self::FrameTooLarge => {
                ErrorCategory::Protocol
            }
            Self::PipelineFailure => ErrorCategory::Execution,
            Self::InternalError => ErrorCategory::Unexpected,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCode {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|code| code.as_str() == s)
            .ok_or_else(|| ProtoError::UnknownErrorCode(s.to_string()))
    }
}

/// Advisory warnings sent to clients.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Warning {
    /// The client should reduce its send rate.
    SlowDown,
}

/// Messages sent from the server to a streaming client.
///
/// The encoding is untagged so each variant maps onto a flat JSON object:
///
/// ```text
/// {"frame_index": 3, "result": {...}}
/// {"frame_index": 4, "dropped": true}
/// {"warning": "slow_down"}
/// {"error": "invalid_frame", "detail": "..."}
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ServerMessage {
    /// A frame was discarded under backpressure.
    Dropped {
        /// The index the frame would have been given had it been accepted.
        frame_index: u64,
        /// Always `true`.
        dropped: bool,
    },
    /// A frame was processed.
    Result {
        /// Index of the processed frame.
        frame_index: u64,
        /// Pipeline output.
        result: serde_json::Value,
    },
    /// Advisory warning.
    Warning {
        /// Which warning.
        warning: Warning,
    },
    /// Terminal error; the server closes the connection after sending it.
    Error {
        /// Error code.
        error: ErrorCode,
        /// Human readable detail.
        detail: String,
    },
}

impl ServerMessage {
    /// Create a result message.
    #[must_use]
    pub const fn result(frame_index: u64, result: serde_json::Value) -> Self {
        Self::Result {
            frame_index,
            result,
        }
    }

    /// Create a dropped-frame message.
    #[must_use]
    pub const fn dropped(frame_index: u64) -> Self {
        Self::Dropped {
            frame_index,
            dropped: true,
        }
    }

    /// Create a slow-down warning.
    #[must_use]
    pub const fn slow_down() -> Self {
        Self::Warning {
            warning: Warning::SlowDown,
        }
    }

    /// Create an error message.
    #[must_use]
    pub fn error(error: ErrorCode, detail: impl Into<String>) -> Self {
        Self::Error {
            error,
            detail: detail.into(),
        }
    }

    /// Frame index carried by result and dropped messages.
    #[must_use]
    pub const fn frame_index(&self) -> Option<u64> {
        match self {
            Self::Result { frame_index, .. } | Self::Dropped { frame_index, .. } => {
                Some(*frame_index)
            }
            Self::Warning { .. } | Self::Error { .. } => None,
        }
    }

    /// Error code if this is an error message.
    #[must_use]
    pub const fn error_code(&self) -> Option<ErrorCode> {
        match self {
            Self::Error { error, .. } => Some(*error),
            _ => None,
        }
    }

    /// Serialize to JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, ProtoError> {
        serde_json::to_string(self).map_err(|e| ProtoError::Encoding(e.to_string()))
    }

    /// Deserialize from JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if deserialization fails.
    pub fn from_json(json: &str) -> Result<Self, ProtoError> {
        serde_json::from_str(json).map_err(|e| ProtoError::Decoding(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_case::test_case;

    // ==================== ErrorCode Tests ====================

    #[test_case(ErrorCode::InvalidMessage, "invalid_message" ; "invalid message")]
    #[test_case(ErrorCode::InvalidFrame, "invalid_frame" ; "invalid frame")]
    #[test_case(ErrorCode::FrameTooLarge, "frame_too_large" ; "frame too large")]
    #[test_case(ErrorCode::InvalidPipeline, "invalid_pipeline" ; "invalid pipeline")]
    #[test_case(ErrorCode::PipelineFailure, "pipeline_failure" ; "pipeline failure")]
    #[test_case(ErrorCode::InternalError, "internal_error" ; "internal error")]
    fn test_error_code_wire_name(code: ErrorCode, expected: &str) {
        assert_eq!(code.as_str(), expected);
        assert_eq!(code.to_string(), expected);
        assert_eq!(serde_json::to_value(code).unwrap(), json!(expected));
        assert_eq!(expected.parse::<ErrorCode>().unwrap(), code);
    }

    #[test]
    fn test_error_code_from_str_unknown() {
        let result = "rate_limited".parse::<ErrorCode>();
        assert!(matches!(result, Err(ProtoError::UnknownErrorCode(_))));
    }

    #[test]
    fn test_error_code_categories() {
        assert_eq!(
            ErrorCode::InvalidPipeline.category(),
            ErrorCategory::ConnectionSetup
        );
        assert_eq!(ErrorCode::InvalidMessage.category(), ErrorCategory::Protocol);
        assert_eq!(ErrorCode::InvalidFrame.category(), ErrorCategory::Protocol);
        assert_eq!(ErrorCode::FrameTooLarge.category(), ErrorCategory::Protocol);
        assert_eq!(ErrorCode::PipelineFailure.category(), ErrorCategory::Execution);
        assert_eq!(ErrorCode::InternalError.category(), ErrorCategory::Unexpected);
    }

    // ==================== ServerMessage Shape Tests ====================

    #[test]
    fn test_result_message_shape() {
        let msg = ServerMessage::result(7, json!({"label": "cat"}));
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();

        assert_eq!(value, json!({"frame_index": 7, "result": {"label": "cat"}}));
    }

    #[test]
    fn test_dropped_message_shape() {
        let msg = ServerMessage::dropped(12);
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();

        assert_eq!(value, json!({"frame_index": 12, "dropped": true}));
    }

    #[test]
    fn test_slow_down_message_shape() {
        let json = ServerMessage::slow_down().to_json().unwrap();
        assert_eq!(json, r#"{"warning":"slow_down"}"#);
    }

    #[test]
    fn test_error_message_shape() {
        let msg = ServerMessage::error(ErrorCode::FrameTooLarge, "frame is 6291456 bytes");
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();

        assert_eq!(
            value,
            json!({"error": "frame_too_large", "detail": "frame is 6291456 bytes"})
        );
    }

    // ==================== Decoding Tests ====================

    #[test]
    fn test_decode_distinguishes_result_from_dropped() {
        let dropped = ServerMessage::from_json(r#"{"frame_index":3,"dropped":true}"#).unwrap();
        assert_eq!(dropped, ServerMessage::dropped(3));

        let result = ServerMessage::from_json(r#"{"frame_index":3,"result":null}"#).unwrap();
        assert_eq!(result, ServerMessage::result(3, serde_json::Value::Null));
    }

    #[test]
    fn test_decode_error_message() {
        let msg =
            ServerMessage::from_json(r#"{"error":"invalid_pipeline","detail":"unknown"}"#).unwrap();
        assert_eq!(msg.error_code(), Some(ErrorCode::InvalidPipeline));
    }

    #[test]
    fn test_decode_garbage_fails() {
        let result = ServerMessage::from_json(r#"{"hello":"world"}"#);
        assert!(matches!(result, Err(ProtoError::Decoding(_))));
    }

    // ==================== Accessor Tests ====================

    #[test]
    fn test_frame_index_accessor() {
        assert_eq!(ServerMessage::dropped(4).frame_index(), Some(4));
        assert_eq!(ServerMessage::result(5, json!(1)).frame_index(), Some(5));
        assert_eq!(ServerMessage::slow_down().frame_index(), None);
        assert_eq!(
            ServerMessage::error(ErrorCode::InternalError, "x").frame_index(),
            None
        );
    }

    #[test]
    fn test_error_code_accessor() {
        assert_eq!(ServerMessage::slow_down().error_code(), None);
        assert_eq!(
            ServerMessage::error(ErrorCode::PipelineFailure, "boom").error_code(),
            Some(ErrorCode::PipelineFailure)
        );
    }
}
