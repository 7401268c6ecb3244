//! OCPP-J wire codec — encode/decode the four frame shapes and validate them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolFormationError;

/// OCPP-J error codes (Table from the OCPP 1.6-J appendix).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    NotImplemented,
    NotSupported,
    InternalError,
    ProtocolError,
    SecurityError,
    FormationViolation,
    PropertyConstraintViolation,
    OccurrenceConstraintViolation,
    TypeConstraintViolation,
    GenericError,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotImplemented => "NotImplemented",
            Self::NotSupported => "NotSupported",
            Self::InternalError => "InternalError",
            Self::ProtocolError => "ProtocolError",
            Self::SecurityError => "SecurityError",
            Self::FormationViolation => "FormationViolation",
            Self::PropertyConstraintViolation => "PropertyConstraintViolation",
            Self::OccurrenceConstraintViolation => "OccurrenceConstraintViolation",
            Self::TypeConstraintViolation => "TypeConstraintViolation",
            Self::GenericError => "GenericError",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ErrorCode {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "NotImplemented" => Self::NotImplemented,
            "NotSupported" => Self::NotSupported,
            "InternalError" => Self::InternalError,
            "ProtocolError" => Self::ProtocolError,
            "SecurityError" => Self::SecurityError,
            "FormationViolation" => Self::FormationViolation,
            "PropertyConstraintViolation" => Self::PropertyConstraintViolation,
            "OccurrenceConstraintViolation" => Self::OccurrenceConstraintViolation,
            "TypeConstraintViolation" => Self::TypeConstraintViolation,
            _ => Self::GenericError,
        })
    }
}

/// A decoded OCPP-J frame, one of the four shapes the wire protocol allows.
#[derive(Debug, Clone, PartialEq)]
pub enum OcppFrame {
    Call {
        message_id: String,
        action: String,
        payload: Value,
    },
    CallResult {
        message_id: String,
        payload: Value,
    },
    CallError {
        message_id: String,
        error_code: ErrorCode,
        error_description: String,
        error_details: Value,
    },
}

impl OcppFrame {
    pub fn message_id(&self) -> &str {
        match self {
            Self::Call { message_id, .. }
            | Self::CallResult { message_id, .. }
            | Self::CallError { message_id, .. } => message_id,
        }
    }

    pub fn encode(&self) -> String {
        let value = match self {
            Self::Call {
                message_id,
                action,
                payload,
            } => serde_json::json!([2, message_id, action, payload]),
            Self::CallResult {
                message_id,
                payload,
            } => serde_json::json!([3, message_id, payload]),
            Self::CallError {
                message_id,
                error_code,
                error_description,
                error_details,
            } => serde_json::json!([
                4,
                message_id,
                error_code.to_string(),
                error_description,
                error_details
            ]),
        };
        value.to_string()
    }

    /// Parse and validate a raw text frame. Any shape violation is returned
    /// as a [`ProtocolFormationError`]; the caller decides whether a
    /// message id could be recovered well enough to answer with a CALLERROR.
    pub fn decode(raw: &str) -> Result<Self, ProtocolFormationError> {
        let value: Value =
            serde_json::from_str(raw).map_err(|_| ProtocolFormationError::NotAnArray)?;
        let arr = value
            .as_array()
            .ok_or(ProtocolFormationError::NotAnArray)?;

        let type_id = arr
            .first()
            .and_then(Value::as_i64)
            .ok_or(ProtocolFormationError::ShapeMismatch)?;

        let message_id = arr
            .get(1)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or(ProtocolFormationError::InvalidMessageId)?
            .to_string();

        match type_id {
            2 => {
                if arr.len() != 4 {
                    return Err(ProtocolFormationError::ShapeMismatch);
                }
                let action = arr
                    .get(2)
                    .and_then(Value::as_str)
                    .ok_or(ProtocolFormationError::ShapeMismatch)?
                    .to_string();
                let payload = arr[3].clone();
                Ok(Self::Call {
                    message_id,
                    action,
                    payload,
                })
            }
            3 => {
                if arr.len() != 3 {
                    return Err(ProtocolFormationError::ShapeMismatch);
                }
                Ok(Self::CallResult {
                    message_id,
                    payload: arr[2].clone(),
                })
            }
            4 => {
                if arr.len() != 5 {
                    return Err(ProtocolFormationError::ShapeMismatch);
                }
                let error_code = arr
                    .get(2)
                    .and_then(Value::as_str)
                    .map(|s| s.parse::<ErrorCode>().unwrap())
                    .ok_or(ProtocolFormationError::ShapeMismatch)?;
                let error_description = arr
                    .get(3)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                Ok(Self::CallError {
                    message_id,
                    error_code,
                    error_description,
                    error_details: arr.get(4).cloned().unwrap_or(Value::Null),
                })
            }
            other => Err(ProtocolFormationError::UnknownMessageType(other)),
        }
    }

    /// Build a CALLERROR frame answering `message_id` with `code`/`description`.
    pub fn error(message_id: impl Into<String>, code: ErrorCode, description: &str) -> Self {
        Self::CallError {
            message_id: message_id.into(),
            error_code: code,
            error_description: description.to_string(),
            error_details: Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_call_as_four_element_array() {
        let frame = OcppFrame::Call {
            message_id: "1".into(),
            action: "Heartbeat".into(),
            payload: serde_json::json!({}),
        };
        assert_eq!(frame.encode(), r#"[2,"1","Heartbeat",{}]"#);
    }

    #[test]
    fn round_trips_call_result() {
        let raw = r#"[3,"42",{"status":"Accepted"}]"#;
        let decoded = OcppFrame::decode(raw).unwrap();
        match decoded {
            OcppFrame::CallResult { message_id, payload } => {
                assert_eq!(message_id, "42");
                assert_eq!(payload["status"], "Accepted");
            }
            _ => panic!("expected CallResult"),
        }
    }

    #[test]
    fn rejects_non_array_frame() {
        let err = OcppFrame::decode(r#"{"not":"a frame"}"#).unwrap_err();
        assert!(matches!(err, ProtocolFormationError::NotAnArray));
    }

    #[test]
    fn rejects_empty_message_id() {
        let err = OcppFrame::decode(r#"[2,"","Heartbeat",{}]"#).unwrap_err();
        assert!(matches!(err, ProtocolFormationError::InvalidMessageId));
    }

    #[test]
    fn rejects_shape_mismatch() {
        let err = OcppFrame::decode(r#"[2,"1","Heartbeat"]"#).unwrap_err();
        assert!(matches!(err, ProtocolFormationError::ShapeMismatch));
    }

    #[test]
    fn unknown_error_code_maps_to_generic() {
        let raw = r#"[4,"1","TotallyMadeUp","desc",{}]"#;
        let decoded = OcppFrame::decode(raw).unwrap();
        match decoded {
            OcppFrame::CallError { error_code, .. } => assert_eq!(error_code, ErrorCode::GenericError),
            _ => panic!("expected CallError"),
        }
    }
}
