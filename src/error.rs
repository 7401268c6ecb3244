//! Core error taxonomy.
//!
//! Subsystems raise their own focused error enum; [`CoreError`] is the
//! boundary type every public supervisor/engine operation returns, the
//! concrete Rust shape of the error kinds named by this crate's design
//! document.

use serde::Serialize;
use thiserror::Error;

use crate::ocpp::codec::ErrorCode;

/// Malformed frame, missing/mistyped field, or an out-of-range value.
#[derive(Debug, Error)]
pub enum ProtocolFormationError {
    #[error("frame is not a JSON array")]
    NotAnArray,
    #[error("unrecognised message type id {0}")]
    UnknownMessageType(i64),
    #[error("message id missing or empty")]
    InvalidMessageId,
    #[error("frame shape does not match its message type")]
    ShapeMismatch,
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("field `{0}` has the wrong type")]
    WrongType(&'static str),
    #[error("field `{0}` is out of range")]
    OutOfRange(&'static str),
}

impl ProtocolFormationError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::NotAnArray | Self::UnknownMessageType(_) | Self::ShapeMismatch => {
                ErrorCode::FormationViolation
            }
            Self::InvalidMessageId => ErrorCode::FormationViolation,
            Self::MissingField(_) => ErrorCode::OccurrenceConstraintViolation,
            Self::WrongType(_) => ErrorCode::TypeConstraintViolation,
            Self::OutOfRange(_) => ErrorCode::PropertyConstraintViolation,
        }
    }
}

/// Requested operation has no edge from the current state in the adjacency table.
#[derive(Debug, Error)]
#[error("cannot move session from {from:?} to {to:?}")]
pub struct StateMachineError {
    pub from: String,
    pub to: String,
}

/// A correlator deadline elapsed before a reply arrived.
#[derive(Debug, Error)]
#[error("request `{action}` (id {message_id}) timed out after {elapsed_ms}ms")]
pub struct TimeoutError {
    pub message_id: String,
    pub action: String,
    pub elapsed_ms: u64,
}

/// WebSocket transport failure (read, write, or unexpected close).
#[derive(Debug, Error)]
#[error("transport failure: {0}")]
pub struct TransportError(pub String);

/// A bounded resource was exhausted (outbound queue, session table).
#[derive(Debug, Error)]
pub enum ResourceExhausted {
    #[error("outbound queue full for session {session_id} (depth {depth})")]
    QueueFull { session_id: String, depth: usize },
    #[error("engine is at its configured session limit ({limit})")]
    SessionLimitReached { limit: usize },
}

/// Invalid profile shape, invalid recurrence, or an unknown referenced id.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("invalid charging profile: {0}")]
    InvalidProfile(String),
    #[error("unknown vehicle profile id `{0}`")]
    UnknownVehicle(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Loss of a required collaborator subsystem (SessionStore or EventBus).
#[derive(Debug, Error)]
#[error("fatal engine condition: {0}")]
pub struct FatalEngineError(pub String);

/// Top-level error returned from every fallible supervisor/engine operation.
///
/// Carries a stable machine-readable `code`, a human message, and an
/// optional JSON details map, matching the envelope every terminal
/// operation is required to produce.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Protocol(#[from] ProtocolFormationError),
    #[error(transparent)]
    StateMachine(#[from] StateMachineError),
    #[error(transparent)]
    Timeout(#[from] TimeoutError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    ResourceExhausted(#[from] ResourceExhausted),
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Fatal(#[from] FatalEngineError),
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Serialize)]
pub struct ErrorDescriptor {
    pub code: &'static str,
    pub message: String,
    pub details: serde_json::Value,
}

impl CoreError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Protocol(_) => "protocol_formation_error",
            Self::StateMachine(_) => "state_machine_error",
            Self::Timeout(_) => "timeout_error",
            Self::Transport(_) => "transport_error",
            Self::ResourceExhausted(_) => "resource_exhausted",
            Self::Configuration(_) => "configuration_error",
            Self::Fatal(_) => "fatal_engine_error",
            Self::Internal(_) => "internal_error",
        }
    }

    pub fn to_descriptor(&self) -> ErrorDescriptor {
        ErrorDescriptor {
            code: self.code(),
            message: self.to_string(),
            details: serde_json::json!({}),
        }
    }

    /// Whether this error should ever tear down the owning session.
    ///
    /// Per the error-handling design, only [`FatalEngineError`] changes engine
    /// operating mode; every other kind is recoverable and leaves the session
    /// intact.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
