//! Transport message definitions for termrelay.
//!
//! Every message travels as one JSON text frame shaped as
//! `{"type": "<name>", "data": <payload>}`. Field names inside payloads are
//! camelCase so the browser client can use them directly.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Messages sent by the browser client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Attach to a session, creating it if absent.
    Attach(AttachRequest),
    /// Switch to an existing session.
    Switch(SwitchRequest),
    /// Raw terminal input.
    Input(String),
    /// Terminal geometry change.
    Resize(ResizeRequest),
    /// Heartbeat request.
    Ping,
}

/// Messages sent to the browser client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum ServerMessage {
    /// An attach (or create) completed.
    Attached(Attached),
    /// A switch completed.
    Switched(Switched),
    /// The active terminal ended.
    Detached(Detached),
    /// A chunk of terminal output.
    Output(String),
    /// An operation failed.
    Error(ErrorMessage),
    /// Heartbeat reply.
    Pong,
}

/// Payload of `attach`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachRequest {
    /// Session to attach to; a fresh name is generated when absent.
    #[serde(default)]
    pub session_name: Option<String>,
}

/// Payload of `switch`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchRequest {
    /// Target session. Must already exist.
    #[serde(default)]
    pub session_name: Option<String>,
}

/// Payload of `resize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeRequest {
    /// Terminal columns.
    pub cols: u16,
    /// Terminal rows.
    pub rows: u16,
}

/// Payload of `attached`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attached {
    /// Full (prefixed) session name.
    pub session_name: String,
    /// Name shown to the user.
    pub display_name: String,
}

/// Payload of `switched`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Switched {
    /// Full (prefixed) session name now attached.
    pub session_name: String,
    /// Name shown to the user.
    pub display_name: String,
    /// Full name of the session attached before the switch, if any.
    pub old_session_name: Option<String>,
}

/// Payload of `detached`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Detached {
    /// Full name of the session whose terminal ended.
    pub session_name: String,
    /// Exit code of the terminal process, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<u32>,
    /// Signal that terminated the process, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
}

/// Payload of `error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Error code for programmatic handling.
    pub code: ErrorCode,
    /// Human-readable summary.
    pub message: String,
    /// Underlying cause, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Error codes for common error conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The client sent a frame that could not be understood.
    InvalidRequest,
    /// A session name failed validation.
    InvalidName,
    /// The target session does not exist.
    NotFound,
    /// The target name is already taken.
    Conflict,
    /// The multiplexer could not create the session.
    CreationFailed,
    /// The terminal process could not be started.
    SpawnFailed,
    /// The multiplexer did not answer in time.
    Timeout,
    /// Any other server-side failure.
    Internal,
}

impl ErrorMessage {
    /// Creates an error message without an underlying cause.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            error: None,
        }
    }

    /// Attaches the underlying cause.
    pub fn with_error(mut self, error: impl ToString) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

// ============================================================================
// Serialization helpers
// ============================================================================

impl ClientMessage {
    /// Parses a client message from a JSON text frame.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Serializes the message to a JSON text frame.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl ServerMessage {
    /// Parses a server message from a JSON text frame.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Serializes the message to a JSON text frame.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Shorthand for an `error` message.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error(ErrorMessage::new(code, message))
    }
}
