//! # termrelay Protocol Library
//!
//! This crate provides the wire messages and session naming rules shared by
//! the termrelay daemon and its browser client.
//!
//! ## Overview
//!
//! - **Message Definitions**: inbound (`attach`, `switch`, `input`, `resize`,
//!   `ping`) and outbound (`attached`, `switched`, `detached`, `output`,
//!   `error`, `pong`) transport messages
//! - **Session Names**: validation, prefixing and display names
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │          Application Messages           │  {"type": .., "data": ..}
//! ├─────────────────────────────────────────┤
//! │           JSON text frames              │  serde_json
//! ├─────────────────────────────────────────┤
//! │            WebSocket                    │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{ClientMessage, SessionNamespace};
//!
//! let msg = ClientMessage::from_json(r#"{"type":"attach","data":{"sessionName":"work"}}"#).unwrap();
//! assert!(matches!(msg, ClientMessage::Attach(_)));
//!
//! let ns = SessionNamespace::default();
//! assert_eq!(ns.full_name("work").unwrap(), "ccw_work");
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Transport message definitions
//! - [`names`]: Session name validation and namespacing
//! - [`error`]: Error types

pub mod error;
pub mod messages;
pub mod names;

pub use error::{ProtocolError, Result};
pub use messages::{
    AttachRequest, Attached, ClientMessage, Detached, ErrorCode, ErrorMessage, ResizeRequest,
    ServerMessage, SwitchRequest, Switched,
};
pub use names::{
    validate_prefix, validate_session_name, NameError, SessionNamespace, DEFAULT_SESSION_PREFIX,
    MAX_SESSION_NAME_LEN,
};
