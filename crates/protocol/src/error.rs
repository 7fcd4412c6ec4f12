//! Error types for the protocol crate.

use thiserror::Error;

use crate::names::NameError;

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Failed to serialize a message.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize a message.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    /// A session name failed validation.
    #[error(transparent)]
    InvalidName(#[from] NameError),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syntax_error_maps_to_deserialization() {
        let err: ProtocolError = serde_json::from_str::<serde_json::Value>("{not json")
            .unwrap_err()
            .into();
        assert!(matches!(err, ProtocolError::Deserialization(_)));
    }

    #[test]
    fn test_name_error_is_transparent() {
        let err: ProtocolError = NameError::Empty.into();
        assert_eq!(err.to_string(), NameError::Empty.to_string());
    }
}
