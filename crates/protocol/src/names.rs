//! Session naming rules.
//!
//! Every session the relay manages lives in a namespace: the multiplexer sees
//! the *full name* (`<prefix><name>`), while clients only ever see the
//! *display name* (the full name with the prefix stripped). Both the transport
//! layer and the HTTP API validate client-supplied names with the same rule:
//! 1 to 50 characters drawn from `[A-Za-z0-9_.-]`.

use thiserror::Error;

/// Prefix applied to every managed session unless configured otherwise.
pub const DEFAULT_SESSION_PREFIX: &str = "ccw_";

/// Maximum length of a session display name, in characters.
pub const MAX_SESSION_NAME_LEN: usize = 50;

/// Reasons a session name or prefix is rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NameError {
    /// The name was empty.
    #[error("session name must not be empty")]
    Empty,

    /// The name exceeded the maximum length.
    #[error("session name is {len} characters long, the maximum is {max}")]
    TooLong {
        /// Actual length.
        len: usize,
        /// Maximum allowed length.
        max: usize,
    },

    /// The name contained a character outside the allowed set.
    #[error("session name contains invalid character {0:?}; use letters, digits, '-', '_' or '.'")]
    InvalidCharacter(char),

    /// The namespace prefix itself is malformed.
    #[error("session prefix must be non-empty and contain only letters, digits and '_', got {0:?}")]
    InvalidPrefix(String),
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')
}

/// Validates a display name against `^[A-Za-z0-9_\-.]{1,50}$`.
pub fn validate_session_name(name: &str) -> Result<(), NameError> {
    if name.is_empty() {
        return Err(NameError::Empty);
    }

    if let Some(c) = name.chars().find(|c| !is_name_char(*c)) {
        return Err(NameError::InvalidCharacter(c));
    }

    // Only ASCII survives the character check, so byte length == char count.
    if name.len() > MAX_SESSION_NAME_LEN {
        return Err(NameError::TooLong {
            len: name.len(),
            max: MAX_SESSION_NAME_LEN,
        });
    }

    Ok(())
}

/// Validates a namespace prefix against `^[A-Za-z0-9_]+$`.
pub fn validate_prefix(prefix: &str) -> Result<(), NameError> {
    if prefix.is_empty() || !prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(NameError::InvalidPrefix(prefix.to_string()));
    }
    Ok(())
}

/// Maps between client-facing display names and prefixed multiplexer names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionNamespace {
    prefix: String,
}

impl SessionNamespace {
    /// Creates a namespace with the given prefix.
    pub fn new(prefix: impl Into<String>) -> Result<Self, NameError> {
        let prefix = prefix.into();
        validate_prefix(&prefix)?;
        Ok(Self { prefix })
    }

    /// Returns the namespace prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Resolves a client-supplied name to the full multiplexer name.
    ///
    /// Accepts either a display name or an already-prefixed full name; the
    /// prefix is stripped once before validation so `ccw_work` and `work`
    /// resolve to the same session.
    pub fn full_name(&self, raw: &str) -> Result<String, NameError> {
        let name = raw.strip_prefix(self.prefix.as_str()).unwrap_or(raw);
        validate_session_name(name)?;
        Ok(format!("{}{}", self.prefix, name))
    }

    /// Returns the display name for a full multiplexer name.
    pub fn display_name<'a>(&self, full: &'a str) -> &'a str {
        full.strip_prefix(self.prefix.as_str()).unwrap_or(full)
    }

    /// Returns whether a multiplexer session belongs to this namespace.
    pub fn owns(&self, full: &str) -> bool {
        full.starts_with(self.prefix.as_str())
    }
}

impl Default for SessionNamespace {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_SESSION_PREFIX.to_string(),
        }
    }
}
