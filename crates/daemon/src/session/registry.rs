//! Session registry: the set of named multiplexer sessions.
//!
//! The registry is independent of any connection. It answers "which sessions
//! exist", creates them on demand, and destroys or renames them on request.
//! Implementations must never block indefinitely; every call against the
//! multiplexer is bounded by a timeout.

use std::future::Future;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use protocol::{ErrorCode, NameError, SessionNamespace};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during registry operations.
#[derive(Error, Debug)]
pub enum RegistryError {
    /// The session name failed validation.
    #[error("invalid session name: {0}")]
    InvalidName(#[from] NameError),

    /// The session was not found.
    #[error("session not found: {0}")]
    NotFound(String),

    /// The target name is already in use.
    #[error("session already exists: {0}")]
    Conflict(String),

    /// The multiplexer failed to create the session.
    #[error("failed to create session: {0}")]
    CreationFailed(String),

    /// The multiplexer failed to destroy the session.
    #[error("failed to destroy session: {0}")]
    DestroyFailed(String),

    /// A multiplexer command exited unsuccessfully.
    #[error("tmux command failed: {0}")]
    CommandFailed(String),

    /// A multiplexer command did not finish in time.
    #[error("tmux did not respond within {0:?}")]
    Timeout(Duration),

    /// The multiplexer binary could not be executed.
    #[error("failed to run tmux: {0}")]
    Unavailable(#[from] std::io::Error),
}

impl RegistryError {
    /// Returns the protocol error code reported to clients.
    pub fn code(&self) -> ErrorCode {
        match self {
            RegistryError::InvalidName(_) => ErrorCode::InvalidName,
            RegistryError::NotFound(_) => ErrorCode::NotFound,
            RegistryError::Conflict(_) => ErrorCode::Conflict,
            RegistryError::CreationFailed(_) => ErrorCode::CreationFailed,
            RegistryError::Timeout(_) => ErrorCode::Timeout,
            RegistryError::DestroyFailed(_)
            | RegistryError::CommandFailed(_)
            | RegistryError::Unavailable(_) => ErrorCode::Internal,
        }
    }
}

/// A named multiplexer session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Full (prefixed) name.
    pub name: String,
    /// Name without the prefix.
    pub display_name: String,
    /// Creation time, Unix epoch milliseconds.
    pub created_at: u64,
    /// Current working directory of the session's active pane.
    pub working_directory: PathBuf,
}

impl Session {
    /// Builds a session record for a full name inside `namespace`.
    pub fn new(
        namespace: &SessionNamespace,
        name: impl Into<String>,
        created_at: u64,
        working_directory: impl Into<PathBuf>,
    ) -> Self {
        let name = name.into();
        Self {
            display_name: namespace.display_name(&name).to_string(),
            name,
            created_at,
            working_directory: working_directory.into(),
        }
    }
}

/// Returns the current Unix timestamp in milliseconds.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Returns the smallest positive integer not already used as a display name.
pub fn next_free_number(sessions: &[Session]) -> String {
    let used: std::collections::HashSet<u64> = sessions
        .iter()
        .filter(|s| !s.display_name.is_empty() && s.display_name.bytes().all(|b| b.is_ascii_digit()))
        .filter_map(|s| s.display_name.parse().ok())
        .collect();

    let mut n = 1;
    while used.contains(&n) {
        n += 1;
    }
    n.to_string()
}

/// Trait for session registry operations.
///
/// Names passed in may be display names or full (prefixed) names; both
/// resolve through the registry's [`SessionNamespace`].
pub trait SessionRegistry: Send + Sync + 'static {
    /// Returns the namespace used to prefix session names.
    fn namespace(&self) -> &SessionNamespace;

    /// Lists the sessions in this registry's namespace.
    ///
    /// Returns an empty list when the multiplexer has no sessions or is not
    /// running.
    fn list(&self) -> impl Future<Output = Result<Vec<Session>, RegistryError>> + Send;

    /// Creates a session.
    ///
    /// Session settings are applied right after creation; failing to apply
    /// them is logged and does not fail the call.
    fn create(&self, raw_name: &str)
        -> impl Future<Output = Result<Session, RegistryError>> + Send;

    /// Probes whether a session exists. Any failure resolves to `false`.
    fn exists(&self, name: &str) -> impl Future<Output = bool> + Send;

    /// Destroys a session. Safe to call while clients are attached.
    fn destroy(&self, name: &str) -> impl Future<Output = Result<(), RegistryError>> + Send;

    /// Renames a session.
    fn rename(
        &self,
        old_name: &str,
        new_name: &str,
    ) -> impl Future<Output = Result<Session, RegistryError>> + Send;

    /// Generates a display name that no live session uses.
    fn generate_unique_name(&self) -> impl Future<Output = Result<String, RegistryError>> + Send {
        async move {
            let sessions = self.list().await?;
            Ok(next_free_number(&sessions))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(display: &str) -> Session {
        Session::new(
            &SessionNamespace::default(),
            format!("ccw_{display}"),
            0,
            "/tmp",
        )
    }

    #[test]
    fn test_next_free_number_empty() {
        assert_eq!(next_free_number(&[]), "1");
    }

    #[test]
    fn test_next_free_number_fills_gaps() {
        let sessions = vec![session("1"), session("2"), session("4")];
        assert_eq!(next_free_number(&sessions), "3");
    }

    #[test]
    fn test_next_free_number_ignores_non_numeric() {
        let sessions = vec![session("work"), session("1"), session("2x"), session("-3")];
        assert_eq!(next_free_number(&sessions), "2");
    }

    #[test]
    fn test_session_new_strips_prefix() {
        let s = session("build");
        assert_eq!(s.name, "ccw_build");
        assert_eq!(s.display_name, "build");
    }

    #[test]
    fn test_session_serializes_camel_case() {
        let value = serde_json::to_value(session("1")).unwrap();
        assert_eq!(value["displayName"], "1");
        assert_eq!(value["createdAt"], 0);
        assert_eq!(value["workingDirectory"], "/tmp");
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            RegistryError::NotFound("x".into()).code(),
            ErrorCode::NotFound
        );
        assert_eq!(
            RegistryError::InvalidName(NameError::Empty).code(),
            ErrorCode::InvalidName
        );
        assert_eq!(
            RegistryError::Timeout(Duration::from_secs(1)).code(),
            ErrorCode::Timeout
        );
        assert_eq!(
            RegistryError::DestroyFailed("boom".into()).code(),
            ErrorCode::Internal
        );
    }
}
