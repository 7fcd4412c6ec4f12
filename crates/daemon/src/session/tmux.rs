//! tmux-backed session registry.
//!
//! Every tmux invocation goes through [`Tmux::run`], which bounds the call with
//! a timeout and kills the child if it does not answer in time. Session
//! targets use tmux's `=name` exact-match syntax so that `ccw_1` never
//! resolves to `ccw_12` by prefix matching.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use protocol::SessionNamespace;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::registry::{now_millis, RegistryError, Session, SessionRegistry};
use crate::config::SessionConfig;

/// Format string handed to `tmux list-sessions -F`.
const LIST_FORMAT: &str = "#{session_name}|#{session_created}|#{pane_current_path}";

/// Session-local options applied after creation and again before each attach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    /// `mouse on|off`.
    pub mouse: bool,
    /// `history-limit`.
    pub history_limit: u32,
    /// `escape-time` in milliseconds.
    pub escape_time_ms: u32,
    /// `mode-keys vi` when true, `emacs` otherwise.
    pub vi_mode_keys: bool,
}

impl From<&SessionConfig> for SessionSettings {
    fn from(config: &SessionConfig) -> Self {
        Self {
            mouse: config.mouse,
            history_limit: config.history_limit,
            escape_time_ms: config.escape_time_ms,
            vi_mode_keys: config.vi_mode_keys,
        }
    }
}

/// Exact-match session target.
pub fn session_target(full_name: &str) -> String {
    format!("={full_name}")
}

/// Current window of an exact-match session.
pub fn window_target(full_name: &str) -> String {
    format!("={full_name}:")
}

/// Runs tmux commands with a bounded wait.
#[derive(Debug, Clone)]
pub struct Tmux {
    binary: String,
    timeout: Duration,
}

impl Tmux {
    /// Creates a runner for the given binary.
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    /// Returns the tmux binary.
    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Runs `tmux <args>` and returns its stdout.
    pub async fn run(&self, args: &[&str]) -> Result<String, RegistryError> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| {
                warn!(args = ?args, timeout = ?self.timeout, "tmux command timed out");
                RegistryError::Timeout(self.timeout)
            })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(RegistryError::CommandFailed(stderr));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Applies [`SessionSettings`] to a session. Idempotent.
    pub async fn apply_settings(
        &self,
        full_name: &str,
        settings: &SessionSettings,
    ) -> Result<(), RegistryError> {
        let target = session_target(full_name);
        let history = settings.history_limit.to_string();
        let escape = settings.escape_time_ms.to_string();
        let mouse = if settings.mouse { "on" } else { "off" };
        let keys = if settings.vi_mode_keys { "vi" } else { "emacs" };

        self.run(&["set-option", "-t", &target, "mouse", mouse]).await?;
        self.run(&["set-option", "-t", &target, "history-limit", &history])
            .await?;
        self.run(&["set-option", "-t", &target, "escape-time", &escape])
            .await?;
        self.run(&[
            "set-window-option",
            "-t",
            &window_target(full_name),
            "mode-keys",
            keys,
        ])
        .await?;
        Ok(())
    }
}

/// Parses `list-sessions` output into the sessions owned by `namespace`.
///
/// Lines from other namespaces and malformed lines are skipped. A missing
/// pane path falls back to `fallback_cwd`.
pub fn parse_session_list(
    output: &str,
    namespace: &SessionNamespace,
    fallback_cwd: &Path,
) -> Vec<Session> {
    let mut sessions: Vec<Session> = output
        .lines()
        .filter(|line| namespace.owns(line))
        .filter_map(|line| {
            let mut parts = line.splitn(3, '|');
            let name = parts.next()?;
            let created_secs: u64 = parts.next()?.trim().parse().ok()?;
            let cwd = parts
                .next()
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| fallback_cwd.to_path_buf());
            Some(Session::new(
                namespace,
                name,
                created_secs.saturating_mul(1000),
                cwd,
            ))
        })
        .collect();

    sessions.sort_by(|a, b| a.name.cmp(&b.name));
    sessions
}

/// Session registry backed by a tmux server.
pub struct TmuxRegistry {
    tmux: Tmux,
    namespace: SessionNamespace,
    settings: SessionSettings,
    working_dir: PathBuf,
}

impl TmuxRegistry {
    /// Creates a registry from its parts.
    pub fn new(
        tmux: Tmux,
        namespace: SessionNamespace,
        settings: SessionSettings,
        working_dir: PathBuf,
    ) -> Self {
        Self {
            tmux,
            namespace,
            settings,
            working_dir,
        }
    }

    /// Creates a registry from the session configuration.
    pub fn from_config(config: &SessionConfig) -> Result<Self, RegistryError> {
        Ok(Self::new(
            Tmux::new(&config.tmux_binary, config.command_timeout()),
            SessionNamespace::new(&config.prefix)?,
            SessionSettings::from(config),
            config.working_dir.clone(),
        ))
    }

    /// Returns the underlying command runner.
    pub fn tmux(&self) -> &Tmux {
        &self.tmux
    }

    async fn find(&self, full_name: &str) -> Result<Option<Session>, RegistryError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .find(|s| s.name == full_name))
    }
}

impl SessionRegistry for TmuxRegistry {
    fn namespace(&self) -> &SessionNamespace {
        &self.namespace
    }

    async fn list(&self) -> Result<Vec<Session>, RegistryError> {
        match self.tmux.run(&["list-sessions", "-F", LIST_FORMAT]).await {
            Ok(output) => Ok(parse_session_list(
                &output,
                &self.namespace,
                &self.working_dir,
            )),
            // No server running or no sessions yet
            Err(RegistryError::CommandFailed(stderr)) => {
                debug!(stderr = %stderr, "tmux list-sessions returned no sessions");
                Ok(Vec::new())
            }
            Err(RegistryError::Unavailable(e)) => {
                warn!(error = %e, binary = %self.tmux.binary(), "tmux is not runnable");
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    async fn create(&self, raw_name: &str) -> Result<Session, RegistryError> {
        let full_name = self.namespace.full_name(raw_name)?;
        let cwd = self.working_dir.to_string_lossy().into_owned();

        self.tmux
            .run(&["new-session", "-d", "-s", &full_name, "-c", &cwd])
            .await
            .map_err(|e| match e {
                RegistryError::Timeout(_) => e,
                other => RegistryError::CreationFailed(other.to_string()),
            })?;

        if let Err(e) = self.tmux.apply_settings(&full_name, &self.settings).await {
            warn!(session = %full_name, error = %e, "Failed to apply session settings");
        }

        info!(session = %full_name, "Created tmux session");

        Ok(Session::new(
            &self.namespace,
            full_name,
            now_millis(),
            self.working_dir.clone(),
        ))
    }

    async fn exists(&self, name: &str) -> bool {
        let Ok(full_name) = self.namespace.full_name(name) else {
            return false;
        };

        self.tmux
            .run(&["has-session", "-t", &session_target(&full_name)])
            .await
            .is_ok()
    }

    async fn destroy(&self, name: &str) -> Result<(), RegistryError> {
        let full_name = self.namespace.full_name(name)?;

        if !self.exists(&full_name).await {
            return Err(RegistryError::NotFound(full_name));
        }

        self.tmux
            .run(&["kill-session", "-t", &session_target(&full_name)])
            .await
            .map_err(|e| match e {
                RegistryError::Timeout(_) => e,
                other => RegistryError::DestroyFailed(other.to_string()),
            })?;

        info!(session = %full_name, "Destroyed tmux session");
        Ok(())
    }

    async fn rename(&self, old_name: &str, new_name: &str) -> Result<Session, RegistryError> {
        let old_full = self.namespace.full_name(old_name)?;
        let new_full = self.namespace.full_name(new_name)?;

        if !self.exists(&old_full).await {
            return Err(RegistryError::NotFound(old_full));
        }

        if old_full != new_full {
            if self.exists(&new_full).await {
                return Err(RegistryError::Conflict(new_full));
            }

            self.tmux
                .run(&["rename-session", "-t", &session_target(&old_full), &new_full])
                .await?;

            info!(from = %old_full, to = %new_full, "Renamed tmux session");
        }

        self.find(&new_full)
            .await?
            .ok_or(RegistryError::NotFound(new_full))
    }
}
