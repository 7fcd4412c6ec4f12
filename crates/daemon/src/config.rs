//! Configuration management for the termrelay daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/termrelay/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("port must be between 1 and 65535, got {0}")]
    InvalidPort(u16),

    #[error("session prefix must contain only letters, digits and underscores, got {0:?}")]
    InvalidPrefix(String),

    #[error("tmux binary not found: {0}")]
    InvalidTmuxBinary(String),

    #[error("default terminal size must be non-zero, got {cols}x{rows}")]
    InvalidGeometry { cols: u16, rows: u16 },

    #[error("command_timeout_ms must be between 1 and 60000, got {0}")]
    InvalidCommandTimeout(u64),

    #[error("ping_timeout_secs ({timeout}) must be greater than ping_interval_secs ({interval}) and both non-zero")]
    InvalidPingSettings { interval: u64, timeout: u64 },

    #[error("event_buffer must be greater than 0")]
    InvalidEventBuffer,

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the termrelay daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// HTTP / WebSocket listener configuration.
    pub server: ServerConfig,

    /// Multiplexer session configuration.
    pub session: SessionConfig,

    /// Real-time transport configuration.
    pub transport: TransportConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Directory for daily rolling log files. Logs go to stderr only when unset.
    pub log_dir: Option<PathBuf>,
}

/// Listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind.
    pub host: String,

    /// Port to bind.
    pub port: u16,

    /// Directory of static client assets served at `/`.
    pub static_dir: Option<PathBuf>,
}

/// Multiplexer session configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Prefix namespacing the sessions this relay manages.
    pub prefix: String,

    /// tmux executable, either a path or a name looked up in `PATH`.
    pub tmux_binary: String,

    /// Working directory for new sessions and attach processes.
    pub working_dir: PathBuf,

    /// Scrollback lines kept by each session.
    pub history_limit: u32,

    /// Escape-key delay in milliseconds.
    pub escape_time_ms: u32,

    /// Enable pointer-device input inside sessions.
    pub mouse: bool,

    /// Use vi-style keys in copy mode.
    pub vi_mode_keys: bool,

    /// Initial terminal columns for a freshly spawned PTY.
    pub default_cols: u16,

    /// Initial terminal rows for a freshly spawned PTY.
    pub default_rows: u16,

    /// UTF-8 locale exported as `LANG` and `LC_ALL`.
    pub locale: String,

    /// Terminal type exported as `TERM`.
    pub term: String,

    /// Upper bound for a single tmux command, in milliseconds.
    pub command_timeout_ms: u64,
}

/// Real-time transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransportConfig {
    /// Interval between server-sent WebSocket pings.
    pub ping_interval_secs: u64,

    /// Silence after which a connection is considered broken.
    pub ping_timeout_secs: u64,

    /// Capacity of the per-connection PTY event and outbound queues.
    pub event_buffer: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            static_dir: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            prefix: protocol::DEFAULT_SESSION_PREFIX.to_string(),
            tmux_binary: "tmux".to_string(),
            working_dir: default_working_dir(),
            history_limit: 10_000,
            escape_time_ms: 10,
            mouse: true,
            vi_mode_keys: true,
            default_cols: 80,
            default_rows: 24,
            locale: "en_US.UTF-8".to_string(),
            term: "xterm-256color".to_string(),
            command_timeout_ms: 2_000,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: 25,
            ping_timeout_secs: 60,
            event_buffer: 256,
        }
    }
}

impl SessionConfig {
    /// Returns the tmux command timeout as a `Duration`.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

impl TransportConfig {
    /// Returns the ping interval as a `Duration`.
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    /// Returns the idle timeout as a `Duration`.
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termrelay")
        .join("config.toml")
}

/// Returns the default working directory for sessions.
fn default_working_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - TERMRELAY_HOST: Override bind address
    /// - TERMRELAY_PORT: Override bind port
    /// - TERMRELAY_SESSION_PREFIX: Override session prefix
    /// - TERMRELAY_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Some(host) = non_empty_env("TERMRELAY_HOST") {
            tracing::info!("Overriding host from environment: {}", host);
            self.server.host = host;
        }

        if let Some(port) = non_empty_env("TERMRELAY_PORT") {
            match port.parse::<u16>() {
                Ok(port) => {
                    tracing::info!("Overriding port from environment: {}", port);
                    self.server.port = port;
                }
                Err(e) => {
                    tracing::warn!(value = %port, error = %e, "Ignoring invalid TERMRELAY_PORT");
                }
            }
        }

        if let Some(prefix) = non_empty_env("TERMRELAY_SESSION_PREFIX") {
            tracing::info!("Overriding session prefix from environment: {}", prefix);
            self.session.prefix = prefix;
        }

        if let Some(level) = non_empty_env("TERMRELAY_LOG_LEVEL") {
            tracing::info!("Overriding log_level from environment: {}", level);
            self.daemon.log_level = level;
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::InvalidPort(self.server.port));
        }

        if protocol::validate_prefix(&self.session.prefix).is_err() {
            return Err(ConfigError::InvalidPrefix(self.session.prefix.clone()));
        }

        if self.session.default_cols == 0 || self.session.default_rows == 0 {
            return Err(ConfigError::InvalidGeometry {
                cols: self.session.default_cols,
                rows: self.session.default_rows,
            });
        }

        if self.session.command_timeout_ms == 0 || self.session.command_timeout_ms > 60_000 {
            return Err(ConfigError::InvalidCommandTimeout(
                self.session.command_timeout_ms,
            ));
        }

        let interval = self.transport.ping_interval_secs;
        let timeout = self.transport.ping_timeout_secs;
        if interval == 0 || timeout <= interval {
            return Err(ConfigError::InvalidPingSettings { interval, timeout });
        }

        if self.transport.event_buffer == 0 {
            return Err(ConfigError::InvalidEventBuffer);
        }

        // Validate tmux binary exists
        let tmux_path = Path::new(&self.session.tmux_binary);
        if tmux_path.is_absolute() {
            if !tmux_path.exists() {
                return Err(ConfigError::InvalidTmuxBinary(
                    self.session.tmux_binary.clone(),
                ));
            }
        } else if which::which(&self.session.tmux_binary).is_err() {
            return Err(ConfigError::InvalidTmuxBinary(
                self.session.tmux_binary.clone(),
            ));
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
