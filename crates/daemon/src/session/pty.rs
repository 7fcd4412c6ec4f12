//! PTY bridge.
//!
//! A [`PtyHandle`] is one live pseudo-terminal process attached to a session.
//! Its output and its exit are reported as [`PtyEvent`]s on a channel owned by
//! the connection that spawned it. Every event carries the generation the
//! handle was spawned with, so the connection can tell a stale handle's
//! leftovers from the current one.

use std::future::Future;
use std::io::{ErrorKind, Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use portable_pty::{
    native_pty_system, Child, ChildKiller, CommandBuilder, ExitStatus, MasterPty, PtySize,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::output::OutputDecoder;
use super::tmux::{session_target, SessionSettings, Tmux};
use crate::config::SessionConfig;

/// Buffer size for reading from the PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// Monotonic per-connection spawn counter.
pub type Generation = u64;

/// How a PTY process ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitInfo {
    /// Exit code, when the process exited normally.
    pub exit_code: Option<u32>,
    /// Signal name, when the process was terminated by a signal.
    pub signal: Option<String>,
}

/// What a PTY reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyEventKind {
    /// Decoded, filtered terminal output.
    Output(String),
    /// The process ended. Sent exactly once per handle, after all output.
    Exit(ExitInfo),
}

/// An event from a PTY, tagged with the generation that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyEvent {
    pub generation: Generation,
    pub kind: PtyEventKind,
}

impl PtyEvent {
    pub fn output(generation: Generation, text: impl Into<String>) -> Self {
        Self {
            generation,
            kind: PtyEventKind::Output(text.into()),
        }
    }

    pub fn exit(generation: Generation, info: ExitInfo) -> Self {
        Self {
            generation,
            kind: PtyEventKind::Exit(info),
        }
    }
}

/// Channel PTY events are delivered on.
pub type PtyEventSender = mpsc::Sender<PtyEvent>;

/// Parameters for spawning a PTY.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    /// Full (prefixed) session name.
    pub session_name: String,
    pub cols: u16,
    pub rows: u16,
    pub generation: Generation,
}

/// Errors that can occur during PTY operations.
#[derive(Error, Debug)]
pub enum PtyError {
    /// Failed to spawn the PTY.
    #[error("failed to spawn PTY: {0}")]
    SpawnFailed(String),

    /// Failed to write to the PTY.
    #[error("failed to write to PTY: {0}")]
    WriteFailed(String),

    /// Failed to resize the PTY.
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A live PTY process.
pub trait PtyHandle: Send + 'static {
    /// Generation this handle was spawned with.
    fn generation(&self) -> Generation;

    /// Process ID, if the platform reports one.
    fn pid(&self) -> Option<u32>;

    /// Full name of the session this handle is attached to.
    fn session_name(&self) -> &str;

    /// Whether the process is still running and has not been killed.
    fn is_alive(&self) -> bool;

    /// Writes raw input. A no-op once the handle is torn down.
    fn write(&mut self, data: &[u8]) -> Result<(), PtyError>;

    /// Resizes the terminal.
    fn resize(&mut self, cols: u16, rows: u16) -> Result<(), PtyError>;

    /// Terminates the process. Idempotent and infallible; the session itself
    /// keeps running.
    fn kill(&mut self);
}

/// Spawns PTY processes attached to sessions.
pub trait PtySpawner: Send + Sync + 'static {
    type Handle: PtyHandle;

    /// Spawns a PTY for `request.session_name`, reporting on `events`.
    fn spawn(
        &self,
        request: SpawnRequest,
        events: PtyEventSender,
    ) -> impl Future<Output = Result<Self::Handle, PtyError>> + Send;
}

/// A PTY process backed by `portable-pty`.
pub struct PtyBridge {
    session_name: String,
    generation: Generation,
    pid: Option<u32>,
    master: Box<dyn MasterPty + Send>,
    writer: Box<dyn Write + Send>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    running: Arc<AtomicBool>,
    killed: bool,
}

impl PtyBridge {
    /// Spawns `cmd` in a new PTY and starts the output pump.
    pub fn spawn_command(
        cmd: CommandBuilder,
        request: &SpawnRequest,
        events: PtyEventSender,
    ) -> Result<Self, PtyError> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: request.rows,
                cols: request.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;

        // The child holds its own copy; ours would keep the master from seeing EOF.
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;

        let running = Arc::new(AtomicBool::new(true));
        let pump = OutputPump {
            session_name: request.session_name.clone(),
            generation: request.generation,
            running: Arc::clone(&running),
            events,
        };

        std::thread::Builder::new()
            .name(format!("pty-reader-{}", request.generation))
            .spawn(move || pump.run(reader, child))
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;

        info!(
            session = %request.session_name,
            generation = request.generation,
            pid = ?pid,
            cols = request.cols,
            rows = request.rows,
            "Spawned PTY"
        );

        Ok(Self {
            session_name: request.session_name.clone(),
            generation: request.generation,
            pid,
            master: pair.master,
            writer,
            killer,
            running,
            killed: false,
        })
    }
}

impl PtyHandle for PtyBridge {
    fn generation(&self) -> Generation {
        self.generation
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn session_name(&self) -> &str {
        &self.session_name
    }

    fn is_alive(&self) -> bool {
        !self.killed && self.running.load(Ordering::SeqCst)
    }

    fn write(&mut self, data: &[u8]) -> Result<(), PtyError> {
        if !self.is_alive() {
            return Ok(());
        }

        self.writer
            .write_all(data)
            .map_err(|e| PtyError::WriteFailed(e.to_string()))?;
        self.writer
            .flush()
            .map_err(|e| PtyError::WriteFailed(e.to_string()))
    }

    fn resize(&mut self, cols: u16, rows: u16) -> Result<(), PtyError> {
        if !self.is_alive() {
            return Ok(());
        }

        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::ResizeFailed(e.to_string()))?;

        debug!(session = %self.session_name, cols, rows, "Resized PTY");
        Ok(())
    }

    fn kill(&mut self) {
        if self.killed {
            return;
        }
        self.killed = true;

        if !self.running.load(Ordering::SeqCst) {
            return;
        }

        if let Err(e) = self.killer.kill() {
            // Usually the process exited between the check and the signal.
            debug!(
                session = %self.session_name,
                generation = self.generation,
                error = %e,
                "PTY kill failed"
            );
        } else {
            debug!(
                session = %self.session_name,
                generation = self.generation,
                "Killed PTY"
            );
        }
    }
}

impl Drop for PtyBridge {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Reader side of a [`PtyBridge`], run on a dedicated thread.
struct OutputPump {
    session_name: String,
    generation: Generation,
    running: Arc<AtomicBool>,
    events: PtyEventSender,
}

impl OutputPump {
    fn run(self, mut reader: Box<dyn Read + Send>, mut child: Box<dyn Child + Send + Sync>) {
        let mut decoder = OutputDecoder::new();
        let mut buffer = [0u8; READ_BUFFER_SIZE];
        // Once the receiver is gone keep draining so the child never blocks on a full PTY.
        let mut delivering = true;

        loop {
            match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => {
                    if let Some(text) = decoder.push(&buffer[..n]) {
                        delivering = delivering && self.send(PtyEvent::output(self.generation, text));
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    // EIO is how Linux reports a closed slave.
                    debug!(session = %self.session_name, error = %e, "PTY read ended");
                    break;
                }
            }
        }

        if let Some(text) = decoder.finish() {
            if delivering {
                self.send(PtyEvent::output(self.generation, text));
            }
        }

        self.running.store(false, Ordering::SeqCst);

        let info = match child.wait() {
            Ok(status) => exit_info(&status),
            Err(e) => {
                warn!(session = %self.session_name, error = %e, "Failed to reap PTY child");
                ExitInfo::default()
            }
        };

        info!(
            session = %self.session_name,
            generation = self.generation,
            exit_code = ?info.exit_code,
            signal = ?info.signal,
            "PTY exited"
        );

        self.send(PtyEvent::exit(self.generation, info));
    }

    fn send(&self, event: PtyEvent) -> bool {
        self.events.blocking_send(event).is_ok()
    }
}

/// Converts a child's exit status. The signal is only exposed through the
/// status text ("Terminated by Hangup").
fn exit_info(status: &ExitStatus) -> ExitInfo {
    describe_exit(status.success(), status.exit_code(), &status.to_string())
}

fn describe_exit(success: bool, code: u32, text: &str) -> ExitInfo {
    if success {
        return ExitInfo {
            exit_code: Some(0),
            signal: None,
        };
    }

    match text.strip_prefix("Terminated by ") {
        Some(description) => ExitInfo {
            exit_code: None,
            signal: Some(signal_name(description.trim())),
        },
        None => ExitInfo {
            exit_code: Some(code),
            signal: None,
        },
    }
}

/// Maps a `strsignal` description to its conventional name. Unknown
/// descriptions are passed through.
fn signal_name(description: &str) -> String {
    let name = match description {
        "Hangup" => "SIGHUP",
        "Interrupt" => "SIGINT",
        "Quit" => "SIGQUIT",
        "Aborted" => "SIGABRT",
        "Killed" => "SIGKILL",
        "Segmentation fault" => "SIGSEGV",
        "Broken pipe" => "SIGPIPE",
        "Terminated" => "SIGTERM",
        other => other,
    };
    name.to_string()
}

/// Spawns `tmux attach-session` clients in native PTYs.
pub struct NativePtySpawner {
    tmux: Tmux,
    settings: SessionSettings,
    working_dir: PathBuf,
    locale: String,
    term: String,
}

impl NativePtySpawner {
    pub fn new(
        tmux: Tmux,
        settings: SessionSettings,
        working_dir: PathBuf,
        locale: impl Into<String>,
        term: impl Into<String>,
    ) -> Self {
        Self {
            tmux,
            settings,
            working_dir,
            locale: locale.into(),
            term: term.into(),
        }
    }

    /// Creates a spawner from the session configuration.
    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(
            Tmux::new(&config.tmux_binary, config.command_timeout()),
            SessionSettings::from(config),
            config.working_dir.clone(),
            &config.locale,
            &config.term,
        )
    }

    fn attach_command(&self, session_name: &str) -> CommandBuilder {
        let mut cmd = CommandBuilder::new(self.tmux.binary());
        cmd.args(["attach-session", "-t", session_target(session_name).as_str()]);
        cmd.env("TERM", &self.term);
        cmd.env("LANG", &self.locale);
        cmd.env("LC_ALL", &self.locale);
        // Running the daemon from inside tmux must not turn this into a nested-session error.
        cmd.env_remove("TMUX");
        if self.working_dir.is_dir() {
            cmd.cwd(&self.working_dir);
        }
        cmd
    }
}

impl PtySpawner for NativePtySpawner {
    type Handle = PtyBridge;

    async fn spawn(
        &self,
        request: SpawnRequest,
        events: PtyEventSender,
    ) -> Result<PtyBridge, PtyError> {
        if let Err(e) = self
            .tmux
            .apply_settings(&request.session_name, &self.settings)
            .await
        {
            debug!(session = %request.session_name, error = %e, "Could not re-apply session settings");
        }

        let cmd = self.attach_command(&request.session_name);
        PtyBridge::spawn_command(cmd, &request, events)
    }
}
