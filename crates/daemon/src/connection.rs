//! Per-connection session controller.
//!
//! A [`Connection`] binds one transport link to at most one PTY at a time.
//! It is driven from a single task: client messages and PTY events are fed
//! in one at a time, so no two transitions ever interleave.
//!
//! Every spawn bumps the connection's generation. PTY events carry the
//! generation of the handle that produced them and are acted on only when it
//! still matches, which is what makes kill-then-spawn safe without waiting for
//! the killed process to report its exit.

use std::sync::Arc;

use protocol::{
    Attached, ClientMessage, Detached, ErrorCode, ErrorMessage, ServerMessage, Switched,
};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::session::{
    Generation, PtyError, PtyEvent, PtyEventKind, PtyEventSender, PtyHandle, PtySpawner,
    SessionRegistry, SpawnRequest,
};

/// Controller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No PTY, nothing attached yet.
    Idle,
    /// Resolving or creating the session for an `attach`.
    Attaching,
    /// A PTY is live.
    Attached,
    /// Replacing the live PTY for a `switch`.
    Switching,
    /// The PTY ended on its own; the client is expected to pick a session.
    Detached,
}

/// One transport connection and its PTY.
pub struct Connection<R: SessionRegistry, S: PtySpawner> {
    id: Uuid,
    registry: Arc<R>,
    spawner: Arc<S>,
    state: ConnectionState,
    current_session: Option<String>,
    active: Option<S::Handle>,
    generation: Generation,
    size: (u16, u16),
    outbound: mpsc::Sender<ServerMessage>,
    events: PtyEventSender,
}

impl<R: SessionRegistry, S: PtySpawner> Connection<R, S> {
    /// Creates an idle connection.
    ///
    /// `outbound` carries messages to the client; `events` is handed to every
    /// PTY this connection spawns. `size` is the geometry used until the
    /// client sends a resize.
    pub fn new(
        registry: Arc<R>,
        spawner: Arc<S>,
        outbound: mpsc::Sender<ServerMessage>,
        events: PtyEventSender,
        size: (u16, u16),
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            registry,
            spawner,
            state: ConnectionState::Idle,
            current_session: None,
            active: None,
            generation: 0,
            size,
            outbound,
            events,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Full name of the session this connection is (or was last) bound to.
    pub fn current_session(&self) -> Option<&str> {
        self.current_session.as_deref()
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn is_attached(&self) -> bool {
        self.active.is_some()
    }

    /// Process ID of the live PTY.
    pub fn active_pid(&self) -> Option<u32> {
        self.active.as_ref().and_then(|pty| pty.pid())
    }

    /// Dispatches one client message.
    pub async fn handle(&mut self, message: ClientMessage) {
        match message {
            ClientMessage::Attach(req) => self.attach(req.session_name).await,
            ClientMessage::Switch(req) => self.switch(req.session_name).await,
            ClientMessage::Input(data) => self.input(data.as_bytes()),
            ClientMessage::Resize(req) => self.resize(req.cols, req.rows),
            ClientMessage::Ping => self.send(ServerMessage::Pong).await,
        }
    }

    /// Attaches to `requested`, creating the session if needed. A missing or
    /// empty name picks a fresh numeric one; anything else must be a valid
    /// name as given.
    pub async fn attach(&mut self, requested: Option<String>) {
        let previous = self.state;
        self.state = ConnectionState::Attaching;

        let raw_name = match requested.filter(|n| !n.is_empty()) {
            Some(name) => name,
            None => match self.registry.generate_unique_name().await {
                Ok(name) => name,
                Err(e) => {
                    self.state = previous;
                    self.report(
                        ErrorMessage::new(e.code(), "Failed to pick a session name").with_error(e),
                    )
                    .await;
                    return;
                }
            },
        };

        let full_name = match self.registry.namespace().full_name(&raw_name) {
            Ok(name) => name,
            Err(e) => {
                self.state = previous;
                self.report(
                    ErrorMessage::new(ErrorCode::InvalidName, "Invalid session name").with_error(e),
                )
                .await;
                return;
            }
        };

        if !self.registry.exists(&full_name).await {
            if let Err(e) = self.registry.create(&full_name).await {
                // Someone else may have created it in the meantime.
                if !self.registry.exists(&full_name).await {
                    warn!(connection = %self.id, session = %full_name, error = %e, "Session creation failed");
                    self.state = previous;
                    self.report(
                        ErrorMessage::new(e.code(), "Failed to create session").with_error(e),
                    )
                    .await;
                    return;
                }
            }
        }

        if let Err(e) = self.replace_pty(&full_name).await {
            self.report_spawn_failure(&full_name, e).await;
            return;
        }

        info!(connection = %self.id, session = %full_name, generation = self.generation, "Attached");

        self.state = ConnectionState::Attached;
        self.current_session = Some(full_name.clone());
        let display_name = self.registry.namespace().display_name(&full_name).to_string();
        self.send(ServerMessage::Attached(Attached {
            session_name: full_name,
            display_name,
        }))
        .await;
    }

    /// Moves to an existing session. Never creates one.
    pub async fn switch(&mut self, requested: Option<String>) {
        let Some(raw_name) = requested.filter(|n| !n.is_empty()) else {
            self.report(ErrorMessage::new(
                ErrorCode::InvalidRequest,
                "Session name is required",
            ))
            .await;
            return;
        };

        let full_name = match self.registry.namespace().full_name(&raw_name) {
            Ok(name) => name,
            Err(e) => {
                self.report(
                    ErrorMessage::new(ErrorCode::InvalidName, "Invalid session name").with_error(e),
                )
                .await;
                return;
            }
        };

        if self.active.is_some() && self.current_session.as_deref() == Some(full_name.as_str()) {
            debug!(connection = %self.id, session = %full_name, "Already attached, ignoring switch");
            return;
        }

        if !self.registry.exists(&full_name).await {
            self.report(
                ErrorMessage::new(ErrorCode::NotFound, "Session not found").with_error(&full_name),
            )
            .await;
            return;
        }

        self.state = ConnectionState::Switching;
        let old_session_name = self.current_session.clone();

        if let Err(e) = self.replace_pty(&full_name).await {
            self.report_spawn_failure(&full_name, e).await;
            return;
        }

        info!(
            connection = %self.id,
            from = ?old_session_name,
            to = %full_name,
            generation = self.generation,
            "Switched"
        );

        self.state = ConnectionState::Attached;
        self.current_session = Some(full_name.clone());
        let display_name = self.registry.namespace().display_name(&full_name).to_string();
        self.send(ServerMessage::Switched(Switched {
            session_name: full_name,
            display_name,
            old_session_name,
        }))
        .await;
    }

    /// Forwards input to the live PTY. Dropped when there is none.
    pub fn input(&mut self, data: &[u8]) {
        let Some(pty) = self.active.as_mut() else {
            trace!(connection = %self.id, bytes = data.len(), "Dropping input, no PTY");
            return;
        };

        if let Err(e) = pty.write(data) {
            warn!(connection = %self.id, error = %e, "PTY write failed");
        }
    }

    /// Resizes the live PTY. Zero dimensions are ignored.
    pub fn resize(&mut self, cols: u16, rows: u16) {
        if cols == 0 || rows == 0 {
            debug!(connection = %self.id, cols, rows, "Ignoring empty resize");
            return;
        }

        // Remembered so the next spawn starts at the client's size.
        self.size = (cols, rows);

        if let Some(pty) = self.active.as_mut() {
            if let Err(e) = pty.resize(cols, rows) {
                warn!(connection = %self.id, error = %e, "PTY resize failed");
            }
        }
    }

    /// Applies a PTY event if it belongs to the live PTY.
    pub async fn handle_pty_event(&mut self, event: PtyEvent) {
        if event.generation != self.generation || self.active.is_none() {
            trace!(
                connection = %self.id,
                event_generation = event.generation,
                current_generation = self.generation,
                "Dropping stale PTY event"
            );
            return;
        }

        match event.kind {
            PtyEventKind::Output(text) => self.send(ServerMessage::Output(text)).await,
            PtyEventKind::Exit(info) => {
                self.active = None;
                self.state = ConnectionState::Detached;
                let session_name = self.current_session.clone().unwrap_or_default();

                info!(
                    connection = %self.id,
                    session = %session_name,
                    exit_code = ?info.exit_code,
                    signal = ?info.signal,
                    "PTY ended, detached"
                );

                self.send(ServerMessage::Detached(Detached {
                    session_name,
                    exit_code: info.exit_code,
                    signal: info.signal,
                }))
                .await;
            }
        }
    }

    /// Reports a frame that could not be decoded. The connection stays open.
    pub async fn reject_frame(&mut self, reason: impl ToString) {
        self.report(
            ErrorMessage::new(ErrorCode::InvalidRequest, "Malformed message").with_error(reason),
        )
        .await;
    }

    /// Tears down the live PTY. The session keeps running and nothing is sent.
    pub fn disconnect(&mut self) {
        self.teardown();
        self.state = ConnectionState::Idle;
        self.current_session = None;
        debug!(connection = %self.id, "Connection closed");
    }

    /// Kills the live PTY, bumps the generation and spawns a new PTY.
    async fn replace_pty(&mut self, full_name: &str) -> Result<(), PtyError> {
        self.teardown();
        self.generation += 1;

        let request = SpawnRequest {
            session_name: full_name.to_string(),
            cols: self.size.0,
            rows: self.size.1,
            generation: self.generation,
        };

        let pty = self.spawner.spawn(request, self.events.clone()).await?;
        self.active = Some(pty);
        Ok(())
    }

    fn teardown(&mut self) {
        if let Some(mut pty) = self.active.take() {
            pty.kill();
        }
    }

    async fn report_spawn_failure(&mut self, full_name: &str, error: PtyError) {
        warn!(connection = %self.id, session = %full_name, error = %error, "PTY spawn failed");
        self.state = ConnectionState::Idle;
        self.current_session = None;
        self.report(
            ErrorMessage::new(ErrorCode::SpawnFailed, "Failed to attach to session")
                .with_error(error),
        )
        .await;
    }

    async fn report(&mut self, error: ErrorMessage) {
        debug!(connection = %self.id, code = ?error.code, message = %error.message, "Reporting error");
        self.send(ServerMessage::Error(error)).await;
    }

    async fn send(&mut self, message: ServerMessage) {
        if self.outbound.send(message).await.is_err() {
            trace!(connection = %self.id, "Outbound channel closed");
        }
    }
}

impl<R: SessionRegistry, S: PtySpawner> Drop for Connection<R, S> {
    fn drop(&mut self) {
        self.teardown();
    }
}
