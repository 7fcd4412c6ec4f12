//! # termrelay Daemon Library
//!
//! This crate relays browser terminals to persistent tmux sessions.
//!
//! ## Overview
//!
//! Sessions live in tmux and survive disconnects. A browser connects over a
//! WebSocket, attaches to a session (creating it on first use), and from then
//! on sees that session's output and drives its input through a PTY running
//! `tmux attach-session`. It can switch sessions on the same connection; the
//! old PTY is killed and a new one spawned, and nothing the old PTY says
//! afterwards reaches the client.
//!
//! - **Session Registry**: list, create, rename and destroy prefixed tmux sessions
//! - **PTY Bridge**: spawn attach clients, decode output, report exits
//! - **Connection Controller**: per-connection state machine with a generation guard
//! - **Transport**: JSON messages over WebSocket, plus a small HTTP API
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         RelayServer (axum)                       │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌────────────────────────────┐   ┌───────────────────────────┐  │
//! │  │   /ws  WebSocket transport │   │  /api/sessions, /health   │  │
//! │  └─────────────┬──────────────┘   └─────────────┬─────────────┘  │
//! │                │ one task per socket            │                │
//! │  ┌─────────────▼──────────────┐                 │                │
//! │  │   Connection (generation)  │                 │                │
//! │  └──────┬──────────────┬──────┘                 │                │
//! │         │              │                        │                │
//! │  ┌──────▼──────┐ ┌─────▼───────────────────────▼──────────────┐  │
//! │  │ PtySpawner  │ │              SessionRegistry                │  │
//! │  │ (PTY Bridge)│ │                (tmux CLI)                   │  │
//! │  └─────────────┘ └─────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::{Config, RelayServer};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     config.validate()?;
//!
//!     let server = RelayServer::from_config(config)?;
//!     let listener = server.bind().await?;
//!     server.serve(listener).await
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: Session registry, PTY bridge, in-memory backends
//! - [`connection`]: Per-connection session controller
//! - [`transport`]: WebSocket handler
//! - [`api`]: HTTP endpoints
//! - [`server`]: Router and server lifecycle

pub mod api;
pub mod config;
pub mod connection;
pub mod server;
pub mod session;
pub mod transport;

// Re-export protocol for convenience
pub use protocol;

// Re-export config types for convenience
pub use config::{Config, ConfigError};

// Re-export session types for convenience
pub use session::{
    MemoryRegistry, MemorySpawner, NativePtySpawner, PtyHandle, PtySpawner, RegistryError,
    Session, SessionRegistry, TmuxRegistry,
};

// Re-export connection and server types for convenience
pub use connection::{Connection, ConnectionState};
pub use server::{build_router, AppState, RelayServer};
