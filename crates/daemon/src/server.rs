//! Relay server: wires the registry, the PTY spawner, the WebSocket transport
//! and the HTTP API into one axum application.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::{
    routing::{delete, get, put},
    Router,
};
use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::api;
use crate::config::Config;
use crate::session::{NativePtySpawner, PtySpawner, SessionRegistry, TmuxRegistry};
use crate::transport;

/// Bookkeeping for one live WebSocket connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub connected_at: Instant,
}

impl ConnectionInfo {
    pub fn new() -> Self {
        Self {
            connected_at: Instant::now(),
        }
    }
}

impl Default for ConnectionInfo {
    fn default() -> Self {
        Self::new()
    }
}

/// State shared by every handler.
pub struct AppState<R: SessionRegistry, S: PtySpawner> {
    pub config: Config,
    pub registry: Arc<R>,
    pub spawner: Arc<S>,
    /// Live connections by id.
    pub connections: DashMap<Uuid, ConnectionInfo>,
    pub started_at: Instant,
    /// Cancelled when the server shuts down; every connection task watches it.
    pub shutdown: CancellationToken,
}

/// Builds the application router.
pub fn build_router<R: SessionRegistry, S: PtySpawner>(state: Arc<AppState<R, S>>) -> Router {
    let static_dir = state.config.server.static_dir.clone();

    let app = Router::new()
        .route("/ws", get(transport::ws_handler::<R, S>))
        .route("/api/sessions", get(api::list_sessions::<R, S>))
        .route("/api/sessions/:name", delete(api::delete_session::<R, S>))
        .route(
            "/api/sessions/:name/rename",
            put(api::rename_session::<R, S>),
        )
        .route("/health", get(api::health::<R, S>));

    let app = match static_dir {
        Some(dir) if dir.is_dir() => {
            info!(dir = %dir.display(), "Serving static assets");
            app.fallback_service(ServeDir::new(dir).append_index_html_on_directories(true))
        }
        Some(dir) => {
            warn!(dir = %dir.display(), "Static directory does not exist, not serving assets");
            app
        }
        None => app,
    };

    app.layer(TraceLayer::new_for_http()).with_state(state)
}

/// The relay server.
pub struct RelayServer<R: SessionRegistry, S: PtySpawner> {
    state: Arc<AppState<R, S>>,
}

impl RelayServer<TmuxRegistry, NativePtySpawner> {
    /// Creates a server backed by tmux.
    pub fn from_config(config: Config) -> Result<Self> {
        let registry = TmuxRegistry::from_config(&config.session)
            .context("Failed to set up session registry")?;
        let spawner = NativePtySpawner::from_config(&config.session);
        Ok(Self::new(config, registry, spawner))
    }
}

impl<R: SessionRegistry, S: PtySpawner> RelayServer<R, S> {
    pub fn new(config: Config, registry: R, spawner: S) -> Self {
        Self {
            state: Arc::new(AppState {
                config,
                registry: Arc::new(registry),
                spawner: Arc::new(spawner),
                connections: DashMap::new(),
                started_at: Instant::now(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn state(&self) -> &Arc<AppState<R, S>> {
        &self.state
    }

    /// Token that stops the server when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.state.shutdown.clone()
    }

    /// Binds the configured host and port.
    pub async fn bind(&self) -> Result<TcpListener> {
        let server = &self.state.config.server;
        let addr = format!("{}:{}", server.host, server.port);
        TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind {addr}"))
    }

    /// Serves until the shutdown token is cancelled, then waits briefly for
    /// connections to close.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let addr: SocketAddr = listener.local_addr()?;
        let shutdown = self.state.shutdown.clone();
        let app = build_router(Arc::clone(&self.state));

        info!(
            %addr,
            prefix = %self.state.registry.namespace().prefix(),
            "Relay server listening"
        );

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .context("Server error")?;

        self.wait_for_connections(Duration::from_secs(3)).await;
        info!("Relay server stopped");
        Ok(())
    }

    async fn wait_for_connections(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while !self.state.connections.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let remaining = self.state.connections.len();
        if remaining > 0 {
            warn!(remaining, "Connections still open after shutdown");
        }
    }
}
