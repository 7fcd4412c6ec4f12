//! WebSocket transport.
//!
//! Each socket gets one [`Connection`] and one task that owns it. That task
//! reads client frames and PTY events in a single `select!` loop; a separate
//! writer task drains outbound messages into the socket and sends heartbeat
//! pings.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use protocol::{ClientMessage, ServerMessage};
use tokio::sync::mpsc;
use tokio::time::{interval, sleep_until, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::connection::Connection;
use crate::server::{AppState, ConnectionInfo};
use crate::session::{PtySpawner, SessionRegistry};

/// How long a closing connection waits for queued messages to reach the socket.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// WebSocket upgrade handler for `/ws`.
pub async fn ws_handler<R: SessionRegistry, S: PtySpawner>(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState<R, S>>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Runs one connection until the socket closes, idles out, or the server
/// shuts down.
pub async fn handle_socket<R: SessionRegistry, S: PtySpawner>(
    socket: WebSocket,
    state: Arc<AppState<R, S>>,
) {
    let transport = &state.config.transport;
    let session = &state.config.session;

    let (out_tx, out_rx) = mpsc::channel::<ServerMessage>(transport.event_buffer);
    let (event_tx, mut event_rx) = mpsc::channel(transport.event_buffer);

    let mut connection = Connection::new(
        Arc::clone(&state.registry),
        Arc::clone(&state.spawner),
        out_tx,
        event_tx,
        (session.default_cols, session.default_rows),
    );
    let id = connection.id();
    state.connections.insert(id, ConnectionInfo::new());
    info!(connection = %id, active = state.connections.len(), "WebSocket connected");

    let (sink, mut stream) = socket.split();
    let writer = tokio::spawn(write_loop(sink, out_rx, transport.ping_interval()));

    let ping_timeout = transport.ping_timeout();
    let mut deadline = Instant::now() + ping_timeout;

    loop {
        tokio::select! {
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        deadline = Instant::now() + ping_timeout;
                        match ClientMessage::from_json(&text) {
                            Ok(message) => {
                                trace!(connection = %id, message = ?message, "Client message");
                                connection.handle(message).await;
                            }
                            Err(e) => {
                                debug!(connection = %id, error = %e, "Malformed frame");
                                connection.reject_frame(e).await;
                            }
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        deadline = Instant::now() + ping_timeout;
                        connection.reject_frame("binary frames are not supported").await;
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                        deadline = Instant::now() + ping_timeout;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(connection = %id, "WebSocket closed by client");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %id, error = %e, "WebSocket error");
                        break;
                    }
                }
            }
            Some(event) = event_rx.recv() => {
                connection.handle_pty_event(event).await;
            }
            _ = sleep_until(deadline) => {
                info!(connection = %id, timeout = ?ping_timeout, "Connection idle, closing");
                break;
            }
            _ = state.shutdown.cancelled() => {
                debug!(connection = %id, "Server shutting down, closing connection");
                break;
            }
        }
    }

    connection.disconnect();
    // Dropping the connection closes the outbound channel so the writer drains and exits.
    drop(connection);
    match timeout(WRITER_DRAIN_TIMEOUT, writer).await {
        Ok(Err(e)) => warn!(connection = %id, error = %e, "Writer task failed"),
        Err(_) => debug!(connection = %id, "Writer did not drain in time"),
        Ok(Ok(())) => {}
    }

    state.connections.remove(&id);
    info!(connection = %id, active = state.connections.len(), "WebSocket disconnected");
}

/// Forwards outbound messages to the socket and keeps it alive with pings.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<ServerMessage>,
    ping_interval: Duration,
) {
    let mut heartbeat = interval(ping_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    heartbeat.tick().await;

    loop {
        tokio::select! {
            message = outbound.recv() => {
                let Some(message) = message else { break };
                let text = match message.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode server message");
                        continue;
                    }
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            _ = heartbeat.tick() => {
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.close().await;
}
