//! Manages the WebSocket connection lifecycle for a voice client.

use super::{
    protocol::{ClientMessage, ServerMessage},
    session::{SessionError, VoiceSession},
};
use crate::{registry::SessionRegistry, state::AppState};
use anyhow::{Context, Result};
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::Utc;
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use sonic_core::InactivityEvent;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{Instant, interval, sleep_until, timeout},
};
use tracing::{debug, error, info, instrument, warn};

const OUTBOUND_QUEUE: usize = 64;
const WRITER_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Axum handler to upgrade an HTTP connection to a WebSocket.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

fn new_connection_id() -> String {
    let suffix: u32 = rand::random();
    format!("conn_{}_{:08x}", Utc::now().timestamp_millis(), suffix)
}

/// Main handler for an individual WebSocket connection.
///
/// Every exit path, including a panic in the message loop, releases the
/// registry entry and the heartbeat task through [`ConnectionGuard`].
#[instrument(name = "ws_connection", skip_all, fields(connection_id, session_id))]
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let connection_id = new_connection_id();
    tracing::Span::current().record("connection_id", connection_id.as_str());
    let open = state.registry.connection_opened();
    info!(open_connections = open, "New WebSocket connection");

    let (socket_tx, socket_rx) = socket.split();
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
    let writer = tokio::spawn(write_outbound(socket_tx, outbound_rx));
    let heartbeat = spawn_heartbeat(outbound_tx.clone(), state.config.heartbeat_interval);
    let guard = ConnectionGuard {
        registry: state.registry.clone(),
        connection_id: connection_id.clone(),
        heartbeat,
    };

    let established = ServerMessage::ConnectionEstablished {
        connection_id: connection_id.clone(),
        timestamp: Utc::now().to_rfc3339(),
    };
    if outbound_tx.send(established).await.is_err() {
        error!("Failed to queue connection_established message");
        return;
    }

    let (inactivity_tx, inactivity_rx) = mpsc::channel(4);
    let mut connection = Connection {
        state,
        connection_id,
        outbound: outbound_tx,
        inactivity_tx,
        session: None,
    };
    if let Err(e) = connection.run(socket_rx, inactivity_rx).await {
        warn!(error = ?e, "Connection loop ended with error");
    }
    connection.teardown().await;
    drop(connection);

    // All senders are gone once the heartbeat is aborted; let queued replies flush.
    drop(guard);
    if timeout(WRITER_FLUSH_TIMEOUT, writer).await.is_err() {
        warn!("Timed out flushing outbound messages");
    }
    info!("WebSocket connection closed");
}

/// Releases per-connection resources when the handler exits.
struct ConnectionGuard {
    registry: Arc<SessionRegistry>,
    connection_id: String,
    heartbeat: JoinHandle<()>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.heartbeat.abort();
        if let Some(entry) = self.registry.connection_closed(&self.connection_id) {
            debug!(session_id = %entry.session_id, "Dropped registry entry on disconnect");
        }
    }
}

enum Flow {
    Continue,
    Close,
}

struct Connection {
    state: Arc<AppState>,
    connection_id: String,
    outbound: mpsc::Sender<ServerMessage>,
    inactivity_tx: mpsc::Sender<InactivityEvent>,
    session: Option<VoiceSession>,
}

impl Connection {
    async fn run(
        &mut self,
        mut socket_rx: SplitStream<WebSocket>,
        mut inactivity_rx: mpsc::Receiver<InactivityEvent>,
    ) -> Result<()> {
        let idle_timeout = self.state.config.session_idle_timeout;
        let mut idle_deadline = Instant::now() + idle_timeout;

        loop {
            tokio::select! {
                msg = socket_rx.next() => {
                    idle_deadline = Instant::now() + idle_timeout;
                    let flow = match msg {
                        Some(Ok(Message::Text(text))) => self.handle_text(text.as_str()).await?,
                        Some(Ok(Message::Binary(data))) => {
                            self.handle_audio(&data, false).await?;
                            Flow::Continue
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            info!("Client disconnected");
                            Flow::Close
                        }
                        Some(Ok(Message::Ping(_) | Message::Pong(_))) => Flow::Continue,
                        Some(Err(e)) => {
                            warn!(error = %e, "Error receiving from client WebSocket");
                            Flow::Close
                        }
                    };
                    if let Flow::Close = flow {
                        break;
                    }
                },
                Some(event) = inactivity_rx.recv() => {
                    if let Some(session) = self.session.as_mut() {
                        let outcome = session.on_inactivity(event).await;
                        self.check_turn(outcome).await?;
                    }
                },
                _ = sleep_until(idle_deadline) => {
                    warn!(idle_secs = idle_timeout.as_secs(), "Session idle timeout");
                    break;
                },
            }
        }
        Ok(())
    }

    async fn handle_text(&mut self, text: &str) -> Result<Flow> {
        let msg = match serde_json::from_str::<ClientMessage>(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "Unparseable client message");
                self.send(ServerMessage::error("Invalid message")).await?;
                return Ok(Flow::Continue);
            }
        };

        match msg {
            ClientMessage::InitializeSession { auth_token } => {
                self.initialize(auth_token.as_deref()).await?;
            }
            ClientMessage::AudioInput {
                audio_data,
                end_of_utterance,
            } => match STANDARD.decode(audio_data.as_bytes()) {
                Ok(pcm) => self.handle_audio(&pcm, end_of_utterance).await?,
                Err(e) => {
                    warn!(error = %e, "Audio payload is not valid base64");
                    self.send(ServerMessage::error("Invalid audio data")).await?;
                }
            },
            ClientMessage::EndSession => {
                if let Some(session_id) = self.end_session().await {
                    self.send(ServerMessage::SessionEnded { session_id }).await?;
                }
                return Ok(Flow::Close);
            }
            ClientMessage::Ping => self.send(ServerMessage::Pong).await?,
            ClientMessage::Unknown => debug!("Ignoring unknown message type"),
        }
        Ok(Flow::Continue)
    }

    /// Builds the new session first; a current session is replaced only once
    /// the new token has been accepted.
    async fn initialize(&mut self, token: Option<&str>) -> Result<()> {
        let initialized = VoiceSession::initialize(
            token,
            self.state.verifier.as_ref(),
            &self.state.sessions,
            &self.connection_id,
            self.inactivity_tx.clone(),
            self.outbound.clone(),
        )
        .await;

        let session = match initialized {
            Ok(session) => session,
            Err(e) => {
                warn!(
                    error = %e,
                    keeps_session = self.session.is_some(),
                    "Authentication failed"
                );
                return self.send(ServerMessage::error("Authentication failed")).await;
            }
        };

        if let Some(previous) = self.end_session().await {
            info!(previous_session = %previous, "Session replaced by re-initialization");
            self.send(ServerMessage::SessionEnded {
                session_id: previous,
            })
            .await?;
        }

        let session_id = session.session_id().to_string();
        tracing::Span::current().record("session_id", session_id.as_str());
        self.state
            .registry
            .insert(&self.connection_id, session.entry());
        self.session = Some(session);
        self.send(ServerMessage::SessionInitialized { session_id })
            .await
    }

    async fn handle_audio(&mut self, pcm: &[u8], end_of_utterance: bool) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            return self
                .send(ServerMessage::error("Session not initialized"))
                .await;
        };
        let outcome = session.handle_audio_chunk(pcm, end_of_utterance).await;
        self.check_turn(outcome).await
    }

    /// A model stream failure mid-turn ends the session; the connection stays
    /// open so the client can initialize again.
    async fn check_turn(&mut self, outcome: Result<(), SessionError>) -> Result<()> {
        match outcome {
            Ok(()) => Ok(()),
            Err(SessionError::OutboundClosed) => Err(SessionError::OutboundClosed.into()),
            Err(SessionError::Stream(e)) => {
                error!(error = %e, "Model stream failed during turn");
                self.send(ServerMessage::error("Model stream error")).await?;
                if let Some(session_id) = self.end_session().await {
                    self.send(ServerMessage::SessionEnded { session_id }).await?;
                }
                Ok(())
            }
        }
    }

    /// Ends the current session, if any, and returns its id.
    async fn end_session(&mut self) -> Option<String> {
        let mut session = self.session.take()?;
        session.end().await;
        self.state.registry.remove(&self.connection_id);
        Some(session.session_id().to_string())
    }

    async fn teardown(&mut self) {
        if let Some(session_id) = self.end_session().await {
            debug!(%session_id, "Session torn down with connection");
        }
    }

    async fn send(&self, msg: ServerMessage) -> Result<()> {
        self.outbound
            .send(msg)
            .await
            .context("Outbound channel closed")
    }
}

fn spawn_heartbeat(outbound: mpsc::Sender<ServerMessage>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let beat = ServerMessage::Heartbeat {
                timestamp: Utc::now().to_rfc3339(),
            };
            if outbound.send(beat).await.is_err() {
                break;
            }
        }
    })
}

/// Drains the outbound queue into the socket until every sender is gone.
async fn write_outbound(
    mut socket_tx: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<ServerMessage>,
) {
    while let Some(msg) = outbound.recv().await {
        if let Err(e) = send_msg(&mut socket_tx, &msg).await {
            warn!(error = ?e, "Failed to write to client WebSocket");
            break;
        }
    }
    let _ = socket_tx.close().await;
}

/// A helper function to serialize and send a `ServerMessage` to the client.
pub(crate) async fn send_msg(
    socket_tx: &mut SplitSink<WebSocket, Message>,
    msg: &ServerMessage,
) -> Result<()> {
    let serialized = serde_json::to_string(msg)?;
    socket_tx.send(Message::Text(serialized.into())).await?;
    Ok(())
}
