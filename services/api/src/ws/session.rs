//! One authenticated voice session: its turn controller, its model stream,
//! and the mapping from turn results to client messages.

use super::protocol::ServerMessage;
use crate::{
    auth::{AuthError, IdentityVerifier},
    registry::SessionEntry,
};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};
use sonic_core::{
    InactivityEvent, InferenceConfig, ModelConnector, ModelStreamAdapter, StreamError,
    StreamSettings, TurnController, TurnResult, TurnSettings,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

const STREAM_UNAVAILABLE: &str = "Model stream unavailable";
const PROCESSING_FAILED: &str = "Processing failed";

/// Everything needed to build a session, shared by all connections.
pub struct SessionSettings {
    pub connector: Arc<dyn ModelConnector>,
    pub stream: StreamSettings,
    pub turn: TurnSettings,
    pub inference: InferenceConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("model stream failure: {0}")]
    Stream(#[from] StreamError),
    #[error("outbound channel closed")]
    OutboundClosed,
}

pub struct VoiceSession {
    session_id: String,
    connection_id: String,
    user_id: String,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    active: bool,
    inference: InferenceConfig,
    controller: TurnController,
    adapter: ModelStreamAdapter,
    outbound: mpsc::Sender<ServerMessage>,
}

impl VoiceSession {
    /// Verifies the client's token and starts the model stream. A stream that
    /// fails to start here is retried when the first turn finalizes.
    #[instrument(name = "session_init", skip_all, fields(connection_id = %connection_id))]
    pub async fn initialize(
        token: Option<&str>,
        verifier: &dyn IdentityVerifier,
        settings: &SessionSettings,
        connection_id: &str,
        inactivity_tx: mpsc::Sender<InactivityEvent>,
        outbound: mpsc::Sender<ServerMessage>,
    ) -> Result<Self, AuthError> {
        let identity = verifier.verify(token.unwrap_or_default()).await?;

        let mut adapter = ModelStreamAdapter::new(settings.connector.clone(), settings.stream.clone());
        if !adapter.start_session(settings.inference).await {
            warn!("Model stream not available at session start");
        }

        let now = Utc::now();
        let session = Self {
            session_id: Uuid::new_v4().to_string(),
            connection_id: connection_id.to_string(),
            user_id: identity.user_id,
            created_at: now,
            last_activity: now,
            active: true,
            inference: settings.inference,
            controller: TurnController::new(settings.turn.clone(), inactivity_tx),
            adapter,
            outbound,
        };
        info!(
            session_id = %session.session_id,
            user_id = %session.user_id,
            "Voice session initialized"
        );
        Ok(session)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_activity
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn model_stream_active(&self) -> bool {
        self.adapter.is_active()
    }

    pub fn entry(&self) -> SessionEntry {
        SessionEntry {
            session_id: self.session_id.clone(),
            user_id: self.user_id.clone(),
            created_at: self.created_at,
        }
    }

    /// Buffers one client chunk and, on end of utterance, runs the turn.
    pub async fn handle_audio_chunk(
        &mut self,
        pcm: &[u8],
        end_of_utterance: bool,
    ) -> Result<(), SessionError> {
        if !self.active {
            warn!(session_id = %self.session_id, "Audio for an ended session dropped");
            return Ok(());
        }
        self.last_activity = Utc::now();
        self.controller.push_audio(pcm);
        if !end_of_utterance {
            return Ok(());
        }

        if self.controller.has_pending_audio() && !self.ensure_stream().await {
            return self.abandon_turn().await;
        }
        let result = self.controller.finish_utterance(&mut self.adapter).await?;
        self.deliver(result).await
    }

    /// Handles a watchdog report for this session's controller.
    pub async fn on_inactivity(&mut self, event: InactivityEvent) -> Result<(), SessionError> {
        if !self.active {
            return Ok(());
        }
        if self.controller.has_pending_audio() && !self.ensure_stream().await {
            return self.abandon_turn().await;
        }
        let result = self
            .controller
            .handle_inactivity(event, &mut self.adapter)
            .await?;
        self.deliver(result).await
    }

    /// Tears the session down. Returns `false` if it had already ended.
    pub async fn end(&mut self) -> bool {
        if !self.active {
            return false;
        }
        self.active = false;
        self.controller.shutdown();
        self.adapter.end_session().await;
        info!(
            session_id = %self.session_id,
            duration_secs = (Utc::now() - self.created_at).num_seconds(),
            "Voice session ended"
        );
        true
    }

    async fn ensure_stream(&mut self) -> bool {
        if self.adapter.is_active() {
            return true;
        }
        warn!(session_id = %self.session_id, "Model stream inactive, restarting");
        self.adapter.start_session(self.inference).await
    }

    async fn abandon_turn(&mut self) -> Result<(), SessionError> {
        let discarded = self.controller.discard_turn();
        warn!(discarded, "Discarding turn audio, model stream could not be restarted");
        self.emit(ServerMessage::error(STREAM_UNAVAILABLE)).await
    }

    async fn deliver(&self, result: Option<TurnResult>) -> Result<(), SessionError> {
        let Some(result) = result else {
            return Ok(());
        };
        if !result.success {
            let error = result.error.unwrap_or_else(|| PROCESSING_FAILED.to_string());
            warn!(session_id = %self.session_id, %error, "Turn produced no output");
            return self.emit(ServerMessage::error(error)).await;
        }

        if !result.audio.is_empty() {
            self.emit(ServerMessage::AudioOutput {
                audio: STANDARD.encode(&result.audio),
                session_id: self.session_id.clone(),
            })
            .await?;
        }
        if !result.text.is_empty() {
            self.emit(ServerMessage::Transcript {
                text: result.text,
                session_id: self.session_id.clone(),
            })
            .await?;
        }
        self.emit(ServerMessage::InferenceComplete {
            session_id: self.session_id.clone(),
        })
        .await
    }

    async fn emit(&self, msg: ServerMessage) -> Result<(), SessionError> {
        self.outbound
            .send(msg)
            .await
            .map_err(|_| SessionError::OutboundClosed)
    }
}
