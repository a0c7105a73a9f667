//! Model Stream Adapter
//!
//! Owns one duplex stream to the speech model for the lifetime of a session.
//! Outbound, it brackets each user turn with content/prompt events. Inbound,
//! a background reader classifies model events and queues them on three
//! mailboxes (audio, text, control) that [`ModelStreamAdapter::drain_turn_result`]
//! consumes.

use crate::{
    error::StreamError,
    events::{InferenceConfig, InputEvent, ModelOutput, Role, classify},
    transport::{EventSink, EventStream, ModelChannel, ModelConnector},
};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::{
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
    time::{Instant, sleep_until},
};
use tracing::{Instrument, debug, error, info, warn};
use uuid::Uuid;

/// Error text reported when a turn produced neither audio nor text.
pub const NO_RESPONSE_ERROR: &str = "No response received from model stream";

const DEFAULT_SYSTEM_PROMPT: &str = "You are an educational AI assistant helping students learn. \
Respond naturally and helpfully to their questions. \
Keep responses concise and clear, generally two or three sentences.";

/// Per-stream settings that do not change between turns.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub voice_id: String,
    pub system_prompt: String,
    /// How long to keep collecting once both audio and text have arrived.
    pub settle_grace: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            voice_id: "matthew".to_string(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            settle_grace: Duration::from_millis(500),
        }
    }
}

/// Output of one turn, gathered from the delivery queues.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnResult {
    pub audio: Vec<u8>,
    pub text: String,
    pub success: bool,
    pub error: Option<String>,
}

impl TurnResult {
    pub fn completed(audio: Vec<u8>, text: String) -> Self {
        Self {
            audio,
            text,
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// The turn-level surface the Turn Controller drives.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TurnSink: Send {
    async fn open_turn(&mut self) -> Result<(), StreamError>;
    async fn send_audio(&mut self, pcm: &[u8]) -> Result<(), StreamError>;
    async fn close_turn(&mut self) -> Result<(), StreamError>;
    async fn drain_turn_result(&mut self, timeout: Duration) -> TurnResult;
}

/// Start/end bookkeeping. Starts and ends must match at every quiescent point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TurnCounters {
    pub turn_starts: u64,
    pub turn_ends: u64,
    pub prompt_starts: u64,
    pub prompt_ends: u64,
}

impl TurnCounters {
    /// Logs a warning for every unbalanced pair. Returns `true` when balanced.
    pub fn check_parity(&self) -> bool {
        let mut balanced = true;
        if self.turn_starts != self.turn_ends {
            warn!(
                starts = self.turn_starts,
                ends = self.turn_ends,
                "Unbalanced turn content"
            );
            balanced = false;
        }
        if self.prompt_starts != self.prompt_ends {
            warn!(
                starts = self.prompt_starts,
                ends = self.prompt_ends,
                "Unbalanced prompts"
            );
            balanced = false;
        }
        balanced
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TextFragment {
    role: Role,
    text: String,
    /// Preview text sent ahead of the final transcript.
    speculative: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlEvent {
    BargeIn,
    ContentEnded,
    Completion,
}

/// Assistant text of one turn. The final transcript wins over the
/// speculative preview of the same reply.
#[derive(Debug, Default)]
struct TranscriptParts {
    final_parts: Vec<String>,
    speculative_parts: Vec<String>,
}

impl TranscriptParts {
    fn push(&mut self, fragment: TextFragment) {
        if fragment.role != Role::Assistant {
            return;
        }
        if fragment.speculative {
            self.speculative_parts.push(fragment.text);
        } else {
            self.final_parts.push(fragment.text);
        }
    }

    fn is_empty(&self) -> bool {
        self.final_parts.is_empty() && self.speculative_parts.is_empty()
    }

    fn into_transcript(self) -> String {
        if self.final_parts.is_empty() {
            self.speculative_parts.join(" ")
        } else {
            self.final_parts.join(" ")
        }
    }
}

struct Queues {
    audio: UnboundedReceiver<Vec<u8>>,
    text: UnboundedReceiver<TextFragment>,
    control: UnboundedReceiver<ControlEvent>,
}

impl Queues {
    fn discard_pending(&mut self) -> usize {
        let mut discarded = 0;
        while self.audio.try_recv().is_ok() {
            discarded += 1;
        }
        while self.text.try_recv().is_ok() {
            discarded += 1;
        }
        while self.control.try_recv().is_ok() {
            discarded += 1;
        }
        discarded
    }
}

struct Mailboxes {
    audio: UnboundedSender<Vec<u8>>,
    text: UnboundedSender<TextFragment>,
    control: UnboundedSender<ControlEvent>,
}

fn mailboxes() -> (Mailboxes, Queues) {
    let (audio_tx, audio_rx) = mpsc::unbounded_channel();
    let (text_tx, text_rx) = mpsc::unbounded_channel();
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    (
        Mailboxes {
            audio: audio_tx,
            text: text_tx,
            control: control_tx,
        },
        Queues {
            audio: audio_rx,
            text: text_rx,
            control: control_rx,
        },
    )
}

/// Drives one bidirectional stream to the remote speech model.
pub struct ModelStreamAdapter {
    connector: Arc<dyn ModelConnector>,
    settings: StreamSettings,
    sink: Option<EventSink>,
    reader: Option<JoinHandle<()>>,
    queues: Option<Queues>,
    active: Arc<AtomicBool>,
    session_id: String,
    prompt_name: String,
    content_name: Option<String>,
    prompt_open: bool,
    counters: TurnCounters,
}

impl ModelStreamAdapter {
    pub fn new(connector: Arc<dyn ModelConnector>, settings: StreamSettings) -> Self {
        Self {
            connector,
            settings,
            sink: None,
            reader: None,
            queues: None,
            active: Arc::new(AtomicBool::new(false)),
            session_id: String::new(),
            prompt_name: String::new(),
            content_name: None,
            prompt_open: false,
            counters: TurnCounters::default(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.sink.is_some() && self.active.load(Ordering::SeqCst)
    }

    pub fn content_open(&self) -> bool {
        self.content_name.is_some()
    }

    pub fn counters(&self) -> TurnCounters {
        self.counters
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Opens the stream and sends the session preamble: session start,
    /// prompt start and the system-instruction turn. Returns `false` instead
    /// of failing so the caller can degrade gracefully.
    pub async fn start_session(&mut self, inference: InferenceConfig) -> bool {
        if self.sink.is_some() || self.reader.is_some() {
            debug!("Releasing previous model stream before restart");
            self.release();
        }

        match self.try_start(inference).await {
            Ok(()) => {
                info!(model_session = %self.session_id, "Model stream session started");
                true
            }
            Err(e) => {
                error!(error = %e, "Failed to start model stream session");
                self.release();
                false
            }
        }
    }

    async fn try_start(&mut self, inference: InferenceConfig) -> Result<(), StreamError> {
        self.session_id = Uuid::new_v4().to_string();
        self.prompt_name = Uuid::new_v4().to_string();
        self.counters = TurnCounters::default();

        let ModelChannel { sink, stream } = self.connector.open().await?;
        self.sink = Some(sink);
        self.active.store(true, Ordering::SeqCst);

        self.send_event(&InputEvent::SessionStart {
            inference_configuration: inference,
        })
        .await?;
        self.start_prompt().await?;

        let system_content = Uuid::new_v4().to_string();
        self.send_event(&InputEvent::system_content_start(
            &self.prompt_name,
            &system_content,
        ))
        .await?;
        self.send_event(&InputEvent::TextInput {
            prompt_name: self.prompt_name.clone(),
            content_name: system_content.clone(),
            content: self.settings.system_prompt.clone(),
        })
        .await?;
        self.send_event(&InputEvent::content_end(&self.prompt_name, &system_content))
            .await?;

        let (mailboxes, queues) = mailboxes();
        self.queues = Some(queues);
        self.reader = Some(spawn_reader(
            stream,
            mailboxes,
            self.active.clone(),
            self.session_id.clone(),
        ));
        Ok(())
    }

    async fn start_prompt(&mut self) -> Result<(), StreamError> {
        let event = InputEvent::prompt_start(&self.prompt_name, &self.settings.voice_id);
        self.send_event(&event).await?;
        self.prompt_open = true;
        self.counters.prompt_starts += 1;
        debug!(prompt_starts = self.counters.prompt_starts, "Prompt started");
        Ok(())
    }

    async fn send_event(&mut self, event: &InputEvent) -> Result<(), StreamError> {
        let wire = event.to_wire()?;
        let sink = self.sink.as_mut().ok_or(StreamError::Inactive)?;
        if let Err(e) = sink.send(wire).await {
            self.active.store(false, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }

    /// Opens a new user audio turn, force-closing any turn still open.
    pub async fn open_turn(&mut self) -> Result<(), StreamError> {
        if !self.is_active() {
            return Err(StreamError::Inactive);
        }
        if self.content_open() {
            warn!("Turn already open, closing previous before opening a new one");
            self.close_turn().await?;
        }
        if let Some(queues) = self.queues.as_mut() {
            let discarded = queues.discard_pending();
            if discarded > 0 {
                debug!(discarded, "Discarded stale model output from an earlier turn");
            }
        }
        if !self.prompt_open {
            self.start_prompt().await?;
        }

        let content_name = Uuid::new_v4().to_string();
        self.send_event(&InputEvent::audio_content_start(
            &self.prompt_name,
            &content_name,
        ))
        .await?;
        self.counters.turn_starts += 1;
        info!(
            content = %content_name,
            turn_starts = self.counters.turn_starts,
            turn_ends = self.counters.turn_ends,
            "Audio turn opened"
        );
        self.content_name = Some(content_name);
        Ok(())
    }

    /// Sends one audio-input event. The caller is responsible for chunking.
    pub async fn send_audio(&mut self, pcm: &[u8]) -> Result<(), StreamError> {
        if !self.is_active() {
            warn!(bytes = pcm.len(), "Dropping audio chunk, model stream is inactive");
            return Ok(());
        }
        let Some(content_name) = self.content_name.as_deref() else {
            warn!(bytes = pcm.len(), "Rejecting audio chunk, no open turn");
            return Ok(());
        };
        let event = InputEvent::audio_input(&self.prompt_name, content_name, pcm);
        self.send_event(&event).await?;
        debug!(bytes = pcm.len(), "Sent audio chunk");
        Ok(())
    }

    /// Ends the open turn with content-end followed by prompt-end.
    pub async fn close_turn(&mut self) -> Result<(), StreamError> {
        let Some(content_name) = self.content_name.take() else {
            warn!("No open turn to close");
            return Ok(());
        };

        self.send_event(&InputEvent::content_end(&self.prompt_name, &content_name))
            .await?;
        self.counters.turn_ends += 1;

        if self.prompt_open {
            self.send_event(&InputEvent::prompt_end(&self.prompt_name))
                .await?;
            self.prompt_open = false;
            self.counters.prompt_ends += 1;
        }

        info!(
            content = %content_name,
            turn_starts = self.counters.turn_starts,
            turn_ends = self.counters.turn_ends,
            "Audio turn closed"
        );
        self.counters.check_parity();
        Ok(())
    }

    /// Collects the model's answer to the last turn.
    ///
    /// Returns on the completion signal, shortly after both audio and text
    /// have arrived, or when `timeout` elapses, whichever comes first. A turn
    /// with no output at all is reported as `success == false`.
    pub async fn drain_turn_result(&mut self, timeout: Duration) -> TurnResult {
        let settle_grace = self.settings.settle_grace;
        let Some(queues) = self.queues.as_mut() else {
            return TurnResult::failed(StreamError::Inactive.to_string());
        };

        let deadline = Instant::now() + timeout;
        let mut settle_at: Option<Instant> = None;
        let mut audio = Vec::new();
        let mut text = TranscriptParts::default();

        loop {
            let wake_at = settle_at.map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                biased;
                Some(chunk) = queues.audio.recv() => audio.extend_from_slice(&chunk),
                Some(fragment) = queues.text.recv() => text.push(fragment),
                Some(event) = queues.control.recv() => match event {
                    ControlEvent::Completion => break,
                    ControlEvent::BargeIn => info!("Barge-in during turn"),
                    ControlEvent::ContentEnded => debug!("Model content ended"),
                },
                _ = sleep_until(wake_at) => {
                    if settle_at.is_none() {
                        warn!(timeout_ms = timeout.as_millis() as u64, "Timed out waiting for model completion");
                    }
                    break;
                },
            }
            if settle_at.is_none() && !audio.is_empty() && !text.is_empty() {
                settle_at = Some(Instant::now() + settle_grace);
            }
        }

        while let Ok(chunk) = queues.audio.try_recv() {
            audio.extend_from_slice(&chunk);
        }
        while let Ok(fragment) = queues.text.try_recv() {
            text.push(fragment);
        }

        if audio.is_empty() && text.is_empty() {
            return TurnResult::failed(NO_RESPONSE_ERROR);
        }
        let text = text.into_transcript();
        info!(audio_bytes = audio.len(), text_chars = text.len(), "Turn result collected");
        TurnResult::completed(audio, text)
    }

    /// Ends the model session. Safe to call in any state, any number of times.
    pub async fn end_session(&mut self) {
        if !self.is_active() {
            self.release();
            return;
        }
        if let Err(e) = self.shutdown_stream().await {
            warn!(error = %e, "Error while ending model session");
        }
        self.release();
        info!(model_session = %self.session_id, "Model stream session ended");
    }

    async fn shutdown_stream(&mut self) -> Result<(), StreamError> {
        if let Some(content_name) = self.content_name.take() {
            self.send_event(&InputEvent::content_end(&self.prompt_name, &content_name))
                .await?;
            self.counters.turn_ends += 1;
        }
        if self.prompt_open {
            self.send_event(&InputEvent::prompt_end(&self.prompt_name))
                .await?;
            self.prompt_open = false;
            self.counters.prompt_ends += 1;
        }
        self.send_event(&InputEvent::SessionEnd {}).await?;
        if let Some(sink) = self.sink.as_mut() {
            sink.close().await?;
        }
        Ok(())
    }

    fn release(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.sink = None;
        self.queues = None;
        self.content_name = None;
        self.prompt_open = false;
        self.active.store(false, Ordering::SeqCst);
    }
}

impl Drop for ModelStreamAdapter {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

#[async_trait]
impl TurnSink for ModelStreamAdapter {
    async fn open_turn(&mut self) -> Result<(), StreamError> {
        ModelStreamAdapter::open_turn(self).await
    }

    async fn send_audio(&mut self, pcm: &[u8]) -> Result<(), StreamError> {
        ModelStreamAdapter::send_audio(self, pcm).await
    }

    async fn close_turn(&mut self) -> Result<(), StreamError> {
        ModelStreamAdapter::close_turn(self).await
    }

    async fn drain_turn_result(&mut self, timeout: Duration) -> TurnResult {
        ModelStreamAdapter::drain_turn_result(self, timeout).await
    }
}

fn spawn_reader(
    mut stream: EventStream,
    mailboxes: Mailboxes,
    active: Arc<AtomicBool>,
    session_id: String,
) -> JoinHandle<()> {
    let span = tracing::info_span!("model_reader", model_session = %session_id);
    tokio::spawn(
        async move {
            let mut role = Role::Assistant;
            let mut speculative = false;
            while let Some(item) = stream.next().await {
                let raw = match item {
                    Ok(raw) => raw,
                    Err(e) => {
                        error!(error = %e, "Error reading from model stream");
                        break;
                    }
                };
                match classify(&raw) {
                    Some(ModelOutput::ContentStarted {
                        role: started,
                        speculative: preview,
                    }) => {
                        role = started;
                        speculative = preview;
                        debug!(?role, speculative, "Model content started");
                    }
                    Some(ModelOutput::Text {
                        role: tagged,
                        text,
                    }) => {
                        let role = tagged.unwrap_or(role);
                        debug!(?role, chars = text.len(), "Text fragment received");
                        let _ = mailboxes.text.send(TextFragment {
                            role,
                            text,
                            speculative,
                        });
                    }
                    Some(ModelOutput::BargeIn) => {
                        info!("Barge-in detected");
                        let _ = mailboxes.control.send(ControlEvent::BargeIn);
                    }
                    Some(ModelOutput::Audio(pcm)) => {
                        debug!(bytes = pcm.len(), "Audio fragment received");
                        let _ = mailboxes.audio.send(pcm);
                    }
                    Some(ModelOutput::ContentEnded) => {
                        let _ = mailboxes.control.send(ControlEvent::ContentEnded);
                    }
                    Some(ModelOutput::Completion) => {
                        info!("Model response sequence completed");
                        let _ = mailboxes.control.send(ControlEvent::Completion);
                    }
                    None => {}
                }
            }
            active.store(false, Ordering::SeqCst);
            info!("Model stream reader finished");
        }
        .instrument(span),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{LoopbackConnector, RemoteEnd};
    use serde_json::{Value, json};

    fn event_name(value: &Value) -> String {
        value["event"]
            .as_object()
            .and_then(|event| event.keys().next().cloned())
            .unwrap_or_default()
    }

    async fn next_names(remote: &mut RemoteEnd, count: usize) -> Vec<String> {
        let mut names = Vec::new();
        for _ in 0..count {
            let value = remote.next_event().await.expect("event");
            names.push(event_name(&value));
        }
        names
    }

    async fn started() -> (ModelStreamAdapter, RemoteEnd) {
        let (connector, mut remotes) = LoopbackConnector::new();
        let mut adapter = ModelStreamAdapter::new(Arc::new(connector), StreamSettings::default());
        assert!(adapter.start_session(InferenceConfig::default()).await);
        let mut remote = remotes.recv().await.unwrap();
        let preamble = next_names(&mut remote, 5).await;
        assert_eq!(
            preamble,
            ["sessionStart", "promptStart", "contentStart", "textInput", "contentEnd"]
        );
        (adapter, remote)
    }

    #[tokio::test]
    async fn test_start_session_fails_gracefully_without_endpoint() {
        let (connector, remotes) = LoopbackConnector::new();
        drop(remotes);
        let mut adapter = ModelStreamAdapter::new(Arc::new(connector), StreamSettings::default());
        assert!(!adapter.start_session(InferenceConfig::default()).await);
        assert!(!adapter.is_active());
    }

    #[tokio::test]
    async fn test_turn_is_bracketed_by_content_and_prompt_events() {
        let (mut adapter, mut remote) = started().await;

        adapter.open_turn().await.unwrap();
        adapter.send_audio(&[0u8; 8]).await.unwrap();
        adapter.close_turn().await.unwrap();

        let start = remote.next_event().await.unwrap();
        assert_eq!(start["event"]["contentStart"]["type"], "AUDIO");
        let content = start["event"]["contentStart"]["contentName"].clone();
        let audio = remote.next_event().await.unwrap();
        assert_eq!(audio["event"]["audioInput"]["contentName"], content);
        assert_eq!(next_names(&mut remote, 2).await, ["contentEnd", "promptEnd"]);

        let counters = adapter.counters();
        assert_eq!(counters.turn_starts, counters.turn_ends);
        assert_eq!(counters.prompt_starts, counters.prompt_ends);
        assert!(!adapter.content_open());
    }

    #[tokio::test]
    async fn test_next_turn_reopens_prompt_with_fresh_content_id() {
        let (mut adapter, mut remote) = started().await;

        adapter.open_turn().await.unwrap();
        let first = remote.next_event().await.unwrap();
        adapter.close_turn().await.unwrap();
        next_names(&mut remote, 2).await;

        adapter.open_turn().await.unwrap();
        let prompt = remote.next_event().await.unwrap();
        assert_eq!(event_name(&prompt), "promptStart");
        let second = remote.next_event().await.unwrap();
        assert_ne!(
            first["event"]["contentStart"]["contentName"],
            second["event"]["contentStart"]["contentName"]
        );
        assert_eq!(
            prompt["event"]["promptStart"]["promptName"],
            second["event"]["contentStart"]["promptName"]
        );
    }

    #[tokio::test]
    async fn test_open_turn_while_open_forces_close_first() {
        let (mut adapter, mut remote) = started().await;

        adapter.open_turn().await.unwrap();
        adapter.open_turn().await.unwrap();

        assert_eq!(
            next_names(&mut remote, 5).await,
            ["contentStart", "contentEnd", "promptEnd", "promptStart", "contentStart"]
        );
        let counters = adapter.counters();
        assert_eq!(counters.turn_starts, 2);
        assert_eq!(counters.turn_ends, 1);
        assert!(adapter.content_open());
    }

    #[tokio::test]
    async fn test_send_audio_without_open_turn_is_dropped() {
        let (mut adapter, mut remote) = started().await;

        adapter.send_audio(&[1, 2, 3]).await.unwrap();
        adapter.close_turn().await.unwrap();
        adapter.end_session().await;

        // Nothing but the shutdown sequence reaches the model.
        assert_eq!(next_names(&mut remote, 2).await, ["promptEnd", "sessionEnd"]);
        assert!(remote.next_event().await.is_none());
    }

    #[tokio::test]
    async fn test_drain_collects_assistant_output_in_order() {
        let (mut adapter, remote) = started().await;
        adapter.open_turn().await.unwrap();
        adapter.close_turn().await.unwrap();

        remote.reply(json!({"event": {"contentStart": {"role": "USER"}}}));
        remote.reply(json!({"event": {"textOutput": {"content": "what is rust"}}}));
        remote.reply(json!({"event": {"contentStart": {"role": "ASSISTANT"}}}));
        remote.reply(json!({"event": {"textOutput": {"content": "Rust is"}}}));
        remote.reply(json!({"event": {"audioOutput": {"content": "AQI="}}}));
        remote.reply(json!({"event": {"textOutput": {"content": "{ \"interrupted\" : true }"}}}));
        remote.reply(json!({"event": {"textOutput": {"content": "a language."}}}));
        remote.reply(json!({"event": {"audioOutput": {"content": "AwQ="}}}));
        remote.reply(json!({"event": {"completionEnd": {}}}));

        let result = adapter.drain_turn_result(Duration::from_secs(5)).await;
        assert!(result.success);
        assert_eq!(result.audio, vec![1, 2, 3, 4]);
        assert_eq!(result.text, "Rust is a language.");
        assert_eq!(result.error, None);
    }

    #[tokio::test]
    async fn test_final_text_replaces_speculative_preview() {
        let (mut adapter, remote) = started().await;
        let stage = |stage: &str| json!({"generationStage": stage}).to_string();

        adapter.open_turn().await.unwrap();
        adapter.close_turn().await.unwrap();
        remote.reply(json!({"event": {"contentStart": {
            "role": "ASSISTANT", "additionalModelFields": stage("SPECULATIVE")}}}));
        remote.reply(json!({"event": {"textOutput": {"content": "Hi there"}}}));
        remote.reply(json!({"event": {"audioOutput": {"content": "AQI="}}}));
        remote.reply(json!({"event": {"contentStart": {
            "role": "ASSISTANT", "additionalModelFields": stage("FINAL")}}}));
        remote.reply(json!({"event": {"textOutput": {"content": "Hi there."}}}));
        remote.reply(json!({"event": {"completionEnd": {}}}));

        let result = adapter.drain_turn_result(Duration::from_secs(5)).await;
        assert!(result.success);
        assert_eq!(result.text, "Hi there.");

        adapter.open_turn().await.unwrap();
        adapter.close_turn().await.unwrap();
        remote.reply(json!({"event": {"contentStart": {
            "role": "ASSISTANT", "additionalModelFields": stage("SPECULATIVE")}}}));
        remote.reply(json!({"event": {"textOutput": {"content": "Only a preview"}}}));
        remote.reply(json!({"event": {"completionEnd": {}}}));

        let preview = adapter.drain_turn_result(Duration::from_secs(5)).await;
        assert!(preview.success);
        assert_eq!(preview.text, "Only a preview");
    }

    #[tokio::test]
    async fn test_drain_times_out_without_output() {
        let (mut adapter, _remote) = started().await;
        adapter.open_turn().await.unwrap();
        adapter.close_turn().await.unwrap();

        let result = adapter.drain_turn_result(Duration::from_millis(50)).await;
        assert!(!result.success);
        assert!(result.audio.is_empty());
        assert!(result.text.is_empty());
        assert_eq!(result.error.as_deref(), Some(NO_RESPONSE_ERROR));
    }

    #[tokio::test]
    async fn test_read_failure_marks_adapter_inactive() {
        let (mut adapter, remote) = started().await;
        remote.fail(StreamError::Transport("reset by peer".to_string()));

        for _ in 0..100 {
            if !adapter.is_active() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!adapter.is_active());
        assert_eq!(adapter.open_turn().await, Err(StreamError::Inactive));

        let result = adapter.drain_turn_result(Duration::from_millis(20)).await;
        assert!(!result.success);
    }

    #[tokio::test]
    async fn test_end_session_closes_open_turn_and_is_idempotent() {
        let (mut adapter, mut remote) = started().await;
        adapter.open_turn().await.unwrap();
        next_names(&mut remote, 1).await;

        adapter.end_session().await;
        adapter.end_session().await;

        assert_eq!(
            next_names(&mut remote, 3).await,
            ["contentEnd", "promptEnd", "sessionEnd"]
        );
        assert!(remote.next_event().await.is_none());
        assert!(!adapter.is_active());
        assert!(adapter.counters().check_parity());
    }

    #[test]
    fn test_adapter_and_channels_are_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<EventSink>();
        assert_send_sync::<ModelStreamAdapter>();
    }
}
