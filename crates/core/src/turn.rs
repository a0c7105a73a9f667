//! Turn Controller
//!
//! Turns a stream of inbound audio chunks into discrete model turns. A turn
//! ends either when the client flags end-of-utterance or when the inactivity
//! watchdog notices the audio has gone quiet. The controller lives as long as
//! its session and handles many turns.

use crate::{
    adapter::{TurnResult, TurnSink},
    error::StreamError,
};
use std::time::Duration;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{Instant, sleep},
};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct TurnSettings {
    /// Quiet period after which the watchdog closes the turn.
    pub inactivity_threshold: Duration,
    pub poll_interval: Duration,
    /// Buffer cap in bytes; the oldest bytes are dropped past it.
    pub buffer_cap: usize,
    /// Size of each audio-input event sent to the model.
    pub chunk_size: usize,
    /// Delay between consecutive audio-input events.
    pub chunk_pacing: Duration,
    pub drain_timeout: Duration,
}

impl Default for TurnSettings {
    fn default() -> Self {
        Self {
            inactivity_threshold: Duration::from_millis(2000),
            poll_interval: Duration::from_millis(500),
            buffer_cap: 100 * 1024,
            chunk_size: 4096,
            chunk_pacing: Duration::from_millis(10),
            drain_timeout: Duration::from_secs(15),
        }
    }
}

/// Bounded audio accumulator that keeps the most recent bytes.
#[derive(Debug)]
pub struct AudioBuffer {
    data: Vec<u8>,
    cap: usize,
    truncated_bytes: u64,
    overruns: u64,
}

impl AudioBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            data: Vec::new(),
            cap,
            truncated_bytes: 0,
            overruns: 0,
        }
    }

    /// Appends `chunk` and returns how many old bytes were dropped to stay
    /// within the cap.
    pub fn push(&mut self, chunk: &[u8]) -> usize {
        self.data.extend_from_slice(chunk);
        if self.data.len() <= self.cap {
            return 0;
        }
        let excess = self.data.len() - self.cap;
        self.data.drain(..excess);
        self.truncated_bytes += excess as u64;
        self.overruns += 1;
        excess
    }

    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.data)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Total bytes dropped by truncation since creation.
    pub fn truncated_bytes(&self) -> u64 {
        self.truncated_bytes
    }

    /// Number of pushes that overflowed the cap.
    pub fn overruns(&self) -> u64 {
        self.overruns
    }
}

/// Sent by the watchdog when the turn identified by `turn` went quiet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InactivityEvent {
    pub turn: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Accumulating,
    Finalizing,
}

pub struct TurnController {
    settings: TurnSettings,
    buffer: AudioBuffer,
    state: TurnState,
    last_audio_time: Instant,
    has_received_audio: bool,
    listening: bool,
    turn: u64,
    activity: watch::Sender<Instant>,
    inactivity_tx: mpsc::Sender<InactivityEvent>,
    watchdog: Option<JoinHandle<()>>,
}

impl TurnController {
    /// Creates an idle controller. Watchdog expirations are delivered on
    /// `inactivity_tx` and must be handed back through
    /// [`TurnController::handle_inactivity`].
    pub fn new(settings: TurnSettings, inactivity_tx: mpsc::Sender<InactivityEvent>) -> Self {
        let now = Instant::now();
        let (activity, _) = watch::channel(now);
        Self {
            buffer: AudioBuffer::new(settings.buffer_cap),
            settings,
            state: TurnState::Idle,
            last_audio_time: now,
            has_received_audio: false,
            listening: false,
            turn: 0,
            activity,
            inactivity_tx,
            watchdog: None,
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn is_listening(&self) -> bool {
        self.listening
    }

    pub fn has_pending_audio(&self) -> bool {
        !self.buffer.is_empty()
    }

    pub fn buffer(&self) -> &AudioBuffer {
        &self.buffer
    }

    /// Appends one inbound chunk to the current turn, starting the watchdog
    /// when this is the first chunk of a turn.
    pub fn push_audio(&mut self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        let dropped = self.buffer.push(chunk);
        if dropped > 0 {
            warn!(
                dropped,
                total_truncated = self.buffer.truncated_bytes(),
                overruns = self.buffer.overruns(),
                "Audio buffer cap exceeded, oldest audio dropped"
            );
        }
        self.last_audio_time = Instant::now();
        self.activity.send_replace(self.last_audio_time);
        self.has_received_audio = true;
        if !self.listening {
            self.start_listening();
        }
        debug!(bytes = chunk.len(), buffered = self.buffer.len(), "Audio chunk buffered");
    }

    fn start_listening(&mut self) {
        self.listening = true;
        self.state = TurnState::Accumulating;
        let running = self.watchdog.as_ref().is_some_and(|w| !w.is_finished());
        if !running {
            self.watchdog = Some(spawn_watchdog(
                self.turn,
                self.activity.subscribe(),
                self.settings.inactivity_threshold,
                self.settings.poll_interval,
                self.inactivity_tx.clone(),
            ));
            debug!(turn = self.turn, "Inactivity watchdog started");
        }
    }

    fn stop_listening(&mut self) {
        self.listening = false;
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.abort();
            debug!(turn = self.turn, "Inactivity watchdog stopped");
        }
    }

    /// Client-declared end of utterance. An empty buffer is a no-op.
    pub async fn finish_utterance<S>(
        &mut self,
        sink: &mut S,
    ) -> Result<Option<TurnResult>, StreamError>
    where
        S: TurnSink + ?Sized,
    {
        if self.buffer.is_empty() {
            info!("End of utterance with empty buffer, nothing to process");
            self.stop_listening();
            return Ok(None);
        }
        self.finalize(sink).await
    }

    /// Watchdog trigger. Stale events and turns that received audio after the
    /// event was raised are ignored.
    pub async fn handle_inactivity<S>(
        &mut self,
        event: InactivityEvent,
        sink: &mut S,
    ) -> Result<Option<TurnResult>, StreamError>
    where
        S: TurnSink + ?Sized,
    {
        if event.turn != self.turn || !self.listening || !self.has_received_audio {
            debug!(event_turn = event.turn, turn = self.turn, "Ignoring stale inactivity event");
            return Ok(None);
        }
        let elapsed = self.last_audio_time.elapsed();
        if elapsed <= self.settings.inactivity_threshold {
            if let Some(watchdog) = self.watchdog.take() {
                watchdog.abort();
            }
            self.start_listening();
            return Ok(None);
        }
        warn!(
            elapsed_ms = elapsed.as_millis() as u64,
            "Inactivity timeout, auto-closing turn"
        );
        self.finalize(sink).await
    }

    async fn finalize<S>(&mut self, sink: &mut S) -> Result<Option<TurnResult>, StreamError>
    where
        S: TurnSink + ?Sized,
    {
        self.state = TurnState::Finalizing;
        self.stop_listening();
        let payload = self.buffer.take();
        self.has_received_audio = false;
        self.turn += 1;

        let outcome = self.flush(payload, sink).await;
        self.state = TurnState::Idle;
        outcome.map(Some)
    }

    async fn flush<S>(&self, payload: Vec<u8>, sink: &mut S) -> Result<TurnResult, StreamError>
    where
        S: TurnSink + ?Sized,
    {
        info!(bytes = payload.len(), "Flushing utterance to model");
        sink.open_turn().await?;
        for chunk in payload.chunks(self.settings.chunk_size.max(1)) {
            sink.send_audio(chunk).await?;
            if !self.settings.chunk_pacing.is_zero() {
                sleep(self.settings.chunk_pacing).await;
            }
        }
        sink.close_turn().await?;
        Ok(sink.drain_turn_result(self.settings.drain_timeout).await)
    }

    /// Drops the current turn without sending it anywhere.
    pub fn discard_turn(&mut self) -> usize {
        self.stop_listening();
        let discarded = self.buffer.take().len();
        self.has_received_audio = false;
        self.turn += 1;
        self.state = TurnState::Idle;
        discarded
    }

    /// Stops the watchdog and clears buffered audio. Idempotent.
    pub fn shutdown(&mut self) {
        let discarded = self.discard_turn();
        if discarded > 0 {
            debug!(discarded, "Discarded buffered audio on shutdown");
        }
    }
}

impl Drop for TurnController {
    fn drop(&mut self) {
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.abort();
        }
    }
}

fn spawn_watchdog(
    turn: u64,
    activity: watch::Receiver<Instant>,
    threshold: Duration,
    poll_interval: Duration,
    inactivity_tx: mpsc::Sender<InactivityEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            sleep(poll_interval).await;
            let elapsed = activity.borrow().elapsed();
            if elapsed > threshold {
                debug!(turn, elapsed_ms = elapsed.as_millis() as u64, "Watchdog fired");
                let _ = inactivity_tx.send(InactivityEvent { turn }).await;
                break;
            }
        }
    })
}
