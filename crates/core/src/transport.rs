//! Transports for the duplex model stream.
//!
//! A [`ModelChannel`] carries one JSON event per frame in each direction.
//! [`WsConnector`] reaches a remote endpoint over WebSocket;
//! [`LoopbackConnector`] keeps both ends in-process.

use crate::error::StreamError;
use async_trait::async_trait;
use futures::{
    Sink, SinkExt, Stream, StreamExt,
    channel::mpsc::{UnboundedReceiver, UnboundedSender, unbounded},
    future,
};
use std::pin::Pin;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, protocol::Message as WsMessage},
};
use tracing::info;

/// Outbound half of a model stream.
pub type EventSink = Pin<Box<dyn Sink<String, Error = StreamError> + Send + Sync>>;
/// Inbound half of a model stream. An `Err` item ends the stream.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<String, StreamError>> + Send>>;

/// An open duplex stream to the model.
pub struct ModelChannel {
    pub sink: EventSink,
    pub stream: EventStream,
}

/// Opens duplex streams to the speech model. Only the bidirectional
/// streaming operation is reachable through this seam.
#[async_trait]
pub trait ModelConnector: Send + Sync {
    async fn open(&self) -> Result<ModelChannel, StreamError>;
}

/// Connects to a WebSocket endpoint that speaks the model event protocol.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
    model_id: String,
    bearer_token: Option<String>,
}

impl WsConnector {
    pub fn new(url: impl Into<String>, model_id: impl Into<String>, bearer_token: Option<String>) -> Self {
        Self {
            url: url.into(),
            model_id: model_id.into(),
            bearer_token,
        }
    }

    fn endpoint(&self) -> String {
        let separator = if self.url.contains('?') { '&' } else { '?' };
        format!("{}{}modelId={}", self.url, separator, self.model_id)
    }
}

#[async_trait]
impl ModelConnector for WsConnector {
    async fn open(&self) -> Result<ModelChannel, StreamError> {
        let mut request = self
            .endpoint()
            .into_client_request()
            .map_err(|e| StreamError::Connect(e.to_string()))?;
        if let Some(token) = &self.bearer_token {
            let value = format!("Bearer {token}")
                .parse()
                .map_err(|_| StreamError::Connect("invalid bearer token".to_string()))?;
            request.headers_mut().insert("Authorization", value);
        }

        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|e| StreamError::Connect(e.to_string()))?;
        info!(model_id = %self.model_id, "Connected to model stream endpoint.");
        let (ws_tx, ws_rx) = ws_stream.split();

        let sink = ws_tx
            .sink_map_err(StreamError::from)
            .with(|event: String| future::ok::<_, StreamError>(WsMessage::Text(event.into())));

        let stream = ws_rx.filter_map(|msg| {
            future::ready(match msg {
                Ok(WsMessage::Text(text)) => Some(Ok(text.as_str().to_owned())),
                Ok(WsMessage::Binary(data)) => Some(
                    String::from_utf8(data.to_vec())
                        .map_err(|e| StreamError::Transport(e.to_string())),
                ),
                Ok(WsMessage::Close(_)) => Some(Err(StreamError::Closed)),
                Ok(_) => None,
                Err(e) => Some(Err(StreamError::from(e))),
            })
        });

        Ok(ModelChannel {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

/// The far side of a loopback stream: what the adapter sent, and a way to
/// answer as the model would.
pub struct RemoteEnd {
    pub events: UnboundedReceiver<String>,
    pub replies: UnboundedSender<Result<String, StreamError>>,
}

impl RemoteEnd {
    /// Receives the next event the adapter sent, parsed as JSON.
    pub async fn next_event(&mut self) -> Option<serde_json::Value> {
        let raw = self.events.next().await?;
        serde_json::from_str(&raw).ok()
    }

    /// Queues a reply event for the adapter's reader.
    pub fn reply(&self, event: serde_json::Value) -> bool {
        self.replies.unbounded_send(Ok(event.to_string())).is_ok()
    }

    /// Injects a transport failure into the adapter's reader.
    pub fn fail(&self, error: StreamError) -> bool {
        self.replies.unbounded_send(Err(error)).is_ok()
    }
}

/// In-process connector. Every `open` hands the matching [`RemoteEnd`] to
/// whoever holds the receiver returned by [`LoopbackConnector::new`].
pub struct LoopbackConnector {
    remotes: mpsc::UnboundedSender<RemoteEnd>,
}

impl LoopbackConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RemoteEnd>) {
        let (remotes, rx) = mpsc::unbounded_channel();
        (Self { remotes }, rx)
    }
}

#[async_trait]
impl ModelConnector for LoopbackConnector {
    async fn open(&self) -> Result<ModelChannel, StreamError> {
        let (event_tx, event_rx) = unbounded::<String>();
        let (reply_tx, reply_rx) = unbounded::<Result<String, StreamError>>();
        self.remotes
            .send(RemoteEnd {
                events: event_rx,
                replies: reply_tx,
            })
            .map_err(|_| StreamError::Connect("loopback peer is gone".to_string()))?;

        let sink = event_tx.sink_map_err(|_| StreamError::Closed);
        Ok(ModelChannel {
            sink: Box::pin(sink),
            stream: Box::pin(reply_rx),
        })
    }
}
