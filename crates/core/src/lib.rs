//! Sonic Core
//!
//! Per-session voice conversation machinery: the adapter that drives one
//! duplex stream to the remote speech model, and the turn controller that
//! cuts inbound client audio into model turns.

pub mod adapter;
pub mod error;
pub mod events;
pub mod transport;
pub mod turn;

pub use adapter::{ModelStreamAdapter, StreamSettings, TurnResult, TurnSink};
pub use error::StreamError;
pub use events::InferenceConfig;
pub use transport::{LoopbackConnector, ModelConnector, WsConnector};
pub use turn::{InactivityEvent, TurnController, TurnSettings};
