//! WebSocket Session Management
//!
//! - `protocol`: the JSON message format between client and server.
//! - `gateway`: the per-connection lifecycle, from upgrade to teardown.
//! - `session`: one authenticated voice session and its turn pipeline.

mod gateway;
pub mod protocol;
pub mod session;

pub use gateway::ws_handler;
