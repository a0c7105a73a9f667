//! Sonic API Library Crate
//!
//! This library contains the web-facing half of the voice service: the
//! application state, identity verification, session registry, WebSocket
//! gateway, and routing. The `api` binary is a thin wrapper around it.

pub mod auth;
pub mod config;
pub mod registry;
pub mod router;
pub mod state;
pub mod ws;
