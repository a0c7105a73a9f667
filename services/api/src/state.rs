//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds the shared,
//! clonable resources every connection handler needs.

use crate::{
    auth::IdentityVerifier, config::Config, registry::SessionRegistry, ws::session::SessionSettings,
};
use sonic_core::ModelConnector;
use std::sync::Arc;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub verifier: Arc<dyn IdentityVerifier>,
    pub sessions: Arc<SessionSettings>,
    pub registry: Arc<SessionRegistry>,
}

impl AppState {
    pub fn new(
        config: Config,
        verifier: Arc<dyn IdentityVerifier>,
        connector: Arc<dyn ModelConnector>,
    ) -> Self {
        let sessions = SessionSettings {
            connector,
            stream: config.stream_settings(),
            turn: config.turn_settings(),
            inference: config.inference,
        };
        Self {
            config: Arc::new(config),
            verifier,
            sessions: Arc::new(sessions),
            registry: Arc::new(SessionRegistry::new()),
        }
    }
}
