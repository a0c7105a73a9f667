//! Main Entrypoint for the Sonic API Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Initializing logging.
//! 3. Building the shared state (identity verifier, model connector, registry).
//! 4. Constructing the Axum router and applying middleware.
//! 5. Starting the web server and handling graceful shutdown.

use anyhow::Context;
use axum::http::HeaderValue;
use sonic_api::{auth::TokenVerifier, config::Config, router::create_router, state::AppState};
use sonic_core::WsConnector;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal. Shutting down gracefully...");
}

fn cors_layer(config: &Config) -> anyhow::Result<CorsLayer> {
    let cors = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    Ok(match &config.allowed_origin {
        Some(origin) => cors.allow_origin(
            origin
                .parse::<HeaderValue>()
                .context("ALLOWED_ORIGIN is not a valid header value")?,
        ),
        None => cors.allow_origin(Any),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing application state...");

    // --- 3. Initialize Shared Services ---
    if config.allow_test_tokens {
        warn!("Development tokens are accepted. Do not enable this in production.");
    }
    let verifier = Arc::new(TokenVerifier::new(
        config.auth_tokens.clone(),
        config.allow_test_tokens,
    ));
    let connector = Arc::new(WsConnector::new(
        config.model_stream_url.clone(),
        config.model_id.clone(),
        config.model_stream_token.clone(),
    ));

    // --- 4. Create Router and Apply Middleware ---
    let cors = cors_layer(&config)?;
    let bind_address = config.bind_address;
    info!(
        model = %config.model_id,
        voice = %config.voice_id,
        bind_address = %bind_address,
        "Service configured. Starting server..."
    );
    let app_state = Arc::new(AppState::new(config, verifier, connector));
    let app = create_router(app_state).layer(cors);

    // --- 5. Start Server ---
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server has shut down.");
    Ok(())
}
