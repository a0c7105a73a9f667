use sonic_core::{InferenceConfig, StreamSettings, TurnSettings};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub log_level: Level,
    pub model_stream_url: String,
    pub model_stream_token: Option<String>,
    pub model_id: String,
    pub voice_id: String,
    pub system_prompt: String,
    pub inference: InferenceConfig,
    pub inactivity_threshold: Duration,
    pub watchdog_poll: Duration,
    pub audio_buffer_max_bytes: usize,
    pub turn_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub session_idle_timeout: Duration,
    /// Accepted tokens mapped to the user id they authenticate.
    pub auth_tokens: HashMap<String, String>,
    pub allow_test_tokens: bool,
    pub allowed_origin: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        let turn = TurnSettings::default();
        Self {
            bind_address: SocketAddr::from(([0, 0, 0, 0], 8000)),
            log_level: Level::INFO,
            model_stream_url: String::new(),
            model_stream_token: None,
            model_id: "amazon.nova-sonic-v1:0".to_string(),
            voice_id: StreamSettings::default().voice_id,
            system_prompt: StreamSettings::default().system_prompt,
            inference: InferenceConfig::default(),
            inactivity_threshold: turn.inactivity_threshold,
            watchdog_poll: turn.poll_interval,
            audio_buffer_max_bytes: turn.buffer_cap,
            turn_timeout: turn.drain_timeout,
            heartbeat_interval: Duration::from_secs(30),
            session_idle_timeout: Duration::from_secs(3600),
            auth_tokens: HashMap::new(),
            allow_test_tokens: false,
            allowed_origin: None,
        }
    }
}

/// Reads `name`, falling back to `default` when unset.
fn parse_var<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

fn parse_millis(name: &str, default: Duration) -> Result<Duration, ConfigError> {
    parse_var(name, default.as_millis() as u64).map(Duration::from_millis)
}

fn parse_secs(name: &str, default: Duration) -> Result<Duration, ConfigError> {
    parse_var(name, default.as_secs()).map(Duration::from_secs)
}

/// Parses `token=user_id` pairs separated by commas.
fn parse_auth_tokens(raw: &str) -> Result<HashMap<String, String>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            pair.split_once('=')
                .map(|(token, user)| (token.trim().to_string(), user.trim().to_string()))
                .filter(|(token, user)| !token.is_empty() && !user.is_empty())
                .ok_or_else(|| {
                    ConfigError::InvalidValue(
                        "AUTH_TOKENS".to_string(),
                        format!("'{}' is not a token=user_id pair", pair),
                    )
                })
        })
        .collect()
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }
        let defaults = Self::default();

        let bind_address = parse_var("BIND_ADDRESS", defaults.bind_address)?;

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let model_stream_url = std::env::var("MODEL_STREAM_URL")
            .map_err(|_| ConfigError::MissingVar("MODEL_STREAM_URL".to_string()))?;
        let model_stream_token = std::env::var("MODEL_STREAM_TOKEN").ok();
        let model_id = std::env::var("MODEL_ID").unwrap_or(defaults.model_id);
        let voice_id = std::env::var("VOICE_ID").unwrap_or(defaults.voice_id);
        let system_prompt = std::env::var("SYSTEM_PROMPT").unwrap_or(defaults.system_prompt);

        let inference = InferenceConfig {
            max_tokens: parse_var("MAX_TOKENS", defaults.inference.max_tokens)?,
            top_p: parse_var("TOP_P", defaults.inference.top_p)?,
            temperature: parse_var("TEMPERATURE", defaults.inference.temperature)?,
        };

        let auth_tokens = match std::env::var("AUTH_TOKENS") {
            Ok(raw) => parse_auth_tokens(&raw)?,
            Err(_) => HashMap::new(),
        };

        Ok(Self {
            bind_address,
            log_level,
            model_stream_url,
            model_stream_token,
            model_id,
            voice_id,
            system_prompt,
            inference,
            inactivity_threshold: parse_millis(
                "INACTIVITY_THRESHOLD_MS",
                defaults.inactivity_threshold,
            )?,
            watchdog_poll: parse_millis("WATCHDOG_POLL_MS", defaults.watchdog_poll)?,
            audio_buffer_max_bytes: parse_var(
                "AUDIO_BUFFER_MAX_BYTES",
                defaults.audio_buffer_max_bytes,
            )?,
            turn_timeout: parse_secs("TURN_TIMEOUT_SECS", defaults.turn_timeout)?,
            heartbeat_interval: parse_secs("HEARTBEAT_INTERVAL_SECS", defaults.heartbeat_interval)?,
            session_idle_timeout: parse_secs(
                "SESSION_IDLE_TIMEOUT_SECS",
                defaults.session_idle_timeout,
            )?,
            auth_tokens,
            allow_test_tokens: parse_var("ALLOW_TEST_TOKENS", defaults.allow_test_tokens)?,
            allowed_origin: std::env::var("ALLOWED_ORIGIN").ok(),
        })
    }

    pub fn stream_settings(&self) -> StreamSettings {
        StreamSettings {
            voice_id: self.voice_id.clone(),
            system_prompt: self.system_prompt.clone(),
            ..StreamSettings::default()
        }
    }

    pub fn turn_settings(&self) -> TurnSettings {
        TurnSettings {
            inactivity_threshold: self.inactivity_threshold,
            poll_interval: self.watchdog_poll,
            buffer_cap: self.audio_buffer_max_bytes,
            drain_timeout: self.turn_timeout,
            ..TurnSettings::default()
        }
    }
}
