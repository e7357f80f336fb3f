//! Configuration management for the companion engine
//!
//! Values are layered: built-in defaults, then the TOML file, then
//! environment variables.

pub mod file;

use std::time::Duration;

use self::file::CompanionConfigFile;
use crate::{Error, Result};

/// Default live model
pub const DEFAULT_MODEL: &str = "models/gemini-2.0-flash-live-001";

/// Default prebuilt voice
pub const DEFAULT_VOICE: &str = "Aoede";

/// Default streaming endpoint
pub const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Default request/response model
pub const DEFAULT_FALLBACK_MODEL: &str = "models/gemini-2.0-flash";

/// Default REST base for the fallback client
pub const DEFAULT_REST_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Companion configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Live session configuration
    pub live: LiveConfig,

    /// Request/response fallback configuration
    pub fallback: FallbackConfig,
}

/// Live session configuration
#[derive(Debug, Clone)]
pub struct LiveConfig {
    /// Backend API key; required
    pub api_key: Option<String>,

    /// Model identifier; required
    pub model: String,

    /// Prebuilt voice name
    pub voice: String,

    /// Streaming endpoint URL
    pub endpoint: String,

    /// Bound on opening the transport
    pub connect_timeout: Duration,

    /// Bound on waiting for the handshake acknowledgment
    pub handshake_timeout: Duration,

    /// Capture buffers held before the oldest is dropped
    pub capture_backlog: usize,

    /// How often the capture sender drains the queue
    pub capture_poll_interval: Duration,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            voice: DEFAULT_VOICE.to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            capture_backlog: 16,
            capture_poll_interval: Duration::from_millis(20),
        }
    }
}

impl LiveConfig {
    /// Check the settings a session cannot start without
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for a missing API key, model or endpoint, or a
    /// zero capture poll interval
    pub fn validate(&self) -> Result<()> {
        if self.api_key.as_deref().is_none_or(|k| k.trim().is_empty()) {
            return Err(Error::Config(
                "API key not set (COMPANION_API_KEY or GEMINI_API_KEY)".to_string(),
            ));
        }
        if self.model.trim().is_empty() {
            return Err(Error::Config("model not set".to_string()));
        }
        if self.endpoint.trim().is_empty() {
            return Err(Error::Config("endpoint not set".to_string()));
        }
        if self.capture_poll_interval.is_zero() {
            return Err(Error::Config("capture poll interval must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Connection URL with the key query parameter
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the configuration is invalid
    pub fn url(&self) -> Result<String> {
        self.validate()?;
        let key = self.api_key.as_deref().unwrap_or_default();
        Ok(format!("{}?key={key}", self.endpoint))
    }
}

/// Request/response fallback configuration
#[derive(Debug, Clone)]
pub struct FallbackConfig {
    /// Backend API key; shared with the live session
    pub api_key: Option<String>,

    /// Model used for request/response turns
    pub model: String,

    /// REST base URL
    pub rest_base: String,

    /// Per-request timeout
    pub request_timeout: Duration,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: DEFAULT_FALLBACK_MODEL.to_string(),
            rest_base: DEFAULT_REST_BASE.to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Load configuration from the config file and environment
    ///
    /// # Errors
    ///
    /// Returns error if an environment override cannot be parsed
    pub fn load() -> Result<Self> {
        let file = file::load_config_file();
        Self::from_sources(file, |key| std::env::var(key).ok())
    }

    /// Layer a parsed config file and an environment lookup over defaults
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if a numeric override cannot be parsed or
    /// `capture_poll_ms` is zero
    pub fn from_sources(
        file: CompanionConfigFile,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let defaults = LiveConfig::default();
        let fc = file;

        let api_key = env("COMPANION_API_KEY")
            .or_else(|| env("GEMINI_API_KEY"))
            .or(fc.live.api_key)
            .filter(|k| !k.trim().is_empty());

        let handshake_timeout = match env("COMPANION_HANDSHAKE_TIMEOUT_SECS") {
            Some(raw) => Duration::from_secs(parse_number(
                "COMPANION_HANDSHAKE_TIMEOUT_SECS",
                &raw,
            )?),
            None => fc
                .live
                .handshake_timeout_secs
                .map_or(defaults.handshake_timeout, Duration::from_secs),
        };

        let capture_poll_interval = match fc.audio.capture_poll_ms {
            Some(0) => {
                return Err(Error::Config(
                    "audio.capture_poll_ms must be at least 1".to_string(),
                ));
            }
            Some(ms) => Duration::from_millis(ms),
            None => defaults.capture_poll_interval,
        };

        let live = LiveConfig {
            api_key: api_key.clone(),
            model: env("COMPANION_MODEL")
                .or(fc.live.model)
                .unwrap_or(defaults.model),
            voice: env("COMPANION_VOICE")
                .or(fc.live.voice)
                .unwrap_or(defaults.voice),
            endpoint: env("COMPANION_ENDPOINT")
                .or(fc.live.endpoint)
                .unwrap_or(defaults.endpoint),
            connect_timeout: fc
                .live
                .connect_timeout_secs
                .map_or(defaults.connect_timeout, Duration::from_secs),
            handshake_timeout,
            capture_backlog: fc.audio.capture_backlog.unwrap_or(defaults.capture_backlog),
            capture_poll_interval,
        };

        let fallback_defaults = FallbackConfig::default();
        let fallback = FallbackConfig {
            api_key,
            model: env("COMPANION_FALLBACK_MODEL")
                .or(fc.fallback.model)
                .unwrap_or(fallback_defaults.model),
            rest_base: fc.fallback.rest_base.unwrap_or(fallback_defaults.rest_base),
            request_timeout: fc
                .fallback
                .request_timeout_secs
                .map_or(fallback_defaults.request_timeout, Duration::from_secs),
        };

        tracing::debug!(
            model = %live.model,
            voice = %live.voice,
            has_api_key = live.api_key.is_some(),
            handshake_timeout = ?live.handshake_timeout,
            "configuration loaded"
        );

        Ok(Self { live, fallback })
    }
}

fn parse_number(name: &str, raw: &str) -> Result<u64> {
    raw.trim()
        .parse()
        .map_err(|_| Error::Config(format!("{name} must be a whole number, got {raw:?}")))
}
