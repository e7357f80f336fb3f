//! TOML configuration file loading
//!
//! Supports `~/.config/companion/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct CompanionConfigFile {
    /// Live session configuration
    #[serde(default)]
    pub live: LiveFileConfig,

    /// Audio pipeline tuning
    #[serde(default)]
    pub audio: AudioFileConfig,

    /// Request/response fallback configuration
    #[serde(default)]
    pub fallback: FallbackFileConfig,
}

/// Live session configuration
#[derive(Debug, Default, Deserialize)]
pub struct LiveFileConfig {
    /// Backend API key
    pub api_key: Option<String>,

    /// Model identifier (e.g. "models/gemini-2.0-flash-live-001")
    pub model: Option<String>,

    /// Prebuilt voice name (e.g. "Aoede")
    pub voice: Option<String>,

    /// Streaming endpoint URL, without the key query parameter
    pub endpoint: Option<String>,

    /// Seconds allowed for the transport to open
    pub connect_timeout_secs: Option<u64>,

    /// Seconds allowed for the handshake acknowledgment
    pub handshake_timeout_secs: Option<u64>,
}

/// Audio pipeline tuning
#[derive(Debug, Default, Deserialize)]
pub struct AudioFileConfig {
    /// Capture buffers held before the oldest is dropped
    pub capture_backlog: Option<usize>,

    /// Capture sender poll interval in milliseconds
    pub capture_poll_ms: Option<u64>,
}

/// Fallback configuration
#[derive(Debug, Default, Deserialize)]
pub struct FallbackFileConfig {
    /// Model used for request/response turns
    pub model: Option<String>,

    /// REST base URL
    pub rest_base: Option<String>,

    /// Per-request timeout in seconds
    pub request_timeout_secs: Option<u64>,
}

/// Load the TOML config file from the standard path
///
/// Returns `CompanionConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> CompanionConfigFile {
    config_file_path().map_or_else(CompanionConfigFile::default, |path| {
        load_config_file_from(&path)
    })
}

/// Load a TOML config file from an explicit path
///
/// Missing or unparsable files yield defaults.
pub fn load_config_file_from(path: &Path) -> CompanionConfigFile {
    if !path.exists() {
        return CompanionConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                CompanionConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            CompanionConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/companion/config.toml`
#[must_use]
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("companion").join("config.toml"))
}
