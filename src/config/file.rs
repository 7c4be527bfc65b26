//! TOML configuration file loading
//!
//! Supports `~/.config/omni/beacon-talk/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::Result;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct TalkConfigFile {
    /// Speech endpoint configuration
    #[serde(default)]
    pub remote: RemoteFileConfig,

    /// Microphone capture configuration
    #[serde(default)]
    pub capture: CaptureFileConfig,

    /// Silence detection configuration
    #[serde(default)]
    pub vad: VadFileConfig,

    /// Welcome prompt configuration
    #[serde(default)]
    pub welcome: WelcomeFileConfig,
}

/// Speech endpoint configuration
#[derive(Debug, Default, Deserialize)]
pub struct RemoteFileConfig {
    /// Base URL (e.g. "http://localhost:8000")
    pub base_url: Option<String>,

    /// Path of the utterance processing endpoint
    pub process_path: Option<String>,

    /// Path of the welcome audio endpoint
    pub welcome_path: Option<String>,

    /// Upper bound for one submission round trip
    pub submit_timeout_secs: Option<u64>,
}

/// Microphone capture configuration
#[derive(Debug, Default, Deserialize)]
pub struct CaptureFileConfig {
    /// Preferred input sample rate
    pub sample_rate: Option<u32>,

    /// Container tag attached to utterances (e.g. "audio/wav")
    pub container: Option<String>,
}

/// Silence detection configuration
#[derive(Debug, Default, Deserialize)]
pub struct VadFileConfig {
    /// Mean byte level below which a frame is silent (0-255)
    pub silence_threshold: Option<f32>,

    /// Time between amplitude samples
    pub frame_interval_ms: Option<u64>,

    /// Analysis window in samples; a power of two
    pub fft_size: Option<usize>,

    /// Spectrum smoothing between frames (0.0-1.0)
    pub smoothing: Option<f32>,
}

/// Welcome prompt configuration
#[derive(Debug, Default, Deserialize)]
pub struct WelcomeFileConfig {
    /// Play the welcome prompt on the first activation
    pub enabled: Option<bool>,
}

/// Load the TOML config file from the standard path
///
/// Returns `TalkConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> TalkConfigFile {
    config_file_path().map_or_else(TalkConfigFile::default, |path| load_config_file_from(&path))
}

/// Load a TOML config file from an explicit path
///
/// Same fallback rules as [`load_config_file`].
pub fn load_config_file_from(path: &Path) -> TalkConfigFile {
    if !path.exists() {
        return TalkConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match parse_config_file(&content) {
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
                TalkConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            TalkConfigFile::default()
        }
    }
}

/// Parse TOML config file contents
///
/// # Errors
///
/// Returns `Error::Toml` if the content is not valid for the schema
pub fn parse_config_file(content: &str) -> Result<TalkConfigFile> {
    Ok(toml::from_str(content)?)
}

/// Return the config file path: `~/.config/omni/beacon-talk/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| {
        d.config_dir()
            .join("omni")
            .join("beacon-talk")
            .join("config.toml")
    })
}
