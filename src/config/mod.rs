//! Configuration management for beacon-talk

pub mod file;

use std::time::Duration;

use crate::{Error, Result};

use self::file::TalkConfigFile;

/// beacon-talk configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Speech endpoint
    pub remote: RemoteConfig,

    /// Microphone capture
    pub capture: CaptureConfig,

    /// Silence detection
    pub vad: VadConfig,

    /// Welcome prompt
    pub welcome: WelcomeConfig,
}

/// Speech endpoint configuration
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// Base URL, without trailing slash
    pub base_url: String,

    /// Utterance processing endpoint path
    pub process_path: String,

    /// Welcome audio endpoint path
    pub welcome_path: String,

    /// Upper bound for one submission round trip
    pub submit_timeout: Duration,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            process_path: "/api/v1/voice/process".to_string(),
            welcome_path: "/api/v1/voice/welcome".to_string(),
            submit_timeout: Duration::from_secs(30),
        }
    }
}

impl RemoteConfig {
    /// Full URL of the processing endpoint
    #[must_use]
    pub fn process_url(&self) -> String {
        format!("{}{}", self.base_url, self.process_path)
    }

    /// Full URL of the welcome endpoint
    #[must_use]
    pub fn welcome_url(&self) -> String {
        format!("{}{}", self.base_url, self.welcome_path)
    }
}

/// Microphone capture configuration
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Preferred input sample rate (16kHz for speech)
    pub sample_rate: u32,

    /// Container tag fixed on every utterance
    pub container: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            container: "audio/wav".to_string(),
        }
    }
}

/// Silence detection configuration
#[derive(Debug, Clone)]
pub struct VadConfig {
    /// Mean byte-frequency level below which a frame counts as silent (0-255 scale)
    pub silence_threshold: f32,

    /// Interval between monitor ticks
    pub frame_interval: Duration,

    /// Analyser window length in samples
    pub fft_size: usize,

    /// Analyser smoothing time constant
    pub smoothing: f32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            silence_threshold: crate::voice::DEFAULT_SILENCE_THRESHOLD,
            frame_interval: Duration::from_millis(16),
            fft_size: 2048,
            smoothing: 0.8,
        }
    }
}

/// Welcome prompt configuration
#[derive(Debug, Clone)]
pub struct WelcomeConfig {
    /// Play the welcome prompt on the first activation
    pub enabled: bool,
}

impl Default for WelcomeConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Config {
    /// Load configuration (env > toml > default)
    ///
    /// # Errors
    ///
    /// Returns error if a value is present but invalid
    pub fn load() -> Result<Self> {
        Self::resolve(file::load_config_file(), |key| std::env::var(key).ok())
    }

    /// Resolve configuration from a parsed file and an environment lookup
    ///
    /// # Errors
    ///
    /// Returns error if an environment value cannot be parsed or validation fails
    pub fn resolve<F>(fc: TalkConfigFile, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let remote = RemoteConfig {
            base_url: env("BEACON_TALK_URL")
                .or(fc.remote.base_url)
                .map_or(defaults.remote.base_url, |url| {
                    url.trim_end_matches('/').to_string()
                }),
            process_path: env("BEACON_TALK_PROCESS_PATH")
                .or(fc.remote.process_path)
                .unwrap_or(defaults.remote.process_path),
            welcome_path: env("BEACON_TALK_WELCOME_PATH")
                .or(fc.remote.welcome_path)
                .unwrap_or(defaults.remote.welcome_path),
            submit_timeout: parse_env(&env, "BEACON_TALK_SUBMIT_TIMEOUT")?
                .or(fc.remote.submit_timeout_secs)
                .map_or(defaults.remote.submit_timeout, Duration::from_secs),
        };

        let capture = CaptureConfig {
            sample_rate: parse_env(&env, "BEACON_TALK_SAMPLE_RATE")?
                .or(fc.capture.sample_rate)
                .unwrap_or(defaults.capture.sample_rate),
            container: fc.capture.container.unwrap_or(defaults.capture.container),
        };

        let vad = VadConfig {
            silence_threshold: parse_env(&env, "BEACON_TALK_SILENCE_THRESHOLD")?
                .or(fc.vad.silence_threshold)
                .unwrap_or(defaults.vad.silence_threshold),
            frame_interval: fc
                .vad
                .frame_interval_ms
                .map_or(defaults.vad.frame_interval, Duration::from_millis),
            fft_size: fc.vad.fft_size.unwrap_or(defaults.vad.fft_size),
            smoothing: fc.vad.smoothing.unwrap_or(defaults.vad.smoothing),
        };

        let welcome = WelcomeConfig {
            enabled: parse_flag_env(&env, "BEACON_TALK_WELCOME")?
                .or(fc.welcome.enabled)
                .unwrap_or(defaults.welcome.enabled),
        };

        let config = Self {
            remote,
            capture,
            vad,
            welcome,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` naming the first offending value
    pub fn validate(&self) -> Result<()> {
        if self.remote.base_url.is_empty() {
            return Err(Error::Config("remote.base_url must not be empty".to_string()));
        }
        if !(0.0..=255.0).contains(&self.vad.silence_threshold) {
            return Err(Error::Config(format!(
                "vad.silence_threshold must be within 0-255, got {}",
                self.vad.silence_threshold
            )));
        }
        if !self.vad.fft_size.is_power_of_two() || !(32..=32768).contains(&self.vad.fft_size) {
            return Err(Error::Config(format!(
                "vad.fft_size must be a power of two within 32-32768, got {}",
                self.vad.fft_size
            )));
        }
        if !(0.0..1.0).contains(&self.vad.smoothing) {
            return Err(Error::Config(format!(
                "vad.smoothing must be within [0, 1), got {}",
                self.vad.smoothing
            )));
        }
        if self.vad.frame_interval.is_zero() {
            return Err(Error::Config("vad.frame_interval_ms must be positive".to_string()));
        }
        if self.capture.sample_rate == 0 {
            return Err(Error::Config("capture.sample_rate must be positive".to_string()));
        }
        Ok(())
    }
}

fn parse_env<T, F>(env: &F, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    env(key)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|_| Error::Config(format!("{key}: cannot parse {raw:?}")))
        })
        .transpose()
}

/// Boolean switch: `1/0`, `true/false`, `yes/no` or `on/off`, any case
fn parse_flag_env<F>(env: &F, key: &str) -> Result<Option<bool>>
where
    F: Fn(&str) -> Option<String>,
{
    env(key)
        .map(|raw| match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(Error::Config(format!("{key}: expected a boolean, got {raw:?}"))),
        })
        .transpose()
}
