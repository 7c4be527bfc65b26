//! Remote speech endpoint
//!
//! The server turns one recorded utterance into one spoken reply and also
//! serves the welcome prompt.

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;

use crate::config::RemoteConfig;
use crate::voice::AudioPayload;
use crate::{Error, Result};

/// MIME type assumed when a response carries no `Content-Type`
pub const DEFAULT_RESPONSE_MIME: &str = "audio/wav";

/// Speech round trip
#[async_trait]
pub trait RemoteVoiceClient: Send + Sync {
    /// Submit one utterance and receive the spoken reply
    ///
    /// # Errors
    ///
    /// Returns `Error::RemoteProcessing` for non-success responses and
    /// `Error::Http` for transport failures
    async fn submit(&self, audio: Vec<u8>, content_type: &str) -> Result<AudioPayload>;

    /// Fetch the welcome prompt
    ///
    /// # Errors
    ///
    /// Returns `Error::RemoteProcessing` for non-success responses and
    /// `Error::Http` for transport failures
    async fn fetch_welcome_prompt(&self) -> Result<AudioPayload>;
}

/// HTTP implementation of [`RemoteVoiceClient`]
#[derive(Debug, Clone)]
pub struct HttpVoiceClient {
    client: reqwest::Client,
    process_url: String,
    welcome_url: String,
}

impl HttpVoiceClient {
    /// Create a client for the configured endpoint
    #[must_use]
    pub fn new(config: &RemoteConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            process_url: config.process_url(),
            welcome_url: config.welcome_url(),
        }
    }

    /// Processing endpoint URL
    #[must_use]
    pub fn process_url(&self) -> &str {
        &self.process_url
    }

    /// Welcome endpoint URL
    #[must_use]
    pub fn welcome_url(&self) -> &str {
        &self.welcome_url
    }
}

#[async_trait]
impl RemoteVoiceClient for HttpVoiceClient {
    async fn submit(&self, audio: Vec<u8>, content_type: &str) -> Result<AudioPayload> {
        tracing::debug!(
            bytes = audio.len(),
            content_type,
            url = %self.process_url,
            "submitting utterance"
        );

        let part = reqwest::multipart::Part::bytes(audio)
            .file_name(file_name_for(content_type))
            .mime_str(content_type)
            .map_err(|e| {
                tracing::error!(error = %e, content_type, "invalid utterance content type");
                e
            })?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .client
            .post(&self.process_url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "voice processing request failed");
                e
            })?;

        into_payload(response, "voice processing").await
    }

    async fn fetch_welcome_prompt(&self) -> Result<AudioPayload> {
        tracing::debug!(url = %self.welcome_url, "fetching welcome prompt");

        let response = self
            .client
            .get(&self.welcome_url)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "welcome request failed");
                e
            })?;

        into_payload(response, "welcome").await
    }
}

/// Check the status and read the audio body
async fn into_payload(response: reqwest::Response, what: &str) -> Result<AudioPayload> {
    let status = response.status();
    tracing::debug!(status = %status, "received response");

    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        tracing::error!(status = %status, body = %body, "{what} endpoint error");
        return Err(Error::RemoteProcessing {
            status: status.as_u16(),
            body,
        });
    }

    let mime = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_RESPONSE_MIME.to_string());

    let data = response.bytes().await?.to_vec();
    tracing::debug!(bytes = data.len(), mime = %mime, "{what} audio received");

    Ok(AudioPayload::new(data, mime))
}

/// Upload file name for a container tag
fn file_name_for(content_type: &str) -> String {
    let base = content_type.split(';').next().unwrap_or_default().trim();
    let extension = match base {
        "audio/wav" | "audio/x-wav" | "audio/wave" => "wav",
        "audio/webm" => "webm",
        "audio/ogg" => "ogg",
        "audio/mpeg" | "audio/mp3" => "mp3",
        "audio/mp4" | "audio/m4a" => "m4a",
        other => other
            .strip_prefix("audio/")
            .filter(|s| !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric()))
            .unwrap_or("bin"),
    };
    format!("utterance.{extension}")
}
