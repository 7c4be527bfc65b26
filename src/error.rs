//! Error types for beacon-talk

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Result type alias for beacon-talk operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while capturing, submitting or playing an utterance
#[derive(Debug, Error)]
pub enum Error {
    /// Microphone missing, permission denied, or the input stream refused to start
    #[error("media access error: {0}")]
    MediaAccess(String),

    /// Payload could not be decoded or the output device failed
    #[error("playback error: {0}")]
    Playback(String),

    /// Speech endpoint answered with a non-success status
    #[error("remote processing error {status}: {body}")]
    RemoteProcessing {
        /// HTTP status code
        status: u16,
        /// Response body, possibly empty
        body: String,
    },

    /// Speech endpoint did not answer within the configured bound
    #[error("submission timed out after {0:?}")]
    SubmissionTimeout(Duration),

    /// Audio plumbing error (encoding, resampling, analyser setup)
    #[error("audio error: {0}")]
    Audio(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP transport error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Coarse error category reported to controller observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// See [`Error::MediaAccess`]
    MediaAccess,
    /// See [`Error::Playback`]
    Playback,
    /// See [`Error::RemoteProcessing`]
    RemoteProcessing,
    /// See [`Error::SubmissionTimeout`]
    SubmissionTimeout,
    /// Transport, IO, configuration and audio plumbing failures
    Other,
}

impl Error {
    /// Category of this error
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::MediaAccess(_) => ErrorKind::MediaAccess,
            Self::Playback(_) => ErrorKind::Playback,
            Self::RemoteProcessing { .. } => ErrorKind::RemoteProcessing,
            Self::SubmissionTimeout(_) => ErrorKind::SubmissionTimeout,
            Self::Audio(_) | Self::Config(_) | Self::Io(_) | Self::Http(_) | Self::Toml(_) => {
                ErrorKind::Other
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            Error::MediaAccess("denied".to_string()).kind(),
            ErrorKind::MediaAccess
        );
        assert_eq!(
            Error::RemoteProcessing {
                status: 500,
                body: String::new(),
            }
            .kind(),
            ErrorKind::RemoteProcessing
        );
        assert_eq!(
            Error::SubmissionTimeout(Duration::from_secs(1)).kind(),
            ErrorKind::SubmissionTimeout
        );
        assert_eq!(Error::Audio("x".to_string()).kind(), ErrorKind::Other);
    }

    #[test]
    fn test_remote_error_display() {
        let err = Error::RemoteProcessing {
            status: 502,
            body: "bad gateway".to_string(),
        };
        assert_eq!(err.to_string(), "remote processing error 502: bad gateway");
    }
}
