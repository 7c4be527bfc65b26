//! Controller notifications

use serde::Serialize;

use crate::error::ErrorKind;

/// What ended a recording
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopTrigger {
    /// The monitor observed a silent frame
    Vad,
    /// `deactivate()` or a repeated activation
    Manual,
}

/// Broadcast to every [`super::UtteranceController::subscribe`] receiver
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControllerEvent {
    /// Welcome prompt finished playing
    WelcomePlayed { session: u64 },
    /// Microphone is live
    RecordingStarted { session: u64 },
    /// Recording stopped with audio
    UtteranceCaptured {
        session: u64,
        trigger: StopTrigger,
        bytes: usize,
        chunks: usize,
    },
    /// Recording stopped with nothing to submit
    UtteranceDiscarded { session: u64, trigger: StopTrigger },
    /// Endpoint replied
    Submitted { session: u64, reply_bytes: usize },
    /// Reply finished playing
    ResponsePlayed { session: u64 },
    /// The session failed and the controller returned to idle
    Failed {
        session: u64,
        kind: ErrorKind,
        message: String,
    },
}

impl ControllerEvent {
    /// Session this event belongs to
    #[must_use]
    pub const fn session(&self) -> u64 {
        match self {
            Self::WelcomePlayed { session }
            | Self::RecordingStarted { session }
            | Self::UtteranceCaptured { session, .. }
            | Self::UtteranceDiscarded { session, .. }
            | Self::Submitted { session, .. }
            | Self::ResponsePlayed { session }
            | Self::Failed { session, .. } => *session,
        }
    }
}
