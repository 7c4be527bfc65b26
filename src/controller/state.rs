//! Controller state cell contents

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;

/// Phase of the utterance pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Nothing in flight
    #[default]
    Idle,
    /// Fetching and playing the welcome prompt
    PlayingWelcome,
    /// Waiting for the microphone and recorder to come up
    Starting,
    /// Capturing speech; the monitor is sampling
    Recording,
    /// Recorder stopping and chunks being assembled
    Finalizing,
    /// Utterance in flight to the speech endpoint
    Submitting,
    /// Playing the endpoint's reply
    PlayingResponse,
}

impl SessionState {
    /// Stable lowercase name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::PlayingWelcome => "playing_welcome",
            Self::Starting => "starting",
            Self::Recording => "recording",
            Self::Finalizing => "finalizing",
            Self::Submitting => "submitting",
            Self::PlayingResponse => "playing_response",
        }
    }

    /// Whether the pipeline is working on something other than listening
    #[must_use]
    pub const fn is_busy(self) -> bool {
        !matches!(self, Self::Idle | Self::Recording)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current state and the session it belongs to
///
/// Session ids increase by one per activation that leaves `Idle`; id 0 means
/// no session has run yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ControllerStatus {
    /// Pipeline phase
    pub state: SessionState,
    /// Owning session id
    pub session: u64,
}

/// Outcome of [`super::UtteranceController::activate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// A new session left `Idle`
    Started {
        /// New session id
        session: u64,
    },
    /// The recording session was asked to stop
    Stopping {
        /// Session being stopped
        session: u64,
    },
    /// Busy; nothing happened
    Ignored {
        /// State observed at the time
        state: SessionState,
    },
}

/// Write-once marker for the welcome prompt
#[derive(Debug, Default)]
pub struct WelcomeFlag(AtomicBool);

impl WelcomeFlag {
    /// Unclaimed flag
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Claim the flag; true only for the first caller ever
    pub fn claim(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Whether the flag has been claimed
    #[must_use]
    pub fn is_claimed(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
