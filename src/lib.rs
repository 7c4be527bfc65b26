//! Beacon Talk - push-to-talk voice client
//!
//! This library provides the pieces of a single-utterance voice round trip:
//! - Microphone capture with an analysis tap
//! - Amplitude-based end-of-utterance detection
//! - Submission to a remote speech endpoint
//! - Playback of the spoken reply
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                UtteranceController                   │
//! │   activate() │ deactivate() │ status │ events        │
//! └───────┬──────────────┬─────────────────┬────────────┘
//!         │              │                 │
//! ┌───────▼──────┐ ┌─────▼──────────┐ ┌────▼────────────┐
//! │ Capture      │ │ Amplitude      │ │ Playback        │
//! │ Session      │ │ Monitor (VAD)  │ │ Service         │
//! └───────┬──────┘ └────────────────┘ └─────────────────┘
//!         │
//! ┌───────▼─────────────────────────────────────────────┐
//! │            Remote speech endpoint (HTTP)             │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod controller;
pub mod error;
pub mod remote;
pub mod voice;

pub use config::Config;
pub use controller::{
    Activation, ControllerEvent, ControllerSettings, ControllerStatus, SessionState, StopTrigger,
    UtteranceController,
};
pub use error::{Error, ErrorKind, Result};
pub use remote::{HttpVoiceClient, RemoteVoiceClient};
