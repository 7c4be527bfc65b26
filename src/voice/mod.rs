//! Voice processing module
//!
//! Handles microphone capture, silence detection, and playback.
//! Speech understanding happens remotely (see `remote.rs`)

mod analyser;
mod capture;
mod monitor;
mod playback;

pub use analyser::{FrequencyAnalyser, MAX_DECIBELS, MIN_DECIBELS, SpectrumAnalyser};
pub use capture::{
    AudioCaptureSession, AudioChunk, AudioInput, CpalMicrophone, LiveInput, Recorder, Utterance,
    samples_to_wav,
};
pub use monitor::{
    AmplitudeMonitor, AmplitudeSample, DEFAULT_SILENCE_THRESHOLD, MonitorExit, RecordingGate,
};
pub use playback::{AudioPayload, AudioSink, Clip, CpalSink, PlaybackService, decode};
