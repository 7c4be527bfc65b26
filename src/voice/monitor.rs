//! Amplitude-based end-of-utterance detection
//!
//! Samples the live analyser once per frame and reports silence when the mean
//! byte-frequency level drops below a threshold.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::time::MissedTickBehavior;

use super::analyser::FrequencyAnalyser;

/// Default silence threshold on the 0-255 byte-frequency scale
pub const DEFAULT_SILENCE_THRESHOLD: f32 = 5.0;

/// Mean level of one frequency snapshot
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AmplitudeSample {
    mean: f32,
}

impl AmplitudeSample {
    /// Wrap a precomputed mean
    #[must_use]
    pub const fn new(mean: f32) -> Self {
        Self { mean }
    }

    /// Arithmetic mean across bins, 0-255
    #[must_use]
    pub const fn mean(self) -> f32 {
        self.mean
    }
}

/// Gate consulted on every tick before sampling
///
/// Implementations run `sample` only while the owning session is still
/// recording, and must hold whatever guards that fact for the duration of the
/// call so teardown cannot start halfway through a sample.
pub trait RecordingGate {
    /// Run `sample` if the session is live, `None` otherwise
    fn while_recording<R>(&self, sample: impl FnOnce() -> R) -> Option<R>;
}

/// Why a drive loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorExit {
    /// A silent frame was observed; signaled once per monitor
    Silence,
    /// The session stopped recording before any silent frame
    SessionEnded,
}

/// Watches the analyser for end of utterance
pub struct AmplitudeMonitor {
    analyser: Arc<dyn FrequencyAnalyser>,
    threshold: f32,
    signaled: AtomicBool,
}

impl AmplitudeMonitor {
    /// Create a monitor over `analyser`
    #[must_use]
    pub fn new(analyser: Arc<dyn FrequencyAnalyser>, threshold: f32) -> Self {
        Self {
            analyser,
            threshold,
            signaled: AtomicBool::new(false),
        }
    }

    /// Take one snapshot and reduce it to its mean
    ///
    /// The analyser writes into a buffer owned by this call, so nothing of the
    /// analyser's internal state is read after it returns.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn sample(&self) -> AmplitudeSample {
        let mut bins = vec![0u8; self.analyser.frequency_bin_count()];
        if bins.is_empty() {
            return AmplitudeSample::new(0.0);
        }

        self.analyser.byte_frequency_data(&mut bins);
        let sum: u64 = bins.iter().map(|&b| u64::from(b)).sum();
        AmplitudeSample::new(sum as f32 / bins.len() as f32)
    }

    /// Whether `sample` is below the silence threshold
    #[must_use]
    pub fn is_silent(&self, sample: AmplitudeSample) -> bool {
        sample.mean() < self.threshold
    }

    /// Configured threshold
    #[must_use]
    pub const fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Whether silence has already been signaled
    #[must_use]
    pub fn has_signaled(&self) -> bool {
        self.signaled.load(Ordering::Acquire)
    }

    /// Sample once per `frame` until silence or until the gate closes
    ///
    /// Frames before the analyser is primed are skipped; an unfilled window
    /// never counts as silence.
    ///
    /// Returns [`MonitorExit::Silence`] at most once over the monitor's
    /// lifetime; any later or concurrent drive returns
    /// [`MonitorExit::SessionEnded`] without sampling.
    pub async fn run<G: RecordingGate>(&self, frame: Duration, gate: &G) -> MonitorExit {
        let mut ticker = tokio::time::interval(frame);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut frames: u64 = 0;
        let mut warmup: u64 = 0;

        loop {
            ticker.tick().await;

            if self.has_signaled() {
                return MonitorExit::SessionEnded;
            }

            let sampled =
                gate.while_recording(|| self.analyser.is_primed().then(|| self.sample()));
            let Some(sampled) = sampled else {
                tracing::debug!(frames, "session no longer recording, monitor stopped");
                return MonitorExit::SessionEnded;
            };
            let Some(sample) = sampled else {
                warmup += 1;
                tracing::trace!(warmup, "analyser not primed, frame skipped");
                continue;
            };
            if frames == 0 && warmup > 0 {
                tracing::debug!(warmup, "analyser primed");
            }
            frames += 1;

            tracing::trace!(mean = sample.mean(), frames, "amplitude sample");

            if self.is_silent(sample) {
                if self
                    .signaled
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    return MonitorExit::SessionEnded;
                }
                tracing::debug!(mean = sample.mean(), frames, "silence detected");
                return MonitorExit::Silence;
            }
        }
    }
}

impl std::fmt::Debug for AmplitudeMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmplitudeMonitor")
            .field("threshold", &self.threshold)
            .field("signaled", &self.has_signaled())
            .finish_non_exhaustive()
    }
}
