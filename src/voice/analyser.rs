//! Frequency-domain analysis tap over the live input
//!
//! Keeps the most recent `fft_size` samples and produces byte-scaled
//! magnitude spectra the same way a browser `AnalyserNode` does: Blackman
//! window, FFT, exponential smoothing across snapshots, decibels mapped onto
//! 0-255.

use std::sync::{Arc, Mutex};

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

use crate::{Error, Result};

/// Lower bound of the byte scale in dBFS
pub const MIN_DECIBELS: f32 = -100.0;

/// Upper bound of the byte scale in dBFS
pub const MAX_DECIBELS: f32 = -30.0;

/// Source of byte-scaled frequency snapshots
pub trait FrequencyAnalyser: Send + Sync {
    /// Number of bins written by [`Self::byte_frequency_data`]
    fn frequency_bin_count(&self) -> usize;

    /// Write the current spectrum into `out`, one byte per bin
    ///
    /// Writes `min(out.len(), frequency_bin_count())` bins; the rest of `out`
    /// is left untouched.
    fn byte_frequency_data(&self, out: &mut [u8]);

    /// Whether enough input has arrived for a snapshot to mean anything
    ///
    /// A window that isn't full yet reads as silence, so the monitor skips
    /// frames until this turns true.
    fn is_primed(&self) -> bool {
        true
    }
}

/// FFT analyser fed from the capture callback
pub struct SpectrumAnalyser {
    fft_size: usize,
    smoothing: f32,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    state: Mutex<AnalyserState>,
}

struct AnalyserState {
    /// Ring buffer of the most recent samples
    ring: Vec<f32>,
    write_index: usize,
    /// Samples received so far, saturating at the window length
    filled: usize,
    /// Smoothed magnitudes from the previous snapshot
    previous: Vec<f32>,
}

impl SpectrumAnalyser {
    /// Create an analyser with the given window length and smoothing constant
    ///
    /// # Errors
    ///
    /// Returns error if `fft_size` is not a power of two or smoothing is outside [0, 1)
    #[allow(clippy::cast_precision_loss)]
    pub fn new(fft_size: usize, smoothing: f32) -> Result<Self> {
        if !fft_size.is_power_of_two() || fft_size < 32 {
            return Err(Error::Audio(format!(
                "fft size must be a power of two >= 32, got {fft_size}"
            )));
        }
        if !(0.0..1.0).contains(&smoothing) {
            return Err(Error::Audio(format!(
                "smoothing must be within [0, 1), got {smoothing}"
            )));
        }

        let fft = FftPlanner::new().plan_fft_forward(fft_size);

        // Blackman window, alpha = 0.16
        let n = fft_size as f32;
        let window = (0..fft_size)
            .map(|i| {
                let x = i as f32 / n;
                let tau = 2.0 * std::f32::consts::PI * x;
                0.08f32.mul_add((2.0 * tau).cos(), 0.5f32.mul_add(-tau.cos(), 0.42))
            })
            .collect();

        tracing::debug!(fft_size, smoothing, "spectrum analyser initialized");

        Ok(Self {
            fft_size,
            smoothing,
            fft,
            window,
            state: Mutex::new(AnalyserState {
                ring: vec![0.0; fft_size],
                write_index: 0,
                filled: 0,
                previous: vec![0.0; fft_size / 2],
            }),
        })
    }

    /// Window length in samples
    #[must_use]
    pub const fn fft_size(&self) -> usize {
        self.fft_size
    }

    /// Append mono samples from the input callback
    pub fn push_samples(&self, samples: &[f32]) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };

        // Only the tail can survive in the ring
        let tail = &samples[samples.len().saturating_sub(self.fft_size)..];
        for &sample in tail {
            let index = state.write_index;
            state.ring[index] = sample;
            state.write_index = (index + 1) % self.fft_size;
        }
        state.filled = state.filled.saturating_add(samples.len()).min(self.fft_size);
    }

    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn snapshot(&self, out: &mut [u8]) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };

        // Oldest sample first
        let start = state.write_index;
        let mut buffer: Vec<Complex<f32>> = state.ring[start..]
            .iter()
            .chain(&state.ring[..start])
            .zip(&self.window)
            .map(|(&sample, &w)| Complex::new(sample * w, 0.0))
            .collect();

        self.fft.process(&mut buffer);

        let scale = 1.0 / self.fft_size as f32;
        let bins = out.len().min(self.fft_size / 2);
        let range = MAX_DECIBELS - MIN_DECIBELS;

        for (k, previous) in state.previous.iter_mut().enumerate() {
            let magnitude = buffer[k].norm() * scale;
            *previous = self
                .smoothing
                .mul_add(*previous, (1.0 - self.smoothing) * magnitude);

            if k < bins {
                out[k] = if *previous > 0.0 {
                    let db = 20.0 * previous.log10();
                    (255.0 * (db - MIN_DECIBELS) / range).clamp(0.0, 255.0) as u8
                } else {
                    0
                };
            }
        }
    }
}

impl FrequencyAnalyser for SpectrumAnalyser {
    fn frequency_bin_count(&self) -> usize {
        self.fft_size / 2
    }

    fn byte_frequency_data(&self, out: &mut [u8]) {
        self.snapshot(out);
    }

    fn is_primed(&self) -> bool {
        self.state
            .lock()
            .is_ok_and(|state| state.filled >= self.fft_size)
    }
}

impl std::fmt::Debug for SpectrumAnalyser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpectrumAnalyser")
            .field("fft_size", &self.fft_size)
            .field("smoothing", &self.smoothing)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic white noise in [-amplitude, amplitude]
    fn noise(len: usize, amplitude: f32) -> Vec<f32> {
        let mut seed: u32 = 0x9E37_79B9;
        (0..len)
            .map(|_| {
                seed ^= seed << 13;
                seed ^= seed >> 17;
                seed ^= seed << 5;
                #[allow(clippy::cast_precision_loss)]
                let unit = seed as f32 / u32::MAX as f32;
                (unit * 2.0 - 1.0) * amplitude
            })
            .collect()
    }

    fn mean(bytes: &[u8]) -> f32 {
        #[allow(clippy::cast_precision_loss)]
        let len = bytes.len() as f32;
        bytes.iter().map(|&b| f32::from(b)).sum::<f32>() / len
    }

    #[test]
    fn test_rejects_bad_fft_size() {
        assert!(SpectrumAnalyser::new(1000, 0.8).is_err());
        assert!(SpectrumAnalyser::new(16, 0.8).is_err());
        assert!(SpectrumAnalyser::new(2048, 1.0).is_err());
    }

    #[test]
    fn test_bin_count() {
        let analyser = SpectrumAnalyser::new(2048, 0.8).unwrap();
        assert_eq!(analyser.frequency_bin_count(), 1024);
    }

    #[test]
    fn test_primed_after_full_window() {
        let analyser = SpectrumAnalyser::new(512, 0.8).unwrap();
        assert!(!analyser.is_primed());

        // One 10ms callback at 16kHz
        analyser.push_samples(&noise(160, 0.5));
        assert!(!analyser.is_primed());

        analyser.push_samples(&noise(352, 0.5));
        assert!(analyser.is_primed());
    }

    #[test]
    fn test_silence_is_zero() {
        let analyser = SpectrumAnalyser::new(512, 0.8).unwrap();
        analyser.push_samples(&vec![0.0; 512]);

        let mut out = vec![0xAA; analyser.frequency_bin_count()];
        analyser.byte_frequency_data(&mut out);
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_noise_is_loud() {
        let analyser = SpectrumAnalyser::new(2048, 0.8).unwrap();
        analyser.push_samples(&noise(4096, 0.3));

        let mut out = vec![0; analyser.frequency_bin_count()];
        analyser.byte_frequency_data(&mut out);
        assert!(mean(&out) > 50.0, "mean was {}", mean(&out));
    }

    #[test]
    fn test_smoothing_decays_after_silence() {
        let analyser = SpectrumAnalyser::new(512, 0.8).unwrap();
        let mut out = vec![0; analyser.frequency_bin_count()];

        analyser.push_samples(&noise(512, 0.3));
        analyser.byte_frequency_data(&mut out);
        let loud = mean(&out);

        analyser.push_samples(&vec![0.0; 512]);
        analyser.byte_frequency_data(&mut out);
        let decaying = mean(&out);

        assert!(decaying > 0.0);
        assert!(decaying < loud);
    }

    #[test]
    fn test_short_output_buffer() {
        let analyser = SpectrumAnalyser::new(256, 0.0).unwrap();
        analyser.push_samples(&noise(256, 0.3));

        let mut out = vec![0; 8];
        analyser.byte_frequency_data(&mut out);
        assert!(out.iter().any(|&b| b > 0));
    }
}
