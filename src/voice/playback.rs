//! Audio playback to speakers

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, StreamConfig};

use crate::{Error, Result};

/// Binary audio with its declared MIME type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioPayload {
    /// Encoded audio
    pub data: Vec<u8>,
    /// MIME type (e.g. "audio/wav", "audio/mpeg")
    pub mime: String,
}

impl AudioPayload {
    /// Wrap encoded audio
    #[must_use]
    pub fn new(data: Vec<u8>, mime: impl Into<String>) -> Self {
        Self {
            data,
            mime: mime.into(),
        }
    }
}

/// Decoded mono PCM ready for an output device
#[derive(Debug, Clone, PartialEq)]
pub struct Clip {
    /// Samples in [-1.0, 1.0]
    pub samples: Vec<f32>,
    /// Sample rate in Hz
    pub sample_rate: u32,
}

impl Clip {
    /// Playback length
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / f64::from(self.sample_rate))
    }
}

/// Output device
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Play `clip` and resolve when it has finished
    ///
    /// # Errors
    ///
    /// Returns `Error::Playback` if the device fails
    async fn play(&self, clip: Clip) -> Result<()>;
}

/// Decodes payloads and plays them to completion
#[derive(Clone)]
pub struct PlaybackService {
    sink: Arc<dyn AudioSink>,
}

impl PlaybackService {
    /// Create a service over `sink`
    #[must_use]
    pub fn new(sink: Arc<dyn AudioSink>) -> Self {
        Self { sink }
    }

    /// Decode and play `payload`, resolving when playback ends
    ///
    /// # Errors
    ///
    /// Returns `Error::Playback` if the payload cannot be decoded or played
    pub async fn play(&self, payload: &AudioPayload) -> Result<()> {
        let clip = decode(payload)?;
        let duration = clip.duration();
        tracing::debug!(
            mime = %payload.mime,
            bytes = payload.data.len(),
            duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            "playing payload"
        );

        self.sink.play(clip).await?;
        tracing::debug!("playback complete");
        Ok(())
    }
}

impl std::fmt::Debug for PlaybackService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackService").finish_non_exhaustive()
    }
}

/// Decode a WAV or MP3 payload into mono PCM
///
/// The container is sniffed from the bytes; the MIME type only breaks ties
/// for headerless MP3 streams.
///
/// # Errors
///
/// Returns `Error::Playback` for empty, unsupported or corrupt payloads
pub fn decode(payload: &AudioPayload) -> Result<Clip> {
    let data = &payload.data;
    if data.is_empty() {
        return Err(Error::Playback("empty audio payload".to_string()));
    }

    if data.len() >= 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"WAVE" {
        return decode_wav(data);
    }

    let mime = payload.mime.to_ascii_lowercase();
    let looks_mp3 = data.starts_with(b"ID3")
        || (data.len() >= 2 && data[0] == 0xFF && data[1] & 0xE0 == 0xE0)
        || mime.contains("mpeg")
        || mime.contains("mp3");

    if looks_mp3 {
        return decode_mp3(data);
    }

    Err(Error::Playback(format!(
        "unsupported audio format ({})",
        payload.mime
    )))
}

/// Decode WAV bytes to mono f32 samples
#[allow(clippy::cast_precision_loss)]
fn decode_wav(data: &[u8]) -> Result<Clip> {
    let mut reader = hound::WavReader::new(Cursor::new(data))
        .map_err(|e| Error::Playback(format!("WAV decode error: {e}")))?;
    let spec = reader.spec();
    let channels = usize::from(spec.channels.max(1));

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::Playback(format!("WAV decode error: {e}")))?,
        hound::SampleFormat::Int => {
            let scale = (1_i64 << (spec.bits_per_sample.clamp(1, 32) - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| Error::Playback(format!("WAV decode error: {e}")))?
        }
    };

    let samples = interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect();

    Ok(Clip {
        samples,
        sample_rate: spec.sample_rate,
    })
}

/// Decode MP3 bytes to mono f32 samples
#[allow(clippy::cast_sign_loss)]
fn decode_mp3(mp3_data: &[u8]) -> Result<Clip> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(mp3_data));
    let mut samples = Vec::new();
    let mut sample_rate = 0_u32;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                sample_rate = frame.sample_rate as u32;
                // Convert i16 samples to f32 and handle stereo to mono
                if frame.channels == 2 {
                    samples.extend(frame.data.chunks(2).map(|chunk| {
                        let left = f32::from(chunk[0]) / 32768.0;
                        let right = f32::from(chunk.get(1).copied().unwrap_or(chunk[0])) / 32768.0;
                        f32::midpoint(left, right)
                    }));
                } else {
                    samples.extend(frame.data.iter().map(|&s| f32::from(s) / 32768.0));
                }
            }
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(Error::Playback(format!("MP3 decode error: {e}"))),
        }
    }

    if samples.is_empty() || sample_rate == 0 {
        return Err(Error::Playback("MP3 payload contained no frames".to_string()));
    }

    Ok(Clip {
        samples,
        sample_rate,
    })
}

/// Plays clips on the default output device
///
/// Each clip gets its own stream on a blocking thread; the stream is dropped
/// on every exit path of that thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpalSink;

impl CpalSink {
    /// Create a sink for the default output device
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AudioSink for CpalSink {
    async fn play(&self, clip: Clip) -> Result<()> {
        tokio::task::spawn_blocking(move || play_blocking(clip))
            .await
            .map_err(|e| Error::Playback(format!("playback task failed: {e}")))?
    }
}

/// Play samples in a blocking manner
fn play_blocking(clip: Clip) -> Result<()> {
    if clip.samples.is_empty() {
        return Ok(());
    }

    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Playback("no output device available".to_string()))?;

    let rate = SampleRate(clip.sample_rate);
    let matching = |channels: u16| {
        device.supported_output_configs().ok()?.find(|c| {
            c.channels() == channels
                && c.sample_format() == SampleFormat::F32
                && c.min_sample_rate() <= rate
                && c.max_sample_rate() >= rate
        })
    };

    let (config, samples) = if let Some(range) = matching(1).or_else(|| matching(2)) {
        (range.with_sample_rate(rate).config(), clip.samples)
    } else {
        // Fallback: device default rate, resampled
        let default = device
            .default_output_config()
            .map_err(|e| Error::Playback(e.to_string()))?;
        if default.sample_format() != SampleFormat::F32 {
            return Err(Error::Playback(format!(
                "unsupported output sample format {:?}",
                default.sample_format()
            )));
        }
        let config: StreamConfig = default.config();
        let resampled = resample(&clip.samples, clip.sample_rate, config.sample_rate.0)?;
        (config, resampled)
    };

    let channels = usize::from(config.channels.max(1));
    let device_rate = config.sample_rate.0;
    let sample_count = samples.len();

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate = device_rate,
        channels = config.channels,
        "audio playback initialized"
    );

    let (done_tx, done_rx) = std::sync::mpsc::channel::<Result<()>>();
    let error_tx = done_tx.clone();
    let mut position = 0usize;
    let mut finished = false;

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                for frame in data.chunks_mut(channels) {
                    let sample = samples.get(position).copied().unwrap_or(0.0);
                    frame.fill(sample);
                    position += 1;
                }
                if position >= samples.len() && !finished {
                    finished = true;
                    let _ = done_tx.send(Ok(()));
                }
            },
            move |err| {
                tracing::error!(error = %err, "audio playback error");
                let _ = error_tx.send(Err(Error::Playback(err.to_string())));
            },
            None,
        )
        .map_err(|e| Error::Playback(e.to_string()))?;

    stream.play().map_err(|e| Error::Playback(e.to_string()))?;

    let duration_ms = (sample_count as u64 * 1000) / u64::from(device_rate.max(1));
    let timeout = Duration::from_millis(duration_ms + 500);

    let outcome = await_completion(&done_rx, timeout);

    // Small delay so the device drains its last buffer
    std::thread::sleep(Duration::from_millis(100));
    drop(stream);

    tracing::debug!(samples = sample_count, "stream released");
    outcome
}

/// Wait for the output callback to report that the clip finished
///
/// A stream that goes quiet without signaling is a playback failure.
fn await_completion(
    done_rx: &std::sync::mpsc::Receiver<Result<()>>,
    timeout: Duration,
) -> Result<()> {
    match done_rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
            tracing::warn!(?timeout, "playback did not signal completion in time");
            Err(Error::Playback(format!(
                "output stream did not finish within {}ms",
                timeout.as_millis()
            )))
        }
        Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => Err(Error::Playback(
            "output stream closed before finishing".to_string(),
        )),
    }
}

/// Resample mono audio using rubato
#[allow(clippy::cast_possible_truncation)]
fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    use rubato::{FftFixedIn, Resampler};

    if from_rate == to_rate {
        return Ok(samples.to_vec());
    }

    let chunk_size = 1024;
    let sub_chunks = 2;

    let mut resampler =
        FftFixedIn::<f64>::new(from_rate as usize, to_rate as usize, chunk_size, sub_chunks, 1)
            .map_err(|e| Error::Audio(format!("resampler init failed: {e}")))?;

    let mut output = Vec::with_capacity(samples.len() * to_rate as usize / from_rate.max(1) as usize);

    for chunk in samples.chunks(chunk_size) {
        // Zero-pad the tail so it isn't dropped
        let mut block: Vec<f64> = chunk.iter().map(|&s| f64::from(s)).collect();
        block.resize(chunk_size, 0.0);

        let result = resampler
            .process(&[block], None)
            .map_err(|e| Error::Audio(format!("resample failed: {e}")))?;
        output.extend(result[0].iter().map(|&s| s as f32));
    }

    Ok(output)
}
