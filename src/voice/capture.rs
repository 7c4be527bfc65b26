//! Microphone capture sessions
//!
//! A session opens the microphone, an analysis tap and a chunked recorder over
//! the same stream, buffers the recorder's chunks, and finalizes them into one
//! [`Utterance`].

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, Sample, SampleFormat, SampleRate, SizedSample, Stream, StreamConfig};
use tokio::sync::{mpsc, oneshot};

use super::analyser::{FrequencyAnalyser, SpectrumAnalyser};
use crate::config::{CaptureConfig, VadConfig};
use crate::{Error, Result};

/// Opaque fragment emitted by a recorder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk(Vec<u8>);

impl AudioChunk {
    /// Wrap recorder output
    #[must_use]
    pub const fn new(data: Vec<u8>) -> Self {
        Self(data)
    }

    /// Chunk bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Chunk size in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the chunk carries no bytes
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for AudioChunk {
    fn from(data: Vec<u8>) -> Self {
        Self(data)
    }
}

/// One finalized capture, immutable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utterance {
    bytes: Vec<u8>,
    chunks: usize,
    mime: String,
}

impl Utterance {
    /// Concatenate `chunks` in order
    ///
    /// Returns `None` when there are no chunks or they hold no bytes.
    #[must_use]
    pub fn from_chunks(chunks: Vec<AudioChunk>, mime: impl Into<String>) -> Option<Self> {
        let total: usize = chunks.iter().map(AudioChunk::len).sum();
        if total == 0 {
            return None;
        }

        let count = chunks.len();
        let mut bytes = Vec::with_capacity(total);
        for chunk in chunks {
            bytes.extend_from_slice(chunk.as_bytes());
        }

        Some(Self {
            bytes,
            chunks: count,
            mime: mime.into(),
        })
    }

    /// Concatenated payload
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Take the payload
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Number of chunks the payload was built from
    #[must_use]
    pub const fn chunk_count(&self) -> usize {
        self.chunks
    }

    /// Container tag (e.g. "audio/wav")
    #[must_use]
    pub fn mime(&self) -> &str {
        &self.mime
    }

    /// Payload size in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Always false; empty captures never become utterances
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Running recorder over an open input stream
#[async_trait]
pub trait Recorder: Send {
    /// Stop recording
    ///
    /// Resolves once the final chunk has been sent and the chunk channel is
    /// closed. Dropping a recorder without calling this must still release
    /// the stream.
    async fn stop(self: Box<Self>) -> Result<()>;
}

/// Everything an open microphone hands to a capture session
pub struct LiveInput {
    /// Frequency tap over the stream
    pub analyser: Arc<dyn FrequencyAnalyser>,
    /// Chunks in emission order; closes after the final chunk
    pub chunks: mpsc::UnboundedReceiver<AudioChunk>,
    /// Recorder handle
    pub recorder: Box<dyn Recorder>,
}

/// Platform microphone
#[async_trait]
pub trait AudioInput: Send + Sync {
    /// Open the microphone and start a recorder over it
    ///
    /// Must not return before the recorder confirmed it is running.
    ///
    /// # Errors
    ///
    /// Returns `Error::MediaAccess` if the microphone is unavailable or refused
    async fn open(&self) -> Result<LiveInput>;
}

/// How long a freshly started stream may take to deliver its first frames
const FIRST_FRAMES_TIMEOUT: Duration = Duration::from_secs(2);

/// Resources of the currently open session
struct ActiveCapture {
    analyser: Arc<dyn FrequencyAnalyser>,
    chunks: mpsc::UnboundedReceiver<AudioChunk>,
    recorder: Box<dyn Recorder>,
    started_at: Instant,
}

/// At most one open capture over an [`AudioInput`]
pub struct AudioCaptureSession {
    input: Arc<dyn AudioInput>,
    container: String,
    active: Option<ActiveCapture>,
}

impl AudioCaptureSession {
    /// Create a closed session tagging utterances with `container`
    #[must_use]
    pub fn new(input: Arc<dyn AudioInput>, container: impl Into<String>) -> Self {
        Self {
            input,
            container: container.into(),
            active: None,
        }
    }

    /// Open the microphone and start buffering chunks
    ///
    /// A session that is still open is torn down first.
    ///
    /// # Errors
    ///
    /// Returns `Error::MediaAccess` if the microphone cannot be opened
    pub async fn start(&mut self) -> Result<()> {
        if self.active.is_some() {
            tracing::warn!("capture still open at start, tearing it down");
            self.abandon();
        }

        let live = self.input.open().await?;
        self.active = Some(ActiveCapture {
            analyser: live.analyser,
            chunks: live.chunks,
            recorder: live.recorder,
            started_at: Instant::now(),
        });

        tracing::debug!(container = %self.container, "capture started");
        Ok(())
    }

    /// Whether a capture is open
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.active.is_some()
    }

    /// Analysis tap of the open capture
    #[must_use]
    pub fn analyser(&self) -> Option<Arc<dyn FrequencyAnalyser>> {
        self.active.as_ref().map(|a| Arc::clone(&a.analyser))
    }

    /// Container tag applied on finalize
    #[must_use]
    pub fn container(&self) -> &str {
        &self.container
    }

    /// Stop recording and assemble the utterance
    ///
    /// All session resources are released whether or not this succeeds.
    /// Returns `None` without a prior `start()` or when nothing was captured.
    ///
    /// # Errors
    ///
    /// Returns error if the recorder fails to stop cleanly
    pub async fn finalize(&mut self) -> Result<Option<Utterance>> {
        let Some(active) = self.active.take() else {
            return Ok(None);
        };

        let ActiveCapture {
            analyser,
            mut chunks,
            recorder,
            started_at,
        } = active;

        recorder.stop().await?;

        let mut collected = Vec::new();
        while let Some(chunk) = chunks.recv().await {
            if !chunk.is_empty() {
                collected.push(chunk);
            }
        }
        drop(analyser);

        let utterance = Utterance::from_chunks(collected, self.container.clone());
        tracing::debug!(
            elapsed_ms = u64::try_from(started_at.elapsed().as_millis()).unwrap_or(u64::MAX),
            bytes = utterance.as_ref().map_or(0, Utterance::len),
            chunks = utterance.as_ref().map_or(0, Utterance::chunk_count),
            "capture finalized"
        );

        Ok(utterance)
    }

    /// Release the open capture without producing an utterance
    pub fn abandon(&mut self) {
        if self.active.take().is_some() {
            tracing::debug!("capture abandoned");
        }
    }
}

impl std::fmt::Debug for AudioCaptureSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioCaptureSession")
            .field("container", &self.container)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

/// Captures from the default input device
///
/// The cpal stream isn't `Send`, so each capture runs on its own thread; the
/// recorder emits the whole take as one WAV chunk when stopped.
#[derive(Debug, Clone)]
pub struct CpalMicrophone {
    sample_rate: u32,
    fft_size: usize,
    smoothing: f32,
}

impl CpalMicrophone {
    /// Create a microphone source
    #[must_use]
    pub const fn new(capture: &CaptureConfig, vad: &VadConfig) -> Self {
        Self {
            sample_rate: capture.sample_rate,
            fft_size: vad.fft_size,
            smoothing: vad.smoothing,
        }
    }
}

#[async_trait]
impl AudioInput for CpalMicrophone {
    async fn open(&self) -> Result<LiveInput> {
        let analyser = Arc::new(SpectrumAnalyser::new(self.fft_size, self.smoothing)?);
        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let (done_tx, done_rx) = oneshot::channel();

        let thread_analyser = Arc::clone(&analyser);
        let preferred_rate = self.sample_rate;

        std::thread::Builder::new()
            .name("mic-capture".to_string())
            .spawn(move || {
                let buffer = Arc::new(Mutex::new(Vec::<f32>::new()));
                let (frames_tx, frames_rx) = std::sync::mpsc::sync_channel::<()>(1);
                let tap = CaptureTap {
                    analyser: thread_analyser,
                    buffer: Arc::clone(&buffer),
                    first_frames: Some(frames_tx),
                };

                let (stream, sample_rate) = match open_input_stream(preferred_rate, tap) {
                    Ok(opened) => opened,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(Error::MediaAccess(e.to_string())));
                    return;
                }

                // Running means audio is flowing, not just that play() returned
                if frames_rx.recv_timeout(FIRST_FRAMES_TIMEOUT).is_err() {
                    let _ = ready_tx.send(Err(Error::MediaAccess(format!(
                        "input stream delivered no audio within {FIRST_FRAMES_TIMEOUT:?}"
                    ))));
                    return;
                }
                let _ = ready_tx.send(Ok(sample_rate));

                // Blocks until stop() or drop of the recorder
                let _ = stop_rx.recv();
                drop(stream);

                let samples = buffer
                    .lock()
                    .map(|mut buf| std::mem::take(&mut *buf))
                    .unwrap_or_default();

                if !samples.is_empty() {
                    match samples_to_wav(&samples, sample_rate) {
                        Ok(wav) => {
                            let _ = chunk_tx.send(AudioChunk::new(wav));
                        }
                        Err(e) => tracing::error!(error = %e, "failed to encode capture"),
                    }
                }
                drop(chunk_tx);
                let _ = done_tx.send(());
            })?;

        let sample_rate = ready_rx
            .await
            .map_err(|_| Error::MediaAccess("capture thread exited before starting".to_string()))??;

        tracing::debug!(sample_rate, "microphone recording");

        Ok(LiveInput {
            analyser,
            chunks: chunk_rx,
            recorder: Box::new(CpalRecorder {
                stop_tx: Some(stop_tx),
                done_rx: Some(done_rx),
            }),
        })
    }
}

/// Where the input callback writes
struct CaptureTap {
    analyser: Arc<SpectrumAnalyser>,
    buffer: Arc<Mutex<Vec<f32>>>,
    /// Fired once, on the first non-empty callback
    first_frames: Option<std::sync::mpsc::SyncSender<()>>,
}

impl CaptureTap {
    fn push(&mut self, mono: &[f32]) {
        if mono.is_empty() {
            return;
        }
        self.analyser.push_samples(mono);
        if let Ok(mut buf) = self.buffer.lock() {
            buf.extend_from_slice(mono);
        }
        if let Some(tx) = self.first_frames.take() {
            let _ = tx.try_send(());
        }
    }
}

/// Handle to the capture thread
struct CpalRecorder {
    stop_tx: Option<std::sync::mpsc::Sender<()>>,
    done_rx: Option<oneshot::Receiver<()>>,
}

#[async_trait]
impl Recorder for CpalRecorder {
    async fn stop(mut self: Box<Self>) -> Result<()> {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(rx) = self.done_rx.take() {
            rx.await
                .map_err(|_| Error::Audio("capture thread exited without flushing".to_string()))?;
        }
        tracing::debug!("microphone released");
        Ok(())
    }
}

impl Drop for CpalRecorder {
    fn drop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Open the default input device, preferring mono at `preferred_rate`
fn open_input_stream(preferred_rate: u32, tap: CaptureTap) -> Result<(Stream, u32)> {
    let host = cpal::default_host();

    let device = host
        .default_input_device()
        .ok_or_else(|| Error::MediaAccess("no input device available".to_string()))?;

    let preferred = device
        .supported_input_configs()
        .map_err(|e| Error::MediaAccess(e.to_string()))?
        .find(|c| {
            c.channels() == 1
                && c.min_sample_rate() <= SampleRate(preferred_rate)
                && c.max_sample_rate() >= SampleRate(preferred_rate)
        })
        .map(|c| c.with_sample_rate(SampleRate(preferred_rate)));

    let supported = match preferred {
        Some(config) => config,
        None => device
            .default_input_config()
            .map_err(|e| Error::MediaAccess(e.to_string()))?,
    };

    let sample_format = supported.sample_format();
    let config = supported.config();

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate = config.sample_rate.0,
        channels = config.channels,
        ?sample_format,
        "audio capture initialized"
    );

    let stream = match sample_format {
        SampleFormat::F32 => build_input_stream::<f32>(&device, &config, tap)?,
        SampleFormat::I16 => build_input_stream::<i16>(&device, &config, tap)?,
        SampleFormat::U16 => build_input_stream::<u16>(&device, &config, tap)?,
        other => {
            return Err(Error::MediaAccess(format!(
                "unsupported input sample format {other:?}"
            )));
        }
    };

    Ok((stream, config.sample_rate.0))
}

fn build_input_stream<T>(device: &Device, config: &StreamConfig, mut tap: CaptureTap) -> Result<Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = usize::from(config.channels.max(1));

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                #[allow(clippy::cast_precision_loss)]
                let mono: Vec<f32> = data
                    .chunks(channels)
                    .map(|frame| {
                        frame.iter().map(|&s| s.to_sample::<f32>()).sum::<f32>()
                            / frame.len() as f32
                    })
                    .collect();
                tap.push(&mono);
            },
            |err| {
                tracing::error!(error = %err, "audio capture error");
            },
            None,
        )
        .map_err(|e| Error::MediaAccess(e.to_string()))
}

/// Convert f32 samples to mono 16-bit WAV bytes
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in samples {
            // Convert f32 [-1.0, 1.0] to i16
            #[allow(clippy::cast_possible_truncation)]
            let sample_i16 = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            writer
                .write_sample(sample_i16)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}
