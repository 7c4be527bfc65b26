//! Shared test utilities
//!
//! Hardware-free stand-ins for the microphone, speakers and speech endpoint.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc, watch};

use beacon_talk::controller::ControllerSettings;
use beacon_talk::voice::{
    AudioCaptureSession, AudioChunk, AudioInput, AudioPayload, AudioSink, Clip,
    FrequencyAnalyser, LiveInput, PlaybackService, Recorder, samples_to_wav,
};
use beacon_talk::{
    ControllerEvent, ControllerStatus, Error, RemoteVoiceClient, Result, SessionState,
    UtteranceController,
};

/// Level above the silence threshold
pub const LOUD: u8 = 120;

/// Level below the silence threshold
pub const QUIET: u8 = 3;

/// Short valid WAV payload
#[must_use]
pub fn wav_bytes(samples: usize) -> Vec<u8> {
    samples_to_wav(&vec![0.25; samples], 16000).expect("wav encode")
}

/// Fills every bin with the next scripted level, then `fallback` forever
///
/// Behaves like a window still filling for the first `warmup` frames: not
/// primed, and every bin reads zero.
pub struct ScriptedAnalyser {
    script: Mutex<VecDeque<u8>>,
    fallback: u8,
    warmup: AtomicUsize,
    reads: Arc<AtomicUsize>,
}

impl FrequencyAnalyser for ScriptedAnalyser {
    fn frequency_bin_count(&self) -> usize {
        32
    }

    fn byte_frequency_data(&self, out: &mut [u8]) {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.warmup.load(Ordering::SeqCst) > 0 {
            out.fill(0);
            return;
        }
        let level = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.fallback);
        out.fill(level);
    }

    fn is_primed(&self) -> bool {
        // Each poll stands for one frame arriving
        self.warmup
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_err()
    }
}

/// Microphone whose recorder emits scripted chunks when stopped
pub struct FakeInput {
    levels: Mutex<Vec<u8>>,
    fallback: Mutex<u8>,
    chunks: Mutex<Vec<Vec<u8>>>,
    flush_delay: Mutex<Duration>,
    warmup: AtomicUsize,
    deny: AtomicBool,
    pub opens: AtomicUsize,
    pub stops: Arc<AtomicUsize>,
    pub reads: Arc<AtomicUsize>,
    live: Arc<AtomicUsize>,
    pub max_live: Arc<AtomicUsize>,
}

impl FakeInput {
    /// Each open plays `levels` then stays at `fallback`
    #[must_use]
    pub fn new(levels: impl IntoIterator<Item = u8>, fallback: u8) -> Arc<Self> {
        Arc::new(Self {
            levels: Mutex::new(levels.into_iter().collect()),
            fallback: Mutex::new(fallback),
            chunks: Mutex::new(vec![b"c1".to_vec(), b"c2".to_vec(), b"c3".to_vec()]),
            flush_delay: Mutex::new(Duration::ZERO),
            warmup: AtomicUsize::new(0),
            deny: AtomicBool::new(false),
            opens: AtomicUsize::new(0),
            stops: Arc::new(AtomicUsize::new(0)),
            reads: Arc::new(AtomicUsize::new(0)),
            live: Arc::new(AtomicUsize::new(0)),
            max_live: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Silent from the first frame
    #[must_use]
    pub fn silent() -> Arc<Self> {
        Self::new([], QUIET)
    }

    /// Never silent
    #[must_use]
    pub fn loud() -> Arc<Self> {
        Self::new([], LOUD)
    }

    pub fn set_chunks(&self, chunks: Vec<Vec<u8>>) {
        *self.chunks.lock().unwrap() = chunks;
    }

    pub fn set_levels(&self, levels: impl IntoIterator<Item = u8>, fallback: u8) {
        *self.levels.lock().unwrap() = levels.into_iter().collect();
        *self.fallback.lock().unwrap() = fallback;
    }

    pub fn set_flush_delay(&self, delay: Duration) {
        *self.flush_delay.lock().unwrap() = delay;
    }

    /// Frames each new capture needs before its analyser is primed
    pub fn set_warmup(&self, frames: usize) {
        self.warmup.store(frames, Ordering::SeqCst);
    }

    pub fn deny(&self, deny: bool) {
        self.deny.store(deny, Ordering::SeqCst);
    }

    /// Sessions currently holding the microphone
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioInput for FakeInput {
    async fn open(&self) -> Result<LiveInput> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(Error::MediaAccess("permission denied".to_string()));
        }

        self.opens.fetch_add(1, Ordering::SeqCst);
        let now_live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live.fetch_max(now_live, Ordering::SeqCst);

        let analyser = ScriptedAnalyser {
            script: Mutex::new(self.levels.lock().unwrap().iter().copied().collect()),
            fallback: *self.fallback.lock().unwrap(),
            warmup: AtomicUsize::new(self.warmup.load(Ordering::SeqCst)),
            reads: Arc::clone(&self.reads),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        Ok(LiveInput {
            analyser: Arc::new(analyser),
            chunks: rx,
            recorder: Box::new(FakeRecorder {
                chunks: self.chunks.lock().unwrap().clone(),
                flush_delay: *self.flush_delay.lock().unwrap(),
                tx: Some(tx),
                stops: Arc::clone(&self.stops),
                live: Arc::clone(&self.live),
                released: false,
            }),
        })
    }
}

struct FakeRecorder {
    chunks: Vec<Vec<u8>>,
    flush_delay: Duration,
    tx: Option<mpsc::UnboundedSender<AudioChunk>>,
    stops: Arc<AtomicUsize>,
    live: Arc<AtomicUsize>,
    released: bool,
}

impl FakeRecorder {
    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl Recorder for FakeRecorder {
    async fn stop(mut self: Box<Self>) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if !self.flush_delay.is_zero() {
            tokio::time::sleep(self.flush_delay).await;
        }
        if let Some(tx) = self.tx.take() {
            for chunk in std::mem::take(&mut self.chunks) {
                let _ = tx.send(AudioChunk::new(chunk));
            }
        }
        self.release();
        Ok(())
    }
}

impl Drop for FakeRecorder {
    fn drop(&mut self) {
        self.release();
    }
}

/// How the fake endpoint answers
#[derive(Debug, Clone)]
pub enum Reply {
    /// 200 with this body
    Audio(AudioPayload),
    /// Non-success status
    Status(u16),
    /// Never answers
    Hang,
}

impl Reply {
    #[must_use]
    pub fn wav() -> Self {
        Self::Audio(AudioPayload::new(wav_bytes(160), "audio/wav"))
    }
}

/// In-memory speech endpoint
pub struct FakeRemote {
    submit_reply: Mutex<Reply>,
    welcome_reply: Mutex<Reply>,
    hold: Mutex<Option<Arc<Notify>>>,
    pub submissions: Mutex<Vec<(Vec<u8>, String)>>,
    pub welcome_fetches: AtomicUsize,
}

impl FakeRemote {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            submit_reply: Mutex::new(Reply::wav()),
            welcome_reply: Mutex::new(Reply::wav()),
            hold: Mutex::new(None),
            submissions: Mutex::new(Vec::new()),
            welcome_fetches: AtomicUsize::new(0),
        })
    }

    pub fn set_submit_reply(&self, reply: Reply) {
        *self.submit_reply.lock().unwrap() = reply;
    }

    pub fn set_welcome_reply(&self, reply: Reply) {
        *self.welcome_reply.lock().unwrap() = reply;
    }

    /// Hold submissions until the returned notify fires
    pub fn hold_submissions(&self) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        *self.hold.lock().unwrap() = Some(Arc::clone(&notify));
        notify
    }

    pub fn submission_count(&self) -> usize {
        self.submissions.lock().unwrap().len()
    }

    async fn answer(reply: Reply) -> Result<AudioPayload> {
        match reply {
            Reply::Audio(payload) => Ok(payload),
            Reply::Status(status) => Err(Error::RemoteProcessing {
                status,
                body: "boom".to_string(),
            }),
            Reply::Hang => std::future::pending().await,
        }
    }
}

#[async_trait]
impl RemoteVoiceClient for FakeRemote {
    async fn submit(&self, audio: Vec<u8>, content_type: &str) -> Result<AudioPayload> {
        self.submissions
            .lock()
            .unwrap()
            .push((audio, content_type.to_string()));

        let hold = self.hold.lock().unwrap().clone();
        if let Some(notify) = hold {
            notify.notified().await;
        }

        let reply = self.submit_reply.lock().unwrap().clone();
        Self::answer(reply).await
    }

    async fn fetch_welcome_prompt(&self) -> Result<AudioPayload> {
        self.welcome_fetches.fetch_add(1, Ordering::SeqCst);
        let reply = self.welcome_reply.lock().unwrap().clone();
        Self::answer(reply).await
    }
}

/// Speakers that record what they were asked to play
#[derive(Default)]
pub struct RecordingSink {
    pub clips: Mutex<Vec<Clip>>,
    fail: AtomicBool,
    panic: AtomicBool,
}

impl RecordingSink {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn panic_on_play(&self, panic: bool) {
        self.panic.store(panic, Ordering::SeqCst);
    }

    pub fn played(&self) -> usize {
        self.clips.lock().unwrap().len()
    }
}

#[async_trait]
impl AudioSink for RecordingSink {
    async fn play(&self, clip: Clip) -> Result<()> {
        assert!(!self.panic.load(Ordering::SeqCst), "speaker exploded");
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Playback("device lost".to_string()));
        }
        // Playback takes as long as the clip
        tokio::time::sleep(clip.duration()).await;
        self.clips.lock().unwrap().push(clip);
        Ok(())
    }
}

/// Controller wired to fakes
pub struct Harness {
    pub controller: UtteranceController,
    pub input: Arc<FakeInput>,
    pub remote: Arc<FakeRemote>,
    pub sink: Arc<RecordingSink>,
}

impl Harness {
    #[must_use]
    pub fn new(input: Arc<FakeInput>, welcome: bool) -> Self {
        Self::with_settings(input, settings(welcome))
    }

    #[must_use]
    pub fn with_settings(input: Arc<FakeInput>, settings: ControllerSettings) -> Self {
        let remote = FakeRemote::new();
        let sink = RecordingSink::new();
        let capture = AudioCaptureSession::new(input.clone(), "audio/wav");
        let playback = PlaybackService::new(sink.clone());
        let controller = UtteranceController::new(capture, playback, remote.clone(), settings);

        Self {
            controller,
            input,
            remote,
            sink,
        }
    }

    /// Wait until the live status satisfies `predicate`
    pub async fn wait_for(&self, predicate: impl FnMut(&ControllerStatus) -> bool) -> ControllerStatus {
        wait_for(&mut self.controller.watch(), predicate).await
    }

    /// Wait until `session` is back to idle
    pub async fn wait_idle(&self, session: u64) {
        self.wait_for(|s| s.session == session && s.state == SessionState::Idle)
            .await;
    }

    /// Wait until `session` reaches `state`
    pub async fn wait_state(&self, session: u64, state: SessionState) {
        self.wait_for(|s| s.session == session && s.state == state)
            .await;
    }
}

/// Default controller settings for tests
#[must_use]
pub fn settings(welcome: bool) -> ControllerSettings {
    ControllerSettings {
        welcome_enabled: welcome,
        silence_threshold: 5.0,
        frame_interval: Duration::from_millis(16),
        submit_timeout: Duration::from_secs(30),
    }
}

/// Wait on a status receiver with a generous bound
pub async fn wait_for(
    rx: &mut watch::Receiver<ControllerStatus>,
    mut predicate: impl FnMut(&ControllerStatus) -> bool,
) -> ControllerStatus {
    let status = tokio::time::timeout(Duration::from_secs(300), rx.wait_for(|s| predicate(s)))
        .await
        .expect("controller never reached the expected status")
        .expect("controller dropped");
    *status
}

/// Everything received so far
pub fn drain(rx: &mut tokio::sync::broadcast::Receiver<ControllerEvent>) -> Vec<ControllerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
