//! Utterance controller
//!
//! Runs one voice session at a time through
//! `Idle → [PlayingWelcome] → Starting → Recording → Finalizing → Submitting →
//! PlayingResponse → Idle`.
//!
//! The `watch` channel holding [`ControllerStatus`] is the only copy of the
//! state. Every transition after a suspension point is a compare-and-set on
//! it keyed by session id, so a stale task can never move a newer session.

mod events;
mod state;

pub use events::{ControllerEvent, StopTrigger};
pub use state::{Activation, ControllerStatus, SessionState, WelcomeFlag};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, broadcast, watch};

use crate::config::Config;
use crate::remote::{HttpVoiceClient, RemoteVoiceClient};
use crate::voice::{
    AmplitudeMonitor, AudioCaptureSession, CpalMicrophone, CpalSink, MonitorExit,
    PlaybackService, RecordingGate, Utterance,
};
use crate::{Error, Result};

/// Event channel depth; slow subscribers lag rather than block
const EVENT_CAPACITY: usize = 64;

/// Controller tuning
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Play the welcome prompt on the first activation
    pub welcome_enabled: bool,
    /// Mean level below which a frame counts as silent
    pub silence_threshold: f32,
    /// Monitor tick interval
    pub frame_interval: Duration,
    /// Upper bound for the submit round trip
    pub submit_timeout: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for ControllerSettings {
    fn from(config: &Config) -> Self {
        Self {
            welcome_enabled: config.welcome.enabled,
            silence_threshold: config.vad.silence_threshold,
            frame_interval: config.vad.frame_interval,
            submit_timeout: config.remote.submit_timeout,
        }
    }
}

/// Push-to-talk state machine
///
/// Cheap to clone; clones share the same session.
#[derive(Clone)]
pub struct UtteranceController {
    inner: Arc<Inner>,
}

struct Inner {
    status: watch::Sender<ControllerStatus>,
    events: broadcast::Sender<ControllerEvent>,
    capture: Mutex<AudioCaptureSession>,
    playback: PlaybackService,
    remote: Arc<dyn RemoteVoiceClient>,
    welcome: WelcomeFlag,
    settings: ControllerSettings,
}

impl UtteranceController {
    /// Create an idle controller
    #[must_use]
    pub fn new(
        capture: AudioCaptureSession,
        playback: PlaybackService,
        remote: Arc<dyn RemoteVoiceClient>,
        settings: ControllerSettings,
    ) -> Self {
        let (status, _) = watch::channel(ControllerStatus::default());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        tracing::debug!(?settings, "utterance controller created");

        Self {
            inner: Arc::new(Inner {
                status,
                events,
                capture: Mutex::new(capture),
                playback,
                remote,
                welcome: WelcomeFlag::new(),
                settings,
            }),
        }
    }

    /// Create a controller over the default microphone, speakers and the
    /// configured HTTP endpoint
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let input = Arc::new(CpalMicrophone::new(&config.capture, &config.vad));
        let capture = AudioCaptureSession::new(input, config.capture.container.clone());
        let playback = PlaybackService::new(Arc::new(CpalSink::new()));
        let remote = Arc::new(HttpVoiceClient::new(&config.remote));

        Self::new(capture, playback, remote, ControllerSettings::from(config))
    }

    /// Handle a push-to-talk press
    ///
    /// From `Idle` this starts a session; while `Recording` it stops the
    /// recording; in every other state it is ignored. Must be called from
    /// within a Tokio runtime.
    pub fn activate(&self) -> Activation {
        let current = self.status();
        match current.state {
            SessionState::Idle => self.start_session(),
            SessionState::Recording => {
                if self.stop_recording(current.session) {
                    Activation::Stopping {
                        session: current.session,
                    }
                } else {
                    self.ignored()
                }
            }
            state => {
                tracing::debug!(session = current.session, %state, "activation ignored, busy");
                Activation::Ignored { state }
            }
        }
    }

    /// Stop the current recording
    ///
    /// Returns false unless a session was `Recording`.
    pub fn deactivate(&self) -> bool {
        let current = self.status();
        if current.state != SessionState::Recording {
            tracing::debug!(state = %current.state, "deactivate ignored, not recording");
            return false;
        }
        self.stop_recording(current.session)
    }

    /// Stop any recording and let the session in flight run to `Idle`
    ///
    /// A session still opening the microphone is stopped as soon as it
    /// reaches `Recording`. Returns false if `Idle` was not reached within
    /// `limit`.
    pub async fn shutdown(&self, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        let mut rx = self.watch();

        loop {
            let status = *rx.borrow_and_update();
            match status.state {
                SessionState::Idle => return true,
                SessionState::Recording => {
                    self.stop_recording(status.session);
                }
                _ => {}
            }

            if !matches!(tokio::time::timeout_at(deadline, rx.changed()).await, Ok(Ok(()))) {
                let state = self.status().state;
                if state != SessionState::Idle {
                    tracing::warn!(%state, "shutdown deadline passed before the session finished");
                }
                return state == SessionState::Idle;
            }
        }
    }

    /// Snapshot of the live state
    #[must_use]
    pub fn status(&self) -> ControllerStatus {
        *self.inner.status.borrow()
    }

    /// Receiver that observes every state change
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<ControllerStatus> {
        self.inner.status.subscribe()
    }

    /// Whether the microphone is live
    #[must_use]
    pub fn is_recording(&self) -> bool {
        self.status().state == SessionState::Recording
    }

    /// Whether the pipeline is working and won't accept a new session
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.status().state.is_busy()
    }

    /// Whether the welcome prompt has been attempted
    #[must_use]
    pub fn welcome_attempted(&self) -> bool {
        self.inner.welcome.is_claimed()
    }

    /// Receive controller events from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.inner.events.subscribe()
    }

    fn ignored(&self) -> Activation {
        Activation::Ignored {
            state: self.status().state,
        }
    }

    fn start_session(&self) -> Activation {
        let inner = &self.inner;
        let mut started = None;

        inner.status.send_if_modified(|status| {
            if status.state != SessionState::Idle {
                return false;
            }
            let first = inner.welcome.claim();
            let welcome = first && inner.settings.welcome_enabled;
            status.session += 1;
            status.state = if welcome {
                SessionState::PlayingWelcome
            } else {
                SessionState::Starting
            };
            started = Some((status.session, status.state, welcome));
            true
        });

        let Some((session, state, welcome)) = started else {
            return self.ignored();
        };

        tracing::info!(session, from = %SessionState::Idle, to = %state, "state transition");
        tokio::spawn(Arc::clone(inner).run_session(session, welcome));
        Activation::Started { session }
    }

    fn stop_recording(&self, session: u64) -> bool {
        if !self
            .inner
            .transition(session, SessionState::Recording, SessionState::Finalizing)
        {
            return false;
        }
        tokio::spawn(Arc::clone(&self.inner).run_stop(session));
        true
    }
}

impl std::fmt::Debug for UtteranceController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UtteranceController")
            .field("status", &self.status())
            .field("welcome_attempted", &self.welcome_attempted())
            .finish_non_exhaustive()
    }
}

impl Inner {
    /// Move `session` from `from` to `to` if it is still there
    fn transition(&self, session: u64, from: SessionState, to: SessionState) -> bool {
        let moved = self.status.send_if_modified(|status| {
            if status.session == session && status.state == from {
                status.state = to;
                true
            } else {
                false
            }
        });

        if moved {
            tracing::info!(session, from = %from, to = %to, "state transition");
        } else {
            tracing::debug!(session, expected = %from, to = %to, "transition skipped, state moved on");
        }
        moved
    }

    fn emit(&self, event: ControllerEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn fail(&self, session: u64, error: &Error) {
        let kind = error.kind();
        tracing::error!(session, ?kind, error = %error, "voice session failed");
        self.emit(ControllerEvent::Failed {
            session,
            kind,
            message: error.to_string(),
        });
    }

    /// Session task: welcome, start, monitor, and the pipeline if silence wins
    async fn run_session(self: Arc<Self>, session: u64, welcome: bool) {
        let mut guard = IdleGuard::new(&self, session);

        if welcome {
            if let Err(e) = self.play_welcome().await {
                self.fail(session, &e);
                return;
            }
            self.emit(ControllerEvent::WelcomePlayed { session });
            if !self.transition(session, SessionState::PlayingWelcome, SessionState::Starting) {
                return;
            }
        }

        let analyser = {
            let mut capture = self.capture.lock().await;
            if let Err(e) = capture.start().await {
                self.fail(session, &e);
                return;
            }
            capture.analyser()
        };
        let Some(analyser) = analyser else {
            self.fail(session, &Error::Audio("capture opened without an analyser".to_string()));
            return;
        };

        if !self.transition(session, SessionState::Starting, SessionState::Recording) {
            return;
        }
        self.emit(ControllerEvent::RecordingStarted { session });

        let monitor = AmplitudeMonitor::new(analyser, self.settings.silence_threshold);
        let gate = SessionGate {
            status: &self.status,
            session,
        };

        match monitor.run(self.settings.frame_interval, &gate).await {
            MonitorExit::Silence => {
                if self.transition(session, SessionState::Recording, SessionState::Finalizing) {
                    self.finish(session, StopTrigger::Vad).await;
                } else {
                    // A manual stop got there first and owns the rest
                    guard.disarm();
                }
            }
            MonitorExit::SessionEnded => guard.disarm(),
        }
    }

    /// Stop task spawned by a manual stop
    async fn run_stop(self: Arc<Self>, session: u64) {
        let _guard = IdleGuard::new(&self, session);
        self.finish(session, StopTrigger::Manual).await;
    }

    async fn play_welcome(&self) -> Result<()> {
        let prompt = self.remote.fetch_welcome_prompt().await?;
        self.playback.play(&prompt).await
    }

    /// Finalizing through to Idle
    async fn finish(&self, session: u64, trigger: StopTrigger) {
        let finalized = self.capture.lock().await.finalize().await;

        let utterance = match finalized {
            Ok(Some(utterance)) => utterance,
            Ok(None) => {
                tracing::info!(session, ?trigger, "nothing captured, utterance discarded");
                self.emit(ControllerEvent::UtteranceDiscarded { session, trigger });
                self.transition(session, SessionState::Finalizing, SessionState::Idle);
                return;
            }
            Err(e) => {
                self.fail(session, &e);
                return;
            }
        };

        tracing::debug!(
            session,
            ?trigger,
            bytes = utterance.len(),
            chunks = utterance.chunk_count(),
            "utterance captured"
        );
        self.emit(ControllerEvent::UtteranceCaptured {
            session,
            trigger,
            bytes: utterance.len(),
            chunks: utterance.chunk_count(),
        });

        if !self.transition(session, SessionState::Finalizing, SessionState::Submitting) {
            return;
        }

        let reply = match self.submit(utterance).await {
            Ok(reply) => reply,
            Err(e) => {
                self.fail(session, &e);
                return;
            }
        };
        self.emit(ControllerEvent::Submitted {
            session,
            reply_bytes: reply.data.len(),
        });

        if !self.transition(session, SessionState::Submitting, SessionState::PlayingResponse) {
            return;
        }

        if let Err(e) = self.playback.play(&reply).await {
            self.fail(session, &e);
            return;
        }
        self.emit(ControllerEvent::ResponsePlayed { session });
        self.transition(session, SessionState::PlayingResponse, SessionState::Idle);
    }

    async fn submit(&self, utterance: Utterance) -> Result<crate::voice::AudioPayload> {
        let limit = self.settings.submit_timeout;
        let mime = utterance.mime().to_string();

        tokio::time::timeout(limit, self.remote.submit(utterance.into_bytes(), &mime))
            .await
            .map_err(|_| Error::SubmissionTimeout(limit))?
    }
}

/// Lets the monitor sample only while its session is recording
///
/// Holds the state cell's read borrow across the check and the sample, so a
/// concurrent stop waits for the sample to finish.
struct SessionGate<'a> {
    status: &'a watch::Sender<ControllerStatus>,
    session: u64,
}

impl RecordingGate for SessionGate<'_> {
    fn while_recording<R>(&self, sample: impl FnOnce() -> R) -> Option<R> {
        let status = self.status.borrow();
        (status.session == self.session && status.state == SessionState::Recording)
            .then(sample)
    }
}

/// Returns the controller to `Idle` if a task exits while its session is
/// still active, including on panic
struct IdleGuard<'a> {
    inner: &'a Inner,
    session: u64,
    armed: bool,
}

impl<'a> IdleGuard<'a> {
    const fn new(inner: &'a Inner, session: u64) -> Self {
        Self {
            inner,
            session,
            armed: true,
        }
    }

    /// Hand the session over to another task
    const fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for IdleGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let session = self.session;
        let mut left = None;
        self.inner.status.send_if_modified(|status| {
            if status.session == session && status.state != SessionState::Idle {
                left = Some(status.state);
                status.state = SessionState::Idle;
                true
            } else {
                false
            }
        });

        if let Some(from) = left {
            if let Ok(mut capture) = self.inner.capture.try_lock() {
                capture.abandon();
            }
            tracing::info!(session, from = %from, to = %SessionState::Idle, "state transition");
        }
    }
}
