//! Session state machine: `idle → connecting → connected → {closed, error} → idle`.
//!
//! Every external callback arrives as a [`SessionEvent`] and is handled by a
//! named method here. Events tagged with an id other than the active
//! session's are stale and dropped.

use crate::audio::device::{AudioBackend, BufferId, CaptureContext, ContextState, OutputContext};
use crate::config::Config;
use crate::error::{Result, VoxliveError};
use crate::session::capture::CapturePipeline;
use crate::session::playback::PlaybackScheduler;
use crate::session::state::{Language, SessionId, SessionState, SessionStatus};
use crate::session::{EventSender, SessionEvent};
use crate::transport::{ServerMessage, TransportConnector, TransportEvent, TransportHandle};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub struct SessionController {
    config: Config,
    backend: Arc<dyn AudioBackend>,
    connector: Arc<dyn TransportConnector>,
    events: EventSender,

    capture_ctx: Option<Box<dyn CaptureContext>>,
    output_ctx: Option<Box<dyn OutputContext>>,
    capture: CapturePipeline,
    playback: PlaybackScheduler,
    transport: Option<Box<dyn TransportHandle>>,

    generation: SessionId,
    active: Option<SessionId>,
    state: SessionState,
    language: Language,
    last_error: Option<String>,
    /// Set by a barge-in flush, cleared when the model sends audio again.
    interrupted: bool,

    status: watch::Sender<SessionStatus>,
}

impl SessionController {
    pub fn new(
        config: Config,
        backend: Arc<dyn AudioBackend>,
        connector: Arc<dyn TransportConnector>,
        events: EventSender,
    ) -> Self {
        let language = config.session.language;
        let capture = CapturePipeline::new(
            config.vad.to_vad_config(),
            config.audio.frame_size,
            config.audio.capture_rate,
        );
        let playback = PlaybackScheduler::new(config.audio.playback_rate, config.audio.lead_gap_ms);
        let (status, _) = watch::channel(SessionStatus {
            language,
            ..SessionStatus::default()
        });
        Self {
            config,
            backend,
            connector,
            events,
            capture_ctx: None,
            output_ctx: None,
            capture,
            playback,
            transport: None,
            generation: SessionId::default(),
            active: None,
            state: SessionState::Idle,
            language,
            last_error: None,
            interrupted: false,
            status,
        }
    }

    /// Opens a new session. A session that is already running is stopped first.
    ///
    /// Credentials and config values are checked before any device is
    /// touched. On failure the error is recorded for display and the
    /// controller is back in `Idle`.
    pub async fn start(&mut self) -> Result<SessionId> {
        if self.state.is_active() {
            info!(state = %self.state, "start while active, tearing down previous session");
            self.stop();
        }
        self.last_error = None;

        let checked = self
            .config
            .require_api_key()
            .map(|_| ())
            .and_then(|()| self.config.validate());
        if let Err(e) = checked {
            self.fail(&e);
            return Err(e);
        }

        match self.open_session().await {
            Ok(session) => Ok(session),
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    async fn open_session(&mut self) -> Result<SessionId> {
        self.ensure_contexts()?;

        if let Some(output) = self.output_ctx.as_mut() {
            output.resume().await?;
        }
        let constraints = self.config.audio.microphone_constraints();
        let microphone = match self.capture_ctx.as_mut() {
            Some(capture) => {
                capture.resume().await?;
                capture.open_microphone(&constraints).await?
            }
            None => {
                return Err(VoxliveError::AudioDevice {
                    message: "capture context unavailable".to_string(),
                });
            }
        };
        self.capture.attach(microphone);

        let now = self.output_ctx.as_ref().map_or(0.0, |ctx| ctx.current_time());
        self.playback.reset(now);

        self.generation = self.generation.next();
        let session = self.generation;
        self.active = Some(session);

        let setup = self.config.live_setup(self.language);
        self.transport = Some(self.connector.connect(setup, session, self.events.clone())?);

        self.state = SessionState::Connecting;
        info!(%session, language = %self.language, "session connecting");
        self.publish();
        Ok(session)
    }

    fn ensure_contexts(&mut self) -> Result<()> {
        let stale = |state: ContextState| state == ContextState::Closed;

        if self.output_ctx.as_ref().is_none_or(|ctx| stale(ctx.state())) {
            let events = self.events.clone();
            let on_ended = Arc::new(move |buffer: BufferId| {
                if events.send(SessionEvent::PlaybackEnded { buffer }).is_err() {
                    debug!(%buffer, "session loop gone, completion dropped");
                }
            });
            self.output_ctx = Some(
                self.backend
                    .create_output_context(self.config.audio.playback_rate, on_ended)?,
            );
            debug!(rate = self.config.audio.playback_rate, "output context created");
        }

        if self.capture_ctx.as_ref().is_none_or(|ctx| stale(ctx.state())) {
            self.capture_ctx = Some(
                self.backend
                    .create_capture_context(self.config.audio.capture_rate)?,
            );
            debug!(rate = self.config.audio.capture_rate, "capture context created");
        }
        Ok(())
    }

    /// Dispatches one event to its handler.
    pub fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Transport { session, event } => {
                if !self.is_current(session) {
                    debug!(%session, ?event, "dropping stale transport event");
                    return;
                }
                match event {
                    TransportEvent::Open => self.on_transport_open(),
                    TransportEvent::Message(message) => self.on_transport_message(&message),
                    TransportEvent::Close => self.on_transport_close(),
                    TransportEvent::Error(message) => self.on_transport_error(&message),
                }
            }
            SessionEvent::CaptureFrame { session, samples } => {
                if self.is_current(session) {
                    self.on_capture_frame(&samples);
                }
            }
            SessionEvent::PlaybackEnded { buffer } => self.on_buffer_ended(buffer),
        }
    }

    fn is_current(&self, session: SessionId) -> bool {
        self.active == Some(session)
    }

    pub fn on_transport_open(&mut self) {
        if self.state != SessionState::Connecting {
            debug!(state = %self.state, "ignoring open outside connecting");
            return;
        }
        let Some(session) = self.active else {
            return;
        };
        self.interrupted = false;
        if let Err(e) = self.capture.wire(session, self.events.clone()) {
            self.fail(&e);
            return;
        }
        self.state = SessionState::Connected;
        info!(%session, "session connected");
        self.publish();
    }

    pub fn on_transport_message(&mut self, message: &ServerMessage) {
        let payloads = message.audio_payloads();
        if !payloads.is_empty() {
            self.interrupted = false;
            if let Some(output) = self.output_ctx.as_deref_mut() {
                for payload in payloads {
                    if let Err(e) = self.playback.enqueue(output, payload) {
                        warn!("Dropping inbound audio chunk: {}", e);
                    }
                }
            }
        }

        if message.interrupted() {
            info!("model reported interruption");
            self.interrupt();
        }
        self.publish();
    }

    pub fn on_transport_close(&mut self) {
        info!(session = ?self.active, "transport closed");
        self.state = SessionState::Closed;
        self.publish();
        self.stop();
    }

    pub fn on_transport_error(&mut self, message: &str) {
        error!("Transport error: {}", message);
        self.fail(&VoxliveError::Transport {
            message: message.to_string(),
        });
    }

    /// The connect deadline for `session` passed. Ignored once it opened.
    pub fn on_connect_timeout(&mut self, session: SessionId, waited: Duration) {
        if !self.is_current(session) || self.state != SessionState::Connecting {
            return;
        }
        self.fail(&VoxliveError::Transport {
            message: format!("no response from the model after {} ms", waited.as_millis()),
        });
    }

    pub fn on_capture_frame(&mut self, samples: &[f32]) {
        if self.state != SessionState::Connected {
            return;
        }
        let Some(output) = self.output_ctx.as_deref_mut() else {
            return;
        };
        let outcome = self.capture.process_frame(
            samples,
            &mut self.playback,
            output,
            self.transport.as_mut(),
        );
        if outcome.barged_in {
            self.interrupted = true;
        }
        self.publish();
    }

    pub fn on_buffer_ended(&mut self, buffer: BufferId) {
        if self.playback.on_buffer_ended(buffer) {
            self.publish();
        } else {
            debug!(%buffer, "completion for unknown buffer");
        }
    }

    fn interrupt(&mut self) {
        if self.interrupted {
            return;
        }
        if let Some(output) = self.output_ctx.as_deref_mut()
            && !self.playback.is_empty()
        {
            self.playback.flush(output);
            self.interrupted = true;
        }
    }

    /// Records a user-visible error, then tears down to `Idle`.
    fn fail(&mut self, e: &VoxliveError) {
        warn!(category = ?e.category(), "session failed: {}", e);
        self.last_error = Some(e.user_message());
        self.state = SessionState::Error;
        self.publish();
        self.stop();
    }

    /// Tears the session down to `Idle`. Idempotent; device contexts stay open.
    pub fn stop(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        self.capture.teardown();

        match self.output_ctx.as_deref_mut() {
            Some(output) => self.playback.flush(output),
            None => self.playback.reset(0.0),
        }

        let was = self.state;
        self.active = None;
        self.interrupted = false;
        self.state = SessionState::Idle;
        if was != SessionState::Idle {
            info!(from = %was, "session stopped");
        }
        self.publish();
    }

    /// Stops the session and closes both device contexts.
    pub async fn shutdown(&mut self) {
        self.stop();
        if let Some(mut capture) = self.capture_ctx.take()
            && let Err(e) = capture.close().await
        {
            warn!("Closing capture context failed: {}", e);
        }
        if let Some(mut output) = self.output_ctx.take()
            && let Err(e) = output.close().await
        {
            warn!("Closing output context failed: {}", e);
        }
        info!("audio contexts closed");
    }

    /// Changes the response language for the next session.
    pub fn set_language(&mut self, language: Language) -> Result<()> {
        if self.state.is_active() {
            return Err(VoxliveError::InvalidState {
                operation: "change language".to_string(),
                state: self.state.to_string(),
            });
        }
        self.language = language;
        self.publish();
        Ok(())
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            state: self.state,
            language: self.language,
            assistant_speaking: self.playback.assistant_speaking(),
            user_speaking: self.capture.user_speaking(),
            error: self.last_error.clone(),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    fn publish(&self) {
        let status = self.status();
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn active_session(&self) -> Option<SessionId> {
        self.active
    }

    pub fn playback(&self) -> &PlaybackScheduler {
        &self.playback
    }

    pub fn capture(&self) -> &CapturePipeline {
        &self.capture
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}
