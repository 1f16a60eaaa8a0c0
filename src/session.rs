//! Session controller
//!
//! Owns the connection state machine and every live resource of a tutoring
//! session: the microphone, the playback scheduler and the transport. Device
//! threads and the transport never touch that state directly; they post
//! events tagged with the generation of the session that created them, and
//! [`SessionController::step`] applies them one at a time. Events from an
//! older generation are dropped, which also releases any resources they carry.

use crate::capture::{self, AudioFrame, CaptureConfig, CapturePipeline, MicrophoneHandle, MicrophoneSource};
use crate::config::TutorConfig;
use crate::error::{Result, TutorError};
use crate::passage::Passage;
use crate::pcm::{self, EncodedFrame};
use crate::playback::{self, EndedCallback, OutputConfig, OutputDevice, OutputError, PlaybackScheduler, SourceId};
use crate::transport::{Connector, LiveSender, LiveSession, SessionRequest, TransportEvent};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Opens the local audio devices for a session.
pub trait AudioDevices: Send + Sync + 'static {
    fn open_microphone(&self, config: &CaptureConfig) -> capture::Result<Box<dyn MicrophoneSource>>;

    fn open_output(
        &self,
        config: &OutputConfig,
        on_ended: EndedCallback,
    ) -> playback::Result<Box<dyn OutputDevice>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a front-end renders.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub connection: ConnectionState,
    pub mic_on: bool,
    pub ai_speaking: bool,
    pub error: Option<String>,
    /// RMS of the last forwarded microphone frame.
    pub input_level: f32,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            connection: ConnectionState::Disconnected,
            mic_on: false,
            ai_speaking: false,
            error: None,
            input_level: 0.0,
        }
    }
}

type Generation = u64;

struct Tagged<T> {
    generation: Generation,
    payload: T,
}

/// Resources acquired by a successful connect attempt.
struct Opened {
    microphone: MicrophoneHandle,
    output: Box<dyn OutputDevice>,
    transport: LiveSession,
}

enum Event {
    Opened(Opened),
    ConnectFailed(TutorError),
    Transport(TransportEvent),
    PlaybackEnded(SourceId),
}

struct CapturedFrame {
    frame: EncodedFrame,
    level: f32,
}

/// Live resources of the current session.
struct Session {
    generation: Generation,
    passage: Passage,
    connecting: Option<JoinHandle<()>>,
    microphone: Option<MicrophoneHandle>,
    scheduler: Option<PlaybackScheduler>,
    transport: Option<LiveSender>,
    forwarder: Option<JoinHandle<()>>,
}

impl Session {
    /// Release everything, each resource exactly once.
    fn teardown(&mut self) {
        if let Some(task) = self.connecting.take() {
            task.abort();
        }
        if let Some(mut microphone) = self.microphone.take() {
            microphone.stop();
        }
        if let Some(mut scheduler) = self.scheduler.take() {
            scheduler.shutdown();
        }
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        if let Some(task) = self.forwarder.take() {
            task.abort();
        }
        debug!("Session {} torn down", self.generation);
    }
}

pub struct SessionController {
    config: TutorConfig,
    devices: Arc<dyn AudioDevices>,
    connector: Arc<dyn Connector>,
    snapshot: SessionSnapshot,
    state_tx: watch::Sender<SessionSnapshot>,
    generation: Generation,
    session: Option<Session>,
    events_tx: mpsc::UnboundedSender<Tagged<Event>>,
    events_rx: mpsc::UnboundedReceiver<Tagged<Event>>,
    frames_tx: mpsc::Sender<Tagged<CapturedFrame>>,
    frames_rx: mpsc::Receiver<Tagged<CapturedFrame>>,
}

impl SessionController {
    pub fn new(
        config: TutorConfig,
        devices: Arc<dyn AudioDevices>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionSnapshot::default());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (frames_tx, frames_rx) = mpsc::channel(config.frame_queue_depth.max(1));
        Self {
            config,
            devices,
            connector,
            snapshot: SessionSnapshot::default(),
            state_tx,
            generation: 0,
            session: None,
            events_tx,
            events_rx,
            frames_tx,
            frames_rx,
        }
    }

    /// Receive every snapshot change.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.state_tx.subscribe()
    }

    pub fn snapshot(&self) -> &SessionSnapshot {
        &self.snapshot
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.snapshot.connection
    }

    pub fn is_mic_on(&self) -> bool {
        self.snapshot.mic_on
    }

    pub fn ai_is_speaking(&self) -> bool {
        self.snapshot.ai_speaking
    }

    pub fn error_message(&self) -> Option<&str> {
        self.snapshot.error.as_deref()
    }

    /// Passage of the current session, if any.
    pub fn passage(&self) -> Option<&Passage> {
        self.session.as_ref().map(|s| &s.passage)
    }

    /// Start a session around `passage`.
    ///
    /// Returns once the attempt is under way; the outcome arrives through
    /// [`SessionController::step`] as `connected` or `error`.
    pub fn connect(&mut self, passage: Option<Passage>) -> Result<()> {
        let state = self.snapshot.connection;
        if matches!(state, ConnectionState::Connecting | ConnectionState::Connected) {
            return Err(TutorError::InvalidState {
                operation: "connect",
                state: state.as_str(),
            });
        }

        let Some(api_key) = self.config.api_key.clone() else {
            return Err(self.reject(TutorError::Configuration(
                "API Key not found in environment.".to_string(),
            )));
        };
        let passage = match passage {
            Some(p) if !p.is_empty() => p,
            _ => return Err(self.reject(TutorError::NoPassageSelected)),
        };

        // Anything left over from a failed session goes first
        self.teardown();
        self.generation += 1;
        let generation = self.generation;

        let request = SessionRequest {
            url: self.config.url.clone(),
            api_key,
            model: self.config.model.clone(),
            voice: self.config.voice.clone(),
            system_instruction: passage.system_instruction(),
            setup_timeout: self.config.setup_timeout,
        };
        let attempt = ConnectAttempt {
            generation,
            config: self.config.clone(),
            devices: self.devices.clone(),
            connector: self.connector.clone(),
            events: self.events_tx.clone(),
            frames: self.frames_tx.clone(),
        };
        let events = self.events_tx.clone();
        let task = tokio::spawn(async move {
            let payload = match attempt.run(request).await {
                Ok(opened) => Event::Opened(opened),
                Err(e) => Event::ConnectFailed(e),
            };
            let _ = events.send(Tagged { generation, payload });
        });

        info!("Connecting session {} for \"{}\"", generation, passage.title());
        self.session = Some(Session {
            generation,
            passage,
            connecting: Some(task),
            microphone: None,
            scheduler: None,
            transport: None,
            forwarder: None,
        });
        self.snapshot = SessionSnapshot {
            connection: ConnectionState::Connecting,
            ..SessionSnapshot::default()
        };
        self.publish();
        Ok(())
    }

    /// Pause or resume frame forwarding. Returns the new mic state.
    pub fn toggle_mic(&mut self) -> Result<bool> {
        let state = self.snapshot.connection;
        let session = match (&self.session, state) {
            (Some(session), ConnectionState::Connected) => Some(session),
            _ => None,
        };
        let Some((session, microphone)) =
            session.and_then(|s| s.microphone.as_ref().map(|mic| (s, mic)))
        else {
            return Err(TutorError::InvalidState {
                operation: "toggle_mic",
                state: state.as_str(),
            });
        };

        let mic_on = !self.snapshot.mic_on;
        if mic_on {
            microphone.resume();
        } else {
            microphone.pause();
            if let Some(transport) = session.transport.as_ref() {
                transport.try_send_stream_end();
            }
            self.snapshot.input_level = 0.0;
        }
        self.snapshot.mic_on = mic_on;
        info!("Microphone {}", if mic_on { "on" } else { "off" });
        self.publish();
        Ok(mic_on)
    }

    /// End the session and release everything. Safe to call in any state,
    /// any number of times. A previous error message stays visible.
    pub fn disconnect(&mut self) {
        if self.session.is_some() {
            info!("Disconnecting session {}", self.generation);
        }
        self.teardown();
        let error = self.snapshot.error.take();
        self.snapshot = SessionSnapshot {
            error,
            ..SessionSnapshot::default()
        };
        self.publish();
    }

    /// Wait for the next event or frame and apply it.
    pub async fn step(&mut self) {
        tokio::select! {
            biased;
            Some(event) = self.events_rx.recv() => self.handle_event(event),
            Some(frame) = self.frames_rx.recv() => self.handle_frame(frame),
            else => {}
        }
    }

    /// Apply everything already queued without waiting. Returns how many
    /// items were handled.
    pub fn drain_ready(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events_rx.try_recv() {
            self.handle_event(event);
            handled += 1;
        }
        while let Ok(frame) = self.frames_rx.try_recv() {
            self.handle_frame(frame);
            handled += 1;
        }
        handled
    }

    fn handle_event(&mut self, event: Tagged<Event>) {
        let current = self.session.as_ref().map(|s| s.generation);
        if current != Some(event.generation) {
            trace!("Dropping event from stale session {}", event.generation);
            return;
        }

        match event.payload {
            Event::Opened(opened) => self.on_opened(opened),
            Event::ConnectFailed(e) => self.fail(e),
            Event::Transport(event) => self.on_transport_event(event),
            Event::PlaybackEnded(id) => {
                let drained = self
                    .session
                    .as_mut()
                    .and_then(|s| s.scheduler.as_mut())
                    .is_some_and(|scheduler| scheduler.on_source_ended(id));
                if drained && self.snapshot.ai_speaking {
                    debug!("Model finished speaking");
                    self.snapshot.ai_speaking = false;
                    self.publish();
                }
            }
        }
    }

    fn on_opened(&mut self, opened: Opened) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if self.snapshot.connection != ConnectionState::Connecting {
            return;
        }
        session.connecting = None;

        let (sender, mut events) = opened.transport.into_parts();
        let generation = session.generation;
        let tx = self.events_tx.clone();
        session.forwarder = Some(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let payload = Event::Transport(event);
                if tx.send(Tagged { generation, payload }).is_err() {
                    return;
                }
            }
            // The transport went away without saying why
            let payload = Event::Transport(TransportEvent::Closed(None));
            let _ = tx.send(Tagged { generation, payload });
        }));

        opened.microphone.resume();
        session.microphone = Some(opened.microphone);
        session.scheduler = Some(PlaybackScheduler::new(opened.output));
        session.transport = Some(sender);

        info!("Session {} connected", generation);
        self.snapshot.connection = ConnectionState::Connected;
        self.snapshot.mic_on = true;
        self.snapshot.error = None;
        self.publish();
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Audio(data) => self.on_audio_chunk(&data),
            TransportEvent::Interrupted => {
                if let Some(scheduler) = self.session.as_mut().and_then(|s| s.scheduler.as_mut()) {
                    scheduler.interrupt();
                }
                self.snapshot.ai_speaking = false;
                self.publish();
            }
            TransportEvent::TurnComplete => debug!("Model turn complete"),
            TransportEvent::GoAway => warn!("Server announced it will close the session"),
            TransportEvent::Closed(reason) => {
                info!(
                    "Transport closed: {}",
                    reason.as_deref().unwrap_or("no reason given")
                );
                self.teardown();
                self.snapshot.connection = ConnectionState::Disconnected;
                self.snapshot.mic_on = false;
                self.snapshot.ai_speaking = false;
                self.snapshot.input_level = 0.0;
                self.publish();
            }
            TransportEvent::Error(message) => self.fail(TutorError::Transport(message)),
        }
    }

    fn on_audio_chunk(&mut self, data: &str) {
        let Some(scheduler) = self.session.as_mut().and_then(|s| s.scheduler.as_mut()) else {
            return;
        };
        let output = &self.config.output;
        let buffer = match pcm::decode_base64_to_bytes(data)
            .and_then(|bytes| pcm::decode_to_audio_buffer(&bytes, output.sample_rate, output.channels))
        {
            Ok(buffer) => buffer,
            Err(e) => {
                warn!("Dropping undecodable audio chunk: {}", e);
                return;
            }
        };

        match scheduler.enqueue(buffer) {
            Ok(_) => {
                if !self.snapshot.ai_speaking {
                    self.snapshot.ai_speaking = true;
                    self.publish();
                }
            }
            Err(e) => warn!("Could not schedule audio chunk: {}", e),
        }
    }

    fn handle_frame(&mut self, frame: Tagged<CapturedFrame>) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        if frame.generation != session.generation
            || self.snapshot.connection != ConnectionState::Connected
            || !self.snapshot.mic_on
        {
            trace!("Dropping frame from session {}", frame.generation);
            return;
        }
        let Some(transport) = session.transport.as_ref() else {
            return;
        };

        transport.try_send_audio(frame.payload.frame);
        self.snapshot.input_level = frame.payload.level;
        self.publish();
    }

    /// Record a connect precondition failure without touching the state.
    fn reject(&mut self, err: TutorError) -> TutorError {
        warn!("Connect rejected: {}", err);
        self.snapshot.error = Some(err.user_message());
        self.publish();
        err
    }

    fn fail(&mut self, err: TutorError) {
        error!("Session {} failed: {}", self.generation, err);
        self.teardown();
        self.snapshot.connection = ConnectionState::Error;
        self.snapshot.error = Some(err.user_message());
        self.snapshot.mic_on = false;
        self.snapshot.ai_speaking = false;
        self.snapshot.input_level = 0.0;
        self.publish();
    }

    fn teardown(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.teardown();
        }
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.snapshot.clone());
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// One connect attempt, run off the controller.
struct ConnectAttempt {
    generation: Generation,
    config: TutorConfig,
    devices: Arc<dyn AudioDevices>,
    connector: Arc<dyn Connector>,
    events: mpsc::UnboundedSender<Tagged<Event>>,
    frames: mpsc::Sender<Tagged<CapturedFrame>>,
}

impl ConnectAttempt {
    /// Output, then microphone, then transport. Whatever was acquired is
    /// released on drop if a later step fails or the attempt is aborted.
    async fn run(self, request: SessionRequest) -> Result<Opened> {
        let generation = self.generation;

        let events = self.events.clone();
        let on_ended: EndedCallback = Arc::new(move |id| {
            let payload = Event::PlaybackEnded(id);
            let _ = events.send(Tagged { generation, payload });
        });
        let devices = self.devices.clone();
        let output_config = self.config.output.clone();
        let output = tokio::task::spawn_blocking(move || devices.open_output(&output_config, on_ended))
            .await
            .map_err(|e| OutputError::Stream(e.to_string()))??;

        let devices = self.devices.clone();
        let capture_config = self.config.capture.clone();
        let source = tokio::task::spawn_blocking(move || devices.open_microphone(&capture_config))
            .await
            .map_err(|e| capture::CaptureError::Stream(e.to_string()))??;

        let frames = self.frames;
        let microphone = CapturePipeline::start(
            source,
            self.config.capture.block_size,
            Box::new(move |frame: AudioFrame| {
                let payload = CapturedFrame {
                    level: pcm::rms(&frame.samples),
                    frame: EncodedFrame::from_samples(&frame.samples),
                };
                if frames.try_send(Tagged { generation, payload }).is_err() {
                    trace!("Frame queue full, dropping frame");
                }
            }),
        )?;
        // Silent until the session is confirmed open
        microphone.pause();

        let transport = self.connector.connect(request).await?;
        Ok(Opened {
            microphone,
            output,
            transport,
        })
    }
}
