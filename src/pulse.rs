//! PulseAudio backends
//!
//! The microphone is a blocking record stream read by the capture thread.
//! The output device runs its own playback thread that writes scheduled
//! buffers in clock order, padding gaps with silence. A source counts as
//! ended once it has been heard, not when it was handed to the server, and
//! stopping a source that is still audible flushes the server buffer.

use crate::capture::{self, CaptureConfig, CaptureError, MicrophoneSource};
use crate::pcm::PlaybackBuffer;
use crate::playback::{self, EndedCallback, OutputConfig, OutputDevice, OutputError, SourceId};
use libpulse_binding::callbacks::ListResult;
use libpulse_binding::context::{Context, FlagSet as ContextFlagSet, State as ContextState};
use libpulse_binding::def::{BufferAttr, Retval};
use libpulse_binding::error::{Code, PAErr};
use libpulse_binding::mainloop::standard::{IterateResult, Mainloop};
use libpulse_binding::proplist::Proplist;
use libpulse_binding::sample::{Format, Spec};
use libpulse_binding::stream::Direction;
use libpulse_simple_binding::Simple;
use std::collections::VecDeque;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Samples written per call on the playback thread (20 ms at 24 kHz).
/// Stop requests are honoured between slices.
const PLAYBACK_SLICE: usize = 480;

/// Server-side playback queue target.
const TARGET_LATENCY_MS: u32 = 80;

/// Errors from device enumeration.
#[derive(Debug, thiserror::Error)]
pub enum PulseError {
    #[error("PulseAudio context error: {0}")]
    Context(String),

    #[error("PulseAudio connection error: {0}")]
    Connection(String),

    #[error("PulseAudio operation error: {0}")]
    Operation(String),
}

fn float_spec(rate: u32, channels: u8) -> Spec {
    Spec {
        format: Format::F32le,
        channels,
        rate,
    }
}

fn is_access_denied(err: &PAErr) -> bool {
    err.0.abs() == Code::Access as i32
}

/// Microphone backed by a PulseAudio simple record stream.
pub struct PulseMicrophone {
    simple: Simple,
    device: Option<String>,
    bytes: Vec<u8>,
}

impl PulseMicrophone {
    pub fn open(app_name: &str, config: &CaptureConfig) -> capture::Result<Self> {
        let spec = float_spec(config.sample_rate, 1);
        if !spec.is_valid() {
            return Err(CaptureError::DeviceUnavailable(format!(
                "unsupported capture rate {} Hz",
                config.sample_rate
            )));
        }

        let simple = Simple::new(
            None, // default server
            app_name,
            Direction::Record,
            config.device.as_deref(),
            "recitation",
            &spec,
            None, // default channel map
            None, // default buffering
        )
        .map_err(|e| {
            if is_access_denied(&e) {
                CaptureError::PermissionDenied(format!("{e}"))
            } else {
                CaptureError::DeviceUnavailable(format!("{e}"))
            }
        })?;

        info!(
            "Opened microphone {} at {} Hz",
            config.device.as_deref().unwrap_or("(default)"),
            config.sample_rate
        );

        Ok(Self {
            simple,
            device: config.device.clone(),
            bytes: Vec::new(),
        })
    }
}

impl MicrophoneSource for PulseMicrophone {
    fn read_block(&mut self, buf: &mut [f32]) -> capture::Result<()> {
        self.bytes.resize(buf.len() * 4, 0);
        self.simple
            .read(&mut self.bytes)
            .map_err(|e| CaptureError::Stream(format!("{e}")))?;

        for (sample, raw) in buf.iter_mut().zip(self.bytes.chunks_exact(4)) {
            *sample = f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("pulse:{}", self.device.as_deref().unwrap_or("default"))
    }
}

enum Command {
    Start {
        id: SourceId,
        at: f64,
        samples: Vec<f32>,
    },
    Stop(SourceId),
    Close,
}

/// Where the playback worker sends its samples.
trait PlaybackSink: Send + 'static {
    fn write(&mut self, samples: &[f32]) -> Result<(), String>;

    /// Discard everything written but not yet heard.
    fn flush(&mut self) -> Result<(), String>;

    /// Seconds until the last written sample reaches the speaker.
    fn latency(&self) -> f64;
}

struct PulseSink {
    simple: Simple,
    bytes: Vec<u8>,
}

impl PlaybackSink for PulseSink {
    fn write(&mut self, samples: &[f32]) -> Result<(), String> {
        self.bytes.clear();
        for s in samples {
            self.bytes.extend_from_slice(&s.to_le_bytes());
        }
        self.simple.write(&self.bytes).map_err(|e| format!("{e}"))
    }

    fn flush(&mut self) -> Result<(), String> {
        self.simple.flush().map_err(|e| format!("{e}"))
    }

    fn latency(&self) -> f64 {
        self.simple
            .get_latency()
            .map(|usec| usec.0 as f64 / 1_000_000.0)
            .unwrap_or(0.0)
    }
}

/// Output device backed by a PulseAudio playback stream on its own thread.
///
/// The clock counts seconds since the device was opened.
pub struct PulseOutput {
    origin: Instant,
    tx: mpsc::Sender<Command>,
    thread: Option<JoinHandle<()>>,
    closed: bool,
}

impl PulseOutput {
    pub fn open(
        app_name: &str,
        config: &OutputConfig,
        on_ended: EndedCallback,
    ) -> playback::Result<Self> {
        let channels = u8::try_from(config.channels)
            .map_err(|_| OutputError::DeviceUnavailable("too many channels".to_string()))?;
        let spec = float_spec(config.sample_rate, channels);
        if !spec.is_valid() {
            return Err(OutputError::DeviceUnavailable(format!(
                "unsupported playback spec {} Hz x{}",
                config.sample_rate, config.channels
            )));
        }

        // Keep the server-side queue short so a flush silences the voice at once
        let frame_bytes = 4 * u32::from(channels);
        let attr = BufferAttr {
            maxlength: u32::MAX,
            tlength: config.sample_rate * TARGET_LATENCY_MS / 1000 * frame_bytes,
            prebuf: u32::MAX,
            minreq: u32::MAX,
            fragsize: u32::MAX,
        };

        let simple = Simple::new(
            None,
            app_name,
            Direction::Playback,
            config.device.as_deref(),
            "muhaffiz voice",
            &spec,
            None,
            Some(&attr),
        )
        .map_err(|e| OutputError::DeviceUnavailable(format!("{e}")))?;

        info!(
            "Opened output {} at {} Hz",
            config.device.as_deref().unwrap_or("(default)"),
            config.sample_rate
        );

        let sink = PulseSink {
            simple,
            bytes: Vec::new(),
        };
        Self::with_sink(sink, config, on_ended)
    }

    fn with_sink<S: PlaybackSink>(
        sink: S,
        config: &OutputConfig,
        on_ended: EndedCallback,
    ) -> playback::Result<Self> {
        let origin = Instant::now();
        let (tx, rx) = mpsc::channel();
        let mut worker = PlaybackWorker {
            sink,
            rx,
            on_ended,
            origin,
            rate: config.sample_rate as f64,
            channels: config.channels.max(1) as usize,
            cursor: 0.0,
            queue: VecDeque::new(),
            current: None,
            current_stopped: false,
            draining: VecDeque::new(),
        };

        let thread = std::thread::Builder::new()
            .name("voice-playback".to_string())
            .spawn(move || worker.run())
            .map_err(|e| OutputError::Stream(format!("failed to spawn playback thread: {}", e)))?;

        Ok(Self {
            origin,
            tx,
            thread: Some(thread),
            closed: false,
        })
    }
}

impl OutputDevice for PulseOutput {
    fn current_time(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    fn start(&mut self, id: SourceId, at: f64, buffer: PlaybackBuffer) -> playback::Result<()> {
        if self.closed {
            return Err(OutputError::Closed);
        }
        self.tx
            .send(Command::Start {
                id,
                at,
                samples: buffer.into_samples(),
            })
            .map_err(|_| OutputError::Stream("playback thread exited".to_string()))
    }

    fn stop(&mut self, id: SourceId) {
        let _ = self.tx.send(Command::Stop(id));
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.tx.send(Command::Close);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Playback thread panicked");
            }
        }
        debug!("Output device closed");
    }
}

impl Drop for PulseOutput {
    fn drop(&mut self) {
        self.close();
    }
}

struct Pending {
    id: SourceId,
    at: f64,
    samples: Vec<f32>,
}

enum Flow {
    Continue,
    Close,
}

/// Plays queued sources in order and reports each one once it has been heard.
struct PlaybackWorker<S> {
    sink: S,
    rx: mpsc::Receiver<Command>,
    on_ended: EndedCallback,
    origin: Instant,
    rate: f64,
    channels: usize,
    /// Clock time up to which audio has been handed to the sink.
    cursor: f64,
    queue: VecDeque<Pending>,
    /// Source being written right now.
    current: Option<SourceId>,
    current_stopped: bool,
    /// Fully written sources and the clock time they finish sounding.
    draining: VecDeque<(SourceId, f64)>,
}

impl<S: PlaybackSink> PlaybackWorker<S> {
    fn run(&mut self) {
        loop {
            self.report_finished();
            if self.queue.is_empty() {
                let cmd = match self.draining.front() {
                    Some(&(_, end)) => {
                        let wait = Duration::from_secs_f64((end - self.now()).max(0.0));
                        match self.rx.recv_timeout(wait) {
                            Ok(cmd) => cmd,
                            Err(RecvTimeoutError::Timeout) => continue,
                            Err(RecvTimeoutError::Disconnected) => break,
                        }
                    }
                    None => match self.rx.recv() {
                        Ok(cmd) => cmd,
                        Err(_) => break,
                    },
                };
                if let Flow::Close = self.apply(cmd) {
                    break;
                }
                continue;
            }
            if let Flow::Close = self.drain_commands() {
                break;
            }
            let Some(source) = self.queue.pop_front() else {
                continue;
            };
            if let Flow::Close = self.play(source) {
                break;
            }
        }
        // Whatever is still queued or buffered goes away with the stream
        for (id, _) in self.draining.drain(..) {
            (self.on_ended)(id);
        }
        for source in self.queue.drain(..) {
            (self.on_ended)(source.id);
        }
        debug!("Playback thread exited");
    }

    fn apply(&mut self, cmd: Command) -> Flow {
        match cmd {
            Command::Start { id, at, samples } => {
                self.queue.push_back(Pending { id, at, samples });
            }
            Command::Stop(id) => self.stop(id),
            Command::Close => return Flow::Close,
        }
        Flow::Continue
    }

    fn drain_commands(&mut self) -> Flow {
        while let Ok(cmd) = self.rx.try_recv() {
            if let Flow::Close = self.apply(cmd) {
                return Flow::Close;
            }
        }
        Flow::Continue
    }

    fn stop(&mut self, id: SourceId) {
        if self.current == Some(id) {
            self.current_stopped = true;
        } else if let Some(pos) = self.queue.iter().position(|p| p.id == id) {
            self.queue.remove(pos);
            (self.on_ended)(id);
        } else if self.draining.iter().any(|(d, _)| *d == id) {
            self.cut();
        } else {
            trace!("Stop for finished source {}", id);
        }
    }

    /// Silence everything already handed to the sink.
    fn cut(&mut self) {
        if let Err(e) = self.sink.flush() {
            warn!("Playback flush failed: {}", e);
        }
        self.cursor = self.now();
        for (id, _) in self.draining.drain(..) {
            (self.on_ended)(id);
        }
    }

    fn report_finished(&mut self) {
        let now = self.now();
        while let Some(&(id, end)) = self.draining.front() {
            if end > now {
                break;
            }
            self.draining.pop_front();
            (self.on_ended)(id);
        }
    }

    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    fn play(&mut self, source: Pending) -> Flow {
        self.cursor = self.cursor.max(self.now());

        let gap = source.at - self.cursor;
        if gap > 0.0 {
            let silence = vec![0.0f32; (gap * self.rate) as usize * self.channels];
            if let Err(e) = self.sink.write(&silence) {
                error!("Playback write failed: {}", e);
            }
            self.cursor = source.at;
        }

        self.current = Some(source.id);
        self.current_stopped = false;
        let slice = PLAYBACK_SLICE * self.channels;
        for chunk in source.samples.chunks(slice) {
            if let Flow::Close = self.drain_commands() {
                self.current = None;
                (self.on_ended)(source.id);
                return Flow::Close;
            }
            if self.current_stopped {
                break;
            }
            if let Err(e) = self.sink.write(chunk) {
                error!("Playback write failed: {}", e);
                self.current_stopped = true;
                break;
            }
            self.cursor += (chunk.len() / self.channels) as f64 / self.rate;
            self.report_finished();
        }
        self.current = None;

        if self.current_stopped {
            self.cut();
            (self.on_ended)(source.id);
        } else {
            let heard_at = self.draining.back().map_or(0.0, |&(_, end)| end);
            let end = self.cursor.max(self.now() + self.sink.latency()).max(heard_at);
            self.draining.push_back((source.id, end));
        }
        Flow::Continue
    }
}

/// Kind of PulseAudio device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// Input devices, microphones and monitors.
    Source,
    /// Output devices.
    Sink,
}

/// An enumerated PulseAudio device.
#[derive(Debug, Clone)]
pub struct AudioDevice {
    pub name: String,
    pub description: String,
    pub sample_rate: u32,
    pub channels: u8,
    /// Monitor of a sink (only meaningful for sources).
    pub is_monitor: bool,
}

/// List the sources or sinks known to the PulseAudio server.
pub fn list_devices(kind: DeviceKind) -> Result<Vec<AudioDevice>, PulseError> {
    let devices = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(Mutex::new(false));

    let mut proplist =
        Proplist::new().ok_or_else(|| PulseError::Context("failed to create proplist".to_string()))?;
    proplist
        .set_str(
            libpulse_binding::proplist::properties::APPLICATION_NAME,
            "muhaffiz-device-lister",
        )
        .map_err(|_| PulseError::Context("failed to set application name".to_string()))?;

    let mut mainloop = Mainloop::new()
        .ok_or_else(|| PulseError::Context("failed to create mainloop".to_string()))?;
    let mut context = Context::new_with_proplist(&mainloop, "muhaffiz-context", &proplist)
        .ok_or_else(|| PulseError::Context("failed to create context".to_string()))?;

    context
        .connect(None, ContextFlagSet::NOFLAGS, None)
        .map_err(|e| PulseError::Connection(format!("{e}")))?;

    loop {
        match mainloop.iterate(false) {
            IterateResult::Quit(_) | IterateResult::Err(_) => {
                return Err(PulseError::Context("mainloop iterate failed".to_string()));
            }
            IterateResult::Success(_) => {}
        }
        match context.get_state() {
            ContextState::Ready => break,
            ContextState::Failed | ContextState::Terminated => {
                return Err(PulseError::Connection("connection failed".to_string()));
            }
            _ => {}
        }
    }

    let introspector = context.introspect();
    let devices_cb = devices.clone();
    let done_cb = done.clone();
    let finish = move |failed: bool| {
        if failed {
            error!("Error listing audio devices");
        }
        if let Ok(mut done) = done_cb.lock() {
            *done = true;
        }
    };

    // The operations keep running after their handles are dropped
    match kind {
        DeviceKind::Source => {
            let _ = introspector.get_source_info_list(move |result| match result {
                ListResult::Item(info) => {
                    let is_monitor = info.monitor_of_sink.is_some();
                    if let (Some(name), Some(description)) = (&info.name, &info.description) {
                        if let Ok(mut devices) = devices_cb.lock() {
                            devices.push(AudioDevice {
                                name: name.to_string(),
                                description: description.to_string(),
                                sample_rate: info.sample_spec.rate,
                                channels: info.sample_spec.channels,
                                is_monitor,
                            });
                        }
                    }
                }
                ListResult::End => finish(false),
                ListResult::Error => finish(true),
            });
        }
        DeviceKind::Sink => {
            let _ = introspector.get_sink_info_list(move |result| match result {
                ListResult::Item(info) => {
                    if let (Some(name), Some(description)) = (&info.name, &info.description) {
                        if let Ok(mut devices) = devices_cb.lock() {
                            devices.push(AudioDevice {
                                name: name.to_string(),
                                description: description.to_string(),
                                sample_rate: info.sample_spec.rate,
                                channels: info.sample_spec.channels,
                                is_monitor: false,
                            });
                        }
                    }
                }
                ListResult::End => finish(false),
                ListResult::Error => finish(true),
            });
        }
    }

    loop {
        match mainloop.iterate(false) {
            IterateResult::Quit(_) | IterateResult::Err(_) => {
                return Err(PulseError::Operation("mainloop iterate failed".to_string()));
            }
            IterateResult::Success(_) => {}
        }
        if done.lock().map(|d| *d).unwrap_or(true) {
            break;
        }
    }

    let result = devices
        .lock()
        .map(|d| d.clone())
        .map_err(|_| PulseError::Operation("device list poisoned".to_string()));

    context.disconnect();
    mainloop.quit(Retval(0));

    result
}

/// Opens PulseAudio streams for a session.
#[derive(Debug, Clone)]
pub struct PulseDevices {
    app_name: String,
}

impl PulseDevices {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
        }
    }
}

impl crate::session::AudioDevices for PulseDevices {
    fn open_microphone(
        &self,
        config: &CaptureConfig,
    ) -> capture::Result<Box<dyn MicrophoneSource>> {
        Ok(Box::new(PulseMicrophone::open(&self.app_name, config)?))
    }

    fn open_output(
        &self,
        config: &OutputConfig,
        on_ended: EndedCallback,
    ) -> playback::Result<Box<dyn OutputDevice>> {
        Ok(Box::new(PulseOutput::open(&self.app_name, config, on_ended)?))
    }
}
