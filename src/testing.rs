//! Hardware- and network-free doubles for the device and transport seams.

use crate::capture::{self, CaptureConfig, CaptureError, MicrophoneSource};
use crate::pcm::PlaybackBuffer;
use crate::playback::{self, EndedCallback, OutputConfig, OutputDevice, SourceId};
use crate::session::AudioDevices;
use crate::transport::{
    self, Connector, LiveSession, OutboundMessage, SessionRequest, TransportError, TransportEvent,
};
use futures_util::future::BoxFuture;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Semaphore};

enum Signal {
    Constant(f32),
    /// Block `k` is filled with `(k % 1000) / 1000`.
    Ramp(Arc<AtomicUsize>),
    Fail,
}

/// Produces a synthetic signal, one block every couple of milliseconds.
pub struct FakeMicrophone {
    signal: Signal,
    delay: Duration,
    held: Option<Arc<AtomicUsize>>,
}

impl FakeMicrophone {
    fn with_signal(signal: Signal) -> Self {
        Self {
            signal,
            delay: Duration::from_millis(2),
            held: None,
        }
    }

    pub fn constant(value: f32) -> Self {
        Self::with_signal(Signal::Constant(value))
    }

    pub fn failing() -> Self {
        Self::with_signal(Signal::Fail)
    }

    /// Counts blocks in `blocks` so tests can tell which block a frame came from.
    pub fn ramp(blocks: Arc<AtomicUsize>) -> Self {
        Self::with_signal(Signal::Ramp(blocks))
    }

    /// Block for `delay` on every read.
    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Count this microphone in `held` until it is dropped.
    pub fn held_by(mut self, held: Arc<AtomicUsize>) -> Self {
        held.fetch_add(1, Ordering::SeqCst);
        self.held = Some(held);
        self
    }

    /// Recover the block index from a sample of a ramp frame.
    pub fn ramp_index(sample: f32) -> usize {
        (sample * 1000.0).round() as usize
    }
}

impl MicrophoneSource for FakeMicrophone {
    fn read_block(&mut self, buf: &mut [f32]) -> capture::Result<()> {
        std::thread::sleep(self.delay);
        match &self.signal {
            Signal::Constant(value) => buf.fill(*value),
            Signal::Ramp(blocks) => {
                let k = blocks.fetch_add(1, Ordering::SeqCst);
                buf.fill((k % 1000) as f32 / 1000.0);
            }
            Signal::Fail => return Err(CaptureError::Stream("unplugged".to_string())),
        }
        Ok(())
    }

    fn describe(&self) -> String {
        "fake".to_string()
    }
}

impl Drop for FakeMicrophone {
    fn drop(&mut self) {
        if let Some(held) = &self.held {
            held.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[derive(Default)]
struct OutputLog {
    time: f64,
    started: Vec<(SourceId, f64, f64)>,
    stopped: Vec<SourceId>,
    close_count: usize,
    on_ended: Option<EndedCallback>,
}

/// Inspects and drives a [`FakeOutput`] from the test.
#[derive(Clone, Default)]
pub struct OutputSpy {
    log: Arc<Mutex<OutputLog>>,
}

impl OutputSpy {
    pub fn set_time(&self, t: f64) {
        self.log.lock().unwrap().time = t;
    }

    /// `(id, start, duration)` for every started source.
    pub fn started(&self) -> Vec<(SourceId, f64, f64)> {
        self.log.lock().unwrap().started.clone()
    }

    pub fn stopped(&self) -> Vec<SourceId> {
        self.log.lock().unwrap().stopped.clone()
    }

    pub fn close_count(&self) -> usize {
        self.log.lock().unwrap().close_count
    }

    /// Fire the device's end-of-playback callback for `id`.
    pub fn finish(&self, id: SourceId) {
        let callback = self.log.lock().unwrap().on_ended.clone();
        if let Some(callback) = callback {
            callback(id);
        }
    }
}

/// Output device with a manually-set clock that records what it is asked to do.
pub struct FakeOutput {
    log: Arc<Mutex<OutputLog>>,
    closed: bool,
}

impl FakeOutput {
    pub fn new() -> (Self, OutputSpy) {
        let spy = OutputSpy::default();
        (
            Self {
                log: spy.log.clone(),
                closed: false,
            },
            spy,
        )
    }
}

impl OutputDevice for FakeOutput {
    fn current_time(&self) -> f64 {
        self.log.lock().unwrap().time
    }

    fn start(&mut self, id: SourceId, at: f64, buffer: PlaybackBuffer) -> playback::Result<()> {
        self.log
            .lock()
            .unwrap()
            .started
            .push((id, at, buffer.duration()));
        Ok(())
    }

    fn stop(&mut self, id: SourceId) {
        self.log.lock().unwrap().stopped.push(id);
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.log.lock().unwrap().close_count += 1;
        }
    }
}

impl Drop for FakeOutput {
    fn drop(&mut self) {
        self.close();
    }
}

/// How the fake microphone behaves when opened.
#[derive(Debug, Clone)]
pub enum MicBehavior {
    Works,
    /// Each block carries its own index, see [`FakeMicrophone::ramp`].
    Ramp,
    Fails(CaptureError),
}

/// Device factory handing out fake microphones and a single watched output.
pub struct FakeDevices {
    mic: MicBehavior,
    spy: OutputSpy,
    mic_opens: AtomicUsize,
    blocks: Arc<AtomicUsize>,
}

impl FakeDevices {
    pub fn new(mic: MicBehavior) -> (Arc<Self>, OutputSpy) {
        let spy = OutputSpy::default();
        (
            Arc::new(Self {
                mic,
                spy: spy.clone(),
                mic_opens: AtomicUsize::new(0),
                blocks: Arc::new(AtomicUsize::new(0)),
            }),
            spy,
        )
    }

    pub fn mic_opens(&self) -> usize {
        self.mic_opens.load(Ordering::SeqCst)
    }

    /// Blocks read so far by ramp microphones.
    pub fn blocks_read(&self) -> usize {
        self.blocks.load(Ordering::SeqCst)
    }
}

impl AudioDevices for FakeDevices {
    fn open_microphone(
        &self,
        _config: &CaptureConfig,
    ) -> capture::Result<Box<dyn MicrophoneSource>> {
        self.mic_opens.fetch_add(1, Ordering::SeqCst);
        match &self.mic {
            MicBehavior::Works => Ok(Box::new(FakeMicrophone::constant(0.5))),
            MicBehavior::Ramp => Ok(Box::new(FakeMicrophone::ramp(self.blocks.clone()))),
            MicBehavior::Fails(e) => Err(e.clone()),
        }
    }

    fn open_output(
        &self,
        _config: &OutputConfig,
        on_ended: EndedCallback,
    ) -> playback::Result<Box<dyn OutputDevice>> {
        let mut log = self.spy.log.lock().unwrap();
        log.on_ended = Some(on_ended);
        drop(log);
        Ok(Box::new(FakeOutput {
            log: self.spy.log.clone(),
            closed: false,
        }))
    }
}

/// The far side of a fake transport session.
pub struct RemoteEnd {
    pub request: SessionRequest,
    pub outbound: mpsc::Receiver<OutboundMessage>,
    pub events: mpsc::Sender<TransportEvent>,
    pub shutdown: oneshot::Receiver<()>,
}

/// Connector whose sessions are driven by the test through [`RemoteEnd`]s.
pub struct FakeConnector {
    gate: Arc<Semaphore>,
    failure: Option<String>,
    remotes: mpsc::UnboundedSender<RemoteEnd>,
}

impl FakeConnector {
    /// Sessions open as soon as they are requested.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<RemoteEnd>) {
        Self::build(Semaphore::MAX_PERMITS, None)
    }

    /// Sessions open only after [`FakeConnector::open_one`].
    pub fn gated() -> (Arc<Self>, mpsc::UnboundedReceiver<RemoteEnd>) {
        Self::build(0, None)
    }

    /// Every connect attempt fails with a handshake error.
    pub fn failing(reason: &str) -> (Arc<Self>, mpsc::UnboundedReceiver<RemoteEnd>) {
        Self::build(Semaphore::MAX_PERMITS, Some(reason.to_string()))
    }

    fn build(
        permits: usize,
        failure: Option<String>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<RemoteEnd>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                gate: Arc::new(Semaphore::new(permits)),
                failure,
                remotes: tx,
            }),
            rx,
        )
    }

    pub fn open_one(&self) {
        self.gate.add_permits(1);
    }
}

impl Connector for FakeConnector {
    fn connect(&self, request: SessionRequest) -> BoxFuture<'static, transport::Result<LiveSession>> {
        let gate = self.gate.clone();
        let failure = self.failure.clone();
        let remotes = self.remotes.clone();
        Box::pin(async move {
            let permit = gate.acquire_owned().await.map_err(|_| TransportError::ChannelClosed)?;
            permit.forget();
            if let Some(reason) = failure {
                return Err(TransportError::Handshake(reason));
            }

            let (outbound_tx, outbound_rx) = mpsc::channel(transport::OUTBOUND_QUEUE_DEPTH);
            let (events_tx, events_rx) = mpsc::channel(16);
            let (shutdown_tx, shutdown_rx) = oneshot::channel();
            let _ = remotes.send(RemoteEnd {
                request,
                outbound: outbound_rx,
                events: events_tx,
                shutdown: shutdown_rx,
            });
            Ok(LiveSession::from_parts(outbound_tx, events_rx, shutdown_tx))
        })
    }
}
