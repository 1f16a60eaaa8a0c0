//! Microphone capture pipeline
//!
//! A dedicated OS thread (not a tokio task) owns the microphone source and
//! reads fixed-size blocks from it. Every block is handed synchronously to the
//! registered callback. The pipeline never buffers frames itself: the callback
//! is expected to forward without blocking and drop when its consumer lags.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

/// Samples per captured block.
pub const CAPTURE_BLOCK_SIZE: usize = 4096;

/// Errors raised while acquiring or reading the microphone.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CaptureError {
    #[error("microphone permission denied: {0}")]
    PermissionDenied(String),

    #[error("no usable microphone: {0}")]
    DeviceUnavailable(String),

    #[error("microphone stream failed: {0}")]
    Stream(String),
}

pub type Result<T> = std::result::Result<T, CaptureError>;

/// One block of mono float samples at the capture rate.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
}

/// Blocking source of float samples, normally a PulseAudio record stream.
pub trait MicrophoneSource: Send + 'static {
    /// Fill `buf` completely, blocking until enough audio is available.
    fn read_block(&mut self, buf: &mut [f32]) -> Result<()>;

    /// Human-readable device description for logs.
    fn describe(&self) -> String {
        "microphone".to_string()
    }
}

/// Callback invoked on the capture thread for every produced frame.
pub type FrameCallback = Box<dyn FnMut(AudioFrame) + Send + 'static>;

/// Capture settings.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub block_size: usize,
    pub sample_rate: u32,
    /// Device to open, `None` for the server default.
    pub device: Option<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            block_size: CAPTURE_BLOCK_SIZE,
            sample_rate: crate::pcm::INPUT_SAMPLE_RATE,
            device: None,
        }
    }
}

#[derive(Debug, Default)]
struct Flags {
    paused: AtomicBool,
    stopped: AtomicBool,
}

/// Starts capture threads.
pub struct CapturePipeline;

impl CapturePipeline {
    /// Begin producing frames from an already-acquired source.
    ///
    /// Device acquisition (and therefore `PermissionDenied` /
    /// `DeviceUnavailable`) happens when the source is opened; this only fails
    /// if the capture thread cannot be spawned.
    pub fn start(
        mut source: Box<dyn MicrophoneSource>,
        block_size: usize,
        mut on_frame: FrameCallback,
    ) -> Result<MicrophoneHandle> {
        let flags = Arc::new(Flags::default());
        let thread_flags = flags.clone();
        let description = source.describe();
        let block_size = block_size.max(1);

        let thread = std::thread::Builder::new()
            .name("mic-capture".to_string())
            .spawn(move || {
                info!("Capture started on {}", source.describe());
                let mut buf = vec![0.0f32; block_size];
                loop {
                    if thread_flags.stopped.load(Ordering::Acquire) {
                        break;
                    }
                    if let Err(e) = source.read_block(&mut buf) {
                        error!("Microphone read error: {}", e);
                        break;
                    }
                    // Reads continue while paused so the stream never overruns
                    if thread_flags.stopped.load(Ordering::Acquire) {
                        break;
                    }
                    if thread_flags.paused.load(Ordering::Acquire) {
                        continue;
                    }
                    on_frame(AudioFrame { samples: buf.clone() });
                }
                // Dropping the source here releases the device
                drop(source);
                debug!("Capture thread exited");
            })
            .map_err(|e| CaptureError::Stream(format!("failed to spawn capture thread: {}", e)))?;

        Ok(MicrophoneHandle {
            flags,
            thread: Some(thread),
            description,
        })
    }
}

/// Handle to a running capture thread. Dropping it stops capture.
pub struct MicrophoneHandle {
    flags: Arc<Flags>,
    thread: Option<JoinHandle<()>>,
    description: String,
}

impl MicrophoneHandle {
    /// Suspend frame delivery; the device stays open.
    pub fn pause(&self) {
        self.flags.paused.store(true, Ordering::Release);
        debug!("Capture paused");
    }

    pub fn resume(&self) {
        self.flags.paused.store(false, Ordering::Release);
        debug!("Capture resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.flags.paused.load(Ordering::Acquire)
    }

    pub fn is_stopped(&self) -> bool {
        self.flags.stopped.load(Ordering::Acquire)
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Release the microphone. Idempotent.
    ///
    /// Blocks until the thread has finished its in-flight read and dropped
    /// the source, so the device is free once this returns. That wait is at
    /// most one block.
    pub fn stop(&mut self) {
        if self.flags.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Stopping capture on {}", self.description);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Capture thread panicked");
            }
        }
        debug!("Capture stopped on {}", self.description);
    }
}

impl Drop for MicrophoneHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeMicrophone;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn delivers_fixed_size_frames() {
        let (tx, rx) = mpsc::channel();
        let mut handle = CapturePipeline::start(
            Box::new(FakeMicrophone::constant(0.25)),
            64,
            Box::new(move |frame| {
                let _ = tx.send(frame);
            }),
        )
        .unwrap();

        let frame = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(frame.samples.len(), 64);
        assert!(frame.samples.iter().all(|s| *s == 0.25));
        handle.stop();
    }

    #[test]
    fn pause_suppresses_frames_until_resume() {
        let (tx, rx) = mpsc::channel();
        let handle = CapturePipeline::start(
            Box::new(FakeMicrophone::constant(0.1)),
            32,
            Box::new(move |frame| {
                let _ = tx.send(frame);
            }),
        )
        .unwrap();

        handle.pause();
        assert!(handle.is_paused());
        // drain anything produced before the pause took effect
        std::thread::sleep(Duration::from_millis(50));
        while rx.try_recv().is_ok() {}
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        handle.resume();
        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
    }

    #[test]
    fn stop_is_idempotent_and_ends_delivery() {
        let (tx, rx) = mpsc::channel();
        let mut handle = CapturePipeline::start(
            Box::new(FakeMicrophone::constant(0.0)),
            16,
            Box::new(move |frame| {
                let _ = tx.send(frame);
            }),
        )
        .unwrap();

        handle.stop();
        handle.stop();
        assert!(handle.is_stopped());

        // the thread has exited, so only already-sent frames remain
        while rx.try_recv().is_ok() {}
        assert!(matches!(rx.try_recv(), Err(mpsc::TryRecvError::Disconnected)));
    }

    #[test]
    fn stop_releases_the_device_before_returning() {
        let held = Arc::new(AtomicUsize::new(0));
        let mic = FakeMicrophone::constant(0.3)
            .slow(Duration::from_millis(50))
            .held_by(held.clone());
        assert_eq!(held.load(Ordering::SeqCst), 1);

        let (tx, rx) = mpsc::channel();
        let mut handle = CapturePipeline::start(
            Box::new(mic),
            16,
            Box::new(move |frame| {
                let _ = tx.send(frame);
            }),
        )
        .unwrap();
        rx.recv_timeout(Duration::from_secs(2)).unwrap();

        // the thread is now sleeping inside a read
        handle.stop();
        assert_eq!(held.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn dropping_the_handle_releases_the_device() {
        let held = Arc::new(AtomicUsize::new(0));
        let mic = FakeMicrophone::constant(0.3)
            .slow(Duration::from_millis(50))
            .held_by(held.clone());
        let handle = CapturePipeline::start(Box::new(mic), 16, Box::new(|_| {})).unwrap();

        drop(handle);
        assert_eq!(held.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn read_error_ends_capture() {
        let (tx, rx) = mpsc::channel::<AudioFrame>();
        let _handle = CapturePipeline::start(
            Box::new(FakeMicrophone::failing()),
            16,
            Box::new(move |frame| {
                let _ = tx.send(frame);
            }),
        )
        .unwrap();

        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(2)),
            Err(mpsc::RecvTimeoutError::Disconnected)
        ));
    }
}
