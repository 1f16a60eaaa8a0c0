//! Gapless playback scheduling
//!
//! Buffers are chained back to back on the output device clock: each one
//! starts where the previous one ends, or at the current clock time if
//! playback has drained. Barge-in stops every scheduled source at once.

use crate::pcm::PlaybackBuffer;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Identifies one scheduled buffer. Ids increase in enqueue order.
pub type SourceId = u64;

/// Invoked by the output device when a source finishes or is stopped.
pub type EndedCallback = Arc<dyn Fn(SourceId) + Send + Sync + 'static>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum OutputError {
    #[error("no usable output device: {0}")]
    DeviceUnavailable(String),

    #[error("output stream failed: {0}")]
    Stream(String),

    #[error("output device closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, OutputError>;

/// Output settings.
#[derive(Debug, Clone)]
pub struct OutputConfig {
    pub sample_rate: u32,
    pub channels: u16,
    /// Device to open, `None` for the server default.
    pub device: Option<String>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            sample_rate: crate::pcm::OUTPUT_SAMPLE_RATE,
            channels: 1,
            device: None,
        }
    }
}

/// An audio output with its own monotonic clock, measured in seconds.
pub trait OutputDevice: Send + 'static {
    fn current_time(&self) -> f64;

    /// Play `buffer` starting at clock time `at`. The device reports the end
    /// through its `EndedCallback`.
    fn start(&mut self, id: SourceId, at: f64, buffer: PlaybackBuffer) -> Result<()>;

    /// Stop a source immediately, even mid-playback.
    fn stop(&mut self, id: SourceId);

    /// Release the device. Idempotent.
    fn close(&mut self);
}

/// Placement of one buffer on the output clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledSource {
    pub id: SourceId,
    pub start: f64,
    pub duration: f64,
}

impl ScheduledSource {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

/// Owns the output device and the set of sounding sources.
pub struct PlaybackScheduler {
    device: Option<Box<dyn OutputDevice>>,
    next_start_time: f64,
    active: BTreeMap<SourceId, ScheduledSource>,
    next_id: SourceId,
}

impl PlaybackScheduler {
    pub fn new(device: Box<dyn OutputDevice>) -> Self {
        Self {
            device: Some(device),
            next_start_time: 0.0,
            active: BTreeMap::new(),
            next_id: 0,
        }
    }

    /// Schedule a buffer right after everything already queued.
    pub fn enqueue(&mut self, buffer: PlaybackBuffer) -> Result<ScheduledSource> {
        let device = self.device.as_mut().ok_or(OutputError::Closed)?;

        // Never in the past, whatever the last reset left behind
        let now = device.current_time();
        self.next_start_time = self.next_start_time.max(now).max(0.0);

        let scheduled = ScheduledSource {
            id: self.next_id,
            start: self.next_start_time,
            duration: buffer.duration(),
        };
        device.start(scheduled.id, scheduled.start, buffer)?;

        self.next_id += 1;
        self.next_start_time += scheduled.duration;
        self.active.insert(scheduled.id, scheduled);

        debug!(
            "Scheduled source {} at {:.3}s for {:.3}s ({} active)",
            scheduled.id,
            scheduled.start,
            scheduled.duration,
            self.active.len()
        );
        Ok(scheduled)
    }

    /// Completion callback. Returns `true` when this drained the active set,
    /// i.e. the model stopped speaking.
    ///
    /// Ids that are no longer active (already stopped by an interrupt) are
    /// ignored.
    pub fn on_source_ended(&mut self, id: SourceId) -> bool {
        if self.active.remove(&id).is_none() {
            debug!("Ignoring end of inactive source {}", id);
            return false;
        }
        self.active.is_empty()
    }

    /// Stop everything that is scheduled or sounding. Returns how many
    /// sources were cut off.
    pub fn interrupt(&mut self) -> usize {
        let stopped = self.active.len();
        if let Some(device) = self.device.as_mut() {
            for id in self.active.keys() {
                device.stop(*id);
            }
        }
        self.active.clear();
        self.next_start_time = 0.0;
        info!("Playback interrupted, {} source(s) stopped", stopped);
        stopped
    }

    /// Stop all sources and release the output device. Idempotent.
    pub fn shutdown(&mut self) {
        let Some(mut device) = self.device.take() else {
            return;
        };
        for id in self.active.keys() {
            device.stop(*id);
        }
        self.active.clear();
        self.next_start_time = 0.0;
        device.close();
        info!("Playback shut down");
    }

    pub fn is_speaking(&self) -> bool {
        !self.active.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    pub fn is_shut_down(&self) -> bool {
        self.device.is_none()
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        if self.device.is_some() {
            warn!("Playback scheduler dropped without shutdown");
            self.shutdown();
        }
    }
}
