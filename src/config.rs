//! Runtime configuration, read from the environment.

use crate::capture::{CaptureConfig, CAPTURE_BLOCK_SIZE};
use crate::pcm::{INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE};
use crate::playback::OutputConfig;
use crate::transport::GEMINI_LIVE_URL;
use std::time::Duration;

pub const DEFAULT_MODEL: &str = "models/gemini-2.5-flash-native-audio-preview-09-2025";
pub const DEFAULT_VOICE: &str = "Puck";

/// Configuration for the tutor
#[derive(Debug, Clone)]
pub struct TutorConfig {
    /// Speech service credential. Connecting without one is a configuration error.
    pub api_key: Option<String>,
    pub url: String,
    pub model: String,
    pub voice: String,
    /// PulseAudio application name.
    pub app_name: String,
    pub capture: CaptureConfig,
    pub output: OutputConfig,
    /// Bound on the setup handshake; `None` waits until the server answers or errors.
    pub setup_timeout: Option<Duration>,
    /// Frames waiting for the controller before new ones are dropped.
    pub frame_queue_depth: usize,
}

impl Default for TutorConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            url: GEMINI_LIVE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            voice: DEFAULT_VOICE.to_string(),
            app_name: "muhaffiz".to_string(),
            capture: CaptureConfig {
                block_size: CAPTURE_BLOCK_SIZE,
                sample_rate: INPUT_SAMPLE_RATE,
                device: None,
            },
            output: OutputConfig {
                sample_rate: OUTPUT_SAMPLE_RATE,
                channels: 1,
                device: None,
            },
            setup_timeout: None,
            frame_queue_depth: 32,
        }
    }
}

impl TutorConfig {
    /// Build from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        config.api_key = get("GEMINI_API_KEY").or_else(|| get("API_KEY"));
        if let Some(url) = get("MUHAFFIZ_URL") {
            config.url = url;
        }
        if let Some(model) = get("MUHAFFIZ_MODEL") {
            config.model = model;
        }
        if let Some(voice) = get("MUHAFFIZ_VOICE") {
            config.voice = voice;
        }
        config.capture.device = get("MUHAFFIZ_INPUT_DEVICE");
        config.output.device = get("MUHAFFIZ_OUTPUT_DEVICE");
        config.setup_timeout = get("MUHAFFIZ_SETUP_TIMEOUT_SECS")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);

        config
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }
}
