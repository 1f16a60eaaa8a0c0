//! Session-level error taxonomy.

use crate::capture::CaptureError;
use crate::playback::OutputError;
use crate::transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum TutorError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("no passage selected")]
    NoPassageSelected,

    #[error(transparent)]
    Microphone(#[from] CaptureError),

    #[error(transparent)]
    Output(#[from] OutputError),

    #[error("connection failed: {0}")]
    Connection(#[from] TransportError),

    #[error("transport failed: {0}")]
    Transport(String),

    #[error("{operation} is not allowed while {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },
}

pub type Result<T> = std::result::Result<T, TutorError>;

impl TutorError {
    /// The single message shown to the user.
    pub fn user_message(&self) -> String {
        match self {
            Self::Configuration(msg) => msg.clone(),
            Self::NoPassageSelected => "No book selected.".to_string(),
            Self::Microphone(CaptureError::PermissionDenied(_)) => {
                "Microphone access was denied.".to_string()
            }
            Self::Microphone(CaptureError::DeviceUnavailable(_)) => {
                "No microphone is available.".to_string()
            }
            Self::Microphone(e) => e.to_string(),
            Self::Output(e) => format!("Audio output failed: {}", e),
            Self::Connection(e) => format!("Failed to connect: {}", e),
            Self::Transport(_) => "Connection error occurred.".to_string(),
            Self::InvalidState { .. } => self.to_string(),
        }
    }
}
