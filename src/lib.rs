//! Muhaffiz - a real-time voice tutor for memorizing fixed texts
//!
//! The student recites into the microphone, audio streams to the Gemini Live
//! API, and the model's spoken corrections are played back gaplessly. The
//! student can barge in at any time; the server reports the interruption and
//! playback stops at once.

#![forbid(unsafe_code)]

pub mod capture;
pub mod catalog;
pub mod config;
pub mod error;
pub mod passage;
pub mod pcm;
pub mod playback;
pub mod protocol;
pub mod pulse;
pub mod session;
pub mod transport;

#[cfg(test)]
mod testing;

pub use config::TutorConfig;
pub use error::{Result, TutorError};
pub use passage::{Book, Passage};
pub use session::{ConnectionState, SessionController, SessionSnapshot};
