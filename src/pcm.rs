//! PCM framing codec
//!
//! Outbound: float samples captured at 16 kHz are clamped, scaled to signed
//! 16-bit and serialized little-endian, which is what the Live API expects for
//! `audio/pcm;rate=16000`. Inbound: the model speaks base64 encoded 16-bit
//! little-endian PCM at 24 kHz, which is turned back into normalized floats.

use base64::engine::general_purpose;
use base64::Engine;

/// Sample rate of microphone capture and outbound frames.
pub const INPUT_SAMPLE_RATE: u32 = 16_000;
/// Sample rate of audio produced by the model.
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;
/// Mime tag attached to every outbound frame.
pub const INPUT_MIME_TYPE: &str = "audio/pcm;rate=16000";

/// Errors produced while decoding inbound audio.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed base64 payload: {0}")]
    MalformedPayload(#[from] base64::DecodeError),

    #[error("cannot decode {len} bytes as 16-bit PCM with {channels} channel(s)")]
    Decode { len: usize, channels: u16 },
}

pub type Result<T> = std::result::Result<T, CodecError>;

/// A byte-encoded outbound frame plus its mime tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    pub data: Vec<u8>,
    pub mime_type: &'static str,
}

impl EncodedFrame {
    /// Encode captured samples into a frame tagged for 16 kHz PCM.
    pub fn from_samples(samples: &[f32]) -> Self {
        Self {
            data: encode(samples),
            mime_type: INPUT_MIME_TYPE,
        }
    }

    pub fn to_base64(&self) -> String {
        general_purpose::STANDARD.encode(&self.data)
    }
}

/// Decoded audio ready to be handed to the playback scheduler.
///
/// Samples are interleaved when `channels > 1`.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackBuffer {
    samples: Vec<f32>,
    sample_rate: u32,
    channels: u16,
}

impl PlaybackBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples,
            sample_rate,
            channels: channels.max(1),
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<f32> {
        self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Number of sample frames (samples per channel).
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    /// Duration in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }
}

/// Clamp to [-1, 1], scale to i16 and serialize little-endian.
///
/// Output is always exactly twice as long as the input.
pub fn encode(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        // NaN clamps to NaN, treat it as silence
        let s = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
        let scaled = if s < 0.0 { s * 32768.0 } else { s * 32767.0 };
        out.extend_from_slice(&(scaled as i16).to_le_bytes());
    }
    out
}

/// Standard base64 decode of an inbound chunk.
pub fn decode_base64_to_bytes(s: &str) -> Result<Vec<u8>> {
    Ok(general_purpose::STANDARD.decode(s)?)
}

/// Interpret `bytes` as 16-bit little-endian PCM and build a playable buffer.
pub fn decode_to_audio_buffer(
    bytes: &[u8],
    target_sample_rate: u32,
    channel_count: u16,
) -> Result<PlaybackBuffer> {
    let channels = channel_count.max(1);
    if bytes.len() % (2 * channels as usize) != 0 {
        return Err(CodecError::Decode {
            len: bytes.len(),
            channels,
        });
    }

    let samples = bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect();

    Ok(PlaybackBuffer::new(samples, target_sample_rate, channels))
}

/// Root-mean-square level of a block, used for input metering.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_doubles_length_and_is_little_endian() {
        let bytes = encode(&[0.0, 1.0, -1.0]);
        assert_eq!(bytes.len(), 6);
        assert_eq!(&bytes[0..2], &[0x00, 0x00]);
        assert_eq!(i16::from_le_bytes([bytes[2], bytes[3]]), i16::MAX);
        assert_eq!(i16::from_le_bytes([bytes[4], bytes[5]]), i16::MIN);
    }

    #[test]
    fn encode_clamps_out_of_range_samples() {
        let clamped = encode(&[3.5, -7.0, f32::NAN]);
        assert_eq!(clamped, encode(&[1.0, -1.0, 0.0]));
    }

    #[test]
    fn round_trip_within_quantization_error() {
        let original: Vec<f32> = (0..480)
            .map(|i| (i as f32 / 480.0 * std::f32::consts::TAU).sin() * 0.8)
            .collect();

        let buffer = decode_to_audio_buffer(&encode(&original), INPUT_SAMPLE_RATE, 1).unwrap();
        assert_eq!(buffer.samples().len(), original.len());
        for (a, b) in original.iter().zip(buffer.samples()) {
            assert!((a - b).abs() <= 1.0 / 16384.0, "{a} vs {b}");
        }
    }

    #[test]
    fn decode_rejects_odd_length() {
        let err = decode_to_audio_buffer(&[1, 2, 3], OUTPUT_SAMPLE_RATE, 1).unwrap_err();
        assert!(matches!(err, CodecError::Decode { len: 3, channels: 1 }));

        // stereo needs multiples of four
        let err = decode_to_audio_buffer(&[0; 6], OUTPUT_SAMPLE_RATE, 2).unwrap_err();
        assert!(matches!(err, CodecError::Decode { len: 6, channels: 2 }));
    }

    #[test]
    fn base64_decode_reports_malformed_payload() {
        assert_eq!(decode_base64_to_bytes("AAEC").unwrap(), vec![0, 1, 2]);
        assert!(matches!(
            decode_base64_to_bytes("not*base64!"),
            Err(CodecError::MalformedPayload(_))
        ));
    }

    #[test]
    fn buffer_duration_uses_frames() {
        let mono = PlaybackBuffer::new(vec![0.0; 24_000], OUTPUT_SAMPLE_RATE, 1);
        assert!((mono.duration() - 1.0).abs() < f64::EPSILON);

        let stereo = PlaybackBuffer::new(vec![0.0; 24_000], OUTPUT_SAMPLE_RATE, 2);
        assert!((stereo.duration() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn frame_carries_mime_and_base64() {
        let frame = EncodedFrame::from_samples(&[0.0, 0.0]);
        assert_eq!(frame.mime_type, "audio/pcm;rate=16000");
        assert_eq!(frame.to_base64(), "AAAAAA==");
    }

    #[test]
    fn rms_of_silence_and_full_scale() {
        assert_eq!(rms(&[]), 0.0);
        assert_eq!(rms(&[0.0; 16]), 0.0);
        assert!((rms(&[1.0, -1.0]) - 1.0).abs() < 1e-6);
    }
}
