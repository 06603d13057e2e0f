//! 16-bit PCM framing for the wire.
//!
//! Outbound audio leaves as base64 signed 16-bit little-endian mono at the
//! capture rate; inbound audio arrives in the same encoding at the playback
//! rate. Both rates are fixed by the remote service.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;

use crate::error::{ParleyError, Result};

pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;
pub const CAPTURE_MIME_TYPE: &str = "audio/pcm;rate=16000";

const SCALE: f32 = 32768.0;

/// A transport-ready block of outbound audio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    pub mime_type: &'static str,
    /// Base64 of the little-endian i16 samples.
    pub data: String,
}

/// Decoded mono audio ready to be scheduled.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl PlaybackBuffer {
    /// Duration in seconds.
    #[must_use]
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / f64::from(self.sample_rate)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[must_use]
pub fn sample_to_i16(sample: f32) -> i16 {
    let clamped = sample.clamp(-1.0, 1.0);
    (clamped * SCALE)
        .round()
        .clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16
}

#[must_use]
pub fn i16_to_sample(value: i16) -> f32 {
    f32::from(value) / SCALE
}

/// Encode capture-rate samples into an outbound frame.
#[must_use]
pub fn encode(samples: &[f32]) -> EncodedFrame {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        bytes.extend_from_slice(&sample_to_i16(sample).to_le_bytes());
    }

    EncodedFrame {
        mime_type: CAPTURE_MIME_TYPE,
        data: B64.encode(bytes),
    }
}

/// Decode a base64 PCM payload. The sample rate comes from the `rate=`
/// parameter of `mime_type` when present, otherwise the playback rate.
pub fn decode(data: &str, mime_type: Option<&str>) -> Result<PlaybackBuffer> {
    let sample_rate = mime_type
        .and_then(rate_from_mime)
        .unwrap_or(PLAYBACK_SAMPLE_RATE);

    let bytes = B64
        .decode(data.trim())
        .map_err(|e| ParleyError::Codec(format!("invalid base64 audio payload: {e}")))?;

    decode_pcm(&bytes, sample_rate)
}

/// Convert raw little-endian i16 bytes into a playback buffer.
pub fn decode_pcm(bytes: &[u8], sample_rate: u32) -> Result<PlaybackBuffer> {
    if bytes.len() % 2 != 0 {
        return Err(ParleyError::Codec(format!(
            "PCM payload has odd length: {} bytes",
            bytes.len()
        )));
    }

    let samples = bytes
        .chunks_exact(2)
        .map(|pair| i16_to_sample(i16::from_le_bytes([pair[0], pair[1]])))
        .collect();

    Ok(PlaybackBuffer {
        samples,
        sample_rate,
    })
}

fn rate_from_mime(mime_type: &str) -> Option<u32> {
    mime_type
        .split(';')
        .filter_map(|param| param.trim().split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("rate"))
        .and_then(|(_, value)| value.trim().parse().ok())
        .filter(|&rate| rate > 0)
}
