//! PCM helpers for frames arriving from and leaving for the voice transport.
//!
//! The transport delivers interleaved signed 16-bit little-endian PCM. The
//! segmenter and the transcriber work on mono `f32` samples in \[-1, 1\].

use crate::error::{BridgeError, Result};

/// Decode little-endian s16 PCM bytes into samples.
///
/// # Errors
///
/// Returns [`BridgeError::Transport`] when the payload has an odd length.
pub fn decode_s16le(bytes: &[u8]) -> Result<Vec<i16>> {
    if bytes.len() % 2 != 0 {
        return Err(BridgeError::Transport(format!(
            "PCM payload has odd length {}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

/// Mix interleaved s16 samples down to mono `f32`.
///
/// A trailing partial frame is ignored. `channels == 0` is treated as mono.
pub fn downmix_to_mono(samples: &[i16], channels: u16) -> Vec<f32> {
    let channels = usize::from(channels.max(1));
    if channels == 1 {
        return samples.iter().map(|&s| i16_to_f32(s)).collect();
    }
    samples
        .chunks_exact(channels)
        .map(|frame| {
            let sum: f32 = frame.iter().map(|&s| i16_to_f32(s)).sum();
            sum / channels as f32
        })
        .collect()
}

/// Encode mono `f32` samples as little-endian s16 PCM bytes.
pub fn encode_s16le(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        out.extend_from_slice(&f32_to_i16(s).to_le_bytes());
    }
    out
}

fn i16_to_f32(s: i16) -> f32 {
    f32::from(s) / 32_768.0
}

/// Convert one sample, clamping out-of-range input.
pub fn f32_to_i16(s: f32) -> i16 {
    (s.clamp(-1.0, 1.0) * 32_767.0) as i16
}
