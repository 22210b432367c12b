//! Message types passed between pipeline stages.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Why a speech segment was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentEnd {
    /// Trailing silence exceeded the hang time.
    Silence,
    /// The segment reached the maximum length.
    MaxDuration,
    /// Closed by idle eviction or teardown.
    Flush,
}

/// A complete speech segment detected by VAD, ready for STT.
#[derive(Debug, Clone)]
pub struct SpeechSegment {
    /// Mono samples for the entire utterance.
    pub samples: Vec<f32>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Offset of the first sample from the start of the speaker stream.
    pub start_offset: Duration,
    /// How the segment ended.
    pub end: SegmentEnd,
}

impl SpeechSegment {
    /// Audio length.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / f64::from(self.sample_rate))
    }
}

/// A segment handed off by a speaker worker, tagged with its speaker.
#[derive(Debug, Clone)]
pub struct SegmentJob {
    /// Source tag the audio arrived on.
    pub ssrc: u32,
    /// User resolved at close time, if any.
    pub user_id: Option<String>,
    /// Wall-clock time of the first sample.
    pub started_at: DateTime<Utc>,
    /// The audio.
    pub segment: SpeechSegment,
}

/// A transcription result for one segment.
#[derive(Debug, Clone)]
pub struct Transcription {
    /// User the speech belongs to.
    pub user_id: String,
    /// The transcribed text.
    pub text: String,
    /// Wall-clock time the audio started.
    pub started_at: DateTime<Utc>,
}

/// Synthesized reply audio, ready for playback.
#[derive(Debug, Clone)]
pub struct SynthesizedAudio {
    /// Encoded audio as returned by the synthesizer.
    pub bytes: Vec<u8>,
    /// User whose turn produced this reply.
    pub user_id: String,
}
