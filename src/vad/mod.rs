//! Voice activity detection and segmentation using energy-based analysis.
//!
//! Uses RMS energy thresholding per frame. Time is measured in samples, not
//! wall clock, so segment boundaries are exact and reproducible regardless of
//! how frames are batched or delayed on their way in.

use crate::config::VadConfig;
use crate::pipeline::messages::{SegmentEnd, SpeechSegment};
use std::time::Duration;
use tracing::debug;

/// Per-speaker segmenter: accumulates speech and closes segments on
/// trailing silence or when the maximum segment length is reached.
pub struct Segmenter {
    /// Accumulated samples for the current segment.
    buffer: Vec<f32>,
    /// Whether we are currently in a speech segment.
    in_speech: bool,
    /// Consecutive trailing silence, in samples.
    silence_samples: usize,
    /// Speech (non-silent) samples in the current segment.
    speech_samples: usize,
    /// Stream offset (samples) at which the current segment started.
    segment_start: u64,
    /// Total samples seen on this stream.
    samples_seen: u64,
    sample_rate: u32,
    threshold: f32,
    hang_samples: usize,
    max_samples: usize,
    min_speech_samples: usize,
}

impl Segmenter {
    /// Create a segmenter for mono audio at `sample_rate`.
    pub fn new(config: &VadConfig, sample_rate: u32) -> Self {
        let hang_samples = ms_to_samples(sample_rate, config.hang_ms);
        // A zero max would close on every frame; treat it as "no cap".
        let max_samples = match ms_to_samples(sample_rate, config.max_segment_ms) {
            0 => usize::MAX,
            n => n,
        };
        let min_speech_samples = ms_to_samples(sample_rate, config.min_speech_ms);

        debug!(
            threshold = config.threshold,
            hang_ms = config.hang_ms,
            max_segment_ms = config.max_segment_ms,
            "segmenter initialized"
        );

        Self {
            buffer: Vec::new(),
            in_speech: false,
            silence_samples: 0,
            speech_samples: 0,
            segment_start: 0,
            samples_seen: 0,
            sample_rate,
            threshold: config.threshold,
            hang_samples,
            max_samples,
            min_speech_samples,
        }
    }

    /// Feed one frame of mono samples.
    ///
    /// Returns every segment closed by this frame. A frame can close at most
    /// one segment by silence, but a long frame can cross several
    /// maximum-length boundaries.
    pub fn process(&mut self, samples: &[f32]) -> Vec<SpeechSegment> {
        let mut closed = Vec::new();
        if samples.is_empty() {
            return closed;
        }

        let is_speech = compute_rms_energy(samples) > self.threshold;

        if !self.in_speech {
            if !is_speech {
                self.samples_seen += samples.len() as u64;
                return closed;
            }
            self.start_segment();
        }

        if is_speech {
            self.silence_samples = 0;
        }

        // Append in pieces so a maximum-length boundary falls exactly on
        // the configured sample count.
        let mut rest = samples;
        while !rest.is_empty() {
            let room = self.max_samples.saturating_sub(self.buffer.len());
            let take = room.min(rest.len());
            let (head, tail) = rest.split_at(take);
            self.buffer.extend_from_slice(head);
            self.samples_seen += head.len() as u64;
            if is_speech {
                self.speech_samples += head.len();
            } else {
                self.silence_samples += head.len();
            }
            rest = tail;

            if self.buffer.len() >= self.max_samples {
                if let Some(segment) = self.close(SegmentEnd::MaxDuration) {
                    closed.push(segment);
                }
                // Speech continues straight into the next segment.
                if is_speech {
                    self.start_segment();
                } else {
                    self.samples_seen += rest.len() as u64;
                    break;
                }
            }
        }

        if self.in_speech && !is_speech && self.silence_samples >= self.hang_samples {
            if let Some(segment) = self.close(SegmentEnd::Silence) {
                closed.push(segment);
            }
        }

        closed
    }

    /// Close whatever is buffered (idle timeout or stream teardown).
    pub fn flush(&mut self) -> Option<SpeechSegment> {
        if !self.in_speech {
            return None;
        }
        self.close(SegmentEnd::Flush)
    }

    /// Whether a segment is currently open.
    pub fn in_speech(&self) -> bool {
        self.in_speech
    }

    fn start_segment(&mut self) {
        self.in_speech = true;
        self.segment_start = self.samples_seen;
        self.silence_samples = 0;
        self.speech_samples = 0;
        self.buffer.clear();
    }

    fn close(&mut self, end: SegmentEnd) -> Option<SpeechSegment> {
        self.in_speech = false;
        let speech_samples = std::mem::take(&mut self.speech_samples);
        self.silence_samples = 0;
        let samples = std::mem::take(&mut self.buffer);

        if speech_samples < self.min_speech_samples {
            debug!(
                speech_samples,
                min = self.min_speech_samples,
                "discarding short segment"
            );
            return None;
        }

        Some(SpeechSegment {
            samples,
            sample_rate: self.sample_rate,
            start_offset: samples_to_duration(self.sample_rate, self.segment_start),
            end,
        })
    }
}

/// Compute RMS energy of audio samples.
pub fn compute_rms_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}

fn ms_to_samples(sample_rate: u32, ms: u32) -> usize {
    (u64::from(sample_rate) * u64::from(ms) / 1000) as usize
}

fn samples_to_duration(sample_rate: u32, samples: u64) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_micros(samples * 1_000_000 / u64::from(sample_rate))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    const RATE: u32 = 16_000;
    /// 20 ms frames.
    const FRAME: usize = 320;

    fn config(hang_ms: u32, max_segment_ms: u32) -> VadConfig {
        VadConfig {
            threshold: 0.01,
            hang_ms,
            max_segment_ms,
            min_speech_ms: 100,
            idle_flush_ms: 2_000,
        }
    }

    fn speech() -> Vec<f32> {
        vec![0.2; FRAME]
    }

    fn silence() -> Vec<f32> {
        vec![0.0; FRAME]
    }

    fn feed(seg: &mut Segmenter, frame: &[f32], ms: u32) -> Vec<SpeechSegment> {
        let mut out = Vec::new();
        for _ in 0..(ms / 20) {
            out.extend(seg.process(frame));
        }
        out
    }

    #[test]
    fn rms_of_empty_is_zero() {
        assert_eq!(compute_rms_energy(&[]), 0.0);
    }

    #[test]
    fn silence_only_never_opens_a_segment() {
        let mut seg = Segmenter::new(&config(500, 8_000), RATE);
        assert!(feed(&mut seg, &silence(), 3_000).is_empty());
        assert!(!seg.in_speech());
        assert!(seg.flush().is_none());
    }

    #[test]
    fn closes_after_hang_time() {
        let mut seg = Segmenter::new(&config(500, 8_000), RATE);
        assert!(feed(&mut seg, &speech(), 1_000).is_empty());
        assert!(feed(&mut seg, &silence(), 480).is_empty());
        let out = feed(&mut seg, &silence(), 20);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].end, SegmentEnd::Silence);
        assert_eq!(out[0].start_offset, Duration::ZERO);
        // Speech plus the tolerated trailing silence.
        assert_eq!(out[0].samples.len(), (RATE as usize) * 3 / 2);
    }

    #[test]
    fn short_pause_does_not_split() {
        let mut seg = Segmenter::new(&config(500, 8_000), RATE);
        feed(&mut seg, &speech(), 600);
        feed(&mut seg, &silence(), 300);
        feed(&mut seg, &speech(), 600);
        let out = feed(&mut seg, &silence(), 500);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn continuous_speech_splits_at_max_duration() {
        let mut seg = Segmenter::new(&config(500, 8_000), RATE);
        let mut out = feed(&mut seg, &speech(), 10_000);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].end, SegmentEnd::MaxDuration);
        assert_eq!(out[0].samples.len(), RATE as usize * 8);

        out.extend(feed(&mut seg, &silence(), 600));
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].start_offset, Duration::from_secs(8));
        assert_eq!(out[1].end, SegmentEnd::Silence);
    }

    #[test]
    fn oversized_frame_splits_exactly() {
        let mut seg = Segmenter::new(&config(500, 1_000), RATE);
        // One 2.5 s frame crosses two boundaries.
        let out = seg.process(&vec![0.3; RATE as usize * 5 / 2]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].start_offset, Duration::from_secs(1));
        assert!(seg.in_speech());
        let tail = seg.flush().unwrap();
        assert_eq!(tail.start_offset, Duration::from_secs(2));
        assert_eq!(tail.end, SegmentEnd::Flush);
    }

    #[test]
    fn short_blip_is_discarded() {
        let mut seg = Segmenter::new(&config(200, 8_000), RATE);
        feed(&mut seg, &speech(), 40);
        let out = feed(&mut seg, &silence(), 400);
        assert!(out.is_empty());
    }

    #[test]
    fn offset_accounts_for_leading_silence() {
        let mut seg = Segmenter::new(&config(200, 8_000), RATE);
        feed(&mut seg, &silence(), 1_000);
        feed(&mut seg, &speech(), 500);
        let out = feed(&mut seg, &silence(), 200);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].start_offset, Duration::from_secs(1));
    }
}
