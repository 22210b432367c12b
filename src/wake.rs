//! Text-level wake phrase gate.
//!
//! Transcripts are matched against a set of phrases using a character-level
//! similarity ratio over sliding word windows, so small transcription slips
//! ("hey atlas" heard as "hay atlas") still open a conversation while
//! different words ("hey alice") do not.

use crate::config::WakeConfig;
use similar::TextDiff;
use tracing::debug;

/// Outcome of gating one transcript.
#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    /// A wake phrase was found. `text` has a leading wake phrase removed.
    Wake {
        /// Text to forward (may be empty when only the phrase was spoken).
        text: String,
        /// Similarity score of the best window.
        score: f32,
    },
    /// No wake phrase, but the user already has an open conversation (or
    /// the gate is disabled).
    Continue {
        /// The transcript, unchanged.
        text: String,
    },
    /// Nothing to forward.
    Drop,
}

/// A wake phrase hit inside a transcript.
#[derive(Debug, Clone, PartialEq)]
pub struct WakeMatch {
    /// Index into the configured phrase list.
    pub phrase_index: usize,
    /// Similarity of the matching window.
    pub score: f32,
    /// Index of the first matched word.
    pub first_word: usize,
    /// Index one past the last matched word.
    pub end_word: usize,
}

struct Phrase {
    words: Vec<String>,
    joined: String,
}

/// Matches transcripts against configured wake phrases.
pub struct WakeGate {
    enabled: bool,
    threshold: f32,
    phrases: Vec<Phrase>,
}

impl WakeGate {
    /// Build a gate from configuration. Blank phrases are ignored.
    pub fn new(config: &WakeConfig) -> Self {
        let phrases = config
            .phrases
            .iter()
            .filter_map(|p| {
                let words: Vec<String> = words(p).into_iter().map(|(_, w)| w).collect();
                if words.is_empty() {
                    return None;
                }
                let joined = words.join(" ");
                Some(Phrase { words, joined })
            })
            .collect();
        Self {
            enabled: config.enabled,
            threshold: config.threshold.clamp(0.0, 1.0),
            phrases,
        }
    }

    /// Whether gating is active. A gate with no usable phrases is inactive.
    pub fn is_active(&self) -> bool {
        self.enabled && !self.phrases.is_empty()
    }

    /// Find the earliest window that matches any phrase.
    pub fn detect(&self, transcript: &str) -> Option<WakeMatch> {
        let tokens = words(transcript);
        let normalized: Vec<&str> = tokens.iter().map(|(_, w)| w.as_str()).collect();

        for start in 0..normalized.len() {
            let mut best: Option<WakeMatch> = None;
            for (phrase_index, phrase) in self.phrases.iter().enumerate() {
                let end = start + phrase.words.len();
                if end > normalized.len() {
                    continue;
                }
                let window = normalized[start..end].join(" ");
                let score = similarity(&window, &phrase.joined);
                if score >= self.threshold && best.as_ref().is_none_or(|b| score > b.score) {
                    best = Some(WakeMatch {
                        phrase_index,
                        score,
                        first_word: start,
                        end_word: end,
                    });
                }
            }
            if best.is_some() {
                return best;
            }
        }
        None
    }

    /// Decide what to forward for a transcript.
    pub fn evaluate(&self, transcript: &str, conversation_open: bool) -> GateDecision {
        let text = transcript.trim();
        if text.is_empty() {
            return GateDecision::Drop;
        }
        if !self.is_active() {
            return GateDecision::Continue {
                text: text.to_owned(),
            };
        }

        if let Some(hit) = self.detect(text) {
            let forwarded = if hit.first_word == 0 {
                strip_leading_words(text, hit.end_word)
            } else {
                text.to_owned()
            };
            debug!(score = hit.score, phrase = hit.phrase_index, "wake phrase matched");
            return GateDecision::Wake {
                text: forwarded,
                score: hit.score,
            };
        }

        if conversation_open {
            GateDecision::Continue {
                text: text.to_owned(),
            }
        } else {
            debug!(transcript = %text, "no wake phrase and no open conversation");
            GateDecision::Drop
        }
    }
}

/// Character-level similarity ratio in \[0, 1\].
pub fn similarity(a: &str, b: &str) -> f32 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    TextDiff::from_chars(a, b).ratio()
}

/// Split into normalized words, remembering each word's whitespace-token
/// index in the original text. Tokens that normalize to nothing are skipped.
fn words(text: &str) -> Vec<(usize, String)> {
    text.split_whitespace()
        .enumerate()
        .filter_map(|(i, token)| {
            let word: String = token
                .chars()
                .filter(|c| c.is_alphanumeric() || *c == '\'')
                .flat_map(char::to_lowercase)
                .collect();
            (!word.is_empty()).then_some((i, word))
        })
        .collect()
}

/// Drop the first `count` normalized words (and any punctuation-only tokens
/// before them) from `text`.
fn strip_leading_words(text: &str, count: usize) -> String {
    let tokens = words(text);
    let Some(last) = count.checked_sub(1).and_then(|i| tokens.get(i)) else {
        return text.to_owned();
    };
    let rest: Vec<&str> = text.split_whitespace().skip(last.0 + 1).collect();
    rest.join(" ")
        .trim_start_matches(|c: char| c.is_ascii_punctuation())
        .trim()
        .to_owned()
}
