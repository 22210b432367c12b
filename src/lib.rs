//! voxbridge: real-time voice bridge for a Discord voice channel.
//!
//! Per-speaker audio arrives from a gateway sidecar and flows through:
//! Frames → Segmenter → STT → Wake gate → Reasoning (+ tool sessions) → TTS → Playback
//!
//! # Architecture
//!
//! - **Transport**: typed voice events in, playback requests out (NDJSON over stdio)
//! - **Identity**: SSRC↔user and display-name cache
//! - **Pipeline**: per-speaker workers, segmentation, wake gating, conversation turns
//! - **Reasoning**: OpenAI-compatible completions with one-shot fallback
//! - **Tools**: manifest loading and JSON-RPC control sessions per tool server
//! - **Retention**: periodic pruning of persisted segment audio

pub mod artifacts;
pub mod audio;
pub mod bridge_dirs;
pub mod config;
pub mod error;
pub mod identity;
pub mod llm;
pub mod logging;
pub mod pipeline;
pub mod retention;
pub mod runtime;
pub mod stt;
pub mod tools;
pub mod transport;
pub mod tts;
pub mod vad;
pub mod wake;

pub use config::BridgeConfig;
pub use error::{BridgeError, Result};
pub use pipeline::{ProcessorDeps, VoiceProcessor};
pub use runtime::Supervisor;
