//! Per-speaker voice pipeline: segmentation, transcription, wake gating and
//! reasoning turns.

pub mod conversation;
pub mod messages;
pub mod processor;
pub mod registry;

pub use conversation::{ConversationContext, ConversationStore, Turn};
pub use processor::{ProcessorDeps, VoiceProcessor};
pub use registry::SpeakerRegistry;
