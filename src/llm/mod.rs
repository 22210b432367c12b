//! Reasoning backend: chat completions with model selection, token
//! clamping, failure classification and a single fallback retry.

pub mod client;
pub mod error;
pub mod types;

pub use client::{DEFAULT_MODEL, ReasoningBackend, ReasoningClient};
pub use error::{FailureKind, ReasoningError};
pub use types::{ChatMessage, ReasoningRequest, ReasoningResponse, Role, ToolCall, ToolDefinition};
