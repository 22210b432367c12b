//! Error types for the voice bridge.

/// Top-level error type for the voice bridge.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Voice transport (gateway sidecar) error.
    #[error("transport error: {0}")]
    Transport(String),

    /// Speech-to-text collaborator error.
    #[error("STT error: {0}")]
    Stt(String),

    /// Text-to-speech collaborator error.
    #[error("TTS error: {0}")]
    Tts(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Tool-server manifest or control session error.
    #[error("tool session error: {0}")]
    Tool(String),

    /// Persisted artifact error.
    #[error("artifact error: {0}")]
    Artifact(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, BridgeError>;
