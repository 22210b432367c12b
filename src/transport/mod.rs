//! Voice transport boundary.
//!
//! The gateway connection, Opus decoding and UDP handling live in a sidecar
//! process. This module defines what crosses the boundary: a closed set of
//! inbound [`VoiceEvent`]s and an outbound [`AudioSink`] for replies.

pub mod stdio;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;

use crate::audio;
use crate::error::{BridgeError, Result};
use crate::identity::Member;

/// Everything the voice transport can report.
#[derive(Debug, Clone, PartialEq)]
pub enum VoiceEvent {
    /// The transport joined the voice channel.
    Ready {
        /// Guild joined.
        guild_id: String,
        /// Voice channel joined.
        channel_id: String,
    },
    /// A source tag started speaking as a user.
    Speaking {
        /// Source tag.
        ssrc: u32,
        /// Stable user id.
        user_id: String,
    },
    /// Decoded audio for one source tag (interleaved s16).
    Frame {
        /// Source tag.
        ssrc: u32,
        /// Interleaved PCM samples.
        pcm: Vec<i16>,
    },
    /// A user left the channel.
    ClientDisconnect {
        /// User who left.
        user_id: String,
    },
    /// Channel membership at join time.
    Members {
        /// Participants present.
        members: Vec<Member>,
    },
    /// A guild display name.
    GuildName {
        /// Guild id.
        id: String,
        /// Display name.
        name: String,
    },
    /// A channel display name.
    ChannelName {
        /// Channel id.
        id: String,
        /// Display name.
        name: String,
    },
}

/// Receives inbound events. Implementations must not block.
pub trait VoiceEventHandler: Send + Sync {
    /// Handle one event.
    fn handle_event(&self, event: VoiceEvent);
}

/// Plays synthesized audio into the voice channel.
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Queue encoded audio for playback.
    async fn play(&self, audio: Vec<u8>) -> Result<()>;
}

/// Wire form of inbound messages, one JSON object per line.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum InboundMessage {
    Ready {
        #[serde(default)]
        guild_id: String,
        #[serde(default)]
        channel_id: String,
    },
    Speaking {
        ssrc: u32,
        user_id: String,
    },
    Frame {
        ssrc: u32,
        pcm: String,
    },
    ClientDisconnect {
        user_id: String,
    },
    Members {
        #[serde(default)]
        members: Vec<Member>,
    },
    Guild {
        id: String,
        #[serde(default)]
        name: String,
    },
    Channel {
        id: String,
        #[serde(default)]
        name: String,
    },
}

impl InboundMessage {
    /// Decode payloads into a [`VoiceEvent`].
    pub(crate) fn into_event(self) -> Result<VoiceEvent> {
        Ok(match self {
            Self::Ready {
                guild_id,
                channel_id,
            } => VoiceEvent::Ready {
                guild_id,
                channel_id,
            },
            Self::Speaking { ssrc, user_id } => VoiceEvent::Speaking { ssrc, user_id },
            Self::Frame { ssrc, pcm } => {
                let bytes = BASE64
                    .decode(pcm.as_bytes())
                    .map_err(|e| {
                        BridgeError::Transport(format!("frame for {ssrc}: bad base64: {e}"))
                    })?;
                VoiceEvent::Frame {
                    ssrc,
                    pcm: audio::decode_s16le(&bytes)?,
                }
            }
            Self::ClientDisconnect { user_id } => VoiceEvent::ClientDisconnect { user_id },
            Self::Members { members } => VoiceEvent::Members { members },
            Self::Guild { id, name } => VoiceEvent::GuildName { id, name },
            Self::Channel { id, name } => VoiceEvent::ChannelName { id, name },
        })
    }
}

/// Parse one inbound line.
///
/// # Errors
///
/// Returns [`BridgeError::Transport`] for malformed JSON, unknown message
/// types, or undecodable audio payloads.
pub fn parse_event(line: &str) -> Result<VoiceEvent> {
    let message: InboundMessage = serde_json::from_str(line)
        .map_err(|e| BridgeError::Transport(format!("malformed transport message: {e}")))?;
    message.into_event()
}
