//! Text-to-speech over HTTP.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::config::TtsConfig;
use crate::error::{BridgeError, Result};

/// Turns reply text into encoded audio.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    /// Synthesize `text`. The returned bytes go to playback unchanged.
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>>;
}

/// [`Synthesizer`] backed by an HTTP endpoint taking `{"text","voice"}`.
pub struct HttpSynthesizer {
    http: reqwest::Client,
    url: String,
    voice: String,
    timeout: Duration,
}

impl HttpSynthesizer {
    /// Build a synthesizer, or `None` when no endpoint is configured.
    pub fn from_config(config: &TtsConfig) -> Option<Self> {
        let url = config.url.trim();
        if url.is_empty() {
            return None;
        }
        Some(Self {
            http: reqwest::Client::new(),
            url: url.to_owned(),
            voice: config.voice.clone(),
            timeout: Duration::from_secs(config.request_timeout_secs.max(1)),
        })
    }
}

#[async_trait]
impl Synthesizer for HttpSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        let response = self
            .http
            .post(&self.url)
            .timeout(self.timeout)
            .json(&json!({ "text": text, "voice": self.voice }))
            .send()
            .await
            .map_err(|e| BridgeError::Tts(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(BridgeError::Tts(format!("HTTP {}", status.as_u16())));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| BridgeError::Tts(format!("body read failed: {e}")))?;
        if bytes.is_empty() {
            return Err(BridgeError::Tts("empty audio".into()));
        }
        Ok(bytes.to_vec())
    }
}
