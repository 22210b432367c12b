//! Speech-to-text over HTTP.
//!
//! Closed segments are posted as raw mono s16le PCM; the service answers with
//! `{"text": "..."}`.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::audio;
use crate::config::SttConfig;
use crate::error::{BridgeError, Result};
use crate::pipeline::messages::SpeechSegment;

/// Turns a speech segment into text.
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe one segment. Empty text means nothing intelligible.
    async fn transcribe(&self, segment: &SpeechSegment) -> Result<String>;
}

#[derive(Deserialize)]
struct TranscriptionBody {
    #[serde(default)]
    text: String,
}

/// [`Transcriber`] backed by an HTTP endpoint.
pub struct HttpTranscriber {
    http: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpTranscriber {
    /// Create a transcriber for the configured endpoint.
    pub fn new(config: &SttConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: config.url.clone(),
            timeout: Duration::from_secs(config.request_timeout_secs.max(1)),
        }
    }
}

#[async_trait]
impl Transcriber for HttpTranscriber {
    async fn transcribe(&self, segment: &SpeechSegment) -> Result<String> {
        let started = Instant::now();
        let body = audio::encode_s16le(&segment.samples);
        let response = self
            .http
            .post(&self.url)
            .query(&[("sample_rate", segment.sample_rate)])
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .timeout(self.timeout)
            .body(body)
            .send()
            .await
            .map_err(|e| BridgeError::Stt(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(BridgeError::Stt(format!("HTTP {}: {text}", status.as_u16())));
        }
        let parsed: TranscriptionBody = response
            .json()
            .await
            .map_err(|e| BridgeError::Stt(format!("malformed response: {e}")))?;

        debug!(
            audio_ms = segment.duration().as_millis() as u64,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "segment transcribed"
        );
        Ok(parsed.text.trim().to_owned())
    }
}
