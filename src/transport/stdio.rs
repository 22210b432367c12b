//! Stdin/stdout JSON bridge to the voice sidecar.
//!
//! Reads newline-delimited JSON events from stdin and hands each one to a
//! [`VoiceEventHandler`]. Replies are written to stdout as
//! `{"type":"play","audio":"<base64>"}` lines.
//!
//! Stdout is exclusively reserved for the JSON protocol; all diagnostic
//! output (tracing, logs) must be routed to stderr.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{BridgeError, Result};
use crate::transport::{AudioSink, VoiceEventHandler, parse_event};

/// Why the reader stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderExit {
    /// The sidecar closed its end of the pipe.
    Eof,
    /// Shutdown was requested.
    Cancelled,
}

/// Read events from `reader` until EOF or cancellation.
///
/// Malformed lines, including ones that are not UTF-8, are logged and
/// skipped.
///
/// # Errors
///
/// Returns [`BridgeError::Transport`] if the stream cannot be read.
pub async fn run_event_reader<R>(
    reader: R,
    handler: Arc<dyn VoiceEventHandler>,
    cancel: CancellationToken,
) -> Result<ReaderExit>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let next = tokio::select! {
            _ = cancel.cancelled() => return Ok(ReaderExit::Cancelled),
            next = reader.read_until(b'\n', &mut buf) => next,
        };
        match next {
            Ok(0) => {
                tracing::info!("transport input closed (EOF)");
                return Ok(ReaderExit::Eof);
            }
            Ok(_) => {}
            Err(e) => {
                return Err(BridgeError::Transport(format!(
                    "failed to read transport input: {e}"
                )));
            }
        }

        let line = match std::str::from_utf8(&buf) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, len = buf.len(), "skipping non-UTF-8 transport line");
                continue;
            }
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match parse_event(trimmed) {
            Ok(event) => handler.handle_event(event),
            Err(e) => tracing::warn!(error = %e, "skipping transport message"),
        }
    }
}

#[derive(Serialize)]
struct PlayMessage<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    audio: &'a str,
}

/// Writes playback requests as JSON lines.
pub struct StdioSink<W> {
    writer: Mutex<W>,
}

impl StdioSink<tokio::io::Stdout> {
    /// Sink writing to the process's stdout.
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }
}

impl<W> StdioSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    /// Sink over any writer.
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Recover the writer.
    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

#[async_trait]
impl<W> AudioSink for StdioSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn play(&self, audio: Vec<u8>) -> Result<()> {
        let encoded = BASE64.encode(&audio);
        let json = serde_json::to_string(&PlayMessage {
            kind: "play",
            audio: &encoded,
        })
        .map_err(|e| BridgeError::Transport(format!("failed to encode play message: {e}")))?;

        let mut w = self.writer.lock().await;
        w.write_all(json.as_bytes())
            .await
            .map_err(|e| BridgeError::Channel(format!("failed to write to stdout: {e}")))?;
        w.write_all(b"\n").await.map_err(|e| {
            BridgeError::Channel(format!("failed to write newline to stdout: {e}"))
        })?;
        w.flush()
            .await
            .map_err(|e| BridgeError::Channel(format!("failed to flush stdout: {e}")))?;
        Ok(())
    }
}
