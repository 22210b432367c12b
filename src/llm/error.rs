//! Classified failures for the reasoning backend.
//!
//! Every failure carries a [`FailureKind`] that drives the fallback decision
//! and a stable code (SCREAMING_SNAKE_CASE) that is included in the Display
//! output. Codes are part of the public API and do not change.

use std::fmt;

/// Stable error codes for programmatic error handling.
pub mod error_codes {
    /// The request never produced an HTTP response (connect, DNS, reset).
    pub const NETWORK_FAILED: &str = "NETWORK_FAILED";

    /// The per-attempt deadline elapsed.
    pub const TIMEOUT_ERROR: &str = "TIMEOUT_ERROR";

    /// The backend answered with 429.
    pub const RATE_LIMITED: &str = "RATE_LIMITED";

    /// The backend answered with a 5xx status.
    pub const SERVER_ERROR: &str = "SERVER_ERROR";

    /// The backend answered with a 4xx status other than 429.
    pub const REQUEST_REJECTED: &str = "REQUEST_REJECTED";

    /// A 2xx body could not be decoded.
    pub const DECODE_FAILED: &str = "DECODE_FAILED";
}

/// Whether a failure is worth retrying against a fallback model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Likely to succeed on another attempt.
    Transient,
    /// Retrying the same request cannot help.
    Permanent,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => f.write_str("transient"),
            Self::Permanent => f.write_str("permanent"),
        }
    }
}

/// A failed reasoning request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("[{code}] {cause}")]
pub struct ReasoningError {
    /// Retry classification.
    pub kind: FailureKind,
    /// Stable code from [`error_codes`].
    pub code: &'static str,
    /// HTTP status, when the backend answered.
    pub status: Option<u16>,
    /// Human-readable cause.
    pub cause: String,
}

impl ReasoningError {
    /// Classify a transport-level failure from reqwest.
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::transient(
                error_codes::TIMEOUT_ERROR,
                None,
                format!("request timed out: {err}"),
            );
        }
        Self::transient(
            error_codes::NETWORK_FAILED,
            None,
            format!("request failed: {err}"),
        )
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = extract_error_message(body);
        match status {
            429 => Self::transient(
                error_codes::RATE_LIMITED,
                Some(status),
                format!("rate limited: {message}"),
            ),
            500..=599 => Self::transient(
                error_codes::SERVER_ERROR,
                Some(status),
                format!("HTTP {status}: {message}"),
            ),
            // Informational and redirect replies carry no completion.
            100..=199 | 300..=399 => Self {
                kind: FailureKind::Permanent,
                code: error_codes::REQUEST_REJECTED,
                status: Some(status),
                cause: format!("unexpected HTTP {status}: {message}"),
            },
            _ => Self {
                kind: FailureKind::Permanent,
                code: error_codes::REQUEST_REJECTED,
                status: Some(status),
                cause: format!("HTTP {status}: {message}"),
            },
        }
    }

    /// A 2xx response whose body could not be decoded.
    pub fn decode(cause: impl fmt::Display) -> Self {
        Self::transient(
            error_codes::DECODE_FAILED,
            None,
            format!("malformed response body: {cause}"),
        )
    }

    /// Returns true if this failure may be retried.
    pub fn is_transient(&self) -> bool {
        self.kind == FailureKind::Transient
    }

    fn transient(code: &'static str, status: Option<u16>, cause: String) -> Self {
        Self {
            kind: FailureKind::Transient,
            code,
            status,
            cause,
        }
    }
}

/// Pull `error.message` out of an OpenAI-style error body, else the raw body.
fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .map(String::from)
        })
        .unwrap_or_else(|| body.trim().to_owned())
}
