//! Persisted segment audio.
//!
//! Each transcribed segment becomes a pair in the recordings directory:
//! `<base>.wav` (mono 16-bit PCM) and `<base>.json` describing it. The
//! retention sweeper prunes these pairs.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

/// Sidecar contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    /// Speaker.
    pub user_id: String,
    /// Guild the segment was captured in.
    #[serde(default)]
    pub guild_id: String,
    /// Voice channel the segment was captured in.
    #[serde(default)]
    pub channel_id: String,
    /// What the transcriber returned.
    #[serde(default)]
    pub transcript: String,
    /// Wall-clock start of the segment.
    pub started_at: DateTime<Utc>,
    /// Segment length in milliseconds.
    pub duration_ms: u64,
    /// Audio sample rate.
    pub sample_rate: u32,
    /// Audio file. A relative path is resolved against the sidecar's
    /// directory; when absent the `.wav` next to the sidecar is assumed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_path: Option<PathBuf>,
}

/// Paths written for one segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedArtifact {
    /// WAV file.
    pub audio: PathBuf,
    /// JSON sidecar.
    pub sidecar: PathBuf,
}

/// Writes artifact pairs into one directory.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    /// Store rooted at `dir`; the directory is created on first save.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory pairs are written to.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `samples` and the sidecar for `record`.
    ///
    /// The audio is written first so a sidecar never points at a missing
    /// file of its own making. `record.audio_path` is filled in with the
    /// audio file name, so the pair stays valid wherever the directory is
    /// opened from.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Artifact`] if either file cannot be written.
    pub fn save(&self, mut record: ArtifactRecord, samples: &[f32]) -> Result<SavedArtifact> {
        fs::create_dir_all(&self.dir)?;
        let base = base_name(&record);
        let audio = self.dir.join(format!("{base}.wav"));
        let sidecar = self.dir.join(format!("{base}.json"));

        write_wav(&audio, samples, record.sample_rate)?;
        record.audio_path = Some(PathBuf::from(format!("{base}.wav")));
        let json = serde_json::to_vec_pretty(&record)
            .map_err(|e| BridgeError::Artifact(format!("failed to encode sidecar: {e}")))?;
        fs::write(&sidecar, json)?;

        Ok(SavedArtifact { audio, sidecar })
    }
}

/// `<timestamp>-<user>-<short id>`, safe for any filesystem.
fn base_name(record: &ArtifactRecord) -> String {
    let user: String = record
        .user_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{}-{}-{}",
        record.started_at.format("%Y%m%dT%H%M%S%3f"),
        if user.is_empty() { "unknown" } else { &user },
        &id[..8]
    )
}

fn write_wav(path: &Path, samples: &[f32], sample_rate: u32) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)
        .map_err(|e| BridgeError::Artifact(format!("failed to create wav writer: {e}")))?;
    for &s in samples {
        writer
            .write_sample(crate::audio::f32_to_i16(s))
            .map_err(|e| BridgeError::Artifact(format!("failed to write wav sample: {e}")))?;
    }
    writer
        .finalize()
        .map_err(|e| BridgeError::Artifact(format!("failed to finalize wav: {e}")))
}
