//! Background pruning of persisted artifact pairs.
//!
//! Each tick rescans the recordings directory. A pair's age is the newest
//! modification time of its halves. Pairs older than the retention window are
//! deleted (when a window is set); if more than `max_files` survive, the
//! oldest go until the cap holds. Deletion failures are swallowed.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::artifacts::ArtifactRecord;
use crate::config::RecordingsConfig;

/// One sidecar and the audio it refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPair {
    /// JSON sidecar.
    pub sidecar: PathBuf,
    /// Audio half.
    pub audio: PathBuf,
    /// Newest modification time of the halves that exist.
    pub modified: SystemTime,
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Sidecars found.
    pub scanned: usize,
    /// Pairs removed.
    pub deleted: usize,
    /// Sidecars that could not be read or parsed.
    pub skipped: usize,
}

/// Decide which pairs go.
///
/// Everything older than `cutoff` is removed; with no cutoff age is ignored.
/// Of the rest, only the newest `max_files` are kept when `max_files > 0`.
pub fn plan_deletions(
    mut pairs: Vec<ArtifactPair>,
    cutoff: Option<SystemTime>,
    max_files: usize,
) -> Vec<ArtifactPair> {
    // Newest first.
    pairs.sort_by(|a, b| b.modified.cmp(&a.modified));
    let mut kept = 0usize;
    pairs
        .into_iter()
        .filter(|pair| {
            if cutoff.is_some_and(|cutoff| pair.modified < cutoff) {
                return true;
            }
            kept += 1;
            max_files > 0 && kept > max_files
        })
        .collect()
}

/// Periodic sweep over one recordings directory.
#[derive(Debug, Clone)]
pub struct RetentionSweeper {
    dir: PathBuf,
    retention: Option<Duration>,
    max_files: usize,
    interval: Duration,
}

impl RetentionSweeper {
    /// Sweeper for `dir`. `retention` of `None` keeps pairs regardless of age.
    pub fn new(
        dir: impl Into<PathBuf>,
        retention: Option<Duration>,
        max_files: usize,
        interval: Duration,
    ) -> Self {
        Self {
            dir: dir.into(),
            retention,
            max_files,
            interval,
        }
    }

    /// Sweeper from the recordings section. `retention_hours = 0` turns age
    /// pruning off.
    pub fn from_config(config: &RecordingsConfig) -> Self {
        let retention = (config.retention_hours > 0)
            .then(|| Duration::from_secs(config.retention_hours.saturating_mul(3_600)));
        Self::new(
            config.dir.clone(),
            retention,
            config.max_files,
            Duration::from_secs(config.sweep_interval_secs.max(1)),
        )
    }

    /// Sweep against the current time.
    pub fn sweep_once(&self) -> SweepReport {
        self.sweep_at(SystemTime::now())
    }

    /// Sweep as if the time were `now`.
    pub fn sweep_at(&self, now: SystemTime) -> SweepReport {
        let cutoff = self
            .retention
            .map(|window| now.checked_sub(window).unwrap_or(UNIX_EPOCH));
        let (pairs, mut report) = scan_pairs(&self.dir);
        for pair in plan_deletions(pairs, cutoff, self.max_files) {
            remove_quietly(&pair.audio);
            remove_quietly(&pair.sidecar);
            report.deleted += 1;
        }
        report
    }

    /// Sweep every interval until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            dir = %self.dir.display(),
            interval_secs = self.interval.as_secs(),
            "retention sweeper started"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let sweeper = self.clone();
            match tokio::task::spawn_blocking(move || sweeper.sweep_once()).await {
                Ok(report) if report.deleted > 0 || report.skipped > 0 => {
                    info!(
                        scanned = report.scanned,
                        deleted = report.deleted,
                        skipped = report.skipped,
                        "retention sweep"
                    );
                }
                Ok(report) => debug!(scanned = report.scanned, "retention sweep: nothing to do"),
                Err(e) => warn!(error = %e, "retention sweep task failed"),
            }
        }
        info!("retention sweeper stopped");
    }
}

fn scan_pairs(dir: &Path) -> (Vec<ArtifactPair>, SweepReport) {
    let mut report = SweepReport::default();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return (Vec::new(), report),
    };

    let mut pairs = Vec::new();
    for entry in entries.flatten() {
        let sidecar = entry.path();
        if sidecar.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        report.scanned += 1;
        match read_pair(&sidecar) {
            Some(pair) => pairs.push(pair),
            None => {
                debug!(path = %sidecar.display(), "unreadable sidecar; skipped this tick");
                report.skipped += 1;
            }
        }
    }
    (pairs, report)
}

/// A relative `audio_path` names a file next to the sidecar.
fn read_pair(sidecar: &Path) -> Option<ArtifactPair> {
    let bytes = fs::read(sidecar).ok()?;
    let record: ArtifactRecord = serde_json::from_slice(&bytes).ok()?;
    let audio = match record.audio_path {
        Some(path) if path.is_absolute() => path,
        Some(path) => match sidecar.parent() {
            Some(parent) => parent.join(path),
            None => path,
        },
        None => sidecar.with_extension("wav"),
    };
    let modified = [sidecar, audio.as_path()]
        .iter()
        .filter_map(|p| p.metadata().ok()?.modified().ok())
        .max()?;
    Some(ArtifactPair {
        sidecar: sidecar.to_path_buf(),
        audio,
        modified,
    })
}

fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        debug!(path = %path.display(), error = %e, "failed to remove artifact");
    }
}
