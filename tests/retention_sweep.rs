//! Retention sweeps over real artifact pairs on disk.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::Utc;
use voxbridge::artifacts::{ArtifactRecord, ArtifactStore};
use voxbridge::config::RecordingsConfig;
use voxbridge::retention::RetentionSweeper;

const HOUR: u64 = 3_600;

fn record(user: &str) -> ArtifactRecord {
    ArtifactRecord {
        user_id: user.to_owned(),
        guild_id: "g".into(),
        channel_id: "c".into(),
        transcript: format!("hello from {user}"),
        started_at: Utc::now(),
        duration_ms: 20,
        sample_rate: 16_000,
        audio_path: None,
    }
}

fn age(path: &Path, now: SystemTime, hours: u64) {
    File::options()
        .write(true)
        .open(path)
        .expect("open")
        .set_modified(now - Duration::from_secs(hours * HOUR))
        .expect("set mtime");
}

fn remaining(dir: &Path) -> Vec<String> {
    let mut names: Vec<_> = fs::read_dir(dir)
        .expect("read dir")
        .flatten()
        .filter_map(|e| {
            let path = e.path();
            (path.extension()? == "json").then(|| {
                let record: ArtifactRecord =
                    serde_json::from_slice(&fs::read(&path).expect("read")).expect("parse");
                record.user_id
            })
        })
        .collect();
    names.sort();
    names
}

/// Save one pair per `(user, age_hours)`.
fn populate(store: &ArtifactStore, now: SystemTime, pairs: &[(&str, u64)]) {
    for (user, hours) in pairs {
        let saved = store.save(record(user), &[0.1; 32]).expect("save");
        age(&saved.audio, now, *hours);
        age(&saved.sidecar, now, *hours);
    }
}

#[test]
fn test_pairs_older_than_retention_are_removed() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let store = ArtifactStore::new(tmp.path());
    let now = SystemTime::now();
    populate(&store, now, &[("fresh", 1), ("old", 100), ("older", 200)]);

    let sweeper = RetentionSweeper::new(
        tmp.path(),
        Some(Duration::from_secs(72 * HOUR)),
        0,
        Duration::from_secs(60),
    );
    let report = sweeper.sweep_at(now);
    assert_eq!(report.scanned, 3);
    assert_eq!(report.deleted, 2);
    assert_eq!(remaining(tmp.path()), vec!["fresh"]);
    assert!(
        fs::read_dir(tmp.path()).expect("dir").flatten().all(|e| {
            let p = e.path();
            p.extension().is_some_and(|x| x == "json") || p.with_extension("json").exists()
        }),
        "no orphaned audio left behind"
    );

    // Nothing new: a second sweep is a no-op.
    let again = sweeper.sweep_at(now);
    assert_eq!(again.deleted, 0);
    assert_eq!(remaining(tmp.path()), vec!["fresh"]);
}

#[test]
fn test_file_cap_removes_oldest_survivors() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let store = ArtifactStore::new(tmp.path());
    let now = SystemTime::now();
    populate(&store, now, &[("a", 1), ("b", 2), ("c", 3), ("d", 4), ("e", 5)]);

    let sweeper = RetentionSweeper::new(
        tmp.path(),
        Some(Duration::from_secs(72 * HOUR)),
        2,
        Duration::from_secs(60),
    );
    let report = sweeper.sweep_at(now);
    assert_eq!(report.deleted, 3);
    assert_eq!(remaining(tmp.path()), vec!["a", "b"]);
}

#[test]
fn test_half_missing_pair_is_still_swept() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let store = ArtifactStore::new(tmp.path());
    let now = SystemTime::now();
    let saved = store.save(record("gone"), &[0.0; 8]).expect("save");
    fs::remove_file(&saved.audio).expect("remove audio");
    age(&saved.sidecar, now, 500);

    let sweeper = RetentionSweeper::new(
        tmp.path(),
        Some(Duration::from_secs(HOUR)),
        0,
        Duration::from_secs(60),
    );
    assert_eq!(sweeper.sweep_at(now).deleted, 1);
    assert!(!saved.sidecar.exists());
}

#[test]
fn test_zero_retention_hours_keeps_every_pair() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let store = ArtifactStore::new(tmp.path());
    let now = SystemTime::now();
    populate(&store, now, &[("fresh", 0), ("ancient", 10_000)]);

    let config = RecordingsConfig {
        enabled: true,
        dir: tmp.path().to_path_buf(),
        retention_hours: 0,
        max_files: 0,
        ..RecordingsConfig::default()
    };
    let report = RetentionSweeper::from_config(&config).sweep_at(now);
    assert_eq!(report.scanned, 2);
    assert_eq!(report.deleted, 0);
    assert_eq!(remaining(tmp.path()), vec!["ancient", "fresh"]);
}

#[test]
fn test_zero_retention_hours_still_applies_file_cap() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let store = ArtifactStore::new(tmp.path());
    let now = SystemTime::now();
    populate(&store, now, &[("a", 1), ("b", 2), ("c", 3)]);

    let config = RecordingsConfig {
        enabled: true,
        dir: tmp.path().to_path_buf(),
        retention_hours: 0,
        max_files: 1,
        ..RecordingsConfig::default()
    };
    assert_eq!(RetentionSweeper::from_config(&config).sweep_at(now).deleted, 2);
    assert_eq!(remaining(tmp.path()), vec!["a"]);
}

#[test]
fn test_relative_recordings_dir_removes_both_halves() {
    let tmp = tempfile::Builder::new()
        .prefix("rec")
        .tempdir_in(".")
        .expect("tempdir in working directory");
    let dir = PathBuf::from(tmp.path().file_name().expect("dir name"));
    assert!(dir.is_relative());

    let store = ArtifactStore::new(&dir);
    let now = SystemTime::now();
    let saved = store.save(record("old"), &[0.2; 16]).expect("save");
    age(&saved.audio, now, 100);
    age(&saved.sidecar, now, 100);

    let sweeper =
        RetentionSweeper::new(&dir, Some(Duration::from_secs(HOUR)), 0, Duration::from_secs(60));
    let report = sweeper.sweep_at(now);
    assert_eq!(report.deleted, 1);
    assert!(!saved.sidecar.exists());
    assert!(!saved.audio.exists(), "audio half must not be orphaned");
    assert_eq!(fs::read_dir(&dir).expect("dir").count(), 0);
}
