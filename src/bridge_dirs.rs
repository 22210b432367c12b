//! Centralized filesystem paths for the bridge.
//!
//! Uses the [`dirs`] crate for platform-appropriate resolution.
//!
//! | Purpose | Linux | macOS |
//! |---------|-------|-------|
//! | Data | `~/.local/share/voxbridge/` | `~/Library/Application Support/voxbridge/` |
//! | Config | `~/.config/voxbridge/` | `~/Library/Application Support/voxbridge/` |
//!
//! # Environment Overrides
//!
//! - `VOXBRIDGE_DATA_DIR` overrides [`data_dir`]
//! - `VOXBRIDGE_CONFIG_DIR` overrides [`config_dir`]

use std::path::{Path, PathBuf};

/// Application data root directory.
///
/// Holds recordings and log files.
#[must_use]
pub fn data_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("VOXBRIDGE_DATA_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::data_dir()
        .map(|d| d.join("voxbridge"))
        .unwrap_or_else(|| PathBuf::from("/tmp/voxbridge-data"))
}

/// Application config directory.
///
/// Holds `config.toml` and the user-scoped tool manifest `mcp.json`.
#[must_use]
pub fn config_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("VOXBRIDGE_CONFIG_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::config_dir()
        .map(|d| d.join("voxbridge"))
        .unwrap_or_else(|| PathBuf::from("/tmp/voxbridge-config"))
}

/// Log file directory (`data_dir()/logs/`).
#[must_use]
pub fn logs_dir() -> PathBuf {
    data_dir().join("logs")
}

/// Persisted segment recordings (`data_dir()/recordings/`).
#[must_use]
pub fn recordings_dir() -> PathBuf {
    data_dir().join("recordings")
}

/// Main config file path (`config_dir()/config.toml`).
#[must_use]
pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}

/// User-scoped tool-server manifest (`config_dir()/mcp.json`).
#[must_use]
pub fn user_manifest_file() -> PathBuf {
    config_dir().join("mcp.json")
}

/// Workspace-scoped tool-server manifest (`<workspace>/.voxbridge/mcp.json`).
#[must_use]
pub fn workspace_manifest_file(workspace: &Path) -> PathBuf {
    workspace.join(".voxbridge").join("mcp.json")
}

/// Expand a leading `~` or `~/` against the user's home directory.
///
/// Values that do not start with either form (including `~user/...`) and
/// values seen when no home directory is known are returned unchanged.
#[must_use]
pub fn expand_home(value: &str) -> String {
    expand_home_with(value, dirs::home_dir().as_deref())
}

/// [`expand_home`] with an injectable home directory.
#[must_use]
pub fn expand_home_with(value: &str, home: Option<&Path>) -> String {
    let Some(home) = home else {
        return value.to_owned();
    };
    if value == "~" {
        return home.to_string_lossy().into_owned();
    }
    match value.strip_prefix("~/") {
        Some(rest) => home.join(rest).to_string_lossy().into_owned(),
        None => value.to_owned(),
    }
}
