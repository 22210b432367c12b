//! Configuration types for the voice bridge.
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! environment variables (see [`BridgeConfig::apply_env`]).

use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Top-level configuration for the bridge.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Discord identifiers and user allow-list.
    pub discord: DiscordConfig,
    /// Inbound PCM frame format.
    pub audio: AudioConfig,
    /// Voice activity detection and segmentation.
    pub vad: VadConfig,
    /// Wake phrase gating.
    pub wake: WakeConfig,
    /// Reasoning backend settings.
    pub llm: LlmConfig,
    /// Speech-to-text collaborator.
    pub stt: SttConfig,
    /// Text-to-speech collaborator.
    pub tts: TtsConfig,
    /// Tool-server control sessions.
    pub tools: ToolsConfig,
    /// Persisted segment recordings and their retention.
    pub recordings: RecordingsConfig,
    /// Supervisor settings.
    pub runtime: RuntimeConfig,
    /// Log output.
    pub logging: LoggingConfig,
}

/// Discord identifiers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscordConfig {
    /// Guild the bridge joins. Required.
    pub guild_id: String,
    /// Voice channel the bridge listens in. Required.
    pub voice_channel_id: String,
    /// Users whose speech is processed. Empty means everyone.
    pub allowed_user_ids: Vec<String>,
}

/// Inbound PCM frame format as delivered by the voice transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Sample rate of decoded frames in Hz.
    pub sample_rate: u32,
    /// Interleaved channels per frame (mixed down to mono on ingest).
    pub channels: u16,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
        }
    }
}

/// Voice activity detection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// RMS energy threshold for speech, for f32 samples in \[-1, 1\].
    pub threshold: f32,
    /// Trailing silence (ms) that closes a speech segment.
    pub hang_ms: u32,
    /// Maximum segment length (ms) before a forced close.
    pub max_segment_ms: u32,
    /// Segments with less speech than this (ms) are discarded.
    pub min_speech_ms: u32,
    /// A speaker stream with no frames for this long is flushed and evicted.
    pub idle_flush_ms: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: 0.01,
            hang_ms: 800,
            max_segment_ms: 15_000,
            min_speech_ms: 300,
            idle_flush_ms: 2_000,
        }
    }
}

/// Wake phrase gate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WakeConfig {
    /// Whether the gate is enabled. When disabled every transcript is forwarded.
    pub enabled: bool,
    /// Accepted wake phrases (case-insensitive).
    pub phrases: Vec<String>,
    /// Similarity (0.0–1.0) a transcript window needs to count as a match.
    pub threshold: f32,
    /// Seconds a conversation stays open after the last turn.
    pub session_timeout_secs: u64,
}

impl Default for WakeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            phrases: vec!["hey atlas".to_owned()],
            threshold: 0.8,
            session_timeout_secs: 45,
        }
    }
}

/// Reasoning backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL of the OpenAI-compatible API.
    pub base_url: String,
    /// Bearer token (empty for local servers).
    pub api_key: String,
    /// Default model.
    pub model: String,
    /// Fallback model used for the single transient retry.
    pub fallback_model: String,
    /// When false the fallback model is used as the primary choice.
    pub primary_model_enabled: bool,
    /// Token budget used when a request does not specify one.
    pub default_max_tokens: u32,
    /// Hard ceiling applied to every request's token budget (0 = no ceiling).
    pub max_tokens_ceiling: u32,
    /// Sampling temperature.
    pub temperature: f32,
    /// Per-attempt request timeout.
    pub request_timeout_secs: u64,
    /// Pause before the fallback retry.
    pub fallback_backoff_ms: u64,
    /// System prompt prepended to every conversation.
    pub system_prompt: String,
    /// Turns retained per conversation (0 = unbounded).
    pub max_history_turns: usize,
    /// Tool-call round trips allowed per turn.
    pub max_tool_rounds: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_owned(),
            api_key: String::new(),
            model: String::new(),
            fallback_model: String::new(),
            primary_model_enabled: true,
            default_max_tokens: 512,
            max_tokens_ceiling: 4_000,
            temperature: 0.7,
            request_timeout_secs: 30,
            fallback_backoff_ms: 250,
            system_prompt: "You are a voice assistant in a Discord call. \
                            Answer in one to three short spoken sentences."
                .to_owned(),
            max_history_turns: 12,
            max_tool_rounds: 3,
        }
    }
}

/// Speech-to-text collaborator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SttConfig {
    /// Endpoint accepting raw PCM and returning `{"text": ...}`.
    pub url: String,
    /// Request timeout.
    pub request_timeout_secs: u64,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8178/transcribe".to_owned(),
            request_timeout_secs: 20,
        }
    }
}

/// Text-to-speech collaborator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// Synthesis endpoint. Empty disables spoken replies.
    pub url: String,
    /// Voice name passed to the synthesizer.
    pub voice: String,
    /// Request timeout.
    pub request_timeout_secs: u64,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            voice: "default".to_owned(),
            request_timeout_secs: 20,
        }
    }
}

/// Tool-server control session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Master switch for tool sessions.
    pub enabled: bool,
    /// Explicit manifest path. When set, no other manifest is read.
    pub config_path: Option<PathBuf>,
    /// Workspace root whose `.voxbridge/mcp.json` is read.
    pub workspace_dir: Option<PathBuf>,
    /// Per-attempt connect + handshake timeout.
    pub connect_timeout_secs: u64,
    /// Liveness probe interval.
    pub probe_interval_secs: u64,
    /// Timeout for a single tool call.
    pub call_timeout_secs: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            config_path: None,
            workspace_dir: None,
            connect_timeout_secs: 10,
            probe_interval_secs: 30,
            call_timeout_secs: 30,
        }
    }
}

/// Segment recording and retention configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingsConfig {
    /// Persist each transcribed segment.
    pub enabled: bool,
    /// Directory holding `<base>.wav` + `<base>.json` pairs.
    pub dir: PathBuf,
    /// Pairs older than this are deleted (0 disables age pruning).
    pub retention_hours: u64,
    /// Interval between sweeps.
    pub sweep_interval_secs: u64,
    /// Maximum pairs kept (0 = no cap).
    pub max_files: usize,
}

impl Default for RecordingsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: crate::bridge_dirs::recordings_dir(),
            retention_hours: 72,
            sweep_interval_secs: 600,
            max_files: 0,
        }
    }
}

/// Supervisor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Time allowed for in-flight work to drain on shutdown.
    pub shutdown_grace_ms: u64,
    /// Frames buffered per speaker before new frames are dropped.
    pub frame_queue_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            shutdown_grace_ms: 5_000,
            frame_queue_capacity: 256,
        }
    }
}

/// Log output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive. Falls back to `RUST_LOG`, then `info`.
    pub filter: Option<String>,
    /// Also write a daily rolling log file.
    pub file_enabled: bool,
    /// Directory for rolling log files.
    pub dir: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: None,
            file_enabled: false,
            dir: crate::bridge_dirs::logs_dir(),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| BridgeError::Config(e.to_string()))
    }

    /// Build the effective configuration from the process environment.
    ///
    /// Reads `VOXBRIDGE_CONFIG` (or the default config file when it exists),
    /// then applies environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error for an unreadable config file or malformed values.
    pub fn load() -> Result<Self> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        let explicit = vars.get("VOXBRIDGE_CONFIG").map(PathBuf::from);
        let mut config = match explicit {
            Some(path) => Self::from_file(&path)?,
            None => {
                let path = crate::bridge_dirs::config_file();
                if path.exists() {
                    Self::from_file(&path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env(&vars)?;
        Ok(config)
    }

    /// Apply environment-variable overrides.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Config`] naming the variable when a numeric or
    /// boolean value cannot be parsed.
    pub fn apply_env(&mut self, vars: &HashMap<String, String>) -> Result<()> {
        let get = |key: &str| {
            vars.get(key)
                .map(|v| v.trim().to_owned())
                .filter(|v| !v.is_empty())
        };

        if let Some(v) = get("DISCORD_GUILD_ID") {
            self.discord.guild_id = v;
        }
        if let Some(v) = get("DISCORD_VOICE_CHANNEL_ID") {
            self.discord.voice_channel_id = v;
        }
        if let Some(v) = get("ALLOWED_USER_IDS") {
            self.discord.allowed_user_ids = split_list(&v);
        }

        if let Some(v) = get("WAKE_PHRASES") {
            self.wake.phrases = split_list(&v);
        }
        if let Some(v) = get("WAKE_THRESHOLD") {
            self.wake.threshold = parse_var("WAKE_THRESHOLD", &v)?;
        }
        if let Some(v) = get("WAKE_SESSION_TIMEOUT_SECS") {
            self.wake.session_timeout_secs = parse_var("WAKE_SESSION_TIMEOUT_SECS", &v)?;
        }

        if let Some(v) = get("VAD_THRESHOLD") {
            self.vad.threshold = parse_var("VAD_THRESHOLD", &v)?;
        }
        if let Some(v) = get("VAD_HANG_MS") {
            self.vad.hang_ms = parse_var("VAD_HANG_MS", &v)?;
        }
        if let Some(v) = get("VAD_MAX_SEGMENT_MS") {
            self.vad.max_segment_ms = parse_var("VAD_MAX_SEGMENT_MS", &v)?;
        }
        if let Some(v) = get("VAD_MIN_SPEECH_MS") {
            self.vad.min_speech_ms = parse_var("VAD_MIN_SPEECH_MS", &v)?;
        }
        if let Some(v) = get("SPEAKER_IDLE_FLUSH_MS") {
            self.vad.idle_flush_ms = parse_var("SPEAKER_IDLE_FLUSH_MS", &v)?;
        }

        if let Some(v) = get("RECORDINGS_ENABLED") {
            self.recordings.enabled = parse_bool("RECORDINGS_ENABLED", &v)?;
        }
        if let Some(v) = get("RECORDINGS_DIR") {
            self.recordings.dir = PathBuf::from(crate::bridge_dirs::expand_home(&v));
        }
        if let Some(v) = get("RECORDINGS_RETENTION_HOURS") {
            self.recordings.retention_hours = parse_var("RECORDINGS_RETENTION_HOURS", &v)?;
        }
        if let Some(v) = get("RECORDINGS_SWEEP_INTERVAL_SECS") {
            self.recordings.sweep_interval_secs =
                parse_var("RECORDINGS_SWEEP_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = get("RECORDINGS_MAX_FILES") {
            self.recordings.max_files = parse_var("RECORDINGS_MAX_FILES", &v)?;
        }

        if let Some(v) = get("LLM_BASE_URL") {
            self.llm.base_url = v;
        }
        if let Some(v) = get("LLM_API_KEY") {
            self.llm.api_key = v;
        }
        if let Some(v) = get("LLM_MODEL") {
            self.llm.model = v;
        }
        if let Some(v) = get("LLM_FALLBACK_MODEL") {
            self.llm.fallback_model = v;
        }
        if let Some(v) = get("LLM_MAX_TOKENS") {
            self.llm.default_max_tokens = parse_var("LLM_MAX_TOKENS", &v)?;
        }
        if let Some(v) = get("LLM_MAX_TOKENS_CEILING") {
            self.llm.max_tokens_ceiling = parse_var("LLM_MAX_TOKENS_CEILING", &v)?;
        }
        if let Some(v) = get("LLM_PRIMARY_MODEL_ENABLED") {
            self.llm.primary_model_enabled = parse_bool("LLM_PRIMARY_MODEL_ENABLED", &v)?;
        }

        if let Some(v) = get("STT_URL") {
            self.stt.url = v;
        }
        if let Some(v) = get("TTS_URL") {
            self.tts.url = v;
        }
        if let Some(v) = get("TTS_VOICE") {
            self.tts.voice = v;
        }

        if let Some(v) = get("MCP_CONFIG_PATH") {
            self.tools.config_path = Some(PathBuf::from(crate::bridge_dirs::expand_home(&v)));
        }
        if let Some(v) = get("VOXBRIDGE_WORKSPACE") {
            self.tools.workspace_dir = Some(PathBuf::from(crate::bridge_dirs::expand_home(&v)));
        }

        if let Some(v) = get("VOXBRIDGE_LOG") {
            self.logging.filter = Some(v);
        }
        if let Some(v) = get("VOXBRIDGE_LOG_DIR") {
            self.logging.file_enabled = true;
            self.logging.dir = PathBuf::from(crate::bridge_dirs::expand_home(&v));
        }

        Ok(())
    }

    /// Check the identifiers the process cannot start without.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Config`] listing every missing identifier.
    pub fn validate_required(&self) -> Result<()> {
        let mut missing = Vec::new();
        if self.discord.guild_id.trim().is_empty() {
            missing.push("DISCORD_GUILD_ID");
        }
        if self.discord.voice_channel_id.trim().is_empty() {
            missing.push("DISCORD_VOICE_CHANNEL_ID");
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(BridgeError::Config(format!(
                "missing required settings: {}",
                missing.join(", ")
            )))
        }
    }
}

/// Split a comma-separated list, trimming entries and dropping empty ones.
fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

fn parse_var<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.parse::<T>()
        .map_err(|e| BridgeError::Config(format!("{key}={raw:?} is invalid: {e}")))
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(BridgeError::Config(format!(
            "{key}={raw:?} is not a boolean"
        ))),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn default_config_is_valid() {
        let config = BridgeConfig::default();
        assert!(config.audio.sample_rate > 0);
        assert!(config.audio.channels > 0);
        assert!(config.vad.hang_ms > 0);
        assert!(config.vad.max_segment_ms > config.vad.hang_ms);
        assert!(!config.wake.phrases.is_empty());
        assert!(config.llm.default_max_tokens > 0);
        assert!(config.llm.default_max_tokens <= config.llm.max_tokens_ceiling);
        assert!(config.runtime.frame_queue_capacity > 0);
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = BridgeConfig::default();
        config.vad.hang_ms = 500;
        config.wake.phrases = vec!["ok bridge".to_owned()];
        std::fs::write(&path, toml::to_string_pretty(&config).unwrap()).unwrap();

        let loaded = BridgeConfig::from_file(&path).unwrap();
        assert_eq!(loaded.vad.hang_ms, 500);
        assert_eq!(loaded.wake.phrases, vec!["ok bridge".to_owned()]);
    }

    #[test]
    fn from_file_invalid_toml_returns_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "this is not valid toml {{{").unwrap();
        assert!(BridgeConfig::from_file(&path).is_err());
    }

    #[test]
    fn partial_section_keeps_defaults() {
        let config: BridgeConfig = toml::from_str("[llm]\nmodel = \"m1\"").unwrap();
        assert_eq!(config.llm.model, "m1");
        assert_eq!(config.llm.default_max_tokens, 512);
        assert!(config.llm.primary_model_enabled);
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = BridgeConfig::default();
        config
            .apply_env(&env(&[
                ("DISCORD_GUILD_ID", "100"),
                ("DISCORD_VOICE_CHANNEL_ID", "200"),
                ("ALLOWED_USER_IDS", "42, 7,,"),
                ("WAKE_PHRASES", "hey atlas,ok atlas"),
                ("WAKE_THRESHOLD", "0.75"),
                ("VAD_HANG_MS", "500"),
                ("VAD_MAX_SEGMENT_MS", "8000"),
                ("RECORDINGS_MAX_FILES", "50"),
                ("LLM_FALLBACK_MODEL", "small"),
                ("LLM_PRIMARY_MODEL_ENABLED", "false"),
            ]))
            .unwrap();
        assert_eq!(config.discord.guild_id, "100");
        assert_eq!(config.discord.allowed_user_ids, vec!["42", "7"]);
        assert_eq!(config.wake.phrases.len(), 2);
        assert!((config.wake.threshold - 0.75).abs() < f32::EPSILON);
        assert_eq!(config.vad.hang_ms, 500);
        assert_eq!(config.vad.max_segment_ms, 8_000);
        assert_eq!(config.recordings.max_files, 50);
        assert_eq!(config.llm.fallback_model, "small");
        assert!(!config.llm.primary_model_enabled);
    }

    #[test]
    fn malformed_number_names_the_variable() {
        let mut config = BridgeConfig::default();
        let err = config
            .apply_env(&env(&[("VAD_HANG_MS", "soon")]))
            .unwrap_err();
        assert!(err.to_string().contains("VAD_HANG_MS"));
    }

    #[test]
    fn blank_values_are_ignored() {
        let mut config = BridgeConfig::default();
        config.apply_env(&env(&[("LLM_MODEL", "   ")])).unwrap();
        assert!(config.llm.model.is_empty());
    }

    #[test]
    fn validate_required_lists_missing_ids() {
        let config = BridgeConfig::default();
        let err = config.validate_required().unwrap_err().to_string();
        assert!(err.contains("DISCORD_GUILD_ID"));
        assert!(err.contains("DISCORD_VOICE_CHANNEL_ID"));

        let mut ok = BridgeConfig::default();
        ok.discord.guild_id = "1".to_owned();
        ok.discord.voice_channel_id = "2".to_owned();
        assert!(ok.validate_required().is_ok());
    }
}
