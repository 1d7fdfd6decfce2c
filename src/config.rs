//! Configuration file support for docrelay
//!
//! Config is loaded from `~/.docrelay/config.toml` (or `$DOCRELAY_HOME/config.toml`)
//! Environment variables override config file settings.

use crate::pacing::PacingPolicy;
use crate::storage::app_dir;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Default backend endpoint
pub const DEFAULT_URL: &str = "ws://localhost:9910";

/// Get the global config instance (loaded once on first access)
pub fn config() -> &'static Config {
    CONFIG.get_or_init(Config::load)
}

/// Main configuration struct
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Backend connection settings
    pub backend: BackendConfig,

    /// Typing-effect pacing for document writes
    pub typing: TypingConfig,

    /// History refresh settings
    pub history: HistoryConfig,
}

/// Backend connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackendConfig {
    /// WebSocket endpoint (default: ws://localhost:9910)
    pub url: String,
    /// Connect + upgrade deadline in milliseconds (default: 5000)
    pub connect_timeout_ms: u64,
    /// Deadline for each received frame in milliseconds (default: 30000)
    pub frame_timeout_ms: u64,
    /// Deadline for a whole exchange in milliseconds (default: 300000)
    pub exchange_timeout_ms: u64,
    /// Run a health round trip after connecting (default: true)
    pub health_check: bool,
    /// Ask the backend to stream analyze replies (default: true)
    pub stream: bool,
    /// Malformed frames tolerated per streaming exchange (default: 16)
    pub max_skipped_frames: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            connect_timeout_ms: 5_000,
            frame_timeout_ms: 30_000,
            exchange_timeout_ms: 300_000,
            health_check: true,
            stream: true,
            max_skipped_frames: 16,
        }
    }
}

impl BackendConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }

    pub fn exchange_timeout(&self) -> Duration {
        Duration::from_millis(self.exchange_timeout_ms)
    }
}

/// How replies are paced into the document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TypingMode {
    /// Write each run in one piece
    Off,
    /// Fixed-size character increments (default)
    #[default]
    Chars,
    /// A few words per increment
    Words,
    /// One line per increment
    Lines,
}

impl TypingMode {
    pub fn label(&self) -> &'static str {
        match self {
            TypingMode::Off => "off",
            TypingMode::Chars => "chars",
            TypingMode::Words => "words",
            TypingMode::Lines => "lines",
        }
    }
}

/// Typing-effect configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TypingConfig {
    /// off/chars/words/lines (default: chars)
    pub mode: TypingMode,
    /// Characters per increment in chars mode (default: 50)
    pub chunk_chars: usize,
    /// Words per increment in words mode (default: 5)
    pub chunk_words: usize,
    /// Pause between increments in milliseconds (default: 50)
    pub delay_ms: u64,
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            mode: TypingMode::Chars,
            chunk_chars: 50,
            chunk_words: 5,
            delay_ms: 50,
        }
    }
}

impl TypingConfig {
    pub fn policy(&self) -> PacingPolicy {
        let delay = Duration::from_millis(self.delay_ms);
        match self.mode {
            TypingMode::Off => PacingPolicy::Off,
            TypingMode::Chars => PacingPolicy::Chars {
                chunk: self.chunk_chars.max(1),
                delay,
            },
            TypingMode::Words => PacingPolicy::Words {
                per_chunk: self.chunk_words.max(1),
                delay,
            },
            TypingMode::Lines => PacingPolicy::Lines { delay },
        }
    }
}

/// History refresh configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct HistoryConfig {
    /// Write the raw text of the last history reply to last_history.txt (default: false)
    pub debug_dump: bool,
}

impl HistoryConfig {
    pub fn dump_path() -> Option<PathBuf> {
        app_dir().ok().map(|d| d.join("last_history.txt"))
    }
}

impl Config {
    /// Get the config file path
    pub fn path() -> Option<PathBuf> {
        app_dir().ok().map(|d| d.join("config.toml"))
    }

    /// Load config from file, with environment variable overrides
    pub fn load() -> Self {
        let mut config = Self::load_from_file().unwrap_or_default();
        config.apply_env_overrides();
        config
    }

    /// Load config from file only (no env overrides)
    fn load_from_file() -> Option<Self> {
        let path = Self::path()?;
        if !path.exists() {
            return None;
        }

        let content = std::fs::read_to_string(&path).ok()?;
        match Self::parse(&content) {
            Ok(config) => Some(config),
            Err(e) => {
                crate::logging::error(&format!("Failed to parse config file: {}", e));
                None
            }
        }
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str::<Self>(content)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        // Backend
        if let Some(v) = var("DOCRELAY_URL") {
            self.backend.url = v;
        }
        if let Some(ms) = var("DOCRELAY_CONNECT_TIMEOUT_MS").and_then(|v| v.trim().parse().ok()) {
            self.backend.connect_timeout_ms = ms;
        }
        if let Some(ms) = var("DOCRELAY_FRAME_TIMEOUT_MS").and_then(|v| v.trim().parse().ok()) {
            self.backend.frame_timeout_ms = ms;
        }
        if let Some(ms) = var("DOCRELAY_EXCHANGE_TIMEOUT_MS").and_then(|v| v.trim().parse().ok())
        {
            self.backend.exchange_timeout_ms = ms;
        }
        if let Some(parsed) = var("DOCRELAY_HEALTH_CHECK").and_then(|v| parse_env_bool(&v)) {
            self.backend.health_check = parsed;
        }
        if let Some(parsed) = var("DOCRELAY_STREAM").and_then(|v| parse_env_bool(&v)) {
            self.backend.stream = parsed;
        }

        // Typing
        if let Some(v) = var("DOCRELAY_TYPING") {
            match v.to_lowercase().as_str() {
                "off" | "none" | "0" | "false" => self.typing.mode = TypingMode::Off,
                "chars" | "char" | "on" | "1" | "true" => self.typing.mode = TypingMode::Chars,
                "words" | "word" => self.typing.mode = TypingMode::Words,
                "lines" | "line" => self.typing.mode = TypingMode::Lines,
                _ => {}
            }
        }
        if let Some(ms) = var("DOCRELAY_TYPING_DELAY_MS").and_then(|v| v.trim().parse().ok()) {
            self.typing.delay_ms = ms;
        }

        // History
        if let Some(parsed) = var("DOCRELAY_HISTORY_DUMP").and_then(|v| parse_env_bool(&v)) {
            self.history.debug_dump = parsed;
        }
    }

    /// Create a default config file with comments
    pub fn create_default_config_file() -> anyhow::Result<PathBuf> {
        let path = Self::path().ok_or_else(|| anyhow::anyhow!("No config path"))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(&path, DEFAULT_CONFIG)?;
        Ok(path)
    }

    /// Human-readable summary of the effective configuration
    pub fn display_string(&self) -> String {
        let path = Self::path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(no home directory)".to_string());
        format!(
            "Config: {}\n\
             \n\
             backend.url                 {}\n\
             backend.connect_timeout_ms  {}\n\
             backend.frame_timeout_ms    {}\n\
             backend.exchange_timeout_ms {}\n\
             backend.health_check        {}\n\
             backend.stream              {}\n\
             backend.max_skipped_frames  {}\n\
             typing.mode                 {}\n\
             typing.chunk_chars          {}\n\
             typing.chunk_words          {}\n\
             typing.delay_ms             {}\n\
             history.debug_dump          {}",
            path,
            self.backend.url,
            self.backend.connect_timeout_ms,
            self.backend.frame_timeout_ms,
            self.backend.exchange_timeout_ms,
            self.backend.health_check,
            self.backend.stream,
            self.backend.max_skipped_frames,
            self.typing.mode.label(),
            self.typing.chunk_chars,
            self.typing.chunk_words,
            self.typing.delay_ms,
            self.history.debug_dump,
        )
    }
}

/// Commented default written by `config --init`
const DEFAULT_CONFIG: &str = r#"# docrelay configuration file
# Location: ~/.docrelay/config.toml
#
# Environment variables override these settings.

[backend]
# WebSocket endpoint of the AI backend (env: DOCRELAY_URL)
url = "ws://localhost:9910"
# Connect + upgrade deadline (env: DOCRELAY_CONNECT_TIMEOUT_MS)
connect_timeout_ms = 5000
# Deadline for each received frame (env: DOCRELAY_FRAME_TIMEOUT_MS)
frame_timeout_ms = 30000
# Deadline for a whole request/response exchange (env: DOCRELAY_EXCHANGE_TIMEOUT_MS)
exchange_timeout_ms = 300000
# Health round trip after connecting (env: DOCRELAY_HEALTH_CHECK)
health_check = true
# Ask for streamed replies (env: DOCRELAY_STREAM)
stream = true
# Malformed frames tolerated per streamed reply
max_skipped_frames = 16

[typing]
# off / chars / words / lines (env: DOCRELAY_TYPING)
mode = "chars"
chunk_chars = 50
chunk_words = 5
# Pause between increments (env: DOCRELAY_TYPING_DELAY_MS)
delay_ms = 50

[history]
# Keep the raw text of the last history reply in last_history.txt (env: DOCRELAY_HISTORY_DUMP)
debug_dump = false
"#;

fn parse_env_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
