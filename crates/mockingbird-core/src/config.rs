//! Configuration loading and validation.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default start marker delimiting embedded instruction markup.
pub const DEFAULT_START_MARKER: &str = "<instructions>";

/// Default end marker delimiting embedded instruction markup.
pub const DEFAULT_END_MARKER: &str = "</instructions>";

/// Default model name echoed in wire events.
pub const DEFAULT_MODEL: &str = "mockingbird-scripted";

/// Top-level mockingbird configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<StreamConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<InstructionsConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionConfig>,
}

/// Stream generation pacing and granularity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Delay between emitted fragments, in milliseconds (0 = no pacing).
    #[serde(default)]
    pub chunk_delay_ms: u64,

    /// Words per text fragment.
    #[serde(default = "default_words_per_chunk")]
    pub words_per_chunk: usize,

    /// Words per reasoning fragment.
    #[serde(default = "default_reasoning_words_per_chunk")]
    pub reasoning_words_per_chunk: usize,

    /// Number of fragments a tool call's argument JSON is split into.
    #[serde(default = "default_argument_fragments")]
    pub argument_fragments: usize,
}

fn default_words_per_chunk() -> usize {
    3
}

fn default_reasoning_words_per_chunk() -> usize {
    5
}

fn default_argument_fragments() -> usize {
    2
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            chunk_delay_ms: 0,
            words_per_chunk: default_words_per_chunk(),
            reasoning_words_per_chunk: default_reasoning_words_per_chunk(),
            argument_fragments: default_argument_fragments(),
        }
    }
}

impl StreamConfig {
    pub fn chunk_delay(&self) -> Duration {
        Duration::from_millis(self.chunk_delay_ms)
    }
}

/// Markers delimiting the instruction block inside a user message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstructionsConfig {
    #[serde(default = "default_start_marker")]
    pub start_marker: String,

    #[serde(default = "default_end_marker")]
    pub end_marker: String,
}

fn default_start_marker() -> String {
    DEFAULT_START_MARKER.into()
}

fn default_end_marker() -> String {
    DEFAULT_END_MARKER.into()
}

impl Default for InstructionsConfig {
    fn default() -> Self {
        Self {
            start_marker: default_start_marker(),
            end_marker: default_end_marker(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "mockingbird_agent=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: default_log_format(),
            level: None,
            filters: Vec::new(),
            output: default_log_output(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Directory for JSONL transcripts (default: `~/.mockingbird/transcripts`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript_dir: Option<String>,
}

static ENV_VAR_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([^}]+)\}").expect("env var pattern is valid")
});

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    ENV_VAR_RE
        .replace_all(input, |caps: &regex::Captures| {
            let var_name = &caps[1];
            std::env::var(var_name).unwrap_or_default()
        })
        .into_owned()
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        Self::from_json5(&raw)
    }

    /// Parse config text (JSON5), substituting `${ENV_VAR}` references.
    pub fn from_json5(raw: &str) -> crate::error::Result<Self> {
        let substituted = substitute_env_vars(raw);
        json5::from_str(&substituted)
            .map_err(|e| crate::error::MockingbirdError::Config(e.to_string()))
    }

    /// Default config file path.
    pub fn config_path() -> PathBuf {
        data_dir().join("config.json")
    }

    pub fn model(&self) -> String {
        self.model
            .clone()
            .unwrap_or_else(|| DEFAULT_MODEL.to_string())
    }

    pub fn stream(&self) -> StreamConfig {
        self.stream.clone().unwrap_or_default()
    }

    pub fn instructions(&self) -> InstructionsConfig {
        self.instructions.clone().unwrap_or_default()
    }

    pub fn logging(&self) -> LoggingConfig {
        self.logging.clone().unwrap_or_default()
    }

    /// Resolve the transcript directory.
    pub fn transcript_dir(&self) -> PathBuf {
        self.session
            .as_ref()
            .and_then(|s| s.transcript_dir.as_ref())
            .map(|dir| {
                let expanded = shellexpand::tilde(dir);
                PathBuf::from(expanded.as_ref())
            })
            .unwrap_or_else(|| data_dir().join("transcripts"))
    }

    /// Get a config value by dotted path (e.g. "stream.words_per_chunk").
    pub fn get_path(&self, path: &str) -> Option<serde_json::Value> {
        let json = serde_json::to_value(self).ok()?;
        let mut current = &json;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current.clone())
    }

    /// Set a config value by dotted path, creating missing sections.
    ///
    /// The whole config is re-read afterwards, so a value of the wrong type or
    /// a key no section knows is refused and `self` is left untouched.
    pub fn set_path(&mut self, path: &str, value: serde_json::Value) -> crate::error::Result<()> {
        let invalid =
            |reason: String| crate::error::MockingbirdError::Config(format!("{path}: {reason}"));

        let segments: Vec<&str> = path.split('.').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(invalid("empty path segment".into()));
        }
        let Some((last, parents)) = segments.split_last() else {
            return Err(invalid("empty path".into()));
        };

        let mut json = serde_json::to_value(&*self)?;
        let mut current = &mut json;
        for segment in parents {
            current = match current {
                serde_json::Value::Object(map) => map
                    .entry(segment.to_string())
                    .or_insert_with(|| serde_json::json!({})),
                _ => return Err(invalid(format!("'{segment}' is not a section"))),
            };
        }
        match current {
            serde_json::Value::Object(map) => {
                map.insert(last.to_string(), value);
            }
            _ => return Err(invalid("parent is not a section".into())),
        }

        let updated: Config =
            serde_json::from_value(json).map_err(|e| invalid(e.to_string()))?;
        if updated.get_path(path).is_none() {
            return Err(invalid("unknown config key".into()));
        }
        *self = updated;
        Ok(())
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        let stream = self.stream();
        if stream.words_per_chunk == 0 {
            errors.push("stream.words_per_chunk must be at least 1".to_string());
        }
        if stream.reasoning_words_per_chunk == 0 {
            errors.push("stream.reasoning_words_per_chunk must be at least 1".to_string());
        }
        if stream.argument_fragments == 0 {
            errors.push("stream.argument_fragments must be at least 1".to_string());
        }
        if stream.chunk_delay_ms > 5_000 {
            warnings.push(format!(
                "stream.chunk_delay_ms is {}ms; turns will stream very slowly",
                stream.chunk_delay_ms
            ));
        }

        let markers = self.instructions();
        if markers.start_marker.is_empty() || markers.end_marker.is_empty() {
            errors.push("instruction markers cannot be empty".to_string());
        } else if markers.start_marker == markers.end_marker {
            errors.push("instruction start and end markers must differ".to_string());
        }

        let logging = self.logging();
        if !matches!(logging.format.as_str(), "plain" | "json") {
            warnings.push(format!(
                "Unknown logging.format '{}', falling back to plain",
                logging.format
            ));
        }

        (warnings, errors)
    }

    /// Save config to a file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Base directory for mockingbird data: `~/.mockingbird/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mockingbird")
}
