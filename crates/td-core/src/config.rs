use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration loaded from `~/.termdeck/config.toml`.
///
/// Every section has serde defaults, so a partial file only overrides the
/// keys it names.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
}

impl Config {
    /// Load config from `~/.termdeck/config.toml`, falling back to defaults
    /// when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.session.validate()?;
        self.buffer.validate()?;
        self.detection.validate()?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".termdeck")
            .join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// General
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// `"pretty"` or `"json"`.
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "pretty".into()
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Size of the terminal id pool (ids run `1..=max_terminals`).
    #[serde(default = "default_max_terminals")]
    pub max_terminals: u16,
    #[serde(default = "default_shell")]
    pub default_shell: String,
    /// Tried once when the requested shell fails to spawn.
    #[serde(default = "default_fallback_shell")]
    pub fallback_shell: String,
    #[serde(default = "default_cols")]
    pub default_cols: u16,
    #[serde(default = "default_rows")]
    pub default_rows: u16,
    /// How long `dispose` waits for the process to exit before force-releasing.
    #[serde(default = "default_dispose_timeout_ms")]
    pub dispose_timeout_ms: u64,
    /// Upper bound on the recent-output snapshot kept per terminal.
    #[serde(default = "default_scrollback_bytes")]
    pub scrollback_bytes: usize,
    #[serde(default = "default_term")]
    pub term: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_terminals: default_max_terminals(),
            default_shell: default_shell(),
            fallback_shell: default_fallback_shell(),
            default_cols: default_cols(),
            default_rows: default_rows(),
            dispose_timeout_ms: default_dispose_timeout_ms(),
            scrollback_bytes: default_scrollback_bytes(),
            term: default_term(),
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_terminals == 0 || self.max_terminals > 64 {
            return Err(ConfigError::Validation(
                "session.max_terminals must be between 1 and 64".to_string(),
            ));
        }
        if self.default_cols == 0 || self.default_rows == 0 {
            return Err(ConfigError::Validation(
                "session.default_cols and session.default_rows must be non-zero".to_string(),
            ));
        }
        if self.default_shell.trim().is_empty() {
            return Err(ConfigError::Validation(
                "session.default_shell must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_max_terminals() -> u16 {
    5
}
fn default_shell() -> String {
    if let Ok(shell) = std::env::var("SHELL") {
        if !shell.trim().is_empty() {
            return shell;
        }
    }
    if cfg!(target_os = "windows") {
        "cmd.exe".into()
    } else if cfg!(target_os = "macos") {
        "/bin/zsh".into()
    } else {
        "/bin/bash".into()
    }
}
fn default_fallback_shell() -> String {
    if cfg!(target_os = "windows") {
        "powershell.exe".into()
    } else {
        "/bin/sh".into()
    }
}
fn default_cols() -> u16 {
    80
}
fn default_rows() -> u16 {
    24
}
fn default_dispose_timeout_ms() -> u64 {
    3000
}
fn default_scrollback_bytes() -> usize {
    64 * 1024
}
fn default_term() -> String {
    "xterm-256color".into()
}

// ---------------------------------------------------------------------------
// Output buffering
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Flush interval while no agent is connected (~60Hz).
    #[serde(default = "default_normal_interval_ms")]
    pub normal_interval_ms: u64,
    /// Flush interval while the terminal holds the connected agent.
    #[serde(default = "default_fast_interval_ms")]
    pub fast_interval_ms: u64,
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,
    /// A single chunk longer than this (in chars) is flushed immediately.
    #[serde(default = "default_large_chunk_threshold")]
    pub large_chunk_threshold: usize,
    /// Queue depth beyond which a forced flush happens.
    #[serde(default = "default_max_queue_entries")]
    pub max_queue_entries: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            normal_interval_ms: default_normal_interval_ms(),
            fast_interval_ms: default_fast_interval_ms(),
            min_interval_ms: default_min_interval_ms(),
            max_interval_ms: default_max_interval_ms(),
            large_chunk_threshold: default_large_chunk_threshold(),
            max_queue_entries: default_max_queue_entries(),
        }
    }
}

impl BufferConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "buffer.min_interval_ms must be non-zero".to_string(),
            ));
        }
        let ordered = self.min_interval_ms <= self.fast_interval_ms
            && self.fast_interval_ms <= self.normal_interval_ms
            && self.normal_interval_ms <= self.max_interval_ms;
        if !ordered {
            return Err(ConfigError::Validation(
                "buffer intervals must satisfy min <= fast <= normal <= max".to_string(),
            ));
        }
        if self.max_queue_entries == 0 || self.large_chunk_threshold == 0 {
            return Err(ConfigError::Validation(
                "buffer.max_queue_entries and buffer.large_chunk_threshold must be non-zero"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

fn default_normal_interval_ms() -> u64 {
    16
}
fn default_fast_interval_ms() -> u64 {
    8
}
fn default_min_interval_ms() -> u64 {
    4
}
fn default_max_interval_ms() -> u64 {
    16
}
fn default_large_chunk_threshold() -> usize {
    1000
}
fn default_max_queue_entries() -> usize {
    50
}

// ---------------------------------------------------------------------------
// Agent detection
// ---------------------------------------------------------------------------

/// Signatures used to recognise one CLI agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSignature {
    /// Reported as the terminal's `agent_type`.
    pub name: String,
    /// Launch commands matched against typed input lines.
    #[serde(default)]
    pub commands: Vec<String>,
    /// Regexes matched against output (startup banner, version string).
    #[serde(default)]
    pub banners: Vec<String>,
    /// Plain, case-insensitive keywords; weak evidence only.
    #[serde(default)]
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Confidence required before a terminal becomes `Connected`.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    /// Evidence contributed by one keyword hit.
    #[serde(default = "default_keyword_confidence")]
    pub keyword_confidence: f64,
    /// Regexes recognising a shell prompt on the last line of a batch.
    #[serde(default = "default_prompt_patterns")]
    pub prompt_patterns: Vec<String>,
    #[serde(default = "default_agents")]
    pub agents: Vec<AgentSignature>,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            min_confidence: default_min_confidence(),
            keyword_confidence: default_keyword_confidence(),
            prompt_patterns: default_prompt_patterns(),
            agents: default_agents(),
        }
    }
}

impl DetectionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(ConfigError::Validation(
                "detection.min_confidence must be between 0 and 1".to_string(),
            ));
        }
        if self.keyword_confidence <= 0.0 || self.keyword_confidence > 1.0 {
            return Err(ConfigError::Validation(
                "detection.keyword_confidence must be in (0, 1]".to_string(),
            ));
        }
        for pattern in &self.prompt_patterns {
            regex::Regex::new(pattern).map_err(|e| {
                ConfigError::Validation(format!("detection.prompt_patterns: {pattern:?}: {e}"))
            })?;
        }
        for agent in &self.agents {
            if agent.name.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "detection.agents: name must not be empty".to_string(),
                ));
            }
            for banner in &agent.banners {
                regex::Regex::new(banner).map_err(|e| {
                    ConfigError::Validation(format!(
                        "detection.agents[{}].banners: {banner:?}: {e}",
                        agent.name
                    ))
                })?;
            }
        }
        Ok(())
    }
}

fn default_min_confidence() -> f64 {
    0.75
}
fn default_keyword_confidence() -> f64 {
    0.4
}
/// Prompt recognition is a heuristic. The defaults stay narrow because a
/// false match ends a live agent session: agent UIs draw `>` input boxes and
/// `❯` selection markers that a loose pattern would take for a shell.
fn default_prompt_patterns() -> Vec<String> {
    vec![
        // user@host:~/dir$ , user@host dir %
        r"^[\w.-]+@[\w.-]+[:\s].*[$#%]\s*$".into(),
        // bare prompts: "$ ", "# ", "% "
        r"^[$#%]\s*$".into(),
        // starship / powerline style: a short path or branch, then the glyph
        r"^[\w~/.:@+\- ]{0,80}?\s?[❯➜λ]\s?$".into(),
        // PowerShell
        r"^PS [A-Za-z]:\\.*>\s*$".into(),
        // bash default without user@host
        r"^bash-\d+(\.\d+)*[$#]\s*$".into(),
    ]
}
fn default_agents() -> Vec<AgentSignature> {
    vec![
        AgentSignature {
            name: "claude".into(),
            commands: vec!["claude".into()],
            banners: vec![
                r"Welcome to Claude Code".into(),
                r"(?i)claude code v?\d+\.\d+".into(),
            ],
            keywords: vec!["claude".into(), "anthropic".into()],
        },
        AgentSignature {
            name: "codex".into(),
            commands: vec!["codex".into()],
            banners: vec![r"(?i)openai codex".into(), r"(?i)codex v?\d+\.\d+".into()],
            keywords: vec!["codex".into()],
        },
        AgentSignature {
            name: "gemini".into(),
            commands: vec!["gemini".into()],
            banners: vec![r"(?i)gemini cli".into(), r"(?i)gemini v?\d+\.\d+".into()],
            keywords: vec!["gemini".into()],
        },
        AgentSignature {
            name: "opencode".into(),
            commands: vec!["opencode".into()],
            banners: vec![r"(?i)opencode v?\d+\.\d+".into()],
            keywords: vec!["opencode".into()],
        },
    ]
}
