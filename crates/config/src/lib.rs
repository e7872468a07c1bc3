//! Configuration loading, validation, and management for Homunculus.
//!
//! Loads configuration from `~/.homunculus/config.toml` (or an explicit
//! `--config` path) with environment variable overrides. Validates all
//! settings at startup.
//!
//! Secrets never live in the TOML file. The model section names the
//! environment variable holding the API key; the key itself is resolved at
//! load time and is redacted from every `Debug` and summary rendering.

use homunculus_core::memory::is_valid_namespace_name;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Skill rulesets the prompt builder knows how to excerpt.
pub const SUPPORTED_RULESETS: [&str; 2] = ["coc7e", "dnd5e"];

/// The root configuration structure.
///
/// Maps directly to `~/.homunculus/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Completion model used for in-character replies
    #[serde(default)]
    pub model: ModelConfig,

    /// Secondary completion settings for memory extraction
    #[serde(default)]
    pub extraction: ExtractionConfig,

    /// Retrieval backend and maintenance schedule
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Prompt assembly limits
    #[serde(default)]
    pub prompt: PromptConfig,

    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// One entry per channel an NPC is bound to
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// `anthropic` or `openai`
    #[serde(default = "default_provider")]
    pub provider: String,

    #[serde(default = "default_model")]
    pub name: String,

    /// Environment variable that holds the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Custom endpoint (proxies, OpenAI-compatible servers)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Resolved from `api_key_env` at load time; never serialized.
    #[serde(skip)]
    pub api_key: Option<String>,
}

fn default_provider() -> String {
    "anthropic".into()
}
fn default_model() -> String {
    "claude-sonnet-4-20250514".into()
}
fn default_api_key_env() -> String {
    "ANTHROPIC_API_KEY".into()
}
fn default_max_tokens() -> u32 {
    500
}
fn default_temperature() -> f32 {
    0.7
}
fn default_timeout_secs() -> u64 {
    30
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for ModelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelConfig")
            .field("provider", &self.provider)
            .field("name", &self.name)
            .field("api_key_env", &self.api_key_env)
            .field("api_key", &redact(&self.api_key))
            .field("base_url", &self.base_url)
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            name: default_model(),
            api_key_env: default_api_key_env(),
            base_url: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            timeout_secs: default_timeout_secs(),
            api_key: None,
        }
    }
}

impl ModelConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.trim().is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Disable to skip post-turn fact extraction entirely
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_extraction_max_tokens")]
    pub max_tokens: u32,

    #[serde(default)]
    pub temperature: f32,

    /// Upper bound on extraction tasks in flight across all channels
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Conversation lines shown to the extraction model
    #[serde(default = "default_history_lines")]
    pub history_lines: usize,
}

fn default_true() -> bool {
    true
}
fn default_extraction_max_tokens() -> u32 {
    220
}
fn default_max_concurrent() -> usize {
    4
}
fn default_history_lines() -> usize {
    8
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_tokens: default_extraction_max_tokens(),
            temperature: 0.0,
            max_concurrent: default_max_concurrent(),
            history_lines: default_history_lines(),
        }
    }
}

/// Which retrieval implementation backs the memory adapter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalBackendKind {
    /// External `qmd` binary (hybrid search + lexical search)
    #[default]
    Qmd,
    /// In-process keyword/cosine index rebuilt from the durable log
    Builtin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default)]
    pub backend: RetrievalBackendKind,

    #[serde(default = "default_qmd_binary")]
    pub qmd_binary: String,

    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Deadline on the primary retrieval tier
    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,

    /// Kill guard on the fallback subprocess
    #[serde(default = "default_fallback_timeout_secs")]
    pub fallback_timeout_secs: u64,

    #[serde(default = "default_update_interval_secs")]
    pub update_interval_secs: u64,

    #[serde(default = "default_update_timeout_secs")]
    pub update_timeout_secs: u64,

    #[serde(default = "default_max_query_chars")]
    pub max_query_chars: usize,
}

fn default_qmd_binary() -> String {
    "qmd".into()
}
fn default_top_k() -> usize {
    10
}
fn default_query_timeout_secs() -> u64 {
    8
}
fn default_fallback_timeout_secs() -> u64 {
    2
}
fn default_update_interval_secs() -> u64 {
    300
}
fn default_update_timeout_secs() -> u64 {
    60
}
fn default_max_query_chars() -> usize {
    600
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            backend: RetrievalBackendKind::default(),
            qmd_binary: default_qmd_binary(),
            top_k: default_top_k(),
            query_timeout_secs: default_query_timeout_secs(),
            fallback_timeout_secs: default_fallback_timeout_secs(),
            update_interval_secs: default_update_interval_secs(),
            update_timeout_secs: default_update_timeout_secs(),
            max_query_chars: default_max_query_chars(),
        }
    }
}

impl MemoryConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    pub fn fallback_timeout(&self) -> Duration {
        Duration::from_secs(self.fallback_timeout_secs)
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs)
    }

    pub fn update_timeout(&self) -> Duration {
        Duration::from_secs(self.update_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptConfig {
    /// Maximum estimated input tokens per reply prompt
    #[serde(default = "default_token_budget")]
    pub token_budget: usize,

    /// Recent messages fetched per turn
    #[serde(default = "default_history_size")]
    pub history_size: usize,
}

fn default_token_budget() -> usize {
    2000
}
fn default_history_size() -> usize {
    25
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            token_budget: default_token_budget(),
            history_size: default_history_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Root of agents/, archive/ and rulesets/
    #[serde(default = "default_data_home")]
    pub data_home: PathBuf,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_json: bool,

    /// How long in-flight turns may run after a shutdown signal
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_data_home() -> PathBuf {
    AppConfig::config_dir()
}
fn default_log_level() -> String {
    "info".into()
}
fn default_shutdown_grace_secs() -> u64 {
    5
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            data_home: default_data_home(),
            log_level: default_log_level(),
            log_json: false,
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl RuntimeConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Binds one channel to one NPC identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub channel_id: String,

    /// Path to the JSON character card
    pub character_card: PathBuf,

    pub memory_namespace: String,

    #[serde(default = "default_ruleset")]
    pub skill_ruleset: String,

    /// The platform user id the NPC posts as
    #[serde(default)]
    pub bot_user_id: u64,

    #[serde(default = "default_true")]
    pub allowed: bool,
}

fn default_ruleset() -> String {
    "coc7e".into()
}

impl AppConfig {
    /// Load configuration from the default path (~/.homunculus/config.toml).
    ///
    /// Environment variables override file values:
    /// - `HOMUNCULUS_MODEL_PROVIDER`, `HOMUNCULUS_MODEL_NAME`
    /// - `HOMUNCULUS_DATA_HOME`, `HOMUNCULUS_LOG_LEVEL`
    /// - `HOMUNCULUS_QMD_BINARY`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        Self::load_with_env(&config_path, false, |key| std::env::var(key).ok())
    }

    /// Load from an explicit path; a missing file is an error.
    pub fn load_required(path: &Path) -> Result<Self, ConfigError> {
        Self::load_with_env(path, true, |key| std::env::var(key).ok())
    }

    /// Load configuration from a specific file path, falling back to defaults
    /// when the file does not exist.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        Self::load_with_env(path, false, |_| None)
    }

    fn load_with_env(
        path: &Path,
        required: bool,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
            toml::from_str::<Self>(&content).map_err(|e| ConfigError::ParseError {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?
        } else if required {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        } else {
            tracing::info!("No config file found at {}, using defaults", path.display());
            Self::default()
        };

        config.apply_env_overrides(&env);
        config.model.api_key = env(&config.model.api_key_env).filter(|k| !k.trim().is_empty());
        config.runtime.data_home = expand_home(&config.runtime.data_home);
        for channel in &mut config.channels {
            channel.character_card = expand_home(&channel.character_card);
        }

        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self, env: &impl Fn(&str) -> Option<String>) {
        if let Some(provider) = env("HOMUNCULUS_MODEL_PROVIDER") {
            self.model.provider = provider;
        }
        if let Some(name) = env("HOMUNCULUS_MODEL_NAME") {
            self.model.name = name;
        }
        if let Some(home) = env("HOMUNCULUS_DATA_HOME") {
            self.runtime.data_home = PathBuf::from(home);
        }
        if let Some(level) = env("HOMUNCULUS_LOG_LEVEL") {
            self.runtime.log_level = level;
        }
        if let Some(binary) = env("HOMUNCULUS_QMD_BINARY") {
            self.memory.qmd_binary = binary;
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".homunculus")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let provider = self.model.provider.trim().to_ascii_lowercase();
        if provider != "anthropic" && provider != "openai" {
            return Err(invalid("model.provider must be 'anthropic' or 'openai'"));
        }
        if self.model.name.trim().is_empty() {
            return Err(invalid("model.name cannot be empty"));
        }
        if self.model.api_key_env.trim().is_empty() {
            return Err(invalid("model.api_key_env cannot be empty"));
        }
        if !(0.0..=1.0).contains(&self.model.temperature) {
            return Err(invalid("model.temperature must be between 0.0 and 1.0"));
        }
        if !(0.0..=1.0).contains(&self.extraction.temperature) {
            return Err(invalid("extraction.temperature must be between 0.0 and 1.0"));
        }

        let positive = [
            ("model.max_tokens", self.model.max_tokens as u64),
            ("model.timeout_secs", self.model.timeout_secs),
            ("extraction.max_tokens", self.extraction.max_tokens as u64),
            ("extraction.max_concurrent", self.extraction.max_concurrent as u64),
            ("memory.top_k", self.memory.top_k as u64),
            ("memory.query_timeout_secs", self.memory.query_timeout_secs),
            ("memory.fallback_timeout_secs", self.memory.fallback_timeout_secs),
            ("memory.update_interval_secs", self.memory.update_interval_secs),
            ("memory.update_timeout_secs", self.memory.update_timeout_secs),
            ("memory.max_query_chars", self.memory.max_query_chars as u64),
            ("prompt.token_budget", self.prompt.token_budget as u64),
            ("prompt.history_size", self.prompt.history_size as u64),
        ];
        if let Some((field, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(invalid(&format!("{field} must be > 0")));
        }
        if self.memory.qmd_binary.trim().is_empty() {
            return Err(invalid("memory.qmd_binary cannot be empty"));
        }

        let mut channel_ids = HashSet::new();
        let mut namespaces = HashSet::new();
        for channel in &self.channels {
            if channel.channel_id.trim().is_empty() {
                return Err(invalid("channels[].channel_id cannot be empty"));
            }
            if !channel_ids.insert(channel.channel_id.as_str()) {
                return Err(invalid(&format!(
                    "channel '{}' is configured more than once",
                    channel.channel_id
                )));
            }
            if !is_valid_namespace_name(&channel.memory_namespace) {
                return Err(invalid(&format!(
                    "channel '{}': memory_namespace '{}' must match [a-z0-9][a-z0-9_-]{{0,63}}",
                    channel.channel_id, channel.memory_namespace
                )));
            }
            if !namespaces.insert(channel.memory_namespace.as_str()) {
                return Err(invalid(&format!(
                    "memory_namespace '{}' is bound to more than one channel",
                    channel.memory_namespace
                )));
            }
            if !SUPPORTED_RULESETS.contains(&channel.skill_ruleset.as_str()) {
                return Err(invalid(&format!(
                    "channel '{}': unsupported skill_ruleset '{}' (expected one of {})",
                    channel.channel_id,
                    channel.skill_ruleset,
                    SUPPORTED_RULESETS.join(", ")
                )));
            }
        }

        Ok(())
    }

    /// Extra checks the long-running mode needs on top of [`validate`](Self::validate).
    pub fn validate_for_run(&self) -> Result<(), ConfigError> {
        self.validate()?;
        if !self.channels.iter().any(|c| c.allowed) {
            return Err(invalid("at least one allowed [[channels]] entry is required"));
        }
        if !self.model.has_api_key() {
            return Err(ConfigError::MissingSecret(self.model.api_key_env.clone()));
        }
        Ok(())
    }

    /// Redacted JSON summary for diagnostics.
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "model": {
                "provider": self.model.provider,
                "name": self.model.name,
                "api_key_env": self.model.api_key_env,
                "api_key": redact(&self.model.api_key),
                "base_url": self.model.base_url,
                "max_tokens": self.model.max_tokens,
                "temperature": self.model.temperature,
            },
            "memory": {
                "backend": self.memory.backend,
                "qmd_binary": self.memory.qmd_binary,
                "top_k": self.memory.top_k,
                "query_timeout_secs": self.memory.query_timeout_secs,
                "update_interval_secs": self.memory.update_interval_secs,
            },
            "prompt": {
                "token_budget": self.prompt.token_budget,
                "history_size": self.prompt.history_size,
            },
            "runtime": {
                "data_home": self.runtime.data_home.display().to_string(),
                "log_level": self.runtime.log_level,
            },
            "channels": self.channels.iter().map(|c| serde_json::json!({
                "channel_id": c.channel_id,
                "character_card": c.character_card.display().to_string(),
                "memory_namespace": c.memory_namespace,
                "skill_ruleset": c.skill_ruleset,
                "allowed": c.allowed,
            })).collect::<Vec<_>>(),
        })
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::ValidationError(message.to_string())
}

/// Expand a leading `~/` to the user's home directory.
fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs_home().join(rest),
        Err(_) => path.to_path_buf(),
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config file not found at {0}")]
    NotFound(PathBuf),

    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    #[error("API key environment variable {0} is not set")]
    MissingSecret(String),
}
