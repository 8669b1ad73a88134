//! Configuration management for lm-predict
//!
//! Supports configuration via:
//! 1. Config file (~/.config/lm-predict/config.toml)
//! 2. Environment variables (OPENAI_API_KEY, LOCAL_LM_URL, etc.)
//! 3. CLI arguments (override file/env settings)

use crate::backends::{BackendKind, LocalBackendConfig, OpenAiConfig};
use crate::cache::{CacheConfig, DEFAULT_SIZE_LIMIT};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read config: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Backend used when the CLI does not name one
    pub default_backend: BackendKind,

    /// Hosted completion API settings
    pub openai: OpenAiSettings,

    /// Local text-generation server settings
    pub local: LocalSettings,

    /// Disk cache settings
    pub cache: CacheSettings,
}

/// Hosted completion API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiSettings {
    /// API key (can also use OPENAI_API_KEY env var)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Base URL for the API
    pub base_url: String,

    /// Completion model
    pub model: String,

    /// Tokens generated when a prompt leaves max_tokens unset
    pub default_max_tokens: u32,

    /// Retries on rate limiting
    pub max_retries: u32,

    /// Model context window, used to reject over-long prompts locally
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_window: Option<usize>,

    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for OpenAiSettings {
    fn default() -> Self {
        let backend = OpenAiConfig::default();
        Self {
            api_key: None,
            base_url: "https://api.openai.com/v1".to_string(),
            model: backend.model,
            default_max_tokens: backend.default_max_tokens,
            max_retries: backend.max_retries,
            context_window: backend.context_window,
            timeout_secs: backend.timeout_secs,
        }
    }
}

/// Local text-generation server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalSettings {
    /// Server URL
    pub url: String,

    /// Model the server hosts
    pub model: String,

    /// Tokens generated when a prompt leaves max_tokens unset
    pub default_max_tokens: u32,

    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for LocalSettings {
    fn default() -> Self {
        let backend = LocalBackendConfig::default();
        Self {
            url: backend.url,
            model: backend.model,
            default_max_tokens: backend.default_max_tokens,
            timeout_secs: backend.timeout_secs,
        }
    }
}

/// Disk cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Serve repeated prompts from disk
    pub enabled: bool,

    /// Cache directory (defaults to the user cache dir)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,

    /// Total size bound in bytes; writes fail once it is reached
    pub size_limit_bytes: u64,

    /// Number of shard directories
    pub shards: usize,

    /// Cached variants kept per prompt
    pub max_variants: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
            size_limit_bytes: DEFAULT_SIZE_LIMIT,
            shards: 4,
            max_variants: 8,
        }
    }
}

impl Config {
    /// Get default config file path
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("lm-predict")
            .join("config.toml")
    }

    /// Load config from default location
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Self::default_path())
    }

    /// Load config from specific path
    pub fn load_from(path: PathBuf) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default().with_env_overrides());
        }

        let content = std::fs::read_to_string(&path)?;
        let config: Config = toml::from_str(&content)?;

        Ok(config.with_env_overrides())
    }

    /// Apply environment variable overrides
    pub fn with_env_overrides(mut self) -> Self {
        // Hosted API
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            self.openai.api_key = Some(key);
        }
        if let Ok(url) = std::env::var("OPENAI_BASE_URL") {
            self.openai.base_url = url;
        }
        if let Ok(model) = std::env::var("OPENAI_MODEL") {
            self.openai.model = model;
        }

        // Local server
        if let Ok(url) = std::env::var("LOCAL_LM_URL") {
            self.local.url = url;
        }
        if let Ok(model) = std::env::var("LOCAL_LM_MODEL") {
            self.local.model = model;
        }

        // Cache
        if let Ok(dir) = std::env::var("LM_PREDICT_CACHE_DIR") {
            self.cache.dir = Some(PathBuf::from(dir));
        }

        self
    }

    /// Save config to default location
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(Self::default_path())
    }

    /// Save config to specific path
    pub fn save_to(&self, path: PathBuf) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_backend == BackendKind::OpenAi && self.openai.api_key.is_none() {
            return Err(ConfigError::MissingRequired(
                "OpenAI is the default backend but no API key is set (OPENAI_API_KEY)".to_string(),
            ));
        }
        if self.cache.shards == 0 {
            return Err(ConfigError::Invalid("cache.shards must be at least 1".to_string()));
        }
        if self.cache.max_variants == 0 {
            return Err(ConfigError::Invalid(
                "cache.max_variants must be at least 1".to_string(),
            ));
        }
        if self.cache.size_limit_bytes == 0 {
            return Err(ConfigError::Invalid(
                "cache.size_limit_bytes must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// Settings for the hosted backend; fails without an API key
    pub fn openai_backend(&self) -> Result<OpenAiConfig, ConfigError> {
        let api_key = self.openai.api_key.clone().ok_or_else(|| {
            ConfigError::MissingRequired("OpenAI API key (OPENAI_API_KEY)".to_string())
        })?;

        Ok(OpenAiConfig {
            api_key,
            model: self.openai.model.clone(),
            base_url: Some(self.openai.base_url.clone()),
            default_max_tokens: self.openai.default_max_tokens,
            max_retries: self.openai.max_retries,
            context_window: self.openai.context_window,
            timeout_secs: self.openai.timeout_secs,
        })
    }

    /// Settings for the local backend
    pub fn local_backend(&self) -> LocalBackendConfig {
        LocalBackendConfig {
            url: self.local.url.clone(),
            model: self.local.model.clone(),
            default_max_tokens: self.local.default_max_tokens,
            timeout_secs: self.local.timeout_secs,
        }
    }

    /// Settings for the disk cache store
    pub fn cache_store(&self) -> CacheConfig {
        CacheConfig {
            dir: self.cache.dir.clone().unwrap_or_else(CacheConfig::default_dir),
            size_limit: self.cache.size_limit_bytes,
            shards: self.cache.shards,
            max_variants: self.cache.max_variants,
        }
    }

    /// Generate example config content
    pub fn example() -> String {
        let example = Config::default();
        toml::to_string_pretty(&example).unwrap_or_default()
    }
}

/// Builder for creating Config programmatically
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn default_backend(mut self, backend: BackendKind) -> Self {
        self.config.default_backend = backend;
        self
    }

    pub fn openai_api_key(mut self, key: impl Into<String>) -> Self {
        self.config.openai.api_key = Some(key.into());
        self
    }

    pub fn openai_model(mut self, model: impl Into<String>) -> Self {
        self.config.openai.model = model.into();
        self
    }

    pub fn local_url(mut self, url: impl Into<String>) -> Self {
        self.config.local.url = url.into();
        self
    }

    pub fn local_model(mut self, model: impl Into<String>) -> Self {
        self.config.local.model = model.into();
        self
    }

    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.cache.dir = Some(dir.into());
        self
    }

    pub fn cache_enabled(mut self, enabled: bool) -> Self {
        self.config.cache.enabled = enabled;
        self
    }

    pub fn cache_size_limit(mut self, bytes: u64) -> Self {
        self.config.cache.size_limit_bytes = bytes;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
