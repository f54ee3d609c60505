//! Configuration management
//!
//! This module handles loading, validation, and management of the Inkwell configuration.
//! Configuration is stored in TOML format at ~/.inkwell/config.toml.
//!
//! # Configuration Sections
//!
//! - **core**: Data directory and log level
//! - **model**: Chat and embedding endpoints, sampling defaults, retry policy
//! - **storage**: Event buffer size, audit rotation, legacy project directory
//! - **pipeline**: Chapter and revision bounds, feedback window
//! - **scheduler**: Poll interval and project cap for the multi-project driver
//!
//! Every section is optional in the file; missing keys fall back to defaults.
//!
//! # Examples
//!
//! ```no_run
//! use inkwell_engine::config::Config;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load_or_create()?;
//! println!("Projects live in {:?}", config.core.data_dir);
//! println!("Chat endpoint: {}", config.model.chat_url);
//! # Ok(())
//! # }
//! ```

use sdk::errors::EngineError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Core settings
    #[serde(default)]
    pub core: CoreConfig,

    /// Model endpoints and call policy
    #[serde(default)]
    pub model: ModelConfig,

    /// Persistence settings
    #[serde(default)]
    pub storage: StorageConfig,

    /// Pipeline bounds
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Multi-project scheduler settings
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

/// Core configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Root directory holding one sub-directory per project (supports ~ expansion)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Which model a generation call should target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ModelMode {
    #[default]
    Fast,
    HighQuality,
}

/// Model endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// OpenAI-compatible chat completions endpoint
    #[serde(default = "default_chat_url")]
    pub chat_url: String,

    /// Model used in fast mode
    #[serde(default = "default_chat_model")]
    pub chat_model: String,

    /// Model used in high-quality mode
    #[serde(default = "default_heavy_model")]
    pub heavy_model: String,

    /// OpenAI-compatible embeddings endpoint
    #[serde(default = "default_embeddings_url")]
    pub embeddings_url: String,

    #[serde(default = "default_embeddings_model")]
    pub embeddings_model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Per-attempt wall-clock limit in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Retries after the first attempt for timeouts and 5xx responses
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay for exponential backoff, in milliseconds
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default)]
    pub mode: ModelMode,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Ring buffer capacity of each project's event bus
    #[serde(default = "default_event_buffer_size")]
    pub event_buffer_size: usize,

    /// Audit logs larger than this are archived and restarted
    #[serde(default = "default_audit_rotate_bytes")]
    pub audit_rotate_bytes: u64,

    /// Directory of flat `<project>.json` files from the old layout
    #[serde(default = "default_legacy_dir")]
    pub legacy_dir: PathBuf,
}

/// Pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Upper bound on chapters a full_story run may plan
    #[serde(default = "default_max_chapters")]
    pub max_chapters: usize,

    /// Upper bound on critique/revise passes in director mode
    #[serde(default = "default_max_revision_passes")]
    pub max_revision_passes: usize,

    /// How many recent bus events an agent inspects for feedback
    #[serde(default = "default_feedback_window")]
    pub feedback_window: usize,

    /// Let agents read from and write to the project memory store
    #[serde(default)]
    pub auto_memory: bool,
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Sleep between idle scheduler ticks, in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Maximum number of projects driven concurrently
    #[serde(default = "default_max_projects")]
    pub max_projects: usize,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("~/.inkwell/projects")
}

fn default_legacy_dir() -> PathBuf {
    PathBuf::from("~/.inkwell/legacy")
}

fn default_chat_url() -> String {
    "http://localhost:8000/v1/chat/completions".to_string()
}

fn default_chat_model() -> String {
    "Qwen/Qwen2.5-3B-Instruct".to_string()
}

fn default_heavy_model() -> String {
    "Qwen/Qwen2.5-7B-Instruct".to_string()
}

fn default_embeddings_url() -> String {
    "http://localhost:8001/v1/embeddings".to_string()
}

fn default_embeddings_model() -> String {
    "BAAI/bge-small-en-v1.5".to_string()
}

fn default_temperature() -> f32 {
    0.8
}

fn default_max_tokens() -> u32 {
    1000
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_event_buffer_size() -> usize {
    100
}

fn default_audit_rotate_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_max_chapters() -> usize {
    20
}

fn default_max_revision_passes() -> usize {
    2
}

fn default_feedback_window() -> usize {
    10
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_max_projects() -> usize {
    10
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: default_log_level(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            chat_url: default_chat_url(),
            chat_model: default_chat_model(),
            heavy_model: default_heavy_model(),
            embeddings_url: default_embeddings_url(),
            embeddings_model: default_embeddings_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            request_timeout_secs: default_request_timeout_secs(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            mode: ModelMode::default(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            event_buffer_size: default_event_buffer_size(),
            audit_rotate_bytes: default_audit_rotate_bytes(),
            legacy_dir: default_legacy_dir(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_chapters: default_max_chapters(),
            max_revision_passes: default_max_revision_passes(),
            feedback_window: default_feedback_window(),
            auto_memory: false,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            max_projects: default_max_projects(),
        }
    }
}

impl ModelConfig {
    /// Model name for the configured mode.
    pub fn active_model(&self) -> &str {
        match self.mode {
            ModelMode::Fast => &self.chat_model,
            ModelMode::HighQuality => &self.heavy_model,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Config {
    /// Load configuration from the default location (~/.inkwell/config.toml)
    ///
    /// If the configuration file doesn't exist, creates a default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration file cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    pub fn load_or_create() -> Result<Self, EngineError> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load_from_path(&config_path)
        } else {
            Self::create_default(&config_path)
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self, EngineError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("Failed to read config file: {}", e)))?;

        let mut config: Config = toml::from_str(&contents)
            .map_err(|e| EngineError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate_and_process()?;

        Ok(config)
    }

    /// Default configuration rooted at `data_dir`, validated but not written
    /// anywhere. Used by tests and embedders that manage their own layout.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let mut config = Self::default();
        config.core.data_dir = data_dir.into();
        config.validate_and_process()?;
        Ok(config)
    }

    /// Create default configuration and save to path
    fn create_default(path: &Path) -> Result<Self, EngineError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                EngineError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        // Serialize before processing so the file keeps the portable ~ paths
        let toml_string = toml::to_string_pretty(&Self::default())
            .map_err(|e| EngineError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| EngineError::Config(format!("Failed to write config file: {}", e)))?;

        let mut config = Self::default();
        config.validate_and_process()?;

        Ok(config)
    }

    /// Get the default configuration file path (~/.inkwell/config.toml)
    pub fn default_config_path() -> Result<PathBuf, EngineError> {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(".inkwell").join("config.toml"))
    }

    /// Validate and process configuration
    ///
    /// Validates ranges, expands ~ in paths and creates the data directory.
    fn validate_and_process(&mut self) -> Result<(), EngineError> {
        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.core.log_level.as_str()) {
            return Err(EngineError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.core.log_level,
                valid_log_levels.join(", ")
            )));
        }

        if !(0.0..=2.0).contains(&self.model.temperature) {
            return Err(EngineError::Config(
                "temperature must be between 0.0 and 2.0".to_string(),
            ));
        }
        if self.model.max_tokens == 0 {
            return Err(EngineError::Config(
                "max_tokens must be greater than 0".to_string(),
            ));
        }
        if self.model.request_timeout_secs == 0 {
            return Err(EngineError::Config(
                "request_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.storage.event_buffer_size == 0 {
            return Err(EngineError::Config(
                "event_buffer_size must be greater than 0".to_string(),
            ));
        }
        if self.pipeline.max_chapters == 0 {
            return Err(EngineError::Config(
                "max_chapters must be greater than 0".to_string(),
            ));
        }
        if self.scheduler.max_projects == 0 {
            return Err(EngineError::Config(
                "max_projects must be greater than 0".to_string(),
            ));
        }

        self.core.data_dir = expand_path(&self.core.data_dir)?;
        self.storage.legacy_dir = expand_path(&self.storage.legacy_dir)?;

        if !self.core.data_dir.exists() {
            fs::create_dir_all(&self.core.data_dir).map_err(|e| {
                EngineError::Config(format!("Failed to create data directory: {}", e))
            })?;
        }

        Ok(())
    }
}

/// Expand ~ in path to user's home directory
fn expand_path(path: &Path) -> Result<PathBuf, EngineError> {
    let path_str = path
        .to_str()
        .ok_or_else(|| EngineError::Config("Invalid UTF-8 in path".to_string()))?;

    if let Some(rest) = path_str.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(rest))
    } else if path_str == "~" {
        dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))
    } else {
        Ok(path.to_path_buf())
    }
}
