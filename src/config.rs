use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub ocr: OcrConfig,
    pub vision: VisionConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub usage: UsageConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
}

/// HTTP server and database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub db_path: PathBuf,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    /// Upper bound for request bodies; inline base64 documents travel in the body.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    #[serde(default = "default_session_cookie")]
    pub session_cookie: String,
}

/// Structured-extraction OCR endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct OcrConfig {
    pub base_url: String,
    #[serde(default = "default_ocr_model")]
    pub model: String,
    pub api_key_env: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

/// Vision fallback (chat completions) endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct VisionConfig {
    pub base_url: String,
    #[serde(default = "default_vision_model")]
    pub model: String,
    pub api_key_env: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Fs,
    Http,
}

/// Object store holding uploaded documents
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_storage_timeout_secs")]
    pub timeout_secs: u64,
}

/// Page quota defaults
#[derive(Debug, Clone, Deserialize)]
pub struct UsageConfig {
    #[serde(default = "default_page_quota")]
    pub default_page_quota: i64,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            default_page_quota: default_page_quota(),
        }
    }
}

/// How the admission check interacts with the usage ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionPolicy {
    /// Check before processing, increment after success. Concurrent requests
    /// near the quota boundary can over-admit.
    #[default]
    CheckThenIncrement,
    /// Conditionally reserve pages at admission; the reservation is released
    /// if the attempt fails.
    Reserve,
}

/// Orchestrator tuning
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    #[serde(default)]
    pub admission: AdmissionPolicy,
    /// Scores below this are logged as low confidence; never used for gating.
    #[serde(default = "default_low_confidence_threshold")]
    pub low_confidence_threshold: f64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            admission: AdmissionPolicy::default(),
            low_confidence_threshold: default_low_confidence_threshold(),
        }
    }
}

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_body_bytes() -> usize {
    25 * 1024 * 1024
}

fn default_session_cookie() -> String {
    "genie_session".to_string()
}

fn default_ocr_model() -> String {
    "mistral-ocr-latest".to_string()
}

fn default_vision_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_temperature() -> f32 {
    0.1
}

fn default_timeout_secs() -> u64 {
    90
}

fn default_storage_timeout_secs() -> u64 {
    30
}

fn default_page_quota() -> i64 {
    50
}

fn default_low_confidence_threshold() -> f64 {
    0.5
}

impl Config {
    /// Load configuration from file
    ///
    /// Loads environment variables from .env file (if present) before loading config.
    /// Looks for config file in this order:
    /// 1. Path specified in GENIE_CONFIG environment variable
    /// 2. ./config.toml in current directory
    pub fn load() -> Result<Self> {
        // .env is optional
        let _ = dotenv::dotenv();

        let config_path = std::env::var("GENIE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config.toml"));

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config = Self::from_toml(&config_str)?;
        config.validate()?;

        Ok(config)
    }

    /// Parse configuration text without validating it
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).context("Failed to parse config.toml")
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        url::Url::parse(&self.ocr.base_url)
            .with_context(|| format!("ocr.base_url is not a valid URL: {}", self.ocr.base_url))?;
        url::Url::parse(&self.vision.base_url)
            .with_context(|| format!("vision.base_url is not a valid URL: {}", self.vision.base_url))?;

        require_env(&self.ocr.api_key_env, "OCR")?;
        require_env(&self.vision.api_key_env, "vision")?;

        if self.ocr.timeout_secs == 0 || self.vision.timeout_secs == 0 || self.storage.timeout_secs == 0 {
            anyhow::bail!("timeout_secs must be greater than 0");
        }

        if !(0.0..=2.0).contains(&self.vision.temperature) {
            anyhow::bail!("vision.temperature must be between 0.0 and 2.0");
        }

        if !(0.0..=1.0).contains(&self.ingest.low_confidence_threshold) {
            anyhow::bail!("ingest.low_confidence_threshold must be between 0.0 and 1.0");
        }

        if self.usage.default_page_quota < 0 {
            anyhow::bail!("usage.default_page_quota must not be negative");
        }

        if self.server.session_cookie.trim().is_empty() {
            anyhow::bail!("server.session_cookie must not be empty");
        }

        match self.storage.backend {
            StorageBackend::Fs => {
                let root = self
                    .storage
                    .root
                    .as_ref()
                    .context("storage.root is required for the fs backend")?;
                if !root.is_dir() {
                    anyhow::bail!("storage.root must be an existing directory: {}", root.display());
                }
            }
            StorageBackend::Http => {
                let base = self
                    .storage
                    .base_url
                    .as_ref()
                    .context("storage.base_url is required for the http backend")?;
                url::Url::parse(base)
                    .with_context(|| format!("storage.base_url is not a valid URL: {}", base))?;
                if let Some(env) = &self.storage.api_key_env {
                    require_env(env, "storage")?;
                }
            }
        }

        Ok(())
    }

    /// Get database path
    pub fn db_path(&self) -> &Path {
        &self.server.db_path
    }
}

fn require_env(name: &str, purpose: &str) -> Result<()> {
    std::env::var(name).with_context(|| {
        format!(
            "Environment variable {} not set. Set it in your .env file or as an environment variable with your {} API key.",
            name, purpose
        )
    })?;
    Ok(())
}

/// Read an API key named by a config field
pub fn api_key(name: &str) -> crate::error::Result<String> {
    std::env::var(name).map_err(|_| {
        crate::error::GenieError::Config(format!("Environment variable {} not set", name))
    })
}
