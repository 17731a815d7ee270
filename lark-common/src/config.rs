//! Configuration for the lark-bot service.
//!
//! Loaded from a JSON file (`LARK_BOT_CONFIG` or `./config.json`); every
//! field has a default so a partial file, or no file at all, still yields
//! a usable configuration. Secrets can be supplied through environment
//! variables instead of the file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable naming the config file path.
pub const CONFIG_PATH_ENV: &str = "LARK_BOT_CONFIG";

const DEFAULT_CONFIG_PATH: &str = "./config.json";

/// Top-level service configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// HTTP server bind settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Feishu open-platform credentials
    #[serde(default)]
    pub feishu: FeishuConfig,

    /// Completion service (OpenAI-compatible) settings
    #[serde(default)]
    pub openai: OpenAiConfig,

    /// Conversation session settings
    #[serde(default)]
    pub session: SessionConfig,

    /// Webhook deduplication settings
    #[serde(default)]
    pub dedup: DedupConfig,

    /// Extra roles merged over the built-in catalog
    #[serde(default)]
    pub roles: Vec<RoleConfig>,

    /// Logging settings
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Feishu open-platform configuration.
///
/// With empty credentials the service still runs: webhooks are decoded and
/// dispatched, but replies are logged instead of sent. Useful for local
/// testing against curl.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeishuConfig {
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub app_secret: String,
    /// AES key for encrypted event callbacks
    #[serde(default)]
    pub encrypt_key: Option<String>,
    /// Token checked against the event envelope
    #[serde(default)]
    pub verification_token: Option<String>,
    #[serde(default = "default_feishu_base_url")]
    pub base_url: String,
}

/// Completion service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: i64,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    /// Per-request timeout enforced by the HTTP client
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Retries after the initial attempt, retryable failures only
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_openai_base_url(),
            model: default_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// Conversation session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Role applied to sessions created on first contact
    #[serde(default = "default_role")]
    pub default_role: String,
    /// Maximum retained turns per session, oldest evicted first
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    /// Sessions idle longer than this are swept by the background task
    #[serde(default = "default_idle_ttl_secs")]
    pub idle_ttl_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_role: default_role(),
            history_window: default_history_window(),
            idle_ttl_secs: default_idle_ttl_secs(),
        }
    }
}

/// Webhook deduplication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// How long an event id is remembered
    #[serde(default = "default_dedup_retention_secs")]
    pub retention_secs: u64,
    /// Hard cap on remembered ids, oldest evicted first
    #[serde(default = "default_dedup_max_entries")]
    pub max_entries: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            retention_secs: default_dedup_retention_secs(),
            max_entries: default_dedup_max_entries(),
        }
    }
}

/// A persona entry: name shown in the role-selection card, prompt sent as
/// the completion system message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleConfig {
    pub name: String,
    pub prompt: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Base log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Output format: "pretty" or "json"
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9000
}

fn default_feishu_base_url() -> String {
    "https://open.feishu.cn/open-apis".to_string()
}

fn default_openai_base_url() -> String {
    "https://api.openai.com".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_max_tokens() -> i64 {
    1024
}

fn default_temperature() -> f64 {
    0.7
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    2
}

fn default_base_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_role() -> String {
    "default".to_string()
}

fn default_history_window() -> usize {
    20
}

fn default_idle_ttl_secs() -> u64 {
    86_400
}

fn default_dedup_retention_secs() -> u64 {
    600
}

fn default_dedup_max_entries() -> usize {
    10_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn config_path() -> PathBuf {
    std::env::var(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
}

impl Config {
    /// Load configuration from the default path.
    ///
    /// A missing file is not an error; defaults are used and environment
    /// overrides still apply.
    pub fn load() -> Result<Self> {
        let path = config_path();
        let mut config = if path.exists() {
            Self::load_from(&path)?
        } else {
            tracing::info!("Config file not found, using defaults");
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var("LARK_BOT_PORT") {
            if let Ok(p) = port.parse() {
                self.server.port = p;
            }
        }

        if let Ok(level) = std::env::var("LARK_BOT_LOG_LEVEL") {
            self.observability.log_level = level;
        }

        if let Ok(app_id) = std::env::var("FEISHU_APP_ID") {
            self.feishu.app_id = app_id;
        }
        if let Ok(secret) = std::env::var("FEISHU_APP_SECRET") {
            self.feishu.app_secret = secret;
        }
        if let Ok(key) = std::env::var("FEISHU_ENCRYPT_KEY") {
            self.feishu.encrypt_key = Some(key);
        }
        if let Ok(token) = std::env::var("FEISHU_VERIFICATION_TOKEN") {
            self.feishu.verification_token = Some(token);
        }

        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            self.openai.api_key = key;
        }
    }

    /// Whether Feishu credentials are present for outbound sends.
    pub fn feishu_enabled(&self) -> bool {
        !self.feishu.app_id.is_empty() && !self.feishu.app_secret.is_empty()
    }
}
