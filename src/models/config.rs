use std::path::Path;
use std::time::Duration as StdDuration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{AppError, AppResult};

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 11434;
pub const DEFAULT_MAX_CONTENT_LENGTH: usize = 20 * 1024 * 1024;
pub const DEFAULT_CONTEXT_WINDOW: usize = 20;
pub const DEFAULT_MAX_CONCURRENT_CHATS: usize = 5;

const ENV_HOST: &str = "OLLAMA_CHAT_HOST";
const ENV_PORT: &str = "OLLAMA_CHAT_PORT";
const ENV_BASE_URL: &str = "OLLAMA_CHAT_BASE_URL";
const ENV_MODEL: &str = "OLLAMA_CHAT_MODEL";
const ENV_CONNECT_TIMEOUT: &str = "OLLAMA_CHAT_CONNECT_TIMEOUT_MS";
const ENV_REQUEST_TIMEOUT: &str = "OLLAMA_CHAT_REQUEST_TIMEOUT_MS";
const ENV_MAX_RETRIES: &str = "OLLAMA_CHAT_MAX_RETRIES";

/// Connection and session settings for the chat engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct OllamaConfig {
    pub host: String,
    pub port: u16,
    /// Full base URL; takes precedence over `host`/`port` when set.
    pub base_url: Option<String>,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub max_content_length: usize,
    pub buffer_size: usize,
    pub default_model: Option<String>,
    pub context_window: usize,
    pub max_concurrent_chats: usize,
    pub keep_alive: Option<String>,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            base_url: None,
            connect_timeout_ms: 200_000,
            request_timeout_ms: 200_000,
            max_retries: 3,
            retry_base_delay_ms: 500,
            max_content_length: DEFAULT_MAX_CONTENT_LENGTH,
            buffer_size: 8192,
            default_model: None,
            context_window: DEFAULT_CONTEXT_WINDOW,
            max_concurrent_chats: DEFAULT_MAX_CONCURRENT_CHATS,
            keep_alive: None,
        }
    }
}

impl OllamaConfig {
    /// Defaults overlaid with any `OLLAMA_CHAT_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// YAML file overlaid with environment variables.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let mut config: OllamaConfig = serde_yaml::from_str(&raw)?;
        debug!(target: "app::config", path = %path.display(), "loaded configuration file");
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Some(host) = env_string(ENV_HOST) {
            self.host = host;
        }
        if let Some(port) = env_parsed::<u16>(ENV_PORT) {
            self.port = port;
        }
        if let Some(base_url) = env_string(ENV_BASE_URL) {
            self.base_url = Some(base_url);
        }
        if let Some(model) = env_string(ENV_MODEL) {
            self.default_model = Some(model);
        }
        if let Some(value) = env_parsed::<u64>(ENV_CONNECT_TIMEOUT) {
            self.connect_timeout_ms = value;
        }
        if let Some(value) = env_parsed::<u64>(ENV_REQUEST_TIMEOUT) {
            self.request_timeout_ms = value;
        }
        if let Some(value) = env_parsed::<u32>(ENV_MAX_RETRIES) {
            self.max_retries = value;
        }
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.max_concurrent_chats == 0 {
            return Err(AppError::config("maxConcurrentChats must be at least 1"));
        }
        if self.context_window == 0 {
            return Err(AppError::config("contextWindow must be at least 1"));
        }
        if self.max_content_length == 0 {
            return Err(AppError::config("maxContentLength must be at least 1"));
        }
        if self.buffer_size == 0 {
            return Err(AppError::config("bufferSize must be at least 1"));
        }
        if self.base_url.is_none() && self.host.trim().is_empty() {
            return Err(AppError::config("host must not be empty"));
        }
        Ok(())
    }

    pub fn base_url(&self) -> String {
        match &self.base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://{}:{}", self.host, self.port),
        }
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url(), path.trim_start_matches('/'))
    }

    pub fn connect_timeout(&self) -> StdDuration {
        StdDuration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> StdDuration {
        StdDuration::from_millis(self.request_timeout_ms)
    }

    /// Delay before retry number `attempt` (1-based): base, 2×base, 4×base, ...
    pub fn retry_delay(&self, attempt: u32) -> StdDuration {
        let exponent = attempt.saturating_sub(1).min(16);
        StdDuration::from_millis(self.retry_base_delay_ms.saturating_mul(1u64 << exponent))
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = env_string(key)?;
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(target: "app::config", key, value = %raw, "ignoring unparsable environment value");
            None
        }
    }
}
