use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    Figment,
    providers::{Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};

pub const CONFIG_DIRECTORY_NAME: &str = "margin";
pub const CONFIG_FILE_NAME: &str = "config.json";

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8000/api";
pub const DEFAULT_WS_BASE_URL: &str = "ws://localhost:8000/api";
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_RECONNECT_BASE_DELAY_MS: u64 = 1_000;
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_CREATE_CONVERSATION_TIMEOUT_MS: u64 = 10_000;

/// Client-wide endpoints and timing policy.
///
/// Timeouts are policy constants surfaced here rather than hardwired into
/// the transport: the connect ceiling belongs to every channel, the
/// creation ceiling only to the session controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_ws_base_url")]
    pub ws_base_url: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_create_conversation_timeout_ms")]
    pub create_conversation_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            ws_base_url: default_ws_base_url(),
            connect_timeout_ms: default_connect_timeout_ms(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            create_conversation_timeout_ms: default_create_conversation_timeout_ms(),
        }
    }
}

impl ClientConfig {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(CONFIG_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".margin"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(CONFIG_FILE_NAME)
    }

    /// Loads defaults merged with the JSON config file, then environment
    /// overrides. A missing or unparseable file falls back to defaults; a
    /// broken config never prevents startup.
    pub fn load() -> Self {
        Self::load_from(&Self::default_config_path())
    }

    pub fn load_from(path: &Path) -> Self {
        let config = if path.exists() {
            let figment = Figment::from(Serialized::defaults(ClientConfig::default()))
                .merge(Json::file(path));
            match figment.extract::<ClientConfig>() {
                Ok(config) => config,
                Err(error) => {
                    tracing::warn!(path = %path.display(), %error, "failed to parse config; using defaults");
                    ClientConfig::default()
                }
            }
        } else {
            tracing::debug!(path = %path.display(), "config file not found; using defaults");
            ClientConfig::default()
        };

        config.with_env_overrides().normalized()
    }

    fn with_env_overrides(mut self) -> Self {
        if let Some(value) = env_string("MARGIN_API_BASE_URL") {
            self.api_base_url = value;
        }
        if let Some(value) = env_string("MARGIN_WS_BASE_URL") {
            self.ws_base_url = value;
        }
        self
    }

    pub fn normalized(mut self) -> Self {
        self.api_base_url = normalize_base_url(&self.api_base_url, DEFAULT_API_BASE_URL);
        self.ws_base_url = normalize_base_url(&self.ws_base_url, DEFAULT_WS_BASE_URL);
        if self.connect_timeout_ms == 0 {
            self.connect_timeout_ms = default_connect_timeout_ms();
        }
        if self.reconnect_base_delay_ms == 0 {
            self.reconnect_base_delay_ms = default_reconnect_base_delay_ms();
        }
        if self.create_conversation_timeout_ms == 0 {
            self.create_conversation_timeout_ms = default_create_conversation_timeout_ms();
        }
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn create_conversation_timeout(&self) -> Duration {
        Duration::from_millis(self.create_conversation_timeout_ms)
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn normalize_base_url(raw: &str, fallback: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.to_string()
    }
}

fn default_api_base_url() -> String {
    DEFAULT_API_BASE_URL.to_string()
}

fn default_ws_base_url() -> String {
    DEFAULT_WS_BASE_URL.to_string()
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

fn default_reconnect_base_delay_ms() -> u64 {
    DEFAULT_RECONNECT_BASE_DELAY_MS
}

fn default_max_reconnect_attempts() -> u32 {
    DEFAULT_MAX_RECONNECT_ATTEMPTS
}

fn default_create_conversation_timeout_ms() -> u64 {
    DEFAULT_CREATE_CONVERSATION_TIMEOUT_MS
}
