use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;
use shared::domain::UserId;
use tracing::debug;
use url::Url;

use crate::{
    attachment::{AttachmentPolicy, DEFAULT_ALLOWED_EXTENSIONS, DEFAULT_IMAGE_EXTENSIONS},
    connection::websocket_url,
    error::{ConfigError, ConnectionError},
    ledger::DEFAULT_LEDGER_CAPACITY,
    retry::RetryPolicy,
    send::DEFAULT_MAX_ATTACHMENT_BYTES,
    store::DEFAULT_LIVE_BUFFER_LIMIT,
};

/// Prefix of environment overrides, e.g. `CONSULT_SYNC__SERVER_URL`.
pub const ENV_PREFIX: &str = "CONSULT_SYNC__";
/// Read from the working directory when no config path is given.
pub const DEFAULT_CONFIG_FILE: &str = "consult_sync.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub server_url: String,
    /// Push endpoint. Derived from `server_url` plus `/ws` when unset.
    pub push_url: Option<String>,
    pub ledger_capacity: usize,
    pub ledger_sweep_interval_ms: u64,
    pub join_retry_window_ms: u64,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub event_buffer: usize,
    pub command_buffer: usize,
    /// Live events held before the first hydrate completes.
    pub live_buffer_limit: usize,
    pub max_attachment_bytes: u64,
    pub allowed_extensions: Vec<String>,
    pub image_extensions: Vec<String>,
    pub request_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8080".into(),
            push_url: None,
            ledger_capacity: DEFAULT_LEDGER_CAPACITY,
            ledger_sweep_interval_ms: 30_000,
            join_retry_window_ms: 10_000,
            reconnect_base_delay_ms: 500,
            reconnect_max_delay_ms: 30_000,
            event_buffer: 256,
            command_buffer: 64,
            live_buffer_limit: DEFAULT_LIVE_BUFFER_LIMIT,
            max_attachment_bytes: DEFAULT_MAX_ATTACHMENT_BYTES,
            allowed_extensions: to_strings(DEFAULT_ALLOWED_EXTENSIONS),
            image_extensions: to_strings(DEFAULT_IMAGE_EXTENSIONS),
            request_timeout_ms: 15_000,
        }
    }
}

fn to_strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

impl EngineConfig {
    pub fn ledger_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.ledger_sweep_interval_ms.max(1))
    }

    pub fn join_retry_window(&self) -> Duration {
        Duration::from_millis(self.join_retry_window_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.max(1))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.reconnect_base_delay_ms, self.reconnect_max_delay_ms)
    }

    pub fn attachment_policy(&self) -> AttachmentPolicy {
        AttachmentPolicy::new(&self.allowed_extensions, &self.image_extensions)
    }

    pub fn push_endpoint(&self, actor: &UserId) -> Result<Url, ConnectionError> {
        match self.push_url.as_deref().filter(|url| !url.trim().is_empty()) {
            Some(push_url) => websocket_url(push_url, actor, false),
            None => websocket_url(&self.server_url, actor, true),
        }
    }

    pub fn from_toml_str(raw: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `CONSULT_SYNC__*` overrides. Keys without the prefix are skipped.
    pub fn apply_env<I, K, V>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let (key, value) = (key.as_ref(), value.as_ref());
            let Some(field) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let invalid = || ConfigError::InvalidEnv {
                key: key.to_string(),
                value: value.to_string(),
            };
            match field.to_ascii_lowercase().as_str() {
                "server_url" => self.server_url = value.trim().to_string(),
                "push_url" => {
                    self.push_url = Some(value.trim().to_string()).filter(|v| !v.is_empty())
                }
                "ledger_capacity" => self.ledger_capacity = value.trim().parse().map_err(|_| invalid())?,
                "ledger_sweep_interval_ms" => {
                    self.ledger_sweep_interval_ms = value.trim().parse().map_err(|_| invalid())?
                }
                "join_retry_window_ms" => {
                    self.join_retry_window_ms = value.trim().parse().map_err(|_| invalid())?
                }
                "reconnect_base_delay_ms" => {
                    self.reconnect_base_delay_ms = value.trim().parse().map_err(|_| invalid())?
                }
                "reconnect_max_delay_ms" => {
                    self.reconnect_max_delay_ms = value.trim().parse().map_err(|_| invalid())?
                }
                "event_buffer" => self.event_buffer = value.trim().parse().map_err(|_| invalid())?,
                "command_buffer" => self.command_buffer = value.trim().parse().map_err(|_| invalid())?,
                "live_buffer_limit" => {
                    self.live_buffer_limit = value.trim().parse().map_err(|_| invalid())?
                }
                "max_attachment_bytes" => {
                    self.max_attachment_bytes = value.trim().parse().map_err(|_| invalid())?
                }
                "allowed_extensions" => self.allowed_extensions = split_list(value),
                "image_extensions" => self.image_extensions = split_list(value),
                "request_timeout_ms" => {
                    self.request_timeout_ms = value.trim().parse().map_err(|_| invalid())?
                }
                _ => debug!(key, "config: ignoring unknown environment override"),
            }
        }
        Ok(())
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

/// Load from `path` (or [`DEFAULT_CONFIG_FILE`] if present), then apply
/// environment overrides.
pub fn load_config(path: Option<&Path>) -> Result<EngineConfig, ConfigError> {
    let mut config = match path {
        Some(path) => read_file(path)?,
        None => {
            let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
            if default_path.is_file() {
                read_file(&default_path)?
            } else {
                EngineConfig::default()
            }
        }
    };
    config.apply_env(std::env::vars())?;
    Ok(config)
}

fn read_file(path: &Path) -> Result<EngineConfig, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(path = %path.display(), "config: loaded file");
    EngineConfig::from_toml_str(&raw, path)
}
