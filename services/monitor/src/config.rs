//! Monitor configuration loading.
//!
//! TOML is the only config source. Default path:
//! `/etc/stationwatch/monitor.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//! - `server.base_url` (`http://` or `https://`)

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::connection::{DEFAULT_MAX_ATTEMPTS, DEFAULT_RECONNECT_DELAY, ReconnectPolicy};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/stationwatch/monitor.toml";
const DEFAULT_WS_PATH: &str = "/ws";
const DEFAULT_CONTROL_BIND: &str = "127.0.0.1:9090";

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    pub schema_version: u32,
    pub server: ServerConfig,
    pub reconnect: ReconnectPolicy,
    pub control_api: ControlApiConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Base for request/response calls, without a trailing slash.
    pub base_url: String,
    pub ws_path: String,
}

impl ServerConfig {
    /// Push-channel URL: the base URL with its scheme mapped to `ws`/`wss`.
    pub fn ws_url(&self) -> String {
        let rest = self
            .base_url
            .strip_prefix("https://")
            .map(|r| format!("wss://{r}"))
            .or_else(|| self.base_url.strip_prefix("http://").map(|r| format!("ws://{r}")))
            .unwrap_or_else(|| self.base_url.clone());
        format!("{rest}{}", self.ws_path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlApiConfig {
    pub bind: SocketAddr,
}

// ---------------------------------------------------------------------------
// Raw TOML types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    server: Option<RawServerConfig>,
    reconnect: Option<RawReconnectConfig>,
    control_api: Option<RawControlApiConfig>,
}

#[derive(Debug, Deserialize)]
struct RawServerConfig {
    base_url: Option<String>,
    ws_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawReconnectConfig {
    max_attempts: Option<u32>,
    delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawControlApiConfig {
    bind: Option<String>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

pub fn load_config_from_path(path: &Path) -> Result<MonitorConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {e}", path.display())))?;
    load_config_from_str(&toml_str)
}

pub fn load_config_from_str(toml_str: &str) -> Result<MonitorConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {schema_version}"
        )));
    }

    let raw_server = raw
        .server
        .ok_or_else(|| ConfigError::MissingField("server".to_owned()))?;
    let base_url = raw_server
        .base_url
        .ok_or_else(|| ConfigError::MissingField("server.base_url".to_owned()))?;
    if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
        return Err(ConfigError::InvalidValue(format!(
            "server.base_url must start with http:// or https://, got '{base_url}'"
        )));
    }
    let ws_path = raw_server
        .ws_path
        .unwrap_or_else(|| DEFAULT_WS_PATH.to_owned());
    if !ws_path.starts_with('/') {
        return Err(ConfigError::InvalidValue(format!(
            "server.ws_path must start with '/', got '{ws_path}'"
        )));
    }

    let reconnect = match raw.reconnect {
        Some(r) => {
            let max_attempts = r.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS);
            if max_attempts == 0 {
                return Err(ConfigError::InvalidValue(
                    "reconnect.max_attempts must be at least 1".to_owned(),
                ));
            }
            ReconnectPolicy {
                max_attempts,
                delay: r.delay_ms.map_or(DEFAULT_RECONNECT_DELAY, Duration::from_millis),
            }
        }
        None => ReconnectPolicy::default(),
    };

    let bind = raw
        .control_api
        .and_then(|c| c.bind)
        .unwrap_or_else(|| DEFAULT_CONTROL_BIND.to_owned());
    let bind: SocketAddr = bind
        .parse()
        .map_err(|e| ConfigError::InvalidValue(format!("control_api.bind '{bind}': {e}")))?;

    Ok(MonitorConfig {
        schema_version,
        server: ServerConfig {
            base_url: base_url.trim_end_matches('/').to_owned(),
            ws_path,
        },
        reconnect,
        control_api: ControlApiConfig { bind },
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}
