//! Layered configuration: built-in defaults, then the TOML file, then `CINDER__*`
//! environment variables.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use cinder_protocol::{AgentRole, EventType, SubscriptionFilter};
use config::{Config, Environment, File, FileFormat};
use log::info;
use serde::{Deserialize, Serialize};

use crate::backoff::BackoffPolicy;
use crate::error::ConfigError;

pub const APP_NAME: &str = "cinder";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub backend: BackendConfig,
    pub pull: PullConfig,
    pub push: PushConfig,
    pub backoff: BackoffPolicy,
    pub retry: RetryConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Agent backend HTTP endpoint and identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub base_url: String,
    pub app_name: String,
    pub user_id: String,
    /// Timeout for the one-shot session bootstrap request.
    pub bootstrap_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            app_name: "recovery_coordinator".to_string(),
            user_id: "operator".to_string(),
            bootstrap_timeout_secs: 15,
        }
    }
}

impl BackendConfig {
    pub fn bootstrap_timeout(&self) -> Duration {
        Duration::from_secs(self.bootstrap_timeout_secs)
    }
}

/// Server-Sent-Events transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PullConfig {
    pub connect_timeout_secs: u64,
    /// Upper bound on one whole streamed turn.
    pub request_timeout_secs: u64,
}

impl Default for PullConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            request_timeout_secs: 300,
        }
    }
}

impl PullConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// WebSocket transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PushConfig {
    pub ws_url: String,
    /// Silence longer than this counts as an unclean close.
    pub heartbeat_timeout_secs: u64,
    pub max_reconnect_attempts: u32,
    /// Default subscription; empty means every agent.
    pub agents: Vec<AgentRole>,
    /// Default subscription; empty means every event type.
    pub event_types: Vec<EventType>,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            ws_url: "ws://localhost:8000".to_string(),
            heartbeat_timeout_secs: 60,
            max_reconnect_attempts: 50,
            agents: Vec::new(),
            event_types: Vec::new(),
        }
    }
}

impl PushConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn filter(&self) -> SubscriptionFilter {
        SubscriptionFilter {
            agents: self.agents.clone(),
            event_types: self.event_types.clone(),
        }
    }
}

/// Turn-level retry in the session client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_retries: 3 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub max_events: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { max_events: 200 }
    }
}

// ============================================================================
// Paths
// ============================================================================

#[derive(Debug, Clone)]
pub struct AppPaths {
    pub config_file: PathBuf,
}

impl AppPaths {
    /// Resolve the config file, honoring an explicit override. A directory override
    /// means `<dir>/config.toml`.
    pub fn discover(override_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let config_file = match override_path {
            Some(path) => {
                let expanded = expand_path(path)?;
                if expanded.is_dir() {
                    expanded.join("config.toml")
                } else {
                    expanded
                }
            }
            None => default_config_dir()?.join("config.toml"),
        };
        Ok(Self { config_file })
    }
}

// ============================================================================
// Loading
// ============================================================================

/// Load the config, writing a commented default file first if none exists.
pub fn load_or_init_config(paths: &AppPaths) -> Result<AppConfig, ConfigError> {
    if !paths.config_file.exists() {
        info!(
            "creating default config at {}",
            paths.config_file.display()
        );
        write_default_config(&paths.config_file)?;
    }
    load_config(&paths.config_file, None)
}

/// Load the config from `path` (which may be missing) and the environment.
///
/// `env_vars` replaces the process environment when given.
pub fn load_config(
    path: &Path,
    env_vars: Option<config::Map<String, String>>,
) -> Result<AppConfig, ConfigError> {
    let env_prefix = env_prefix();
    let built = Config::builder()
        .set_default("logging.level", "info")?
        .add_source(
            File::from(path)
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(
            Environment::with_prefix(env_prefix.as_str())
                .separator("__")
                .source(env_vars),
        )
        .build()?;

    Ok(built.try_deserialize()?)
}

pub fn write_default_config(path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config)?;
    let mut body = default_config_header(path);
    body.push_str(&toml);
    fs::write(path, body)?;
    Ok(())
}

fn default_config_header(path: &Path) -> String {
    let mut buffer = String::new();
    buffer.push_str("# Configuration for ");
    buffer.push_str(APP_NAME);
    buffer.push('\n');
    buffer.push_str("# File: ");
    buffer.push_str(&path.display().to_string());
    buffer.push('\n');
    buffer.push_str("# Environment overrides: ");
    buffer.push_str(&env_prefix());
    buffer.push_str("__<SECTION>__<KEY>\n");
    buffer.push('\n');
    buffer
}

fn expand_path(path: PathBuf) -> Result<PathBuf, ConfigError> {
    if let Some(text) = path.to_str() {
        expand_str_path(text)
    } else {
        Ok(path)
    }
}

pub fn expand_str_path(text: &str) -> Result<PathBuf, ConfigError> {
    let expanded = shellexpand::full(text).map_err(|e| ConfigError::Expand {
        path: text.to_string(),
        message: e.to_string(),
    })?;
    Ok(PathBuf::from(expanded.to_string()))
}

pub fn default_config_dir() -> Result<PathBuf, ConfigError> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        let mut path = PathBuf::from(dir);
        path.push(APP_NAME);
        return Ok(path);
    }

    if let Some(mut dir) = dirs::config_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or(ConfigError::NoConfigDir)
}

pub fn env_prefix() -> String {
    APP_NAME
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}
