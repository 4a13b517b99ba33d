//! Server configuration: TOML file + CLI overrides.

use crate::auth::RateLimitConfig;
use crate::relay::{HubSettings, KEEPALIVE_PERIOD};
use logrelay_core::{RelayError, RelayResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub limits: RateLimitConfig,
    #[serde(default)]
    pub storage: StorageSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_device_port")]
    pub device_port: u16,
    #[serde(default = "default_inspector_port")]
    pub inspector_port: u16,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_history_size")]
    pub history_size: usize,
    #[serde(default = "default_max_token_duration_ms")]
    pub max_token_duration_ms: u64,
    #[serde(default = "default_max_log_length")]
    pub max_log_length: usize,
    #[serde(default = "default_true")]
    pub no_token_mode: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            device_port: default_device_port(),
            inspector_port: default_inspector_port(),
            password: None,
            history_size: default_history_size(),
            max_token_duration_ms: default_max_token_duration_ms(),
            max_log_length: default_max_log_length(),
            no_token_mode: true,
        }
    }
}

/// `[storage]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageSection {
    #[serde(default)]
    pub disk_logging: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_persistent_store")]
    pub persistent_store: String,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            disk_logging: false,
            log_dir: default_log_dir(),
            persistent_store: default_persistent_store(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_device_port() -> u16 {
    8080
}
fn default_inspector_port() -> u16 {
    8081
}
fn default_history_size() -> usize {
    1000
}
fn default_max_token_duration_ms() -> u64 {
    24 * 60 * 60 * 1000
}
fn default_max_log_length() -> usize {
    3000
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_persistent_store() -> String {
    "persistent-tokens.json".to_string()
}
fn default_true() -> bool {
    true
}

/// Values given on the command line (or their `LOGRELAY_*` env fallbacks).
/// `None` keeps whatever the file or the defaults say.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub host: Option<String>,
    pub device_port: Option<u16>,
    pub inspector_port: Option<u16>,
    pub password: Option<String>,
    pub history_size: Option<usize>,
    pub max_token_duration_ms: Option<u64>,
    pub max_log_length: Option<usize>,
    pub no_token_mode: Option<bool>,
    pub wrong_password_limit: Option<u64>,
    pub inspector_connection_limit: Option<u64>,
    pub device_connection_limit: Option<u64>,
    pub device_message_limit: Option<u64>,
    pub inspector_message_limit: Option<u64>,
    pub disk_logging: Option<bool>,
    pub log_dir: Option<String>,
    pub persistent_store: Option<String>,
}

/// Resolved server configuration (all paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub device_port: u16,
    pub inspector_port: u16,
    pub password: Option<String>,
    pub history_size: usize,
    pub max_token_duration_ms: u64,
    pub max_log_length: usize,
    pub no_token_mode: bool,
    pub limits: RateLimitConfig,
    pub disk_logging: bool,
    pub log_dir: PathBuf,
    pub persistent_store: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_file(ConfigFile::default(), ConfigOverrides::default())
    }
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    ///
    /// A missing file means defaults; an unreadable or malformed one is an
    /// error.
    pub fn load(config_path: Option<&Path>, overrides: ConfigOverrides) -> RelayResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded).map_err(|e| {
                        RelayError::Config(format!("cannot read {}: {e}", expanded.display()))
                    })?;
                    parse_config(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        let config = Self::from_file(file_config, overrides);
        config.validate()?;
        Ok(config)
    }

    /// Merge a parsed file with CLI overrides. Does not validate.
    pub fn from_file(file: ConfigFile, cli: ConfigOverrides) -> Self {
        let ConfigFile {
            server,
            mut limits,
            storage,
        } = file;

        if let Some(v) = cli.wrong_password_limit {
            limits.wrong_password = v;
        }
        if let Some(v) = cli.inspector_connection_limit {
            limits.inspector_connection = v;
        }
        if let Some(v) = cli.device_connection_limit {
            limits.device_connection = v;
        }
        if let Some(v) = cli.device_message_limit {
            limits.device_message = v;
        }
        if let Some(v) = cli.inspector_message_limit {
            limits.inspector_message = v;
        }

        let log_dir = cli.log_dir.unwrap_or(storage.log_dir);
        let persistent_store = cli.persistent_store.unwrap_or(storage.persistent_store);

        Self {
            host: cli.host.unwrap_or(server.host),
            device_port: cli.device_port.unwrap_or(server.device_port),
            inspector_port: cli.inspector_port.unwrap_or(server.inspector_port),
            password: cli.password.or(server.password).filter(|p| !p.is_empty()),
            history_size: cli.history_size.unwrap_or(server.history_size),
            max_token_duration_ms: cli
                .max_token_duration_ms
                .unwrap_or(server.max_token_duration_ms),
            max_log_length: cli.max_log_length.unwrap_or(server.max_log_length),
            no_token_mode: cli.no_token_mode.unwrap_or(server.no_token_mode),
            limits,
            disk_logging: cli.disk_logging.unwrap_or(storage.disk_logging),
            log_dir: expand_tilde_str(&log_dir),
            persistent_store: expand_tilde_str(&persistent_store),
        }
    }

    /// Reject configurations the relay cannot start with.
    pub fn validate(&self) -> RelayResult<()> {
        if self.device_port == 0 || self.inspector_port == 0 {
            return Err(RelayError::Config("ports must be nonzero".into()));
        }
        if self.device_port == self.inspector_port {
            return Err(RelayError::Config(format!(
                "device and inspector ports must differ (both {})",
                self.device_port
            )));
        }
        Ok(())
    }

    /// The slice of the configuration the relay hub needs.
    pub fn hub_settings(&self) -> HubSettings {
        HubSettings {
            password: self.password.clone(),
            history_size: self.history_size,
            max_token_duration_ms: self.max_token_duration_ms,
            max_log_length: self.max_log_length,
            no_token_mode: self.no_token_mode,
            keepalive_period: KEEPALIVE_PERIOD,
        }
    }
}

fn parse_config(content: &str) -> RelayResult<ConfigFile> {
    toml::from_str::<ConfigFile>(content)
        .map_err(|e| RelayError::Config(format!("config parse error: {e}")))
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
