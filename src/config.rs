//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `JUMPGATE_LISTEN`, `JUMPGATE_SECRET_KEY`,
//!    `JUMPGATE_GUACD_HOST`, `JUMPGATE_GUACD_PORT`, `JUMPGATE_SSH_LISTEN`
//! 2. **Config file** — path via `--config <path>`, or `jumpgate.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8888"
//! max_connections = 1024
//! data_dir = "/var/lib/jumpgate"
//! default_width = 1280
//! default_height = 800
//! default_dpi = 96
//!
//! [auth]
//! secret_key = "your-secret-key"
//! salt = "cookie-session"
//! cookie_name = "session"
//!
//! [[auth.api_keys]]
//! key = "ops-robot"
//! secret = "s3cret"
//! uid = 900
//! user_name = "robot"
//! admin = true
//!
//! [guacd]
//! host = "127.0.0.1"
//! port = 4822
//!
//! [ssh]
//! enabled = true
//! listen = "0.0.0.0:2222"
//! host_key = ""              # empty = $data_dir/ssh_host_ed25519_key, generated on first start
//! dial_timeout_secs = 5
//! handshake_timeout_secs = 10
//! keepalive_secs = 30
//!
//! [replay]
//! dir = ""                   # empty = $data_dir/replay
//! path_strategy = "date-hierarchy"
//! retention_days = 30        # 0 keeps recordings forever
//!
//! [telnet]
//! login_markers = ["login", "username", "account"]
//! password_markers = ["password", "pass:"]
//! prompt_chars = ["$", "#", ">"]
//!
//! [parser]
//! scrub_markers = ["\u001b[0;90;49m", "\u001b[90m", "\u001b[2m", "\u001b[37m"]
//!
//! [settings]
//! timeout = 3600
//! rdp = { copy = true, paste = true }
//! vnc = { copy = true, paste = true }
//!
//! [inventory]
//! path = "inventory.toml"
//!
//! [schedule]
//! connectable_interval_secs = 300   # 0 disables the sweep
//! connectable_concurrency = 16
//! settings_refresh_secs = 60
//!
//! [logging]
//! level = "info"
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::model::GlobalSettings;
use crate::protocols::TelnetPrompts;
use crate::storage::PathStrategy;
use crate::terminal::DEFAULT_SCRUB_MARKERS;

const DEFAULT_FILE: &str = "jumpgate.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid value for {var}: {value:?}")]
    Env { var: &'static str, value: String },
}

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub guacd: GuacdSettings,
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub replay: ReplayConfig,
    #[serde(default)]
    pub telnet: TelnetPrompts,
    #[serde(default)]
    pub parser: ParserConfig,
    /// Initial global settings snapshot; the inventory may override it.
    #[serde(default)]
    pub settings: GlobalSettings,
    #[serde(default)]
    pub inventory: InventoryConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP listener and connection defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:8888`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Maximum concurrent in-flight HTTP requests (default 1024).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Directory for the audit journal, staging casts and the SSH host key.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Viewport used when the client omits `w`.
    #[serde(default = "default_width")]
    pub default_width: u32,
    /// Viewport used when the client omits `h`.
    #[serde(default = "default_height")]
    pub default_height: u32,
    /// DPI used when the client omits `dpi`.
    #[serde(default = "default_dpi")]
    pub default_dpi: u32,
}

/// Cookie and API-key authentication.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Secret shared with the web front-end that issues session cookies.
    /// Override with `JUMPGATE_SECRET_KEY`. Defaults to `"change-me"`,
    /// which triggers a startup warning.
    #[serde(default = "default_secret_key")]
    pub secret_key: String,
    #[serde(default = "default_salt")]
    pub salt: String,
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,
    #[serde(default)]
    pub api_keys: Vec<ApiKeyConfig>,
}

/// A machine credential for the `_key`/`_secret` query flow.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiKeyConfig {
    pub key: String,
    pub secret: String,
    pub uid: u64,
    pub user_name: String,
    #[serde(default)]
    pub admin: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GuacdSettings {
    #[serde(default = "default_guacd_host")]
    pub host: String,
    #[serde(default = "default_guacd_port")]
    pub port: u16,
}

/// Native SSH front-end and outbound SSH timeouts.
#[derive(Debug, Clone, Deserialize)]
pub struct SshConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_ssh_listen")]
    pub listen: String,
    /// Host key path. Empty means `$data_dir/ssh_host_ed25519_key`.
    #[serde(default)]
    pub host_key: String,
    /// TCP dial timeout for targets and jump hosts.
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,
    /// SSH handshake plus authentication timeout.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    /// Keepalive interval on outbound SSH connections (0 disables).
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,
}

/// Session recordings.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplayConfig {
    /// Local provider root. Empty means `$data_dir/replay`.
    #[serde(default)]
    pub dir: String,
    #[serde(default)]
    pub path_strategy: PathStrategy,
    /// Recordings older than this are purged daily (0 keeps them forever).
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParserConfig {
    /// SGR sequences that open a dimmed auto-completion hint.
    #[serde(default = "default_scrub_markers")]
    pub scrub_markers: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InventoryConfig {
    #[serde(default = "default_inventory_path")]
    pub path: String,
}

/// Background task intervals.
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    /// Seconds between connectable sweeps (0 disables).
    #[serde(default = "default_connectable_interval")]
    pub connectable_interval_secs: u64,
    /// Reachability checks in flight at once during a sweep.
    #[serde(default = "default_connectable_concurrency")]
    pub connectable_concurrency: usize,
    /// Seconds between global settings refreshes.
    #[serde(default = "default_settings_refresh")]
    pub settings_refresh_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:8888".to_string()
}
fn default_max_connections() -> usize {
    1024
}
fn default_data_dir() -> String {
    "/var/lib/jumpgate".to_string()
}
fn default_width() -> u32 {
    1280
}
fn default_height() -> u32 {
    800
}
fn default_dpi() -> u32 {
    96
}
fn default_secret_key() -> String {
    "change-me".to_string()
}
fn default_salt() -> String {
    "cookie-session".to_string()
}
fn default_cookie_name() -> String {
    "session".to_string()
}
fn default_guacd_host() -> String {
    "127.0.0.1".to_string()
}
fn default_guacd_port() -> u16 {
    4822
}
fn default_true() -> bool {
    true
}
fn default_ssh_listen() -> String {
    "0.0.0.0:2222".to_string()
}
fn default_dial_timeout() -> u64 {
    5
}
fn default_handshake_timeout() -> u64 {
    10
}
fn default_keepalive() -> u64 {
    30
}
fn default_retention_days() -> u64 {
    30
}
fn default_scrub_markers() -> Vec<String> {
    DEFAULT_SCRUB_MARKERS.iter().map(ToString::to_string).collect()
}
fn default_inventory_path() -> String {
    "inventory.toml".to_string()
}
fn default_connectable_interval() -> u64 {
    300
}
fn default_connectable_concurrency() -> usize {
    16
}
fn default_settings_refresh() -> u64 {
    60
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_connections: default_max_connections(),
            data_dir: default_data_dir(),
            default_width: default_width(),
            default_height: default_height(),
            default_dpi: default_dpi(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret_key: default_secret_key(),
            salt: default_salt(),
            cookie_name: default_cookie_name(),
            api_keys: Vec::new(),
        }
    }
}

impl Default for GuacdSettings {
    fn default() -> Self {
        Self {
            host: default_guacd_host(),
            port: default_guacd_port(),
        }
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            listen: default_ssh_listen(),
            host_key: String::new(),
            dial_timeout_secs: default_dial_timeout(),
            handshake_timeout_secs: default_handshake_timeout(),
            keepalive_secs: default_keepalive(),
        }
    }
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            dir: String::new(),
            path_strategy: PathStrategy::default(),
            retention_days: default_retention_days(),
        }
    }
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            scrub_markers: default_scrub_markers(),
        }
    }
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            path: default_inventory_path(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            connectable_interval_secs: default_connectable_interval(),
            connectable_concurrency: default_connectable_concurrency(),
            settings_refresh_secs: default_settings_refresh(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise `jumpgate.toml`
    /// in the current directory is used when present.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_FILE).exists() => Self::from_file(DEFAULT_FILE)?,
            None => Self::default(),
        };
        config.apply_env(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    fn apply_env(
        &mut self,
        lookup: impl Fn(&'static str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(listen) = lookup("JUMPGATE_LISTEN") {
            self.server.listen = listen;
        }
        if let Some(key) = lookup("JUMPGATE_SECRET_KEY") {
            self.auth.secret_key = key;
        }
        if let Some(host) = lookup("JUMPGATE_GUACD_HOST") {
            self.guacd.host = host;
        }
        if let Some(port) = lookup("JUMPGATE_GUACD_PORT") {
            self.guacd.port = port.parse().map_err(|_| ConfigError::Env {
                var: "JUMPGATE_GUACD_PORT",
                value: port.clone(),
            })?;
        }
        if let Some(listen) = lookup("JUMPGATE_SSH_LISTEN") {
            self.ssh.listen = listen;
        }
        Ok(())
    }

    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.server.data_dir)
    }

    pub fn replay_dir(&self) -> PathBuf {
        if self.replay.dir.is_empty() {
            self.data_dir().join("replay")
        } else {
            PathBuf::from(&self.replay.dir)
        }
    }

    pub fn host_key_path(&self) -> PathBuf {
        if self.ssh.host_key.is_empty() {
            self.data_dir().join("ssh_host_ed25519_key")
        } else {
            PathBuf::from(&self.ssh.host_key)
        }
    }
}
