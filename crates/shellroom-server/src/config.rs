//! Server configuration: TOML file + CLI overrides.

use crate::chat::ChatLimits;
use crate::lifecycle::LifecycleConfig;
use serde::Deserialize;
use shellroom_core::{PasswordPolicy, RoomError, RoomResult, UsernamePolicy};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub containers: ContainerSection,
    #[serde(default)]
    pub accounts: AccountSection,
    #[serde(default)]
    pub chat: ChatSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
            database: default_database(),
            max_sessions: default_max_sessions(),
        }
    }
}

/// `[containers]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ContainerSection {
    #[serde(default = "default_runtime")]
    pub runtime: String,
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default = "default_memory")]
    pub memory: String,
    #[serde(default = "default_cpu_shares")]
    pub cpu_shares: u32,
    #[serde(default = "default_network_mode")]
    pub network_mode: String,
    #[serde(default = "default_lifetime")]
    pub lifetime_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_build_timeout")]
    pub build_timeout_secs: u64,
    #[serde(default = "default_start_timeout")]
    pub start_timeout_secs: u64,
}

impl Default for ContainerSection {
    fn default() -> Self {
        Self {
            runtime: default_runtime(),
            name_prefix: default_name_prefix(),
            image: default_image(),
            memory: default_memory(),
            cpu_shares: default_cpu_shares(),
            network_mode: default_network_mode(),
            lifetime_secs: default_lifetime(),
            sweep_interval_secs: default_sweep_interval(),
            build_timeout_secs: default_build_timeout(),
            start_timeout_secs: default_start_timeout(),
        }
    }
}

/// `[accounts]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountSection {
    #[serde(default = "default_max_username_len")]
    pub max_username_len: usize,
    #[serde(default = "default_min_password_len")]
    pub min_password_len: usize,
    #[serde(default = "default_true")]
    pub password_requires_letter: bool,
    #[serde(default = "default_true")]
    pub password_requires_digit: bool,
    #[serde(default = "default_bcrypt_cost")]
    pub bcrypt_cost: u32,
}

impl Default for AccountSection {
    fn default() -> Self {
        Self {
            max_username_len: default_max_username_len(),
            min_password_len: default_min_password_len(),
            password_requires_letter: true,
            password_requires_digit: true,
            bcrypt_cost: default_bcrypt_cost(),
        }
    }
}

/// `[chat]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatSection {
    #[serde(default = "default_max_message_len")]
    pub max_message_len: usize,
    #[serde(default = "default_per_minute")]
    pub per_minute: u32,
    #[serde(default = "default_per_hour")]
    pub per_hour: u32,
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
    #[serde(default = "default_duplicate_window")]
    pub duplicate_window: usize,
    #[serde(default = "default_history_limit")]
    pub history_limit: u32,
}

impl Default for ChatSection {
    fn default() -> Self {
        Self {
            max_message_len: default_max_message_len(),
            per_minute: default_per_minute(),
            per_hour: default_per_hour(),
            min_interval_ms: default_min_interval_ms(),
            duplicate_window: default_duplicate_window(),
            history_limit: default_history_limit(),
        }
    }
}

fn default_port() -> u16 {
    3001
}
fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_database() -> String {
    "~/.shellroom/shellroom.db".to_string()
}
fn default_max_sessions() -> usize {
    200
}
fn default_runtime() -> String {
    "docker".to_string()
}
fn default_name_prefix() -> String {
    "linuxdo".to_string()
}
fn default_image() -> String {
    "linuxdo-ubuntu:latest".to_string()
}
fn default_memory() -> String {
    "512m".to_string()
}
fn default_cpu_shares() -> u32 {
    512
}
fn default_network_mode() -> String {
    "bridge".to_string()
}
fn default_lifetime() -> u64 {
    2 * 60 * 60
}
fn default_sweep_interval() -> u64 {
    5 * 60
}
fn default_build_timeout() -> u64 {
    30 * 60
}
fn default_start_timeout() -> u64 {
    60
}
fn default_max_username_len() -> usize {
    32
}
fn default_min_password_len() -> usize {
    6
}
fn default_bcrypt_cost() -> u32 {
    10
}
fn default_max_message_len() -> usize {
    500
}
fn default_per_minute() -> u32 {
    10
}
fn default_per_hour() -> u32 {
    100
}
fn default_min_interval_ms() -> u64 {
    1000
}
fn default_duplicate_window() -> usize {
    5
}
fn default_history_limit() -> u32 {
    50
}
fn default_true() -> bool {
    true
}

/// CLI overrides applied on top of the config file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub port: Option<u16>,
    pub bind: Option<String>,
    pub database: Option<String>,
    pub runtime: Option<String>,
    pub lifetime_secs: Option<u64>,
    pub sweep_interval_secs: Option<u64>,
    pub max_sessions: Option<usize>,
}

/// Resolved server configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub bind: String,
    pub database_path: PathBuf,
    pub max_sessions: usize,
    pub runtime_binary: String,
    pub sweep_interval: Duration,
    pub lifecycle: LifecycleConfig,
    pub username_policy: UsernamePolicy,
    pub password_policy: PasswordPolicy,
    pub bcrypt_cost: u32,
    pub chat: ChatLimits,
    pub chat_history_limit: u32,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, cli: CliOverrides) -> RoomResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| RoomError::Other(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Self::from_file(file_config, cli)
    }

    /// Merge a parsed config file with CLI overrides and validate the result.
    pub fn from_file(file: ConfigFile, cli: CliOverrides) -> RoomResult<Self> {
        let ConfigFile {
            server,
            containers,
            accounts,
            chat,
        } = file;

        if !(8..=32).contains(&accounts.max_username_len) {
            return Err(RoomError::Other(format!(
                "accounts.max_username_len must be between 8 and 32, got {}",
                accounts.max_username_len
            )));
        }
        if !(4..=31).contains(&accounts.bcrypt_cost) {
            return Err(RoomError::Other(format!(
                "accounts.bcrypt_cost must be between 4 and 31, got {}",
                accounts.bcrypt_cost
            )));
        }

        let lifetime_secs = cli.lifetime_secs.unwrap_or(containers.lifetime_secs);
        let sweep_secs = cli
            .sweep_interval_secs
            .unwrap_or(containers.sweep_interval_secs);
        if lifetime_secs == 0 || sweep_secs == 0 {
            return Err(RoomError::Other(
                "container lifetime and sweep interval must be non-zero".into(),
            ));
        }

        let lifecycle = LifecycleConfig {
            name_prefix: containers.name_prefix,
            image: containers.image,
            memory: containers.memory,
            cpu_shares: containers.cpu_shares,
            network_mode: containers.network_mode,
            lifetime: Duration::from_secs(lifetime_secs),
            build_timeout: Duration::from_secs(containers.build_timeout_secs),
            start_timeout: Duration::from_secs(containers.start_timeout_secs),
        };

        Ok(Self {
            port: cli.port.unwrap_or(server.port),
            bind: cli.bind.unwrap_or(server.bind),
            database_path: expand_tilde_str(&cli.database.unwrap_or(server.database)),
            max_sessions: cli.max_sessions.unwrap_or(server.max_sessions),
            runtime_binary: cli.runtime.unwrap_or(containers.runtime),
            sweep_interval: Duration::from_secs(sweep_secs),
            lifecycle,
            username_policy: UsernamePolicy::new(accounts.max_username_len),
            password_policy: PasswordPolicy {
                min_len: accounts.min_password_len,
                require_letter: accounts.password_requires_letter,
                require_digit: accounts.password_requires_digit,
            },
            bcrypt_cost: accounts.bcrypt_cost,
            chat: ChatLimits {
                max_message_len: chat.max_message_len,
                per_minute: chat.per_minute,
                per_hour: chat.per_hour,
                min_interval: Duration::from_millis(chat.min_interval_ms),
                duplicate_window: chat.duplicate_window,
            },
            chat_history_limit: chat.history_limit,
        })
    }
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
