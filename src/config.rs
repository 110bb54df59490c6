//! Configuration module for the shardgate server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::protocol::{ServerInfo, ShardSettings};
use clap::Parser;
use serde::Deserialize;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the login server
#[derive(Parser, Debug)]
#[command(name = "shardgate")]
#[command(version)]
#[command(about = "Login and world hand-off server for a persistent shard", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:2593)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Maximum connections per worker
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub buffers: BufferConfig,
    #[serde(default)]
    pub login: LoginConfig,
    #[serde(default)]
    pub shards: Vec<ShardConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Number of worker threads
    pub workers: Option<usize>,
    /// Maximum connections per worker
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: None,
            max_connections: default_max_connections(),
        }
    }
}

/// Per-connection buffer sizes
#[derive(Debug, Deserialize)]
pub struct BufferConfig {
    #[serde(default = "default_receive_size")]
    pub receive_size: usize,
    #[serde(default = "default_send_size")]
    pub send_size: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            receive_size: default_receive_size(),
            send_size: default_send_size(),
        }
    }
}

/// Handshake tunables
#[derive(Debug, Deserialize)]
pub struct LoginConfig {
    /// Live session tokens kept for the game connection
    #[serde(default = "default_auth_window")]
    pub auth_window: usize,
    /// How often the login timer checks for the client version
    #[serde(default = "default_version_poll_ms")]
    pub version_poll_ms: u64,
    /// Supported-features flags
    #[serde(default = "default_features")]
    pub features: u32,
    /// Character list flags
    #[serde(default = "default_character_flags")]
    pub character_flags: u32,
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self {
            auth_window: default_auth_window(),
            version_poll_ms: default_version_poll_ms(),
            features: default_features(),
            character_flags: default_character_flags(),
        }
    }
}

/// One `[[shards]]` entry of the server list
#[derive(Debug, Deserialize)]
pub struct ShardConfig {
    pub name: String,
    /// IPv4 address and port the client connects to for the game session
    pub address: String,
    #[serde(default)]
    pub timezone: i8,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:2593".to_string()
}

fn default_max_connections() -> usize {
    1024
}

fn default_receive_size() -> usize {
    64 * 1024
}

fn default_send_size() -> usize {
    256 * 1024
}

fn default_auth_window() -> usize {
    crate::protocol::auth::DEFAULT_CAPACITY
}

fn default_version_poll_ms() -> u64 {
    1000
}

fn default_features() -> u32 {
    ShardSettings::default().features
}

fn default_character_flags() -> u32 {
    ShardSettings::default().character_flags
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub workers: Option<usize>,
    pub max_connections: usize,
    pub receive_size: usize,
    pub send_size: usize,
    pub auth_window: usize,
    pub version_poll: Duration,
    pub features: u32,
    pub character_flags: u32,
    /// Shards advertised in the server list
    pub servers: Vec<ServerInfo>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents).map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args over a parsed TOML file.
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let listen_str = cli.listen.unwrap_or(toml_config.server.listen);
        let listen: SocketAddr = listen_str
            .parse()
            .map_err(|_| ConfigError::Address(listen_str.clone()))?;

        let servers = if toml_config.shards.is_empty() {
            vec![default_server(listen)]
        } else {
            toml_config
                .shards
                .into_iter()
                .map(|shard| {
                    let address = shard
                        .address
                        .parse::<SocketAddrV4>()
                        .map_err(|_| ConfigError::Address(shard.address.clone()))?;
                    Ok(ServerInfo {
                        name: shard.name,
                        address,
                        full_percent: 0,
                        timezone: shard.timezone,
                    })
                })
                .collect::<Result<Vec<_>, ConfigError>>()?
        };

        Ok(Config {
            listen,
            workers: cli.workers.or(toml_config.server.workers),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            receive_size: toml_config.buffers.receive_size,
            send_size: toml_config.buffers.send_size,
            auth_window: toml_config.login.auth_window,
            version_poll: Duration::from_millis(toml_config.login.version_poll_ms),
            features: toml_config.login.features,
            character_flags: toml_config.login.character_flags,
            servers,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        })
    }

    pub fn shard_settings(&self) -> ShardSettings {
        ShardSettings {
            auth_window: self.auth_window,
            version_poll: self.version_poll,
            features: self.features,
            character_flags: self.character_flags,
        }
    }
}

/// With no `[[shards]]`, advertise this server itself. A wildcard bind is
/// advertised as loopback.
fn default_server(listen: SocketAddr) -> ServerInfo {
    let ip = match listen {
        SocketAddr::V4(addr) if !addr.ip().is_unspecified() => *addr.ip(),
        _ => Ipv4Addr::LOCALHOST,
    };
    ServerInfo {
        name: "shardgate".to_string(),
        address: SocketAddrV4::new(ip, listen.port()),
        full_percent: 0,
        timezone: 0,
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {1}", .0.display())]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {1}", .0.display())]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid socket address '{0}'")]
    Address(String),
}
