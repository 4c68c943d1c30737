//! Configuration module for blocking-cache server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

/// Command-line arguments for the cache server
#[derive(Parser, Debug)]
#[command(name = "blocking-cache")]
#[command(author = "blocking-cache authors")]
#[command(version = "0.1.0")]
#[command(about = "A thread-per-connection cache server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:8080)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Maximum number of concurrently served connections
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Maximum memory usage in bytes (e.g., 67108864 for 64MB)
    #[arg(short = 'm', long)]
    pub max_memory: Option<usize>,

    /// Per-connection receive buffer size in bytes
    #[arg(long)]
    pub buffer_size: Option<usize>,

    /// Largest request body accepted, in bytes
    #[arg(long)]
    pub max_body_size: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Connection thread ceiling
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Receive buffer capacity per connection
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Body buffer capacity per connection
    #[serde(default = "default_buffer_size")]
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: default_workers(),
            backlog: default_backlog(),
            buffer_size: default_buffer_size(),
            max_body_size: default_buffer_size(),
        }
    }
}

/// Storage-related configuration
#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    /// Maximum memory usage in bytes
    #[serde(default = "default_max_memory")]
    pub max_memory: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_memory: default_max_memory(),
        }
    }
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
    "0.0.0.0:8080".to_string()
}

fn default_workers() -> usize {
    64
}

fn default_backlog() -> i32 {
    5
}

fn default_buffer_size() -> usize {
    1024
}

fn default_max_memory() -> usize {
    64 * 1024 * 1024 // 64 MB
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Socket-level limits applied to every connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Capacity of the receive buffer the header is assembled in.
    pub buffer_size: usize,
    /// Largest body a request may declare.
    pub max_body_size: usize,
    /// Listen backlog for the server socket.
    pub backlog: i32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            max_body_size: default_buffer_size(),
            backlog: default_backlog(),
        }
    }
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub workers: usize,
    pub max_memory: usize,
    pub limits: Limits,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let listen = cli.listen.unwrap_or(toml_config.server.listen);
        let listen = listen
            .parse()
            .map_err(|_| ConfigError::InvalidListen(listen.clone()))?;

        Ok(Config {
            listen,
            workers: cli.workers.unwrap_or(toml_config.server.workers),
            max_memory: cli.max_memory.unwrap_or(toml_config.storage.max_memory),
            limits: Limits {
                buffer_size: cli.buffer_size.unwrap_or(toml_config.server.buffer_size),
                max_body_size: cli
                    .max_body_size
                    .unwrap_or(toml_config.server.max_body_size),
                backlog: toml_config.server.backlog,
            },
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid listen address '{0}'")]
    InvalidListen(String),
}
