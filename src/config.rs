//! Configuration module for the file-drop server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the file-drop server
#[derive(Parser, Debug)]
#[command(name = "file-drop")]
#[command(author = "file-drop authors")]
#[command(version = "0.1.0")]
#[command(about = "A TCP file-drop server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:8080)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Directory received files are written to
    #[arg(short = 'd', long)]
    pub root_dir: Option<PathBuf>,

    /// Maximum accepted payload in bytes (e.g., 10485760 for 10MB)
    #[arg(short = 'm', long)]
    pub max_file_size: Option<u64>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Idle read timeout in seconds (0 = wait forever)
    #[arg(long)]
    pub read_timeout: Option<u64>,

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
    /// Number of worker threads
    pub workers: Option<usize>,
    /// Maximum number of connections handled at once
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Idle read timeout in seconds, 0 disables it
    #[serde(default = "default_read_timeout")]
    pub read_timeout: u64,
    /// Seconds to wait for in-flight transfers on shutdown
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: None,
            max_connections: default_max_connections(),
            read_timeout: default_read_timeout(),
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

/// Storage-related configuration
#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    /// Directory received files are written to
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,
    /// Largest payload accepted, in bytes
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    /// Size of each payload read
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            max_file_size: default_max_file_size(),
            chunk_size: default_chunk_size(),
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
    "127.0.0.1:8080".to_string()
}

fn default_max_connections() -> usize {
    1024
}

fn default_read_timeout() -> u64 {
    60
}

fn default_shutdown_grace() -> u64 {
    10
}

fn default_root_dir() -> PathBuf {
    PathBuf::from("goDropped")
}

fn default_max_file_size() -> u64 {
    10 * 1024 * 1024 // 10 MB
}

fn default_chunk_size() -> usize {
    4 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub workers: Option<usize>,
    pub max_connections: usize,
    pub read_timeout: u64,
    pub shutdown_grace: u64,
    pub root_dir: PathBuf,
    pub max_file_size: u64,
    pub chunk_size: usize,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config::merge(CliArgs::empty(), TomlConfig::default())
    }
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
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Config::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            workers: cli.workers.or(toml_config.server.workers),
            max_connections: toml_config.server.max_connections,
            read_timeout: cli
                .read_timeout
                .unwrap_or(toml_config.server.read_timeout),
            shutdown_grace: toml_config.server.shutdown_grace,
            root_dir: cli.root_dir.unwrap_or(toml_config.storage.root_dir),
            max_file_size: cli
                .max_file_size
                .unwrap_or(toml_config.storage.max_file_size),
            chunk_size: toml_config.storage.chunk_size,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be greater than 0"));
        }
        if self.workers == Some(0) {
            return Err(ConfigError::Invalid("workers must be greater than 0"));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_connections must be greater than 0",
            ));
        }
        Ok(())
    }

    /// Idle deadline applied to each connection read, if enabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        match self.read_timeout {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

impl CliArgs {
    fn empty() -> Self {
        CliArgs {
            config: None,
            listen: None,
            root_dir: None,
            max_file_size: None,
            workers: None,
            read_timeout: None,
            log_level: default_log_level(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Invalid(reason) => write!(f, "Invalid configuration: {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}
