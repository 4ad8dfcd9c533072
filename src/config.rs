//! Configuration for the sluice server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the HTTP server
#[derive(Parser, Debug, Default)]
#[command(name = "sluice")]
#[command(version)]
#[command(about = "An event-driven HTTP/1.1 server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:8055)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Number of network threads
    #[arg(short = 'n', long)]
    pub net_threads: Option<usize>,

    /// Worker threads per network thread
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Directory served under /static
    #[arg(short = 'r', long)]
    pub root: Option<PathBuf>,

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
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub limits: LimitConfig,
    #[serde(default)]
    pub static_files: StaticConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Number of network threads (defaults to number of CPU cores)
    pub net_threads: Option<usize>,
    #[serde(default = "default_workers_per_thread")]
    pub workers_per_thread: usize,
    /// Capacity of each network thread's job queue
    #[serde(default = "default_job_queue_size")]
    pub job_queue_size: usize,
    /// Connections per network thread
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Readiness events fetched per poll
    #[serde(default = "default_events_capacity")]
    pub events_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            net_threads: None,
            workers_per_thread: default_workers_per_thread(),
            job_queue_size: default_job_queue_size(),
            max_connections: default_max_connections(),
            events_capacity: default_events_capacity(),
        }
    }
}

/// Timeouts in milliseconds
#[derive(Debug, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_keep_alive_ms")]
    pub keep_alive_ms: u64,
    #[serde(default = "default_read_ms")]
    pub read_ms: u64,
    #[serde(default = "default_write_ms")]
    pub write_ms: u64,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            keep_alive_ms: default_keep_alive_ms(),
            read_ms: default_read_ms(),
            write_ms: default_write_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

/// Size limits in bytes
#[derive(Debug, Deserialize)]
pub struct LimitConfig {
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,
    #[serde(default = "default_max_content_size")]
    pub max_content_size: usize,
    #[serde(default = "default_stream_buffer_size")]
    pub stream_buffer_size: usize,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            max_header_size: default_max_header_size(),
            max_content_size: default_max_content_size(),
            stream_buffer_size: default_stream_buffer_size(),
        }
    }
}

/// Static file serving
#[derive(Debug, Deserialize, Default)]
pub struct StaticConfig {
    pub root: Option<PathBuf>,
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
    "127.0.0.1:8055".to_string()
}

fn default_workers_per_thread() -> usize {
    4
}

fn default_job_queue_size() -> usize {
    256
}

fn default_max_connections() -> usize {
    10_000
}

fn default_events_capacity() -> usize {
    1024
}

fn default_keep_alive_ms() -> u64 {
    60_000
}

fn default_read_ms() -> u64 {
    30_000
}

fn default_write_ms() -> u64 {
    30_000
}

fn default_shutdown_grace_ms() -> u64 {
    5_000
}

fn default_max_header_size() -> usize {
    8 * 1024
}

fn default_max_content_size() -> usize {
    16 * 1024 * 1024 // 16 MB
}

fn default_stream_buffer_size() -> usize {
    32 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Connection phase timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub keep_alive: Duration,
    pub read: Duration,
    pub write: Duration,
    /// How long shutdown waits for in-flight connections.
    pub shutdown_grace: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        TimeoutConfig::default().into()
    }
}

impl From<TimeoutConfig> for Timeouts {
    fn from(t: TimeoutConfig) -> Self {
        Self {
            keep_alive: Duration::from_millis(t.keep_alive_ms),
            read: Duration::from_millis(t.read_ms),
            write: Duration::from_millis(t.write_ms),
            shutdown_grace: Duration::from_millis(t.shutdown_grace_ms),
        }
    }
}

/// Request and buffer size limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Largest accepted request head.
    pub max_header_size: usize,
    /// Largest accepted request body, declared or chunked.
    pub max_content_size: usize,
    /// Ring buffer size for streamed response bodies.
    pub stream_buffer_size: usize,
}

impl Default for Limits {
    fn default() -> Self {
        LimitConfig::default().into()
    }
}

impl From<LimitConfig> for Limits {
    fn from(l: LimitConfig) -> Self {
        Self {
            max_header_size: l.max_header_size,
            max_content_size: l.max_content_size,
            stream_buffer_size: l.stream_buffer_size,
        }
    }
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub net_threads: usize,
    pub workers_per_thread: usize,
    pub job_queue_size: usize,
    pub max_connections: usize,
    pub events_capacity: usize,
    pub timeouts: Timeouts,
    pub limits: Limits,
    pub static_root: Option<PathBuf>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::default(), TomlConfig::default())
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

        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    /// Merge CLI args with TOML config (CLI takes precedence)
    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            net_threads: cli
                .net_threads
                .or(toml_config.server.net_threads)
                .unwrap_or_else(num_cpus),
            workers_per_thread: cli
                .workers
                .unwrap_or(toml_config.server.workers_per_thread),
            job_queue_size: toml_config.server.job_queue_size,
            max_connections: toml_config.server.max_connections,
            events_capacity: toml_config.server.events_capacity,
            timeouts: toml_config.timeouts.into(),
            limits: toml_config.limits.into(),
            static_root: cli.root.or(toml_config.static_files.root),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        }
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("server.net_threads", self.net_threads),
            ("server.workers_per_thread", self.workers_per_thread),
            ("server.job_queue_size", self.job_queue_size),
            ("server.max_connections", self.max_connections),
            ("server.events_capacity", self.events_capacity),
            ("limits.max_header_size", self.limits.max_header_size),
            ("limits.stream_buffer_size", self.limits.stream_buffer_size),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue(name, "must be greater than zero".into()));
            }
        }
        if self.listen.parse::<std::net::SocketAddr>().is_err() {
            return Err(ConfigError::InvalidValue(
                "server.listen",
                format!("'{}' is not a socket address", self.listen),
            ));
        }
        Ok(())
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidValue(&'static str, String),
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
            ConfigError::InvalidValue(name, reason) => {
                write!(f, "Invalid value for {name}: {reason}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "127.0.0.1:8055");
        assert_eq!(config.server.job_queue_size, 256);
        assert_eq!(config.server.workers_per_thread, 4);
        assert_eq!(config.timeouts.keep_alive_ms, 60_000);
        assert_eq!(config.limits.max_header_size, 8192);
        assert_eq!(config.limits.max_content_size, 16 * 1024 * 1024);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "0.0.0.0:8080"
            net_threads = 2
            job_queue_size = 16

            [timeouts]
            read_ms = 1500

            [limits]
            max_content_size = 1048576

            [static_files]
            root = "/var/www"

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:8080");
        assert_eq!(config.server.net_threads, Some(2));
        assert_eq!(config.server.job_queue_size, 16);
        assert_eq!(config.server.workers_per_thread, 4);
        assert_eq!(config.timeouts.read_ms, 1500);
        assert_eq!(config.timeouts.write_ms, 30_000);
        assert_eq!(config.limits.max_content_size, 1048576);
        assert_eq!(config.static_files.root, Some(PathBuf::from("/var/www")));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_file() {
        let cli = CliArgs {
            listen: Some("127.0.0.1:9000".into()),
            workers: Some(2),
            log_level: Some("trace".into()),
            ..Default::default()
        };
        let file: TomlConfig = toml::from_str(
            r#"
            [server]
            listen = "0.0.0.0:80"
            workers_per_thread = 8
            net_threads = 3
            "#,
        )
        .unwrap();

        let config = Config::merge(cli, file);
        assert_eq!(config.listen, "127.0.0.1:9000");
        assert_eq!(config.workers_per_thread, 2);
        assert_eq!(config.net_threads, 3);
        assert_eq!(config.log_level, "trace");
        assert_eq!(config.timeouts.read, Duration::from_secs(30));
    }

    #[test]
    fn test_validate_rejects_zero_queue() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.job_queue_size = 0;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue("server.job_queue_size", _)));

        config.job_queue_size = 1;
        config.listen = "not-an-address".into();
        assert!(config.validate().is_err());
    }
}
