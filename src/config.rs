//! Configuration module for the time server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::runtime::{MAX_RING_ENTRIES, MAX_SLOTS};
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// I/O strategy used to serve connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum RuntimeType {
    /// Completion-queue event loop on io_uring (Linux only).
    Uring,
    /// Readiness polling with mio (epoll/kqueue).
    Mio,
    /// Blocking accept loop, one OS thread per connection.
    Threads,
    /// Tokio runtime, one task per connection.
    Tasks,
}

/// How accept operations are armed in the completion-queue runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Population {
    /// Every slot keeps its own accept armed while idle.
    PreArmed,
    /// A single accept tagged with the listener token binds an idle slot on completion.
    SharedAccept,
}

/// What the dispatcher does when a connection's operation fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Any failed completion stops the worker.
    Abort,
    /// Only the failing slot's cycle is aborted; the slot is recycled.
    Recycle,
}

/// Command-line arguments for the time server
#[derive(Parser, Debug)]
#[command(name = "time-server")]
#[command(author = "time-server authors")]
#[command(version = "0.1.0")]
#[command(about = "Answers every TCP connection with the current time", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:12345)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Listen backlog
    #[arg(long)]
    pub backlog: Option<i32>,

    /// I/O runtime to serve connections with
    #[arg(short = 'r', long, value_enum)]
    pub runtime: Option<RuntimeType>,

    /// Number of independent worker event loops
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Connection slots per io_uring worker
    #[arg(short = 's', long)]
    pub slots: Option<usize>,

    /// io_uring submission queue entries (0 derives it from the slot count)
    #[arg(long)]
    pub ring_size: Option<u32>,

    /// Accept arming strategy for the io_uring runtime
    #[arg(long, value_enum)]
    pub population: Option<Population>,

    /// Reaction to a failed connection operation in the io_uring runtime
    #[arg(long, value_enum)]
    pub failure_policy: Option<FailurePolicy>,

    /// Delay before responding, in milliseconds (threads and tasks runtimes)
    #[arg(long)]
    pub response_delay_ms: Option<u64>,

    /// Maximum open connections per mio worker
    #[arg(long)]
    pub max_connections: Option<usize>,

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
    pub uring: UringConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    #[serde(default = "default_runtime")]
    pub runtime: RuntimeType,
    /// Number of worker event loops
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub response_delay_ms: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backlog: default_backlog(),
            runtime: default_runtime(),
            workers: default_workers(),
            response_delay_ms: 0,
            max_connections: default_max_connections(),
        }
    }
}

/// io_uring runtime configuration
#[derive(Debug, Deserialize)]
pub struct UringConfig {
    /// Connection slot pool size
    #[serde(default = "default_slots")]
    pub slots: usize,
    /// Submission queue entries, 0 = derived from slots
    #[serde(default)]
    pub ring_size: u32,
    #[serde(default = "default_population")]
    pub population: Population,
    #[serde(default = "default_failure_policy")]
    pub failure_policy: FailurePolicy,
}

impl Default for UringConfig {
    fn default() -> Self {
        Self {
            slots: default_slots(),
            ring_size: 0,
            population: default_population(),
            failure_policy: default_failure_policy(),
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
    "0.0.0.0:12345".to_string()
}

fn default_backlog() -> i32 {
    128
}

fn default_runtime() -> RuntimeType {
    RuntimeType::Uring
}

fn default_workers() -> usize {
    1
}

fn default_max_connections() -> usize {
    1024
}

fn default_slots() -> usize {
    64
}

fn default_population() -> Population {
    Population::PreArmed
}

fn default_failure_policy() -> FailurePolicy {
    FailurePolicy::Recycle
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub backlog: i32,
    pub runtime: RuntimeType,
    pub workers: usize,
    pub slots: usize,
    pub ring_size: u32,
    pub population: Population,
    pub failure_policy: FailurePolicy,
    pub response_delay: Duration,
    pub max_connections: usize,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(None, TomlConfig::default())
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

        let config = Self::merge(Some(cli), toml_config);
        config.validate()?;
        Ok(config)
    }

    fn merge(cli: Option<CliArgs>, file: TomlConfig) -> Self {
        let Some(cli) = cli else {
            return Config {
                listen: file.server.listen,
                backlog: file.server.backlog,
                runtime: file.server.runtime,
                workers: file.server.workers,
                slots: file.uring.slots,
                ring_size: file.uring.ring_size,
                population: file.uring.population,
                failure_policy: file.uring.failure_policy,
                response_delay: Duration::from_millis(file.server.response_delay_ms),
                max_connections: file.server.max_connections,
                log_level: file.logging.level,
            };
        };

        Config {
            listen: cli.listen.unwrap_or(file.server.listen),
            backlog: cli.backlog.unwrap_or(file.server.backlog),
            runtime: cli.runtime.unwrap_or(file.server.runtime),
            workers: cli.workers.unwrap_or(file.server.workers),
            slots: cli.slots.unwrap_or(file.uring.slots),
            ring_size: cli.ring_size.unwrap_or(file.uring.ring_size),
            population: cli.population.unwrap_or(file.uring.population),
            failure_policy: cli.failure_policy.unwrap_or(file.uring.failure_policy),
            response_delay: Duration::from_millis(
                cli.response_delay_ms
                    .unwrap_or(file.server.response_delay_ms),
            ),
            max_connections: cli
                .max_connections
                .unwrap_or(file.server.max_connections),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                file.logging.level
            },
        }
    }

    /// Reject values no runtime can work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1"));
        }
        if self.slots == 0 {
            return Err(ConfigError::Invalid("slots must be at least 1"));
        }
        if self.slots > MAX_SLOTS {
            return Err(ConfigError::Invalid("slots exceeds what one ring can hold"));
        }
        if self.ring_size > MAX_RING_ENTRIES {
            return Err(ConfigError::Invalid("ring_size exceeds the kernel limit"));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be at least 1"));
        }
        if self.backlog <= 0 {
            return Err(ConfigError::Invalid("backlog must be positive"));
        }
        Ok(())
    }

    /// Submission queue depth: large enough that every slot plus the shared
    /// accept can have an operation in flight.
    ///
    /// Never exceeds [`MAX_RING_ENTRIES`], even for unvalidated values.
    pub fn effective_ring_size(&self) -> u32 {
        let slots = self.slots.min(MAX_SLOTS) as u32;
        let floor = (slots + 1).next_power_of_two();
        self.ring_size
            .clamp(floor, MAX_RING_ENTRIES)
            .next_power_of_two()
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
            ConfigError::Invalid(reason) => write!(f, "Invalid configuration: {}", reason),
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
        assert_eq!(config.server.listen, "0.0.0.0:12345");
        assert_eq!(config.server.backlog, 128);
        assert_eq!(config.server.runtime, RuntimeType::Uring);
        assert_eq!(config.uring.slots, 64);
        assert_eq!(config.uring.population, Population::PreArmed);
        assert_eq!(config.uring.failure_policy, FailurePolicy::Recycle);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "127.0.0.1:8080"
            runtime = "mio"
            workers = 4
            response_delay_ms = 500

            [uring]
            slots = 16
            ring_size = 64
            population = "shared-accept"
            failure_policy = "abort"

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:8080");
        assert_eq!(config.server.runtime, RuntimeType::Mio);
        assert_eq!(config.server.workers, 4);
        assert_eq!(config.server.response_delay_ms, 500);
        assert_eq!(config.uring.slots, 16);
        assert_eq!(config.uring.ring_size, 64);
        assert_eq!(config.uring.population, Population::SharedAccept);
        assert_eq!(config.uring.failure_policy, FailurePolicy::Abort);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides_file() {
        let cli = CliArgs::parse_from([
            "time-server",
            "--runtime",
            "threads",
            "--slots",
            "8",
            "--population",
            "shared-accept",
        ]);
        let file: TomlConfig = toml::from_str("[uring]\nslots = 32\n").unwrap();

        let config = Config::merge(Some(cli), file);
        assert_eq!(config.runtime, RuntimeType::Threads);
        assert_eq!(config.slots, 8);
        assert_eq!(config.population, Population::SharedAccept);
        assert_eq!(config.listen, "0.0.0.0:12345");
    }

    #[test]
    fn test_validate_rejects_empty_pool() {
        let config = Config {
            slots: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_oversized_ring() {
        let config = Config {
            ring_size: u32::MAX,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = Config {
            ring_size: MAX_RING_ENTRIES,
            ..Config::default()
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.effective_ring_size(), MAX_RING_ENTRIES);
    }

    #[test]
    fn test_validate_rejects_slots_past_ring_limit() {
        let config = Config {
            slots: 40_000,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        // The largest accepted pool still fits a ring the kernel allows
        let config = Config {
            slots: MAX_SLOTS,
            ..Config::default()
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.effective_ring_size(), MAX_RING_ENTRIES);
    }

    #[test]
    fn test_effective_ring_size_is_capped() {
        let config = Config {
            slots: 40_000,
            ring_size: u32::MAX,
            ..Config::default()
        };
        assert_eq!(config.effective_ring_size(), MAX_RING_ENTRIES);
    }

    #[test]
    fn test_effective_ring_size() {
        let mut config = Config {
            slots: 64,
            ..Config::default()
        };
        // 64 slots plus the shared accept
        assert_eq!(config.effective_ring_size(), 128);

        config.ring_size = 1000;
        assert_eq!(config.effective_ring_size(), 1024);

        config.slots = 1;
        config.ring_size = 0;
        assert_eq!(config.effective_ring_size(), 2);
    }
}
