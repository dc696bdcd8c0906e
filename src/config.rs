//! Configuration for the proxy.
//!
//! Supports command-line arguments and a configuration file in JSON or TOML.
//! CLI arguments take precedence over config file values, which take
//! precedence over the defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;
use thiserror::Error;

use crate::protocols::stratum::SessionSettings;

/// Command-line arguments for the proxy
#[derive(Parser, Debug, Default)]
#[command(name = "math-proxy")]
#[command(version)]
#[command(about = "A Stratum proxy that validates shares before relaying them", long_about = None)]
pub struct CliArgs {
    /// Path to a JSON or TOML configuration file [default: ./config.json if present]
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to listen on (e.g., 0.0.0.0:3333)
    #[arg(short, long)]
    pub listen: Option<String>,

    /// Upstream pool address
    #[arg(short, long)]
    pub upstream: Option<String>,

    /// Enable debug logging, including every frame sent and received
    #[arg(short, long)]
    pub debug: bool,

    /// Share difficulty assigned to new sessions
    #[arg(long)]
    pub difficulty: Option<f64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// Configuration file contents. Every field is optional.
#[derive(Debug, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct FileConfig {
    pub listen_addr: Option<String>,
    pub upstream_addr: Option<String>,
    pub debug: Option<bool>,
    pub difficulty: Option<f64>,
    pub extranonce2_size: Option<usize>,
    pub max_connections: Option<usize>,
    pub shutdown_grace_ms: Option<u64>,
    pub log_level: Option<String>,
}

impl FileConfig {
    /// Read a config file. Paths ending in `.toml` are parsed as TOML,
    /// anything else as JSON.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.to_path_buf(), e))?;

        if path.extension().is_some_and(|ext| ext == "toml") {
            toml::from_str(&contents).map_err(|e| ConfigError::TomlParse(path.to_path_buf(), e))
        } else {
            serde_json::from_str(&contents)
                .map_err(|e| ConfigError::JsonParse(path.to_path_buf(), e))
        }
    }
}

/// Read when no `--config` is given. A missing or broken file here only
/// produces a warning.
const DEFAULT_CONFIG_PATH: &str = "config.json";

fn default_listen() -> String {
    "0.0.0.0:3333".to_string()
}

fn default_upstream() -> String {
    "localhost:3334".to_string()
}

const DEFAULT_DIFFICULTY: f64 = 1.0;
const DEFAULT_EXTRANONCE2_SIZE: usize = 4;
const DEFAULT_MAX_CONNECTIONS: usize = 10_000;
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 5_000;

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub listen_addr: String,
    /// Reserved for relaying to the pool.
    pub upstream_addr: String,
    pub debug: bool,
    pub difficulty: f64,
    pub extranonce2_size: usize,
    pub max_connections: usize,
    /// How long an in-flight share check may run once shutdown starts.
    pub shutdown_grace: Duration,
    pub log_level: String,
    /// Problems with the default config file, logged once logging is up.
    pub warnings: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self::merge(CliArgs::default(), FileConfig::default())
    }
}

impl Config {
    /// Load configuration from CLI args and the optional config file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        Self::resolve(cli, Path::new(DEFAULT_CONFIG_PATH))
    }

    /// An explicit `--config` must load. Otherwise `default_path` is used
    /// when it exists, falling back to defaults with a warning if it can't
    /// be read.
    fn resolve(cli: CliArgs, default_path: &Path) -> Result<Self, ConfigError> {
        let mut warnings = Vec::new();
        let file = match cli.config {
            Some(ref path) => FileConfig::from_path(path)?,
            None if default_path.exists() => match FileConfig::from_path(default_path) {
                Ok(file) => file,
                Err(e) => {
                    warnings.push(format!("{e}; using defaults"));
                    FileConfig::default()
                }
            },
            None => FileConfig::default(),
        };
        let mut config = Self::merge(cli, file);
        config.warnings = warnings;
        config.validate()?;
        Ok(config)
    }

    fn merge(cli: CliArgs, file: FileConfig) -> Self {
        Config {
            listen_addr: cli
                .listen
                .or(file.listen_addr)
                .unwrap_or_else(default_listen),
            upstream_addr: cli
                .upstream
                .or(file.upstream_addr)
                .unwrap_or_else(default_upstream),
            debug: cli.debug || file.debug.unwrap_or(false),
            difficulty: cli
                .difficulty
                .or(file.difficulty)
                .unwrap_or(DEFAULT_DIFFICULTY),
            extranonce2_size: file.extranonce2_size.unwrap_or(DEFAULT_EXTRANONCE2_SIZE),
            max_connections: file.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS),
            shutdown_grace: Duration::from_millis(
                file.shutdown_grace_ms.unwrap_or(DEFAULT_SHUTDOWN_GRACE_MS),
            ),
            log_level: cli
                .log_level
                .or(file.log_level)
                .unwrap_or_else(default_log_level),
            warnings: Vec::new(),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.difficulty.is_finite() && self.difficulty > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "difficulty must be a positive number, got {}",
                self.difficulty
            )));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_connections must be at least 1".to_string(),
            ));
        }
        if !(1..=8).contains(&self.extranonce2_size) {
            return Err(ConfigError::Invalid(format!(
                "extranonce2_size must be between 1 and 8, got {}",
                self.extranonce2_size
            )));
        }
        Ok(())
    }

    /// Filter directive for the log subscriber. The debug flag wins over the
    /// configured level.
    pub fn log_filter(&self) -> &str {
        if self.debug {
            "debug"
        } else {
            &self.log_level
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            difficulty: self.difficulty,
            extranonce2_size: self.extranonce2_size,
            shutdown_grace: self.shutdown_grace,
        }
    }
}

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config file '{}': {}", .0.display(), .1)]
    JsonParse(PathBuf, #[source] serde_json::Error),

    #[error("failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
