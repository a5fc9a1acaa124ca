//! Configuration management for the termhost daemon.
//!
//! This module provides TOML-based configuration file loading.
//! The default configuration path is `~/.config/termhost/daemon.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use termhost_protocol::DEFAULT_OUTPUT_LIMIT;
use thiserror::Error;

use crate::host::{HostOptions, DEFAULT_IDLE_TIMEOUT};
use crate::session::ShellArgsPolicy;

/// Largest accepted idle timeout (24 hours).
const MAX_IDLE_TIMEOUT_MS: u64 = 24 * 60 * 60 * 1000;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("idle_timeout_ms must be between 1 and 86400000, got {0}")]
    InvalidIdleTimeout(u64),

    #[error("output_limit must be greater than 0, got {0}")]
    InvalidOutputLimit(usize),

    #[error("default_shell not found: {0}")]
    InvalidShellPath(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the termhost daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Process-level settings.
    pub daemon: DaemonConfig,

    /// Session defaults.
    pub session: SessionConfig,

    /// Where the broker keeps session metadata.
    pub store: StoreConfig,
}

/// Process-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Socket to listen on. Derived from the executable path when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<PathBuf>,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log to this file instead of stderr.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,

    /// Milliseconds without sessions or clients before the daemon exits.
    pub idle_timeout_ms: u64,
}

/// Session defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Command used when a request names none.
    pub default_shell: String,

    /// Loop input back instead of spawning processes.
    pub fake_pty: bool,

    /// Characters of pending output kept per detached session.
    pub output_limit: usize,

    /// Extra shell arguments by executable basename; `"*"` sets the fallback.
    pub shell_args: BTreeMap<String, Vec<String>>,
}

/// Metadata store hint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct StoreConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            log_level: "info".to_string(),
            log_file: None,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT.as_millis() as u64,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_shell: default_shell(),
            fake_pty: false,
            output_limit: DEFAULT_OUTPUT_LIMIT,
            shell_args: BTreeMap::new(),
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termhost")
        .join("daemon.toml")
}

/// Returns the default shell for the current platform.
fn default_shell() -> String {
    if cfg!(windows) {
        platform_shell(true, env_value("COMSPEC"))
    } else {
        platform_shell(false, env_value("SHELL"))
    }
}

/// `COMSPEC` on Windows and `SHELL` elsewhere, as passed in `from_env`.
fn platform_shell(windows: bool, from_env: Option<String>) -> String {
    let fallback = if windows { "cmd.exe" } else { "/bin/sh" };
    from_env.unwrap_or_else(|| fallback.to_string())
}

/// Whether an environment flag value means "on".
fn is_truthy(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes")
}

/// Reads a non-empty environment variable.
fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

/// An environment variable found by [`Config::apply_env_overrides`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvOverride {
    pub variable: &'static str,
    pub value: String,
    /// False when the value could not be parsed and was ignored.
    pub applied: bool,
}

impl EnvOverride {
    fn applied(variable: &'static str, value: String) -> Self {
        Self {
            variable,
            value,
            applied: true,
        }
    }

    fn ignored(variable: &'static str, value: String) -> Self {
        Self {
            variable,
            value,
            applied: false,
        }
    }
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - TERMHOST_SOCKET: socket path
    /// - TERMHOST_LOG_LEVEL: log level (trace, debug, info, warn, error)
    /// - TERMHOST_IDLE_TIMEOUT_MS: idle shutdown delay in milliseconds
    /// - TERMHOST_FAKE_PTY: `1`, `true` or `yes` selects the fake PTY
    /// - TERMHOST_STORE_PATH: metadata store hint
    ///
    /// Runs before logging is set up (the level itself can be overridden),
    /// so nothing is logged here. The caller reports the returned list once
    /// the subscriber is installed.
    pub fn apply_env_overrides(&mut self) -> Vec<EnvOverride> {
        let mut seen = Vec::new();

        if let Some(socket) = env_value("TERMHOST_SOCKET") {
            self.daemon.socket_path = Some(PathBuf::from(&socket));
            seen.push(EnvOverride::applied("TERMHOST_SOCKET", socket));
        }

        if let Some(level) = env_value("TERMHOST_LOG_LEVEL") {
            self.daemon.log_level = level.clone();
            seen.push(EnvOverride::applied("TERMHOST_LOG_LEVEL", level));
        }

        if let Some(raw) = env_value("TERMHOST_IDLE_TIMEOUT_MS") {
            match raw.trim().parse::<u64>() {
                Ok(ms) => {
                    self.daemon.idle_timeout_ms = ms;
                    seen.push(EnvOverride::applied("TERMHOST_IDLE_TIMEOUT_MS", raw));
                }
                Err(_) => seen.push(EnvOverride::ignored("TERMHOST_IDLE_TIMEOUT_MS", raw)),
            }
        }

        if let Some(flag) = env_value("TERMHOST_FAKE_PTY") {
            self.session.fake_pty = is_truthy(&flag);
            seen.push(EnvOverride::applied("TERMHOST_FAKE_PTY", flag));
        }

        if let Some(path) = env_value("TERMHOST_STORE_PATH") {
            self.store.path = Some(path.clone());
            seen.push(EnvOverride::applied("TERMHOST_STORE_PATH", path));
        }

        seen
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let idle = self.daemon.idle_timeout_ms;
        if idle == 0 || idle > MAX_IDLE_TIMEOUT_MS {
            return Err(ConfigError::InvalidIdleTimeout(idle));
        }

        if self.session.output_limit == 0 {
            return Err(ConfigError::InvalidOutputLimit(self.session.output_limit));
        }

        // The fake PTY never executes the shell.
        if !self.session.fake_pty {
            let shell_path = Path::new(&self.session.default_shell);
            let found = if shell_path.is_absolute() {
                shell_path.exists()
            } else {
                which::which(&self.session.default_shell).is_ok()
            };
            if !found {
                return Err(ConfigError::InvalidShellPath(
                    self.session.default_shell.clone(),
                ));
            }
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// The configured socket path, or the per-installation default.
    pub fn socket_path(&self) -> PathBuf {
        self.daemon
            .socket_path
            .clone()
            .unwrap_or_else(crate::ipc::default_socket_path)
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

impl From<&Config> for HostOptions {
    fn from(config: &Config) -> Self {
        Self {
            idle_timeout: Duration::from_millis(config.daemon.idle_timeout_ms),
            default_shell: config.session.default_shell.clone(),
            shell_args: ShellArgsPolicy::with_overrides(&config.session.shell_args),
            output_limit: config.session.output_limit,
            store_path: config.store.path.clone(),
            ..HostOptions::default()
        }
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
