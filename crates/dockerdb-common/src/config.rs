//! Global configuration model for dockerdb.
//!
//! Defaults come from [`crate::constants`]; [`DockerDbConfig::from_env`]
//! overlays the `DOCKER_HOST` and `DOCKERDB_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{DockerDbError, Result};

/// Tuning of the duplex exec channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecOptions {
    /// Bytes read from the input source per write.
    pub chunk_size: usize,
    /// Buffer size of the final blocking drain.
    pub drain_buffer: usize,
    /// Seconds the interleaved phase may go without progress.
    pub io_timeout_secs: u64,
    /// Seconds the final drain waits for trailing output.
    pub drain_timeout_secs: u64,
    /// Seconds to wait for a terminal exit code.
    pub exit_timeout_secs: u64,
    /// Milliseconds between exit-status polls.
    pub exit_poll_interval_ms: u64,
}

impl ExecOptions {
    /// Maximum time without progress during the interleaved phase.
    #[must_use]
    pub const fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }

    /// Read timeout of the final drain.
    #[must_use]
    pub const fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    /// Maximum time to wait for the exit code.
    #[must_use]
    pub const fn exit_timeout(&self) -> Duration {
        Duration::from_secs(self.exit_timeout_secs)
    }

    /// Delay between exit-status polls.
    #[must_use]
    pub const fn exit_poll_interval(&self) -> Duration {
        Duration::from_millis(self.exit_poll_interval_ms)
    }
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            chunk_size: constants::EXEC_CHUNK_SIZE,
            drain_buffer: constants::EXEC_DRAIN_BUFFER,
            io_timeout_secs: constants::DEFAULT_EXEC_IO_TIMEOUT_SECS,
            drain_timeout_secs: constants::DEFAULT_EXEC_DRAIN_TIMEOUT_SECS,
            exit_timeout_secs: constants::DEFAULT_EXEC_EXIT_TIMEOUT_SECS,
            exit_poll_interval_ms: constants::DEFAULT_EXEC_POLL_INTERVAL_MS,
        }
    }
}

/// Root configuration for dockerdb.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerDbConfig {
    /// Path of the Docker Engine Unix socket.
    pub docker_socket: PathBuf,
    /// Name of the shared network instances are attached to.
    pub network: String,
    /// Directory under which scratch directories are created.
    /// `None` uses the system temporary directory.
    pub scratch_root: Option<PathBuf>,
    /// Seconds to wait for an instance to become ready.
    pub ready_timeout_secs: u64,
    /// Milliseconds between readiness probe attempts.
    pub ready_interval_ms: u64,
    /// Exec channel tuning.
    pub exec: ExecOptions,
}

impl Default for DockerDbConfig {
    fn default() -> Self {
        Self {
            docker_socket: PathBuf::from(constants::DEFAULT_DOCKER_SOCKET),
            network: constants::DEFAULT_NETWORK.to_string(),
            scratch_root: None,
            ready_timeout_secs: constants::DEFAULT_READY_TIMEOUT_SECS,
            ready_interval_ms: constants::DEFAULT_READY_INTERVAL_MS,
            exec: ExecOptions::default(),
        }
    }
}

impl DockerDbConfig {
    /// Builds the configuration from defaults and process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if an environment variable holds an invalid value.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from defaults and a variable lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable holds an invalid value or the
    /// resulting configuration fails [`DockerDbConfig::validate`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(host) = lookup(constants::ENV_DOCKER_HOST) {
            config.docker_socket = parse_docker_host(&host)?;
        }
        if let Some(network) = lookup(constants::ENV_NETWORK) {
            config.network = network;
        }
        if let Some(root) = lookup(constants::ENV_SCRATCH_ROOT) {
            config.scratch_root = Some(PathBuf::from(root));
        }
        if let Some(secs) = lookup(constants::ENV_READY_TIMEOUT) {
            config.ready_timeout_secs = parse_secs(constants::ENV_READY_TIMEOUT, &secs)?;
        }
        if let Some(secs) = lookup(constants::ENV_EXEC_TIMEOUT) {
            config.exec.exit_timeout_secs = parse_secs(constants::ENV_EXEC_TIMEOUT, &secs)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks that sizes and timeouts are usable.
    ///
    /// # Errors
    ///
    /// Returns [`DockerDbError::Config`] describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.network.trim().is_empty() {
            return Err(config_error("network name must not be empty"));
        }
        if self.exec.chunk_size == 0 || self.exec.drain_buffer == 0 {
            return Err(config_error("exec buffer sizes must be non-zero"));
        }
        if self.exec.exit_timeout_secs == 0
            || self.exec.io_timeout_secs == 0
            || self.exec.drain_timeout_secs == 0
        {
            return Err(config_error("exec timeouts must be non-zero"));
        }
        if self.ready_interval_ms == 0 {
            return Err(config_error("readiness interval must be non-zero"));
        }
        Ok(())
    }

    /// Time to wait for an instance to become ready.
    #[must_use]
    pub const fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    /// Delay between readiness probe attempts.
    #[must_use]
    pub const fn ready_interval(&self) -> Duration {
        Duration::from_millis(self.ready_interval_ms)
    }

    /// Root directory for scratch directories.
    #[must_use]
    pub fn scratch_root(&self) -> PathBuf {
        self.scratch_root.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// Extracts the socket path from a `unix://` Docker host URL.
fn parse_docker_host(host: &str) -> Result<PathBuf> {
    host.strip_prefix("unix://")
        .filter(|path| !path.is_empty())
        .map(PathBuf::from)
        .ok_or_else(|| config_error(format!("unsupported DOCKER_HOST {host:?}, expected unix://<path>")))
}

fn parse_secs(key: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| config_error(format!("{key} must be a number of seconds, got {value:?}")))
}

fn config_error(message: impl Into<String>) -> DockerDbError {
    DockerDbError::Config {
        message: message.into(),
    }
}
