//! Unified error types for the dockerdb workspace.
//!
//! Every crate in the workspace returns [`DockerDbError`]. The CLI wraps it
//! in `anyhow` at the top level.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum DockerDbError {
    /// An I/O operation on a local path failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration value is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// A runtime resource (container, exec, network, image) does not exist.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Type of the missing resource.
        kind: &'static str,
        /// Identifier of the missing resource.
        id: String,
    },

    /// The container runtime rejected a request.
    #[error("container runtime returned {status}: {message}")]
    Runtime {
        /// HTTP status code returned by the runtime API.
        status: u16,
        /// Error message reported by the runtime.
        message: String,
    },

    /// Transport failure while talking to the runtime or driving an exec channel.
    #[error("channel error: {message}: {source}")]
    Channel {
        /// What the channel was doing when it failed.
        message: String,
        /// Underlying transport error.
        source: std::io::Error,
    },

    /// A channel operation did not complete in time.
    #[error("timed out after {elapsed:?} waiting for {operation}")]
    ChannelTimeout {
        /// Operation that timed out.
        operation: String,
        /// Time spent waiting.
        elapsed: Duration,
    },

    /// A dump restore exited non-zero.
    #[error("restore failed with exit code {exit_code}: {output}")]
    RestoreFailed {
        /// Exit code of the restore tool.
        exit_code: i64,
        /// Decoded combined output of the restore tool.
        output: String,
    },

    /// A command run through the exec channel exited non-zero.
    #[error("command {command:?} failed with exit code {exit_code}: {output}")]
    CommandFailed {
        /// Command line that was executed.
        command: Vec<String>,
        /// Exit code of the command.
        exit_code: i64,
        /// Decoded combined output of the command.
        output: String,
    },

    /// No single network address could be resolved for a container.
    #[error("expected exactly one attached network, found {count}")]
    AmbiguousNetwork {
        /// Number of attached networks found.
        count: usize,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl DockerDbError {
    /// Returns `true` if this error reports a missing runtime resource.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Builds a [`DockerDbError::Channel`] from an I/O error.
    #[must_use]
    pub fn channel(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Channel {
            message: message.into(),
            source,
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, DockerDbError>;
