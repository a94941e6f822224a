//! Readiness probes.
//!
//! A probe answers one question, "can this instance accept work yet", and
//! never fails: anything short of a positive answer is "not ready".

use std::fmt;
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use dockerdb_common::config::ExecOptions;
use dockerdb_common::error::{DockerDbError, Result};

use crate::instance::Instance;

/// Per-attempt timeout of network probes.
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(1);

/// Per-attempt timeouts of exec probes, in seconds.
const EXEC_PROBE_TIMEOUT_SECS: u64 = 5;

/// Service-specific readiness check.
pub trait ReadinessProbe: Send + Sync + fmt::Debug {
    /// Returns `true` once the instance can accept work.
    fn is_ready(&self, instance: &Instance) -> bool;
}

/// HTTP GET against the instance address; any response means ready.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    port: u16,
    path: String,
    client: reqwest::blocking::Client,
}

impl HttpProbe {
    /// Probe for `http://<address>:<port>/`.
    ///
    /// # Errors
    ///
    /// Returns [`DockerDbError::Config`] if the HTTP client cannot be built.
    pub fn new(port: u16) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(ATTEMPT_TIMEOUT)
            .build()
            .map_err(|e| DockerDbError::Config {
                message: format!("building readiness HTTP client: {e}"),
            })?;
        Ok(Self {
            port,
            path: "/".into(),
            client,
        })
    }

    /// Probes `path` instead of the root.
    #[must_use]
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        let path = path.into();
        self.path = if path.starts_with('/') {
            path
        } else {
            format!("/{path}")
        };
        self
    }

    fn url(&self, address: &str) -> String {
        format!("http://{address}:{}{}", self.port, self.path)
    }
}

impl ReadinessProbe for HttpProbe {
    fn is_ready(&self, instance: &Instance) -> bool {
        let Ok(address) = instance.network_address() else {
            return false;
        };
        match self.client.get(self.url(&address)).send() {
            Ok(response) => {
                tracing::trace!(name = %instance.name(), status = %response.status(), "http probe answered");
                true
            }
            Err(e) => {
                tracing::trace!(name = %instance.name(), error = %e, "http probe not ready");
                false
            }
        }
    }
}

/// TCP connect to the instance address.
#[derive(Debug, Clone, Copy)]
pub struct TcpProbe {
    port: u16,
}

impl TcpProbe {
    /// Probe for `<address>:<port>`.
    #[must_use]
    pub const fn new(port: u16) -> Self {
        Self { port }
    }
}

impl ReadinessProbe for TcpProbe {
    fn is_ready(&self, instance: &Instance) -> bool {
        let Ok(address) = instance.network_address() else {
            return false;
        };
        let Ok(target) = format!("{address}:{}", self.port).parse::<SocketAddr>() else {
            return false;
        };
        TcpStream::connect_timeout(&target, ATTEMPT_TIMEOUT).is_ok()
    }
}

/// Runs a command inside the instance; exit code zero means ready.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecProbe {
    command: Vec<String>,
}

impl ExecProbe {
    /// Probe running `command`.
    #[must_use]
    pub const fn new(command: Vec<String>) -> Self {
        Self { command }
    }

    /// The probed command line.
    #[must_use]
    pub fn command(&self) -> &[String] {
        &self.command
    }
}

impl ReadinessProbe for ExecProbe {
    fn is_ready(&self, instance: &Instance) -> bool {
        let options = ExecOptions {
            io_timeout_secs: EXEC_PROBE_TIMEOUT_SECS,
            exit_timeout_secs: EXEC_PROBE_TIMEOUT_SECS,
            drain_timeout_secs: EXEC_PROBE_TIMEOUT_SECS,
            ..instance.exec_options().clone()
        };
        match instance.exec_with(&self.command, &mut std::io::empty(), &options) {
            Ok(output) => output.success(),
            Err(e) => {
                tracing::trace!(name = %instance.name(), error = %e, "exec probe not ready");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_probe_normalizes_path() {
        let probe = HttpProbe::new(8080).unwrap().with_path("health");
        assert_eq!(probe.url("172.18.0.2"), "http://172.18.0.2:8080/health");
        assert_eq!(HttpProbe::new(80).unwrap().url("10.0.0.1"), "http://10.0.0.1:80/");
    }
}
