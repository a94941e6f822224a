//! Container runtime abstraction.

pub mod docker;

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use dockerdb_common::error::{DockerDbError, Result};
use dockerdb_common::types::{ContainerId, ExecId, ExecState, NetworkId};
use serde::{Deserialize, Serialize};

/// A host directory bound into a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindMount {
    /// Path on the host.
    pub host: String,
    /// Path inside the container.
    pub container: String,
    /// Whether the mount is read-only.
    pub read_only: bool,
}

impl BindMount {
    /// Binds `path` read-write at the same location inside the container.
    #[must_use]
    pub fn same_path(path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            host: path.clone(),
            container: path,
            read_only: false,
        }
    }

    /// Renders the mount in the `host:container:mode` bind syntax.
    #[must_use]
    pub fn to_bind_spec(&self) -> String {
        let mode = if self.read_only { "ro" } else { "rw" };
        format!("{}:{}:{mode}", self.host, self.container)
    }
}

/// Configuration for creating and starting a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Container name.
    pub name: String,
    /// Image reference, e.g. `mongo:6.0`.
    pub image: String,
    /// Command arguments passed to the image entrypoint.
    pub command: Vec<String>,
    /// Environment variables.
    pub env: Vec<(String, String)>,
    /// Network to attach the container to.
    pub network: Option<String>,
    /// Host directories bound into the container.
    pub binds: Vec<BindMount>,
    /// Labels attached to the container.
    pub labels: BTreeMap<String, String>,
    /// Ports exposed by the container.
    pub exposed_ports: Vec<u16>,
}

/// The subset of container inspect data dockerdb relies on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerDetails {
    /// Runtime-assigned identifier.
    pub id: ContainerId,
    /// Container name without the leading slash.
    pub name: String,
    /// Whether the container is running.
    pub running: bool,
    /// Address on the default network; empty when not attached to it.
    pub ip_address: String,
    /// Addresses per attached network name.
    pub networks: BTreeMap<String, String>,
    /// Labels attached to the container.
    pub labels: BTreeMap<String, String>,
}

impl ContainerDetails {
    /// Resolves the network address of the container.
    ///
    /// Prefers the default-network address. Otherwise exactly one network
    /// must be attached and its address is used.
    ///
    /// # Errors
    ///
    /// Returns [`DockerDbError::AmbiguousNetwork`] if the default address is
    /// empty and the number of attached networks is not one.
    pub fn network_address(&self) -> Result<String> {
        if !self.ip_address.is_empty() {
            return Ok(self.ip_address.clone());
        }
        let mut networks = self.networks.values();
        match (networks.next(), networks.next()) {
            (Some(address), None) => Ok(address.clone()),
            _ => Err(DockerDbError::AmbiguousNetwork {
                count: self.networks.len(),
            }),
        }
    }
}

/// One row of a container listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    /// Runtime-assigned identifier.
    pub id: ContainerId,
    /// Container name without the leading slash.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Runtime state, e.g. `running` or `exited`.
    pub state: String,
    /// Labels attached to the container.
    pub labels: BTreeMap<String, String>,
}

/// A bidirectional byte stream attached to a process inside a container.
///
/// The exec channel switches it between blocking and non-blocking mode
/// and half-closes the write side to signal end of input.
pub trait DuplexStream: Read + Write + AsFd + Send {
    /// Moves the stream into or out of non-blocking mode.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the mode cannot be changed.
    fn set_nonblocking(&self, nonblocking: bool) -> std::io::Result<()>;

    /// Sets the timeout of blocking reads.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the timeout cannot be applied.
    fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()>;

    /// Shuts down the write half, signalling end of input to the peer.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the shutdown fails.
    fn shutdown_write(&self) -> std::io::Result<()>;
}

impl DuplexStream for UnixStream {
    fn set_nonblocking(&self, nonblocking: bool) -> std::io::Result<()> {
        Self::set_nonblocking(self, nonblocking)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        Self::set_read_timeout(self, timeout)
    }

    fn shutdown_write(&self) -> std::io::Result<()> {
        self.shutdown(std::net::Shutdown::Write)
    }
}

impl DuplexStream for TcpStream {
    fn set_nonblocking(&self, nonblocking: bool) -> std::io::Result<()> {
        Self::set_nonblocking(self, nonblocking)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> std::io::Result<()> {
        Self::set_read_timeout(self, timeout)
    }

    fn shutdown_write(&self) -> std::io::Result<()> {
        self.shutdown(std::net::Shutdown::Write)
    }
}

/// Container engine operations used by dockerdb.
///
/// Implementors must report missing containers and execs as
/// [`DockerDbError::NotFound`] so that teardown paths can ignore them.
pub trait ContainerRuntime: Send + Sync {
    /// Checks that the runtime is reachable.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime does not answer.
    fn ping(&self) -> Result<()>;

    /// Returns the network with the given name, creating it if missing.
    ///
    /// # Errors
    ///
    /// Returns an error if the network cannot be inspected or created.
    fn ensure_network(&self, name: &str) -> Result<NetworkId>;

    /// Creates and starts a container, pulling its image if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the image cannot be pulled or the container
    /// cannot be created or started.
    fn run_container(&self, spec: &ContainerSpec) -> Result<ContainerId>;

    /// Returns the current state of a container.
    ///
    /// # Errors
    ///
    /// Returns [`DockerDbError::NotFound`] if the container does not exist.
    fn inspect_container(&self, id: &ContainerId) -> Result<ContainerDetails>;

    /// Lists containers (running or not) carrying the given label key.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime cannot list containers.
    fn list_containers(&self, label: &str) -> Result<Vec<ContainerSummary>>;

    /// Force-removes a container together with its anonymous volumes.
    ///
    /// # Errors
    ///
    /// Returns [`DockerDbError::NotFound`] if the container is already gone.
    fn remove_container(&self, id: &ContainerId) -> Result<()>;

    /// Creates an exec session running `command` inside a container.
    ///
    /// # Errors
    ///
    /// Returns an error if the container is missing or not running.
    fn exec_create(&self, id: &ContainerId, command: &[String], attach_stdin: bool)
    -> Result<ExecId>;

    /// Starts an exec session and returns its attached duplex stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the session cannot be started.
    fn exec_start(&self, exec: &ExecId) -> Result<Box<dyn DuplexStream>>;

    /// Returns the status record of an exec session.
    ///
    /// # Errors
    ///
    /// Returns [`DockerDbError::NotFound`] if the session does not exist.
    fn exec_inspect(&self, exec: &ExecId) -> Result<ExecState>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn details(ip: &str, networks: &[(&str, &str)]) -> ContainerDetails {
        ContainerDetails {
            ip_address: ip.into(),
            networks: networks
                .iter()
                .map(|(n, a)| ((*n).to_string(), (*a).to_string()))
                .collect(),
            ..ContainerDetails::default()
        }
    }

    #[test]
    fn default_network_address_wins() {
        let d = details("172.17.0.2", &[("dockerdb", "172.18.0.5")]);
        assert_eq!(d.network_address().unwrap(), "172.17.0.2");
    }

    #[test]
    fn single_attached_network_is_used() {
        let d = details("", &[("dockerdb", "172.18.0.5")]);
        assert_eq!(d.network_address().unwrap(), "172.18.0.5");
    }

    #[test]
    fn two_attached_networks_are_ambiguous() {
        let d = details("", &[("a", "10.0.0.2"), ("b", "10.1.0.2")]);
        let err = d.network_address().unwrap_err();
        assert!(matches!(err, DockerDbError::AmbiguousNetwork { count: 2 }));
    }

    #[test]
    fn no_network_is_ambiguous() {
        let err = details("", &[]).network_address().unwrap_err();
        assert!(matches!(err, DockerDbError::AmbiguousNetwork { count: 0 }));
    }

    #[test]
    fn bind_spec_renders_mode() {
        assert_eq!(BindMount::same_path("/tmp/x").to_bind_spec(), "/tmp/x:/tmp/x:rw");
        let ro = BindMount {
            host: "/a".into(),
            container: "/b".into(),
            read_only: true,
        };
        assert_eq!(ro.to_bind_spec(), "/a:/b:ro");
    }
}
