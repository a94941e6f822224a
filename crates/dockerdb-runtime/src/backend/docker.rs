//! Docker Engine API backend over the daemon's Unix socket.
//!
//! Regular API calls go through `bollard`, driven to completion on a
//! private current-thread `tokio` runtime so the backend stays
//! synchronous. `exec_start` is the exception: it hijacks a raw
//! `UnixStream` by hand because the exec channel polls the socket's file
//! descriptor directly.
//!
//! Methods must not be called from inside another `tokio` runtime.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::CreateExecOptions;
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::network::{CreateNetworkOptions, InspectNetworkOptions};
use bollard::{ClientVersion, Docker};
use dockerdb_common::config::DockerDbConfig;
use dockerdb_common::constants::DOCKER_API_VERSION;
use dockerdb_common::error::{DockerDbError, Result};
use dockerdb_common::types::{ContainerId, ExecId, ExecState, NetworkId};
use futures::StreamExt;
use serde_json::{Value, json};

use super::{
    ContainerDetails, ContainerRuntime, ContainerSpec, ContainerSummary, DuplexStream,
};
use crate::http;

/// API version negotiated with the daemon; matches [`DOCKER_API_VERSION`].
const CLIENT_VERSION: ClientVersion = ClientVersion {
    major_version: 1,
    minor_version: 41,
};

/// Per-request timeout. Image pulls run inside a single request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

/// Docker Engine client.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    socket: PathBuf,
    docker: Docker,
    executor: Arc<tokio::runtime::Runtime>,
}

impl DockerRuntime {
    /// Client for the daemon listening on `socket`.
    ///
    /// No connection is made until the first request.
    ///
    /// # Errors
    ///
    /// Returns [`DockerDbError::Channel`] if the async runtime or the
    /// client cannot be built.
    pub fn new(socket: impl Into<PathBuf>) -> Result<Self> {
        let socket = socket.into();
        let executor = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| DockerDbError::channel("building the docker client runtime", e))?;
        let docker = {
            let _entered = executor.enter();
            Docker::connect_with_unix(
                &socket.to_string_lossy(),
                REQUEST_TIMEOUT.as_secs(),
                &CLIENT_VERSION,
            )
            .map_err(|e| transport(&format!("connecting to docker socket {}", socket.display()), e))?
        };
        Ok(Self {
            socket,
            docker,
            executor: Arc::new(executor),
        })
    }

    /// Client for the socket named in the configuration.
    ///
    /// # Errors
    ///
    /// See [`DockerRuntime::new`].
    pub fn from_config(config: &DockerDbConfig) -> Result<Self> {
        Self::new(config.docker_socket.clone())
    }

    /// Path of the daemon socket.
    #[must_use]
    pub fn socket(&self) -> &Path {
        &self.socket
    }

    fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.executor.block_on(future)
    }

    fn pull_image(&self, image: &str) -> Result<()> {
        let (from_image, tag) = split_image(image);
        tracing::info!(image = %image, "pulling image");
        let options = CreateImageOptions {
            from_image: from_image.to_string(),
            tag: tag.to_string(),
            ..Default::default()
        };
        self.block_on(async {
            let mut progress = self.docker.create_image(Some(options), None, None);
            while let Some(update) = progress.next().await {
                match update {
                    Ok(info) => {
                        if let Some(status) = info.status {
                            tracing::trace!(image = %image, status = %status, "pull progress");
                        }
                    }
                    // Pull failures arrive inside a 200 progress stream.
                    Err(e) => return Err(api_error(e, "image", image)),
                }
            }
            Ok(())
        })
    }

    fn create_container(&self, spec: &ContainerSpec) -> std::result::Result<String, BollardError> {
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };
        let created = self
            .block_on(self.docker.create_container(Some(options), container_config(spec)))?;
        Ok(created.id)
    }

    fn start_container(&self, id: &ContainerId) -> Result<()> {
        match self.block_on(
            self.docker
                .start_container(id.as_str(), None::<StartContainerOptions<String>>),
        ) {
            Ok(()) => Ok(()),
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(api_error(e, "container", id.as_str())),
        }
    }

    fn network_id(&self, name: &str) -> std::result::Result<NetworkId, BollardError> {
        let network = self.block_on(
            self.docker
                .inspect_network(name, None::<InspectNetworkOptions<String>>),
        )?;
        Ok(NetworkId::new(network.id.unwrap_or_else(|| name.to_string())))
    }
}

/// Splits an image reference into repository and tag.
fn split_image(image: &str) -> (&str, &str) {
    match image.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => (repo, tag),
        _ => (image, "latest"),
    }
}

fn container_config(spec: &ContainerSpec) -> Config<String> {
    let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
    let binds: Vec<String> = spec.binds.iter().map(super::BindMount::to_bind_spec).collect();
    let exposed_ports: HashMap<String, HashMap<(), ()>> = spec
        .exposed_ports
        .iter()
        .map(|port| (format!("{port}/tcp"), HashMap::new()))
        .collect();

    Config {
        image: Some(spec.image.clone()),
        cmd: Some(spec.command.clone()),
        env: Some(env),
        labels: Some(spec.labels.clone().into_iter().collect()),
        exposed_ports: Some(exposed_ports),
        host_config: Some(HostConfig {
            binds: Some(binds),
            network_mode: spec.network.clone(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Maps `bollard` errors to workspace errors.
fn api_error(error: BollardError, kind: &'static str, id: &str) -> DockerDbError {
    match error {
        BollardError::DockerResponseServerError {
            status_code: 404, ..
        } => DockerDbError::NotFound {
            kind,
            id: id.to_string(),
        },
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => DockerDbError::Runtime {
            status: status_code,
            message,
        },
        BollardError::DockerStreamError { error } => DockerDbError::Runtime {
            status: 200,
            message: error,
        },
        BollardError::RequestTimeoutError => DockerDbError::ChannelTimeout {
            operation: format!("docker request for {kind} {id}"),
            elapsed: REQUEST_TIMEOUT,
        },
        other => transport(&format!("docker request for {kind} {id}"), other),
    }
}

fn transport(message: &str, error: BollardError) -> DockerDbError {
    match error {
        BollardError::IOError { err } => DockerDbError::channel(message, err),
        other => DockerDbError::channel(message, std::io::Error::other(other)),
    }
}

fn error_message(body: &[u8]) -> String {
    serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| String::from_utf8_lossy(body).trim().to_string())
}

fn labels(labels: Option<HashMap<String, String>>) -> BTreeMap<String, String> {
    labels.unwrap_or_default().into_iter().collect()
}

impl ContainerRuntime for DockerRuntime {
    fn ping(&self) -> Result<()> {
        let _ = self
            .block_on(self.docker.ping())
            .map_err(|e| api_error(e, "daemon", "_ping"))?;
        Ok(())
    }

    fn ensure_network(&self, name: &str) -> Result<NetworkId> {
        match self.network_id(name) {
            Ok(id) => return Ok(id),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => return Err(api_error(e, "network", name)),
        }

        let options = CreateNetworkOptions {
            name: name.to_string(),
            ..Default::default()
        };
        let _ = self
            .block_on(self.docker.create_network(options))
            .map_err(|e| api_error(e, "network", name))?;
        let id = self.network_id(name).map_err(|e| api_error(e, "network", name))?;
        tracing::info!(network = %name, id = %id, "created network");
        Ok(id)
    }

    fn run_container(&self, spec: &ContainerSpec) -> Result<ContainerId> {
        let created = match self.create_container(spec) {
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                self.pull_image(&spec.image)?;
                self.create_container(spec)
            }
            other => other,
        };
        let id = ContainerId::new(created.map_err(|e| api_error(e, "image", &spec.image))?);

        if let Err(e) = self.start_container(&id) {
            tracing::warn!(container = %id, name = %spec.name, error = %e, "start failed, removing container");
            if let Err(cleanup) = self.remove_container(&id) {
                tracing::warn!(container = %id, error = %cleanup, "failed to remove unstarted container");
            }
            return Err(e);
        }
        tracing::debug!(container = %id, name = %spec.name, image = %spec.image, "container started");
        Ok(id)
    }

    fn inspect_container(&self, id: &ContainerId) -> Result<ContainerDetails> {
        let inspect = self
            .block_on(
                self.docker
                    .inspect_container(id.as_str(), None::<InspectContainerOptions>),
            )
            .map_err(|e| api_error(e, "container", id.as_str()))?;
        let settings = inspect.network_settings.unwrap_or_default();
        Ok(ContainerDetails {
            id: ContainerId::new(inspect.id.unwrap_or_default()),
            name: inspect
                .name
                .unwrap_or_default()
                .trim_start_matches('/')
                .to_string(),
            running: inspect.state.and_then(|s| s.running).unwrap_or(false),
            ip_address: settings.ip_address.unwrap_or_default(),
            networks: settings
                .networks
                .unwrap_or_default()
                .into_iter()
                .map(|(name, endpoint)| (name, endpoint.ip_address.unwrap_or_default()))
                .collect(),
            labels: labels(inspect.config.and_then(|c| c.labels)),
        })
    }

    fn list_containers(&self, label: &str) -> Result<Vec<ContainerSummary>> {
        let options = ListContainersOptions {
            all: true,
            filters: HashMap::from([("label".to_string(), vec![label.to_string()])]),
            ..Default::default()
        };
        let entries = self
            .block_on(self.docker.list_containers(Some(options)))
            .map_err(|e| api_error(e, "containers", label))?;
        Ok(entries
            .into_iter()
            .map(|entry| ContainerSummary {
                id: ContainerId::new(entry.id.unwrap_or_default()),
                name: entry
                    .names
                    .unwrap_or_default()
                    .first()
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default(),
                image: entry.image.unwrap_or_default(),
                state: entry.state.map(|s| s.to_string()).unwrap_or_default(),
                labels: labels(entry.labels),
            })
            .collect())
    }

    fn remove_container(&self, id: &ContainerId) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        self.block_on(self.docker.remove_container(id.as_str(), Some(options)))
            .map_err(|e| api_error(e, "container", id.as_str()))?;
        tracing::debug!(container = %id, "container removed");
        Ok(())
    }

    fn exec_create(
        &self,
        id: &ContainerId,
        command: &[String],
        attach_stdin: bool,
    ) -> Result<ExecId> {
        let options = CreateExecOptions {
            attach_stdin: Some(attach_stdin),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            cmd: Some(command.to_vec()),
            ..Default::default()
        };
        let created = self
            .block_on(self.docker.create_exec(id.as_str(), options))
            .map_err(|e| api_error(e, "container", id.as_str()))?;
        Ok(ExecId::new(created.id))
    }

    fn exec_start(&self, exec: &ExecId) -> Result<Box<dyn DuplexStream>> {
        let path = format!("/{DOCKER_API_VERSION}/exec/{exec}/start");
        let body = json!({ "Detach": false, "Tty": false }).to_string();
        let mut stream = UnixStream::connect(&self.socket).map_err(|e| {
            DockerDbError::channel(
                format!("connecting to docker socket {}", self.socket.display()),
                e,
            )
        })?;
        tracing::trace!(path = %path, "hijacking exec connection");
        http::write_upgrade_request(&mut stream, &path, body.as_bytes())
            .map_err(|e| DockerDbError::channel(format!("sending POST {path}"), e))?;
        let head = http::read_head(&mut stream)
            .map_err(|e| DockerDbError::channel(format!("reading response to POST {path}"), e))?;

        match head.status {
            101 | 200 => Ok(Box::new(stream)),
            404 => Err(DockerDbError::NotFound {
                kind: "exec",
                id: exec.to_string(),
            }),
            status => {
                let body = http::read_error_body(&mut stream, &head);
                Err(DockerDbError::Runtime {
                    status,
                    message: error_message(&body),
                })
            }
        }
    }

    fn exec_inspect(&self, exec: &ExecId) -> Result<ExecState> {
        let inspect = self
            .block_on(self.docker.inspect_exec(exec.as_str()))
            .map_err(|e| api_error(e, "exec", exec.as_str()))?;
        Ok(ExecState {
            running: inspect.running.unwrap_or(false),
            exit_code: inspect.exit_code,
        })
    }
}
