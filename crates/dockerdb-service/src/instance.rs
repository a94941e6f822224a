//! A running containerized service.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use dockerdb_common::config::ExecOptions;
use dockerdb_common::error::{DockerDbError, Result};
use dockerdb_common::types::{ContainerId, VersionKey};
use dockerdb_runtime::backend::{ContainerDetails, ContainerRuntime};
use dockerdb_runtime::exec::{self, ExecOutput};
use serde_json::{Map, Value};
use tempfile::TempDir;

use crate::kind::{ServiceKind, ServiceOptions};
use crate::registry::CleanupRegistry;

/// Everything an [`Instance`] is built from.
///
/// Produced by [`crate::context::Context::create`] once the container is
/// running.
pub(crate) struct InstanceParts {
    pub(crate) runtime: Arc<dyn ContainerRuntime>,
    pub(crate) registry: Arc<CleanupRegistry>,
    pub(crate) kind: Arc<dyn ServiceKind>,
    pub(crate) id: ContainerId,
    pub(crate) name: String,
    pub(crate) sequence: u64,
    pub(crate) version: VersionKey,
    pub(crate) port: u16,
    pub(crate) options: ServiceOptions,
    pub(crate) scratch: TempDir,
    pub(crate) ready_timeout: Duration,
    pub(crate) ready_interval: Duration,
    pub(crate) exec_options: ExecOptions,
}

/// One running service container.
///
/// Removed when dropped. [`Instance::remove`] does the same explicitly and
/// reports errors; both are idempotent.
pub struct Instance {
    runtime: Arc<dyn ContainerRuntime>,
    registry: Arc<CleanupRegistry>,
    kind: Arc<dyn ServiceKind>,
    id: ContainerId,
    name: String,
    sequence: u64,
    version: VersionKey,
    port: u16,
    options: ServiceOptions,
    scratch_path: PathBuf,
    scratch: Mutex<Option<TempDir>>,
    ready_timeout: Duration,
    ready_interval: Duration,
    exec_options: ExecOptions,
    initialized: AtomicBool,
    removed: AtomicBool,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("kind", &self.kind.name())
            .field("id", &self.id)
            .field("name", &self.name)
            .field("version", &self.version)
            .field("port", &self.port)
            .field("scratch", &self.scratch_path)
            .finish_non_exhaustive()
    }
}

impl Instance {
    pub(crate) fn from_parts(parts: InstanceParts) -> Self {
        Self {
            scratch_path: parts.scratch.path().to_path_buf(),
            scratch: Mutex::new(Some(parts.scratch)),
            runtime: parts.runtime,
            registry: parts.registry,
            kind: parts.kind,
            id: parts.id,
            name: parts.name,
            sequence: parts.sequence,
            version: parts.version,
            port: parts.port,
            options: parts.options,
            ready_timeout: parts.ready_timeout,
            ready_interval: parts.ready_interval,
            exec_options: parts.exec_options,
            initialized: AtomicBool::new(false),
            removed: AtomicBool::new(false),
        }
    }

    /// Runtime-assigned container id.
    #[must_use]
    pub const fn id(&self) -> &ContainerId {
        &self.id
    }

    /// Generated container name, `tmp_{start_time}_{kind}_{counter}`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Creation sequence number within the owning context.
    #[must_use]
    pub const fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Version the instance was created from.
    #[must_use]
    pub const fn version(&self) -> &VersionKey {
        &self.version
    }

    /// The service family.
    #[must_use]
    pub fn kind(&self) -> &dyn ServiceKind {
        self.kind.as_ref()
    }

    /// Port the service listens on.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Options the instance was created with.
    #[must_use]
    pub const fn options(&self) -> &ServiceOptions {
        &self.options
    }

    /// Opaque client arguments passed through from the options.
    #[must_use]
    pub const fn client_args(&self) -> &Map<String, Value> {
        &self.options.client_args
    }

    /// Host directory bound into the container at the same path.
    #[must_use]
    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_path
    }

    /// Runtime handle the instance was created through.
    #[must_use]
    pub fn runtime(&self) -> &dyn ContainerRuntime {
        self.runtime.as_ref()
    }

    /// Exec channel tuning used by [`Instance::exec`].
    #[must_use]
    pub const fn exec_options(&self) -> &ExecOptions {
        &self.exec_options
    }

    /// Default readiness timeout.
    #[must_use]
    pub const fn ready_timeout(&self) -> Duration {
        self.ready_timeout
    }

    /// Returns `true` once the instance has been removed.
    #[must_use]
    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }

    /// Current runtime inspect data.
    ///
    /// # Errors
    ///
    /// Returns [`DockerDbError::NotFound`] if the container is gone.
    pub fn inspect(&self) -> Result<ContainerDetails> {
        self.runtime.inspect_container(&self.id)
    }

    /// Address of the instance on its network.
    ///
    /// # Errors
    ///
    /// Returns [`DockerDbError::AmbiguousNetwork`] if no single address can
    /// be resolved.
    pub fn network_address(&self) -> Result<String> {
        self.inspect()?.network_address()
    }

    /// Client connection string, e.g. `mongodb://172.18.0.2:27017/`.
    ///
    /// # Errors
    ///
    /// Returns an error if the network address cannot be resolved.
    pub fn connection_uri(&self) -> Result<String> {
        Ok(self
            .kind
            .connection_uri(&self.network_address()?, self.port))
    }

    /// Waits for readiness using the configured timeout.
    ///
    /// # Errors
    ///
    /// See [`Instance::wait_ready_for`].
    pub fn wait_ready(&self) -> Result<bool> {
        self.wait_ready_for(self.ready_timeout)
    }

    /// Polls the readiness probe until it succeeds or `timeout` elapses.
    ///
    /// Returns whether readiness was observed; a timeout is logged, not an
    /// error. After the first success the kind's one-time initialization
    /// runs.
    ///
    /// # Errors
    ///
    /// Returns an error if the probe cannot be built or the one-time
    /// initialization fails.
    pub fn wait_ready_for(&self, timeout: Duration) -> Result<bool> {
        let probe = self.kind.probe(self.port)?;
        let start = Instant::now();
        loop {
            if probe.is_ready(self) {
                tracing::debug!(name = %self.name, elapsed = ?start.elapsed(), "instance ready");
                break;
            }
            if start.elapsed() >= timeout {
                tracing::warn!(name = %self.name, timeout = ?timeout, "instance not ready before timeout");
                return Ok(false);
            }
            std::thread::sleep(self.ready_interval);
        }

        if !self.initialized.swap(true, Ordering::SeqCst) {
            if let Err(err) = self.kind.after_ready(self) {
                self.initialized.store(false, Ordering::SeqCst);
                return Err(err);
            }
        }
        Ok(true)
    }

    /// Restores the kind's clean baseline.
    ///
    /// # Errors
    ///
    /// Returns the kind's reset error.
    pub fn reset(&self) -> Result<()> {
        self.kind.reset(self)
    }

    /// Runs `command` in the container, streaming `input` to its stdin.
    ///
    /// # Errors
    ///
    /// Returns channel errors; a non-zero exit code is not an error here.
    pub fn exec(&self, command: &[String], input: &mut dyn Read) -> Result<ExecOutput> {
        self.exec_with(command, input, &self.exec_options)
    }

    /// [`Instance::exec`] with explicit channel tuning.
    ///
    /// # Errors
    ///
    /// Returns channel errors; a non-zero exit code is not an error here.
    pub fn exec_with(
        &self,
        command: &[String],
        input: &mut dyn Read,
        options: &ExecOptions,
    ) -> Result<ExecOutput> {
        exec::run_exec(self.runtime.as_ref(), &self.id, command, input, options)
    }

    /// [`Instance::exec`] that fails on a non-zero exit code.
    ///
    /// # Errors
    ///
    /// Returns [`DockerDbError::CommandFailed`] with the decoded output if
    /// the command exits non-zero.
    pub fn exec_checked(&self, command: &[String], input: &mut dyn Read) -> Result<ExecOutput> {
        let output = self.exec(command, input)?;
        if output.success() {
            return Ok(output);
        }
        let text = output.text();
        tracing::error!(name = %self.name, cmd = ?command, exit_code = output.exit_code, output = %text, "command failed");
        Err(DockerDbError::CommandFailed {
            command: command.to_vec(),
            exit_code: output.exit_code,
            output: text,
        })
    }

    /// Force-removes the container and its volumes, then deletes the
    /// scratch directory.
    ///
    /// Safe to call repeatedly and concurrently. Concurrent callers wait
    /// for the one doing the work, so a successful return always means the
    /// container and scratch directory are gone. A container that is
    /// already gone counts as removed.
    ///
    /// # Errors
    ///
    /// Returns the runtime error if the container could not be removed
    /// (a later call retries), or [`DockerDbError::Io`] if the scratch
    /// directory could not be deleted.
    pub fn remove(&self) -> Result<()> {
        // Held for the whole removal; late callers block here.
        let mut scratch = self.scratch.lock().unwrap_or_else(PoisonError::into_inner);
        if self.removed.load(Ordering::SeqCst) {
            return Ok(());
        }

        match self.runtime.remove_container(&self.id) {
            Ok(()) => tracing::info!(name = %self.name, id = %self.id, "removed instance"),
            Err(e) if e.is_not_found() => {
                tracing::debug!(name = %self.name, "instance already gone");
            }
            Err(e) => return Err(e),
        }
        self.removed.store(true, Ordering::SeqCst);
        let _ = self.registry.unregister(&self.id);

        match scratch.take().map(TempDir::close) {
            Some(Err(e)) if e.kind() != std::io::ErrorKind::NotFound => Err(DockerDbError::Io {
                path: self.scratch_path.clone(),
                source: e,
            }),
            _ => Ok(()),
        }
    }

    /// Gives up ownership of the container: it keeps running after the
    /// handle is dropped and its scratch directory stays on disk.
    ///
    /// Returns the container id.
    pub fn detach(self) -> ContainerId {
        self.removed.store(true, Ordering::SeqCst);
        let _ = self.registry.unregister(&self.id);
        if let Some(scratch) = self
            .scratch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = scratch.keep();
        }
        tracing::info!(name = %self.name, id = %self.id, "detached instance");
        self.id.clone()
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        if let Err(e) = self.remove() {
            tracing::debug!(name = %self.name, error = %e, "ignoring removal failure on drop");
        }
    }
}
