//! Process-wide state shared by every instance.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use dockerdb_common::config::DockerDbConfig;
use dockerdb_common::constants::{self, LABEL_KIND, LABEL_SESSION, NAME_PREFIX};
use dockerdb_common::error::{DockerDbError, Result};
use dockerdb_common::types::{NetworkId, VersionKey};
use dockerdb_runtime::backend::docker::DockerRuntime;
use dockerdb_runtime::backend::{BindMount, ContainerRuntime, ContainerSpec};

use crate::exit;
use crate::instance::{Instance, InstanceParts};
use crate::kind::{ServiceKind, ServiceOptions};
use crate::pool::InstancePool;
use crate::registry::{CleanupRecord, CleanupRegistry};

/// Runtime handle, shared network, naming counter, reuse pools and
/// cleanup registry for one test-run process.
///
/// Dropping the context runs [`Context::shutdown`]. A context that is never
/// dropped, such as one kept in a `static`, is cleaned up at process exit
/// instead; see [`crate::exit`].
pub struct Context {
    config: DockerDbConfig,
    runtime: Arc<dyn ContainerRuntime>,
    network: NetworkId,
    session: i64,
    counter: AtomicU64,
    pools: Mutex<HashMap<String, Arc<InstancePool<Instance>>>>,
    registry: Arc<CleanupRegistry>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("network", &self.network)
            .field("session", &self.session)
            .field("counter", &self.counter)
            .field("registered", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl Context {
    /// Connects to the Docker daemon named by the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the daemon does
    /// not answer, or the shared network cannot be created.
    pub fn from_env() -> Result<Self> {
        let config = DockerDbConfig::from_env()?;
        let runtime = DockerRuntime::from_config(&config)?;
        runtime.ping()?;
        Self::new(config, Arc::new(runtime))
    }

    /// Builds a context over an existing runtime handle, creating the
    /// shared network if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the network
    /// cannot be created.
    pub fn new(config: DockerDbConfig, runtime: Arc<dyn ContainerRuntime>) -> Result<Self> {
        config.validate()?;
        let network = runtime.ensure_network(&config.network)?;
        let session = constants::process_start_time();
        let registry = Arc::new(CleanupRegistry::new());
        exit::register(&registry, &runtime);
        tracing::debug!(network = %config.network, session, "context initialized");
        Ok(Self {
            config,
            runtime,
            network,
            session,
            counter: AtomicU64::new(0),
            pools: Mutex::new(HashMap::new()),
            registry,
        })
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &DockerDbConfig {
        &self.config
    }

    /// Shared runtime handle.
    #[must_use]
    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    /// Identifier of the shared network.
    #[must_use]
    pub const fn network(&self) -> &NetworkId {
        &self.network
    }

    /// Session marker (process start time) used in names and labels.
    #[must_use]
    pub const fn session(&self) -> i64 {
        self.session
    }

    /// Cleanup registry of live instances.
    #[must_use]
    pub fn registry(&self) -> &CleanupRegistry {
        &self.registry
    }

    /// Reserves the next sequence number and derives a container name.
    pub fn next_name(&self, kind: &str) -> (u64, String) {
        let sequence = self.counter.fetch_add(1, Ordering::SeqCst);
        let name = format!("{NAME_PREFIX}_{}_{kind}_{sequence}", self.session);
        (sequence, name)
    }

    /// Creates a new instance of `kind` at `version`.
    ///
    /// The instance gets a fresh scratch directory bound at the same path,
    /// is attached to the shared network, and is tracked by the cleanup
    /// registry until removed. Readiness is not awaited.
    ///
    /// # Errors
    ///
    /// Returns an error if the scratch directory cannot be created or the
    /// runtime fails to run the container.
    pub fn create(
        &self,
        kind: &Arc<dyn ServiceKind>,
        version: &VersionKey,
        options: &ServiceOptions,
    ) -> Result<Instance> {
        let (sequence, name) = self.next_name(kind.name());
        let root = self.config.scratch_root();
        std::fs::create_dir_all(&root).map_err(|source| DockerDbError::Io {
            path: root.clone(),
            source,
        })?;
        let scratch = tempfile::Builder::new()
            .prefix("dockerdb_")
            .suffix(&name)
            .tempdir_in(&root)
            .map_err(|source| DockerDbError::Io {
                path: root.clone(),
                source,
            })?;

        let port = options.port.unwrap_or_else(|| kind.port());
        let spec = ContainerSpec {
            name: name.clone(),
            image: kind.image(version),
            command: kind.command(options),
            env: options.env.clone(),
            network: Some(self.config.network.clone()),
            binds: vec![BindMount::same_path(
                scratch.path().to_string_lossy().into_owned(),
            )],
            labels: BTreeMap::from([
                (LABEL_SESSION.to_string(), self.session.to_string()),
                (LABEL_KIND.to_string(), kind.name().to_string()),
            ]),
            exposed_ports: vec![port],
        };

        let id = self.runtime.run_container(&spec)?;
        self.registry.register(CleanupRecord {
            container: id.clone(),
            name: name.clone(),
            scratch: scratch.path().to_path_buf(),
        });
        tracing::info!(name = %name, id = %id, image = %spec.image, "created instance");

        Ok(Instance::from_parts(InstanceParts {
            runtime: Arc::clone(&self.runtime),
            registry: Arc::clone(&self.registry),
            kind: Arc::clone(kind),
            id,
            name,
            sequence,
            version: version.clone(),
            port,
            options: options.clone(),
            scratch,
            ready_timeout: self.config.ready_timeout(),
            ready_interval: self.config.ready_interval(),
            exec_options: self.config.exec.clone(),
        }))
    }

    /// Reuse pool of one service kind.
    pub fn pool(&self, kind: &str) -> Arc<InstancePool<Instance>> {
        let mut pools = self.pools.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(pools.entry(kind.to_string()).or_default())
    }

    /// Returns the pooled instance for `version`, creating it if absent.
    ///
    /// # Errors
    ///
    /// Propagates creation errors; nothing is pooled in that case.
    pub fn get_or_create(
        &self,
        kind: &Arc<dyn ServiceKind>,
        version: &VersionKey,
        options: &ServiceOptions,
    ) -> Result<Arc<Instance>> {
        self.pool(kind.name())
            .get_or_create(version, || self.create(kind, version, options))
    }

    /// Pre-warms one pooled instance per version.
    ///
    /// # Errors
    ///
    /// Stops at the first creation error.
    pub fn ensure(
        &self,
        kind: &Arc<dyn ServiceKind>,
        versions: &[VersionKey],
        options: &ServiceOptions,
    ) -> Result<()> {
        for version in versions {
            let _ = self.get_or_create(kind, version, options)?;
        }
        Ok(())
    }

    /// Drops the pooled instance for `version` and removes it.
    ///
    /// Returns `false` if nothing was pooled.
    ///
    /// # Errors
    ///
    /// Returns the removal error of the evicted instance.
    pub fn invalidate(&self, kind: &str, version: &VersionKey) -> Result<bool> {
        match self.pool(kind).invalidate(version) {
            Some(instance) => {
                instance.remove()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Removes every pooled instance and anything left in the cleanup
    /// registry. Never fails; safe to call more than once.
    ///
    /// Returns the number of instances released.
    pub fn shutdown(&self) -> usize {
        let pools: Vec<Arc<InstancePool<Instance>>> = self
            .pools
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let mut released = 0;
        for pool in pools {
            for (version, instance) in pool.drain() {
                if let Err(e) = instance.remove() {
                    tracing::warn!(name = %instance.name(), version = %version, error = %e, "failed to remove pooled instance");
                }
                released += 1;
            }
        }
        let leftover = self.registry.drain(self.runtime.as_ref());
        if released + leftover > 0 {
            tracing::info!(pooled = released, leftover, "context shut down");
        }
        released + leftover
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}
