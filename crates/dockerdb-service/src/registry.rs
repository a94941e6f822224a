//! Shutdown-time cleanup of instances that were never released.
//!
//! Records hold only the container id and scratch path, never the
//! instance itself, so registering an instance does not keep it alive.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

use dockerdb_common::types::ContainerId;
use dockerdb_runtime::backend::ContainerRuntime;

/// Back-reference to a live instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupRecord {
    /// Container to force-remove.
    pub container: ContainerId,
    /// Container name, for logging.
    pub name: String,
    /// Scratch directory to delete.
    pub scratch: PathBuf,
}

/// Set of instances still alive, keyed by container id.
#[derive(Debug, Default)]
pub struct CleanupRegistry {
    records: Mutex<BTreeMap<ContainerId, CleanupRecord>>,
}

impl CleanupRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracks an instance until it is released.
    pub fn register(&self, record: CleanupRecord) {
        let _ = self.lock().insert(record.container.clone(), record);
    }

    /// Stops tracking an instance. Returns `false` if it was not tracked.
    pub fn unregister(&self, container: &ContainerId) -> bool {
        self.lock().remove(container).is_some()
    }

    /// Returns `true` if the container is still tracked.
    pub fn contains(&self, container: &ContainerId) -> bool {
        self.lock().contains_key(container)
    }

    /// Number of tracked instances.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` if nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Force-removes every tracked container and scratch directory.
    ///
    /// Never fails: errors are logged and skipped. Returns the number of
    /// records processed.
    pub fn drain(&self, runtime: &dyn ContainerRuntime) -> usize {
        let records = std::mem::take(&mut *self.lock());
        let count = records.len();
        for record in records.into_values() {
            match runtime.remove_container(&record.container) {
                Ok(()) => tracing::info!(name = %record.name, "removed leftover container"),
                Err(e) if e.is_not_found() => {}
                Err(e) => tracing::warn!(name = %record.name, error = %e, "failed to remove leftover container"),
            }
            match std::fs::remove_dir_all(&record.scratch) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(path = %record.scratch.display(), error = %e, "failed to remove scratch directory"),
            }
        }
        count
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<ContainerId, CleanupRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use dockerdb_runtime::backend::ContainerSpec;
    use dockerdb_runtime::testing::FakeRuntime;

    use super::*;

    #[test]
    fn drain_removes_containers_and_scratch() {
        let runtime = FakeRuntime::new();
        let id = runtime
            .run_container(&ContainerSpec {
                name: "tmp_1_mongo_0".into(),
                ..ContainerSpec::default()
            })
            .unwrap();
        let scratch_dir = tempfile::tempdir().unwrap();
        let scratch = scratch_dir.path().to_path_buf();
        let registry = CleanupRegistry::new();
        registry.register(CleanupRecord {
            container: id.clone(),
            name: "tmp_1_mongo_0".into(),
            scratch: scratch.clone(),
        });

        assert_eq!(registry.drain(&runtime), 1);
        assert!(registry.is_empty());
        assert!(!scratch.exists());
        assert_eq!(runtime.removed(), vec![id]);
    }

    #[test]
    fn drain_skips_already_gone_resources() {
        let runtime = FakeRuntime::new();
        let registry = CleanupRegistry::new();
        registry.register(CleanupRecord {
            container: ContainerId::new("gone"),
            name: "gone".into(),
            scratch: PathBuf::from("/nonexistent/dockerdb-scratch"),
        });
        assert_eq!(registry.drain(&runtime), 1);
        assert_eq!(registry.drain(&runtime), 0);
    }

    #[test]
    fn unregister_reports_whether_tracked() {
        let registry = CleanupRegistry::new();
        let id = ContainerId::new("c1");
        registry.register(CleanupRecord {
            container: id.clone(),
            name: "c1".into(),
            scratch: PathBuf::from("/tmp/x"),
        });
        assert!(registry.contains(&id));
        assert!(registry.unregister(&id));
        assert!(!registry.unregister(&id));
    }
}
