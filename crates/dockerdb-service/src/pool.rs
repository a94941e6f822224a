//! Reuse pool mapping version keys to shared instances.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dockerdb_common::error::Result;
use dockerdb_common::types::VersionKey;

/// At most one shared value per [`VersionKey`].
///
/// The lock is held while a missing entry is created, so a factory runs at
/// most once per key even under concurrent first access. Entries are never
/// evicted on their own; they live until [`InstancePool::invalidate`] or
/// [`InstancePool::drain`].
#[derive(Debug)]
pub struct InstancePool<T> {
    entries: Mutex<HashMap<VersionKey, Arc<T>>>,
}

impl<T> Default for InstancePool<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> InstancePool<T> {
    /// Creates an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached entry for `key`, creating it with `factory` if
    /// absent.
    ///
    /// # Errors
    ///
    /// Propagates the factory's error; nothing is cached in that case.
    pub fn get_or_create(
        &self,
        key: &VersionKey,
        factory: impl FnOnce() -> Result<T>,
    ) -> Result<Arc<T>> {
        let mut entries = self.lock();
        if let Some(existing) = entries.get(key) {
            return Ok(Arc::clone(existing));
        }
        let created = Arc::new(factory()?);
        let _ = entries.insert(key.clone(), Arc::clone(&created));
        Ok(created)
    }

    /// Returns the cached entry for `key` without creating one.
    pub fn get(&self, key: &VersionKey) -> Option<Arc<T>> {
        self.lock().get(key).cloned()
    }

    /// Removes the entry for `key` and returns it.
    pub fn invalidate(&self, key: &VersionKey) -> Option<Arc<T>> {
        self.lock().remove(key)
    }

    /// Removes and returns every entry.
    pub fn drain(&self) -> Vec<(VersionKey, Arc<T>)> {
        self.lock().drain().collect()
    }

    /// Keys currently cached, sorted.
    pub fn keys(&self) -> Vec<VersionKey> {
        let mut keys: Vec<VersionKey> = self.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<VersionKey, Arc<T>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use dockerdb_common::error::DockerDbError;

    use super::*;

    #[test]
    fn factory_runs_once_per_key() {
        let pool = InstancePool::new();
        let calls = AtomicUsize::new(0);
        let key = VersionKey::latest();
        let make = || -> Result<String> {
            let _ = calls.fetch_add(1, Ordering::SeqCst);
            Ok(String::from("instance"))
        };

        let first = pool.get_or_create(&key, make).unwrap();
        let second = pool.get_or_create(&key, make).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn concurrent_first_access_creates_once() {
        let pool = Arc::new(InstancePool::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let calls = Arc::clone(&calls);
                std::thread::spawn(move || {
                    pool.get_or_create(&VersionKey::new("6.0"), || {
                        let _ = calls.fetch_add(1, Ordering::SeqCst);
                        std::thread::sleep(std::time::Duration::from_millis(20));
                        Ok(42_u32)
                    })
                    .unwrap()
                })
            })
            .collect();
        let results: Vec<Arc<u32>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| Arc::ptr_eq(r, &results[0])));
    }

    #[test]
    fn factory_errors_are_not_cached() {
        let pool: InstancePool<u32> = InstancePool::new();
        let key = VersionKey::latest();
        let err = pool
            .get_or_create(&key, || {
                Err(DockerDbError::Config {
                    message: "no".into(),
                })
            })
            .unwrap_err();
        assert!(matches!(err, DockerDbError::Config { .. }));
        assert!(pool.is_empty());
        assert_eq!(*pool.get_or_create(&key, || Ok(1)).unwrap(), 1);
    }

    #[test]
    fn invalidate_forgets_one_key() {
        let pool = InstancePool::new();
        let _ = pool.get_or_create(&VersionKey::new("5.0"), || Ok(5)).unwrap();
        let _ = pool.get_or_create(&VersionKey::new("6.0"), || Ok(6)).unwrap();

        assert_eq!(pool.invalidate(&VersionKey::new("5.0")).as_deref(), Some(&5));
        assert!(pool.invalidate(&VersionKey::new("5.0")).is_none());
        assert_eq!(pool.keys(), vec![VersionKey::new("6.0")]);
        assert_eq!(pool.drain().len(), 1);
        assert!(pool.is_empty());
    }
}
