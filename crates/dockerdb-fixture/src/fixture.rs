//! Scoped acquisition of prepared instances.

use std::collections::HashSet;
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex, PoisonError};

use dockerdb_common::error::Result;
use dockerdb_common::types::VersionKey;
use dockerdb_service::context::Context;
use dockerdb_service::instance::Instance;
use dockerdb_service::kind::{Mongo, ServiceKind, ServiceOptions};

use crate::options::FixtureOptions;
use crate::restore::restore_dump;
use crate::seed::{self, MongoImportSeeder, Seeder};

/// Hands out instances of one service kind, prepared according to a set of
/// [`FixtureOptions`].
pub struct Fixture {
    ctx: Arc<Context>,
    kind: Arc<dyn ServiceKind>,
    options: FixtureOptions,
    service_options: ServiceOptions,
    seeder: Arc<dyn Seeder>,
    prepared: Mutex<HashSet<VersionKey>>,
}

impl fmt::Debug for Fixture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fixture")
            .field("kind", &self.kind.name())
            .field("options", &self.options)
            .field("seeder", &self.seeder)
            .finish_non_exhaustive()
    }
}

impl Fixture {
    /// Builds a fixture for `kind`.
    ///
    /// With `reuse` enabled one pooled instance per version is created
    /// up front.
    ///
    /// # Errors
    ///
    /// Returns [`dockerdb_common::error::DockerDbError::Config`] for
    /// inconsistent options, or the creation error of a pre-warmed instance.
    pub fn new(ctx: Arc<Context>, kind: Arc<dyn ServiceKind>, options: FixtureOptions) -> Result<Self> {
        options.validate()?;
        let service_options = options.service_options();
        if options.reuse {
            ctx.ensure(&kind, &options.versions, &service_options)?;
        }
        tracing::debug!(kind = %kind.name(), versions = ?options.versions, scope = ?options.scope, "fixture ready");
        Ok(Self {
            ctx,
            kind,
            options,
            service_options,
            seeder: Arc::new(MongoImportSeeder),
            prepared: Mutex::new(HashSet::new()),
        })
    }

    /// MongoDB fixture seeded through `mongoimport`.
    ///
    /// # Errors
    ///
    /// See [`Fixture::new`].
    pub fn mongo(ctx: Arc<Context>, options: FixtureOptions) -> Result<Self> {
        Self::new(ctx, Arc::new(Mongo), options)
    }

    /// Replaces the seeder used for [`FixtureOptions::data`].
    #[must_use]
    pub fn with_seeder(mut self, seeder: Arc<dyn Seeder>) -> Self {
        self.seeder = seeder;
        self
    }

    /// Options the fixture was built with.
    #[must_use]
    pub const fn options(&self) -> &FixtureOptions {
        &self.options
    }

    /// Versions the fixture is parametrized over.
    #[must_use]
    pub fn versions(&self) -> &[VersionKey] {
        &self.options.versions
    }

    /// Acquires a prepared instance of `version`.
    ///
    /// The instance is taken from the pool or created fresh, awaited,
    /// reset if pooled, seeded and restored. With a shared scope the
    /// preparation runs only on the first acquisition of each version.
    ///
    /// # Errors
    ///
    /// Returns the first error of acquisition or preparation. A fresh
    /// instance is removed when preparation fails.
    pub fn acquire(&self, version: &VersionKey) -> Result<FixtureGuard> {
        let guard = if self.options.reuse {
            FixtureGuard {
                instance: self
                    .ctx
                    .get_or_create(&self.kind, version, &self.service_options)?,
                remove_on_drop: false,
            }
        } else {
            FixtureGuard {
                instance: Arc::new(self.ctx.create(&self.kind, version, &self.service_options)?),
                remove_on_drop: true,
            }
        };

        if !self.options.reuse || !self.options.scope.shares_preparation() {
            self.prepare(&guard)?;
            return Ok(guard);
        }

        let mut prepared = self.prepared.lock().unwrap_or_else(PoisonError::into_inner);
        if !prepared.contains(version) {
            self.prepare(&guard)?;
            let _ = prepared.insert(version.clone());
        }
        drop(prepared);
        Ok(guard)
    }

    fn prepare(&self, instance: &Instance) -> Result<()> {
        let _ = instance.wait_ready()?;
        if self.options.reuse {
            instance.reset()?;
        }
        if let Some(data) = &self.options.data {
            seed::seed(instance, data, self.seeder.as_ref())?;
        }
        if let Some(path) = &self.options.restore {
            restore_dump(instance, path)?;
        }
        Ok(())
    }

    /// Runs `body` against a prepared instance of `version`.
    ///
    /// A fresh instance is removed afterwards, also when `body` panics.
    ///
    /// # Errors
    ///
    /// Returns acquisition, preparation and removal errors.
    pub fn run<T>(&self, version: &VersionKey, body: impl FnOnce(&Instance) -> T) -> Result<T> {
        let guard = self.acquire(version)?;
        let value = body(&guard);
        guard.release()?;
        Ok(value)
    }

    /// Runs `body` once per configured version, in order.
    ///
    /// # Errors
    ///
    /// Stops at the first version that fails to acquire or release.
    pub fn for_each_version(&self, mut body: impl FnMut(&VersionKey, &Instance)) -> Result<()> {
        for version in &self.options.versions {
            self.run(version, |instance| body(version, instance))?;
        }
        Ok(())
    }
}

/// A prepared instance on loan from a [`Fixture`].
///
/// Dropping the guard removes instances that were created for this
/// acquisition alone; pooled instances stay in their pool.
#[derive(Debug)]
pub struct FixtureGuard {
    instance: Arc<Instance>,
    remove_on_drop: bool,
}

impl FixtureGuard {
    /// The shared instance handle.
    #[must_use]
    pub const fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }

    /// Ends the loan, reporting removal errors that dropping would only
    /// log.
    ///
    /// # Errors
    ///
    /// Returns the removal error of a fresh instance.
    pub fn release(mut self) -> Result<()> {
        if std::mem::take(&mut self.remove_on_drop) {
            self.instance.remove()?;
        }
        Ok(())
    }
}

impl Deref for FixtureGuard {
    type Target = Instance;

    fn deref(&self) -> &Instance {
        &self.instance
    }
}

impl Drop for FixtureGuard {
    fn drop(&mut self) {
        if !self.remove_on_drop {
            return;
        }
        if let Err(e) = self.instance.remove() {
            tracing::warn!(name = %self.instance.name(), error = %e, "failed to tear down instance");
        }
    }
}
