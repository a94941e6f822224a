//! Containerized service instances for dockerdb.
//!
//! A [`context::Context`] owns everything process-wide: the runtime
//! handle, the shared network, the naming counter, one
//! [`pool::InstancePool`] per service kind and the
//! [`registry::CleanupRegistry`] scanned at shutdown and, through [`exit`],
//! at process exit. Instances are created
//! through it from a [`kind::ServiceKind`] and probed with a
//! [`probe::ReadinessProbe`].

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod context;
pub mod exit;
pub mod instance;
pub mod kind;
pub mod pool;
pub mod probe;
pub mod registry;
