//! Test fixtures backed by dockerdb instances.
//!
//! A [`fixture::Fixture`] turns a service kind and a set of
//! [`options::FixtureOptions`] into ready-to-use instances: it acquires one
//! (pooled or fresh), waits for readiness, resets pooled state, seeds data,
//! restores a dump, and hands out a [`fixture::FixtureGuard`] that tears
//! the instance down when dropped.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use dockerdb_fixture::fixture::Fixture;
//! use dockerdb_fixture::options::{FixtureOptions, SeedData};
//! use dockerdb_service::context::Context;
//! use serde_json::json;
//!
//! # fn main() -> dockerdb_common::error::Result<()> {
//! let ctx = Arc::new(Context::from_env()?);
//! let data = SeedData::new().with("db1", "users", [json!({"name": "a"})]);
//! let fixture = Fixture::mongo(ctx, FixtureOptions::default().data(data))?;
//! fixture.for_each_version(|version, mongo| {
//!     println!("{version}: {}", mongo.name());
//! })?;
//! # Ok(())
//! # }
//! ```

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod fixture;
pub mod options;
pub mod restore;
pub mod seed;
