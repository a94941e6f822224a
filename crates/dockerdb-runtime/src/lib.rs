//! Container runtime access for dockerdb.
//!
//! [`backend::ContainerRuntime`] is the seam between dockerdb and the
//! container engine. [`backend::docker::DockerRuntime`] speaks the Docker
//! Engine API over its Unix socket, and [`exec`] drives the duplex exec
//! channel that streams input into a container process while capturing
//! its output.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod backend;
pub mod exec;
pub mod frames;
pub mod http;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
