//! `dockerdb rm`: Force-remove containers.

use clap::Args;
use dockerdb_common::types::ContainerId;
use dockerdb_runtime::backend::ContainerRuntime;

use crate::output::{DIM, RESET};

/// Arguments for the `rm` command.
#[derive(Args, Debug)]
pub struct RmArgs {
    /// Container IDs or names.
    #[arg(required = true)]
    pub containers: Vec<String>,
}

/// Executes the `rm` command.
///
/// Containers that no longer exist are reported and skipped.
///
/// # Errors
///
/// Returns the first removal error other than not-found.
pub fn execute(args: RmArgs) -> anyhow::Result<()> {
    let (_, runtime) = super::connect()?;
    for container in args.containers {
        let id = ContainerId::new(container);
        match runtime.remove_container(&id) {
            Ok(()) => println!("{id}"),
            Err(e) if e.is_not_found() => eprintln!("  {DIM}{id}: already gone{RESET}"),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
