//! `dockerdb restore`: Restore a mongodump archive into a container.

use std::path::PathBuf;

use clap::Args;
use dockerdb_common::constants::MONGO_PORT;
use dockerdb_common::types::ContainerId;
use dockerdb_fixture::restore::restore_archive;

use crate::output::{GREEN, RESET};

/// Arguments for the `restore` command.
#[derive(Args, Debug)]
pub struct RestoreArgs {
    /// Container ID or name.
    pub container: String,

    /// Archive produced by `mongodump --archive`.
    pub dump: PathBuf,

    /// Port mongod listens on inside the container.
    #[arg(long, default_value_t = MONGO_PORT)]
    pub port: u16,
}

/// Executes the `restore` command.
///
/// # Errors
///
/// Returns the error of the last restore attempt.
pub fn execute(args: RestoreArgs) -> anyhow::Result<()> {
    let (config, runtime) = super::connect()?;
    let container = ContainerId::new(args.container);
    restore_archive(&runtime, &container, args.port, &args.dump, &config.exec)?;
    eprintln!("  {GREEN}Restored{RESET} {} into {container}", args.dump.display());
    Ok(())
}
