//! `dockerdb exec`: Run a command inside a container.

use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;

use anyhow::Context as _;
use clap::Args;
use dockerdb_common::types::ContainerId;
use dockerdb_runtime::{exec, frames};

/// Arguments for the `exec` command.
#[derive(Args, Debug)]
pub struct ExecArgs {
    /// Container ID or name.
    pub container: String,

    /// File streamed to the command's stdin.
    #[arg(long, short)]
    pub input: Option<PathBuf>,

    /// Command to execute.
    #[arg(trailing_var_arg = true, required = true)]
    pub command: Vec<String>,
}

/// Executes the `exec` command.
///
/// Streams the input file (or nothing) through the duplex exec channel,
/// writes the combined output to stdout and exits with the remote exit
/// code.
///
/// # Errors
///
/// Returns an error if the daemon is unreachable, the input cannot be
/// opened, or the channel fails.
pub fn execute(args: ExecArgs) -> anyhow::Result<()> {
    let (config, runtime) = super::connect()?;
    let mut input: Box<dyn Read> = match &args.input {
        Some(path) => Box::new(
            File::open(path).with_context(|| format!("cannot open {}", path.display()))?,
        ),
        None => Box::new(std::io::empty()),
    };

    let output = exec::run_exec(
        &runtime,
        &ContainerId::new(args.container),
        &args.command,
        &mut input,
        &config.exec,
    )?;

    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&frames::combined(&output.output))?;
    stdout.flush()?;
    drop(stdout);

    if output.success() {
        return Ok(());
    }
    std::process::exit(i32::try_from(output.exit_code).unwrap_or(1));
}
