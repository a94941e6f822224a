//! CLI command definitions and dispatch.

pub mod exec;
pub mod prune;
pub mod ps;
pub mod restore;
pub mod rm;
pub mod run;

use clap::{Parser, Subcommand};
use dockerdb_common::config::DockerDbConfig;
use dockerdb_runtime::backend::ContainerRuntime;
use dockerdb_runtime::backend::docker::DockerRuntime;

/// dockerdb: disposable database containers.
#[derive(Parser, Debug)]
#[command(name = "dockerdb", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Provision an instance and keep it running until Ctrl+C.
    Run(run::RunArgs),
    /// Run a command inside a container through the exec channel.
    Exec(exec::ExecArgs),
    /// Restore a mongodump archive into a container.
    Restore(restore::RestoreArgs),
    /// Force-remove containers.
    Rm(rm::RmArgs),
    /// List containers created by dockerdb.
    Ps(ps::PsArgs),
    /// Remove containers left over from earlier runs.
    Prune(prune::PruneArgs),
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the command execution fails.
pub fn execute(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Run(args) => run::execute(args),
        Command::Exec(args) => exec::execute(args),
        Command::Restore(args) => restore::execute(args),
        Command::Rm(args) => rm::execute(args),
        Command::Ps(args) => ps::execute(args),
        Command::Prune(args) => prune::execute(args),
    }
}

/// Configuration from the environment and a daemon that answered a ping.
pub(crate) fn connect() -> anyhow::Result<(DockerDbConfig, DockerRuntime)> {
    let config = DockerDbConfig::from_env()?;
    let runtime = DockerRuntime::from_config(&config)?;
    runtime.ping().map_err(|e| {
        anyhow::anyhow!(
            "cannot reach the Docker daemon at {}: {e}",
            runtime.socket().display()
        )
    })?;
    Ok((config, runtime))
}
