//! `dockerdb prune`: Remove containers left over from earlier runs.

use clap::Args;
use dockerdb_common::constants::LABEL_SESSION;
use dockerdb_runtime::backend::{ContainerRuntime, ContainerSummary};

use crate::output::{GREEN, RESET, YELLOW};

/// Arguments for the `prune` command.
#[derive(Args, Debug)]
pub struct PruneArgs {
    /// Also remove running containers, whatever session created them.
    #[arg(long)]
    pub all_sessions: bool,

    /// Only consider containers of this session.
    #[arg(long)]
    pub session: Option<String>,
}

/// Containers `args` selects for removal.
///
/// Without `--all-sessions` only stopped containers are selected, since a
/// running one may belong to a test run in progress.
pub(crate) fn select<'a>(
    containers: &'a [ContainerSummary],
    args: &PruneArgs,
) -> Vec<&'a ContainerSummary> {
    containers
        .iter()
        .filter(|c| {
            args.session
                .as_deref()
                .is_none_or(|s| c.labels.get(LABEL_SESSION).is_some_and(|l| l == s))
        })
        .filter(|c| args.all_sessions || c.state != "running")
        .collect()
}

/// Executes the `prune` command.
///
/// # Errors
///
/// Returns an error if the daemon is unreachable or listing fails.
/// Individual removal failures are reported and skipped.
pub fn execute(args: PruneArgs) -> anyhow::Result<()> {
    let (_, runtime) = super::connect()?;
    let containers = runtime.list_containers(LABEL_SESSION)?;

    let mut removed = 0;
    for container in select(&containers, &args) {
        match runtime.remove_container(&container.id) {
            Ok(()) => {
                tracing::info!(id = %container.id, name = %container.name, "pruned container");
                removed += 1;
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => eprintln!("  {YELLOW}{}: {e}{RESET}", container.name),
        }
    }
    eprintln!("  {GREEN}Pruned {removed}{RESET} container(s).");
    Ok(())
}
