//! `dockerdb ps`: List containers created by dockerdb.

use clap::Args;
use dockerdb_common::constants::{LABEL_KIND, LABEL_SESSION};
use dockerdb_runtime::backend::{ContainerRuntime, ContainerSummary};

use crate::output::{short_id, table};

/// Arguments for the `ps` command.
#[derive(Args, Debug)]
pub struct PsArgs {
    /// Only show containers of this session.
    #[arg(long)]
    pub session: Option<String>,
}

fn label<'a>(container: &'a ContainerSummary, key: &str) -> &'a str {
    container.labels.get(key).map_or("-", String::as_str)
}

/// Table rows for `containers`, filtered by session.
pub(crate) fn rows(containers: &[ContainerSummary], session: Option<&str>) -> Vec<Vec<String>> {
    containers
        .iter()
        .filter(|c| session.is_none_or(|s| label(c, LABEL_SESSION) == s))
        .map(|c| {
            vec![
                short_id(c.id.as_str()).to_string(),
                c.name.clone(),
                label(c, LABEL_KIND).to_string(),
                label(c, LABEL_SESSION).to_string(),
                c.state.clone(),
                c.image.clone(),
            ]
        })
        .collect()
}

/// Executes the `ps` command.
///
/// # Errors
///
/// Returns an error if the daemon is unreachable.
pub fn execute(args: PsArgs) -> anyhow::Result<()> {
    let (_, runtime) = super::connect()?;
    let containers = runtime.list_containers(LABEL_SESSION)?;
    let rows = rows(&containers, args.session.as_deref());
    if rows.is_empty() {
        println!("No dockerdb containers found.");
        return Ok(());
    }
    println!(
        "{}",
        table(&["CONTAINER ID", "NAME", "KIND", "SESSION", "STATE", "IMAGE"], &rows)
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use dockerdb_common::types::ContainerId;

    use super::*;

    fn summary(id: &str, session: &str, state: &str) -> ContainerSummary {
        ContainerSummary {
            id: ContainerId::new(id),
            name: format!("tmp_{session}_mongo_0"),
            image: "mongo:latest".into(),
            state: state.into(),
            labels: BTreeMap::from([
                (LABEL_SESSION.to_string(), session.to_string()),
                (LABEL_KIND.to_string(), "mongo".to_string()),
            ]),
        }
    }

    #[test]
    fn rows_show_labels_and_short_ids() {
        let rows = rows(&[summary("0123456789abcdef", "17", "running")], None);
        assert_eq!(
            rows,
            vec![vec![
                "0123456789ab".to_string(),
                "tmp_17_mongo_0".to_string(),
                "mongo".to_string(),
                "17".to_string(),
                "running".to_string(),
                "mongo:latest".to_string(),
            ]]
        );
    }

    #[test]
    fn session_filter_drops_other_runs() {
        let containers = [summary("a", "1", "running"), summary("b", "2", "exited")];
        let rows = rows(&containers, Some("2"));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][0], "b");
    }
}
