//! `dockerdb run`: Provision an instance and keep it until Ctrl+C.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use clap::{Args, ValueEnum};
use dockerdb_common::constants::APP_NAME;
use dockerdb_common::types::VersionKey;
use dockerdb_service::context::Context;
use dockerdb_service::instance::Instance;
use dockerdb_service::kind::{HttpServer, Mongo, ServiceKind, ServiceOptions};

use crate::output::{BOLD, CYAN, DIM, GREEN, RESET, YELLOW};

/// Service families the CLI can provision.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum KindArg {
    /// MongoDB from the official image.
    Mongo,
    /// Any image serving HTTP on port 80.
    Http,
}

/// Arguments for the `run` command.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Service family to provision.
    #[arg(value_enum)]
    pub kind: KindArg,

    /// Image tag to run.
    #[arg(long, default_value = "latest")]
    pub version: String,

    /// Image repository for `http` instances.
    #[arg(long, default_value = "nginx")]
    pub image: String,

    /// Port the service listens on inside the container.
    #[arg(long)]
    pub port: Option<u16>,

    /// Replica set to initiate (mongo only).
    #[arg(long = "replicaset")]
    pub replica_set: Option<String>,

    /// Seconds to wait for readiness.
    #[arg(long, default_value_t = 30)]
    pub wait: u64,

    /// Leave the container running on exit.
    #[arg(long)]
    pub keep: bool,
}

impl RunArgs {
    fn service_kind(&self) -> Arc<dyn ServiceKind> {
        match self.kind {
            KindArg::Mongo => Arc::new(Mongo),
            KindArg::Http => Arc::new(HttpServer::new(self.image.clone())),
        }
    }

    fn service_options(&self) -> ServiceOptions {
        ServiceOptions {
            port: self.port,
            replica_set: self.replica_set.clone(),
            ..ServiceOptions::default()
        }
    }
}

/// Executes the `run` command.
///
/// # Errors
///
/// Returns an error if the daemon is unreachable, the container cannot be
/// created, or removal on exit fails.
pub fn execute(args: RunArgs) -> anyhow::Result<()> {
    let start = Instant::now();
    let ctx = Context::from_env()?;
    let kind = args.service_kind();
    let instance = ctx.create(&kind, &VersionKey::new(&args.version), &args.service_options())?;

    eprintln!();
    eprintln!("  {BOLD}{APP_NAME}{RESET} {DIM}v{}{RESET}", env!("CARGO_PKG_VERSION"));
    eprintln!();
    eprintln!("  Waiting for {BOLD}{}{RESET} to become ready...", instance.name());
    if instance.wait_ready_for(Duration::from_secs(args.wait))? {
        eprintln!(
            "  {GREEN}{BOLD}Ready{RESET} in {:.1}s",
            start.elapsed().as_secs_f64()
        );
    } else {
        eprintln!("  {YELLOW}Not ready after {}s; leaving it running anyway.{RESET}", args.wait);
    }
    report(&instance);

    wait_for_interrupt()?;

    eprintln!();
    if args.keep {
        let id = instance.detach();
        eprintln!("  Kept {BOLD}{id}{RESET}. Remove it with {BOLD}dockerdb rm {id}{RESET}.");
    } else {
        eprintln!("  Removing {}...", instance.name());
        instance.remove()?;
        eprintln!("  {GREEN}Removed.{RESET}");
    }
    Ok(())
}

fn report(instance: &Instance) {
    eprintln!();
    eprintln!(
        "    {GREEN}●{RESET} {BOLD}{}{RESET} {DIM}[{}]{RESET}",
        instance.name(),
        crate::output::short_id(instance.id().as_str())
    );
    match instance.connection_uri() {
        Ok(uri) => println!("{uri}"),
        Err(e) => eprintln!("  {YELLOW}No address:{RESET} {e}"),
    }
    eprintln!("    {CYAN}scratch{RESET} {}", instance.scratch_dir().display());
}

fn wait_for_interrupt() -> anyhow::Result<()> {
    eprintln!();
    eprintln!("  Press {BOLD}Ctrl+C{RESET} to stop...");

    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .map_err(|e| anyhow::anyhow!("failed to set Ctrl+C handler: {e}"))?;

    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(250));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use crate::commands::{Cli, Command};

    use super::*;

    fn parse(args: &[&str]) -> RunArgs {
        let cli = Cli::try_parse_from(args).unwrap();
        match cli.command {
            Command::Run(args) => args,
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn defaults_to_latest_with_a_thirty_second_wait() {
        let args = parse(&["dockerdb", "run", "mongo"]);
        assert_eq!(args.kind, KindArg::Mongo);
        assert_eq!(args.version, "latest");
        assert_eq!(args.wait, 30);
        assert!(!args.keep);
        assert_eq!(args.service_options(), ServiceOptions::default());
    }

    #[test]
    fn replica_set_and_port_reach_the_service_options() {
        let args = parse(&[
            "dockerdb", "run", "mongo", "--version", "6.0", "--port", "27018", "--replicaset", "rs0",
        ]);
        let options = args.service_options();
        assert_eq!(options.port, Some(27018));
        assert_eq!(options.replica_set.as_deref(), Some("rs0"));
        assert_eq!(args.service_kind().image(&VersionKey::new(&args.version)), "mongo:6.0");
    }

    #[test]
    fn http_uses_the_requested_image() {
        let args = parse(&["dockerdb", "run", "http", "--image", "httpd"]);
        assert_eq!(args.service_kind().image(&VersionKey::latest()), "httpd:latest");
    }
}
