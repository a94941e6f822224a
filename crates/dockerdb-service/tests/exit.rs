//! Cleanup of contexts that are never dropped.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::path::PathBuf;
use std::process::Command;
use std::sync::{Arc, LazyLock};

use dockerdb_common::config::DockerDbConfig;
use dockerdb_common::types::VersionKey;
use dockerdb_runtime::backend::ContainerRuntime;
use dockerdb_runtime::testing::FakeRuntime;
use dockerdb_service::context::Context;
use dockerdb_service::exit;
use dockerdb_service::kind::{Mongo, ServiceKind, ServiceOptions};

/// Set in the child process: scratch root of its static context.
const CHILD_SCRATCH: &str = "DOCKERDB_EXIT_TEST_SCRATCH";
/// Set in the child process: file the child writes its instance's scratch
/// directory into.
const CHILD_MARKER: &str = "DOCKERDB_EXIT_TEST_MARKER";

fn config(scratch_root: PathBuf) -> DockerDbConfig {
    DockerDbConfig {
        scratch_root: Some(scratch_root),
        ..DockerDbConfig::default()
    }
}

static STATIC_CTX: LazyLock<Context> = LazyLock::new(|| {
    let root = std::env::var_os(CHILD_SCRATCH).expect("scratch root");
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(FakeRuntime::new());
    Context::new(config(PathBuf::from(root)), runtime).expect("context")
});

/// In the child: pools an instance in a static context and returns,
/// leaving cleanup to process exit. In the parent: re-runs this test
/// binary as that child and checks that the scratch directory is gone.
#[test]
fn static_context_is_cleaned_up_at_exit() {
    if let Some(marker) = std::env::var_os(CHILD_MARKER) {
        let kind: Arc<dyn ServiceKind> = Arc::new(Mongo);
        let instance = STATIC_CTX
            .get_or_create(&kind, &VersionKey::latest(), &ServiceOptions::default())
            .unwrap();
        assert!(instance.scratch_dir().is_dir());
        std::fs::write(marker, instance.scratch_dir().to_string_lossy().as_bytes()).unwrap();
        return;
    }

    let scratch = tempfile::tempdir().unwrap();
    let markers = tempfile::tempdir().unwrap();
    let marker = markers.path().join("scratch-path");
    let status = Command::new(std::env::current_exe().unwrap())
        .args([
            "static_context_is_cleaned_up_at_exit",
            "--exact",
            "--nocapture",
            "--test-threads=1",
        ])
        .env(CHILD_SCRATCH, scratch.path())
        .env(CHILD_MARKER, &marker)
        .status()
        .unwrap();

    assert!(status.success());
    let instance_scratch = PathBuf::from(std::fs::read_to_string(&marker).unwrap());
    assert!(instance_scratch.starts_with(scratch.path()));
    assert!(!instance_scratch.exists());
}

#[test]
fn exit_hooks_drain_every_live_context() {
    let scratch = tempfile::tempdir().unwrap();
    let runtime = Arc::new(FakeRuntime::new());
    let ctx = Context::new(
        config(scratch.path().to_path_buf()),
        Arc::clone(&runtime) as Arc<dyn ContainerRuntime>,
    )
    .unwrap();
    let kind: Arc<dyn ServiceKind> = Arc::new(Mongo);
    let pooled = ctx
        .get_or_create(&kind, &VersionKey::latest(), &ServiceOptions::default())
        .unwrap();

    assert!(exit::run_exit_hooks() >= 1);

    assert!(runtime.live_containers().is_empty());
    assert!(!pooled.scratch_dir().exists());
    assert!(ctx.registry().is_empty());
}

#[test]
fn dropped_contexts_are_not_revisited() {
    let scratch = tempfile::tempdir().unwrap();
    let runtime = Arc::new(FakeRuntime::new());
    let ctx = Context::new(
        config(scratch.path().to_path_buf()),
        Arc::clone(&runtime) as Arc<dyn ContainerRuntime>,
    )
    .unwrap();
    drop(ctx);
    let removed = runtime.removed().len();

    let _ = exit::run_exit_hooks();

    assert_eq!(runtime.removed().len(), removed);
}
