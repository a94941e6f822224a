//! Cleanup at process exit.
//!
//! Dropping a [`Context`](crate::context::Context) cleans up after it, but
//! a context kept in a `static` is never dropped:
//!
//! ```ignore
//! static CTX: LazyLock<Context> = LazyLock::new(|| Context::from_env().expect("docker"));
//! ```
//!
//! Every context therefore registers its cleanup registry here. The first
//! registration installs a `libc::atexit` handler that drains every
//! registry still alive when the process exits normally, including when
//! the test harness returns from `main`. [`install_interrupt_handler`]
//! extends this to Ctrl+C.
//!
//! By the time `atexit` handlers run, the exiting thread's thread-locals
//! are gone. The drain itself runs on a dedicated thread started at
//! install time; the handler only wakes it and waits.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, Once, PoisonError, Weak};
use std::time::Duration;

use dockerdb_common::error::{DockerDbError, Result};
use dockerdb_runtime::backend::ContainerRuntime;

use crate::registry::CleanupRegistry;

/// Longest the exit handler waits for the drain to finish.
const EXIT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Exit code used after an interrupt, as a shell reports SIGINT.
const INTERRUPTED_EXIT_CODE: i32 = 130;

struct ExitHook {
    registry: Weak<CleanupRegistry>,
    runtime: Weak<dyn ContainerRuntime>,
}

impl ExitHook {
    fn is_live(&self) -> bool {
        self.registry.strong_count() > 0 && self.runtime.strong_count() > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Requested,
    Done,
}

static HOOKS: Mutex<Vec<ExitHook>> = Mutex::new(Vec::new());
static PHASE: Mutex<Phase> = Mutex::new(Phase::Idle);
static SIGNAL: Condvar = Condvar::new();
static INSTALL: Once = Once::new();
static DRAINER: Mutex<bool> = Mutex::new(false);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Tracks a context's registry until the process exits or the context is
/// gone. Installs the exit handler on first use.
pub(crate) fn register(registry: &Arc<CleanupRegistry>, runtime: &Arc<dyn ContainerRuntime>) {
    {
        let mut hooks = lock(&HOOKS);
        hooks.retain(ExitHook::is_live);
        hooks.push(ExitHook {
            registry: Arc::downgrade(registry),
            runtime: Arc::downgrade(runtime),
        });
    }
    INSTALL.call_once(install);
}

fn install() {
    match std::thread::Builder::new()
        .name("dockerdb-exit".into())
        .spawn(drain_on_request)
    {
        Ok(_) => *lock(&DRAINER) = true,
        Err(e) => tracing::warn!(error = %e, "no exit cleanup thread, draining inline at exit"),
    }

    // SAFETY: `at_exit` is a plain `extern "C" fn()` that never unwinds
    // across the FFI boundary, and registering it has no other
    // preconditions.
    #[allow(unsafe_code)]
    let status = unsafe { libc::atexit(at_exit) };
    if status != 0 {
        tracing::warn!(status, "failed to register exit cleanup");
    }
}

fn drain_on_request() {
    let mut phase = lock(&PHASE);
    while *phase != Phase::Requested {
        phase = SIGNAL.wait(phase).unwrap_or_else(PoisonError::into_inner);
    }
    drop(phase);

    let released = run_exit_hooks();
    if released > 0 {
        tracing::info!(released, "cleaned up at exit");
    }
    *lock(&PHASE) = Phase::Done;
    SIGNAL.notify_all();
}

extern "C" fn at_exit() {
    let _ = std::panic::catch_unwind(|| {
        if !*lock(&DRAINER) {
            let _ = run_exit_hooks();
            return;
        }
        let mut phase = lock(&PHASE);
        *phase = Phase::Requested;
        SIGNAL.notify_all();
        let _ = SIGNAL
            .wait_timeout_while(phase, EXIT_DRAIN_TIMEOUT, |phase| *phase != Phase::Done)
            .unwrap_or_else(PoisonError::into_inner);
    });
}

/// Drains the cleanup registry of every context still alive: tracked
/// containers are force-removed and their scratch directories deleted.
///
/// Runs automatically at normal process exit. Safe to call at any time;
/// contexts keep working afterwards and only instances created later are
/// tracked again.
///
/// Returns the number of instances cleaned up.
pub fn run_exit_hooks() -> usize {
    let live: Vec<(Arc<CleanupRegistry>, Arc<dyn ContainerRuntime>)> = lock(&HOOKS)
        .iter()
        .filter_map(|hook| Some((hook.registry.upgrade()?, hook.runtime.upgrade()?)))
        .collect();
    live.iter()
        .map(|(registry, runtime)| registry.drain(runtime.as_ref()))
        .sum()
}

/// Installs a Ctrl+C handler that runs [`run_exit_hooks`] and exits with
/// status 130.
///
/// Opt-in: a process can have only one such handler, and binaries that
/// handle interrupts themselves should keep theirs.
///
/// # Errors
///
/// Returns [`DockerDbError::Config`] if a handler is already installed.
pub fn install_interrupt_handler() -> Result<()> {
    ctrlc::set_handler(|| {
        let released = run_exit_hooks();
        tracing::info!(released, "interrupted, cleaned up");
        std::process::exit(INTERRUPTED_EXIT_CODE);
    })
    .map_err(|e| DockerDbError::Config {
        message: format!("cannot install interrupt handler: {e}"),
    })
}
