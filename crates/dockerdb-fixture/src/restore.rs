//! Restoring dump archives into an instance.

use std::fs::File;
use std::path::Path;

use dockerdb_common::config::ExecOptions;
use dockerdb_common::constants::RESTORE_ATTEMPTS;
use dockerdb_common::error::{DockerDbError, Result};
use dockerdb_common::types::ContainerId;
use dockerdb_runtime::backend::ContainerRuntime;
use dockerdb_runtime::exec;
use dockerdb_service::instance::Instance;

/// Runs `attempt` up to `attempts` times, returning the first success.
///
/// The attempt number (starting at 1) is passed in. Failures before the
/// last are logged as warnings; the last failure is returned.
///
/// # Errors
///
/// Returns the error of the final attempt.
pub fn with_retries<T>(
    attempts: usize,
    operation: &str,
    mut attempt: impl FnMut(usize) -> Result<T>,
) -> Result<T> {
    let attempts = attempts.max(1);
    let mut number = 1;
    loop {
        match attempt(number) {
            Ok(value) => return Ok(value),
            Err(e) if number < attempts => {
                tracing::warn!(operation, attempt = number, attempts, error = %e, "attempt failed, retrying");
            }
            Err(e) => {
                tracing::error!(operation, attempts, error = %e, "giving up");
                return Err(e);
            }
        }
        number += 1;
    }
}

fn restore_command(port: u16) -> Vec<String> {
    vec![
        "mongorestore".into(),
        "--port".into(),
        port.to_string(),
        "--archive".into(),
    ]
}

/// Streams the archive at `path` into `mongorestore` inside `container`
/// once.
///
/// # Errors
///
/// Returns [`DockerDbError::Io`] if the archive cannot be opened and
/// [`DockerDbError::RestoreFailed`] if `mongorestore` exits non-zero.
pub fn restore_once(
    runtime: &dyn ContainerRuntime,
    container: &ContainerId,
    port: u16,
    path: &Path,
    options: &ExecOptions,
) -> Result<()> {
    let mut archive = File::open(path).map_err(|source| DockerDbError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let output = exec::run_exec(runtime, container, &restore_command(port), &mut archive, options)?;
    if output.success() {
        tracing::info!(container = %container, archive = %path.display(), "restored dump");
        return Ok(());
    }
    let text = output.text();
    tracing::error!(container = %container, exit_code = output.exit_code, output = %text, "mongorestore failed");
    Err(DockerDbError::RestoreFailed {
        exit_code: output.exit_code,
        output: text,
    })
}

/// [`restore_once`], retried a bounded number of times.
///
/// # Errors
///
/// Returns the error of the last attempt.
pub fn restore_archive(
    runtime: &dyn ContainerRuntime,
    container: &ContainerId,
    port: u16,
    path: &Path,
    options: &ExecOptions,
) -> Result<()> {
    with_retries(RESTORE_ATTEMPTS, "restore", |_| {
        restore_once(runtime, container, port, path, options)
    })
}

/// Restores the archive at `path` into `instance`.
///
/// # Errors
///
/// Returns the error of the last attempt.
pub fn restore_dump(instance: &Instance, path: &Path) -> Result<()> {
    restore_archive(
        instance.runtime(),
        instance.id(),
        instance.port(),
        path,
        instance.exec_options(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(n: usize) -> DockerDbError {
        DockerDbError::RestoreFailed {
            exit_code: 1,
            output: format!("attempt {n}"),
        }
    }

    #[test]
    fn first_success_stops_retrying() {
        let mut calls = 0;
        let value = with_retries(3, "op", |n| {
            calls += 1;
            if n < 2 { Err(failure(n)) } else { Ok(n) }
        })
        .unwrap();
        assert_eq!(value, 2);
        assert_eq!(calls, 2);
    }

    #[test]
    fn exhaustion_returns_the_last_error() {
        let mut calls = 0;
        let err = with_retries::<()>(3, "op", |n| {
            calls += 1;
            Err(failure(n))
        })
        .unwrap_err();
        assert_eq!(calls, 3);
        assert!(matches!(err, DockerDbError::RestoreFailed { ref output, .. } if output == "attempt 3"));
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        let mut calls = 0;
        let _ = with_retries(0, "op", |_| {
            calls += 1;
            Ok(())
        });
        assert_eq!(calls, 1);
    }

    #[test]
    fn restore_streams_an_archive() {
        assert_eq!(
            restore_command(27018),
            vec!["mongorestore", "--port", "27018", "--archive"]
        );
    }
}
