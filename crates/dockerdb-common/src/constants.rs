//! System-wide constants and default values.

use std::sync::OnceLock;

/// Default Docker Engine socket path.
pub const DEFAULT_DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// Docker Engine API version prefix used for every request.
pub const DOCKER_API_VERSION: &str = "v1.41";

/// Name of the shared network every instance is attached to.
pub const DEFAULT_NETWORK: &str = "dockerdb";

/// Environment variable naming the Docker daemon endpoint.
pub const ENV_DOCKER_HOST: &str = "DOCKER_HOST";

/// Environment variable overriding the shared network name.
pub const ENV_NETWORK: &str = "DOCKERDB_NETWORK";

/// Environment variable overriding the scratch directory root.
pub const ENV_SCRATCH_ROOT: &str = "DOCKERDB_SCRATCH";

/// Environment variable overriding the readiness timeout, in seconds.
pub const ENV_READY_TIMEOUT: &str = "DOCKERDB_READY_TIMEOUT";

/// Environment variable overriding the exec exit-status timeout, in seconds.
pub const ENV_EXEC_TIMEOUT: &str = "DOCKERDB_EXEC_TIMEOUT";

/// Prefix of generated container names.
pub const NAME_PREFIX: &str = "tmp";

/// Label carrying the session (process start time) that created a container.
pub const LABEL_SESSION: &str = "dockerdb.session";

/// Label carrying the service kind of a container.
pub const LABEL_KIND: &str = "dockerdb.kind";

/// Seconds to wait for an instance to become ready.
pub const DEFAULT_READY_TIMEOUT_SECS: u64 = 30;

/// Milliseconds between readiness probe attempts.
pub const DEFAULT_READY_INTERVAL_MS: u64 = 100;

/// Bytes read from the input source per write to an exec channel.
pub const EXEC_CHUNK_SIZE: usize = 4096;

/// Buffer size of the final blocking drain of an exec channel.
pub const EXEC_DRAIN_BUFFER: usize = 4096 * 100;

/// Seconds an exec channel may go without progress before timing out.
pub const DEFAULT_EXEC_IO_TIMEOUT_SECS: u64 = 60;

/// Seconds the final drain waits for trailing output.
pub const DEFAULT_EXEC_DRAIN_TIMEOUT_SECS: u64 = 10;

/// Seconds to wait for an exec to report a terminal exit code.
pub const DEFAULT_EXEC_EXIT_TIMEOUT_SECS: u64 = 60;

/// Milliseconds between exec status polls.
pub const DEFAULT_EXEC_POLL_INTERVAL_MS: u64 = 50;

/// Total attempts made to restore a dump.
pub const RESTORE_ATTEMPTS: usize = 3;

/// Default port exposed by MongoDB.
pub const MONGO_PORT: u16 = 27017;

/// Default port exposed by HTTP services.
pub const HTTP_PORT: u16 = 80;

/// Application name used in CLI output.
pub const APP_NAME: &str = "dockerdb";

static START_TIME: OnceLock<i64> = OnceLock::new();

/// Returns the unix timestamp captured the first time this is called.
///
/// Used as the session marker in generated container names and labels.
pub fn process_start_time() -> i64 {
    *START_TIME.get_or_init(|| chrono::Utc::now().timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_time_is_stable() {
        let first = process_start_time();
        assert!(first > 0);
        assert_eq!(first, process_start_time());
    }
}
