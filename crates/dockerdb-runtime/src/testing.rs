//! In-memory container runtime for tests.
//!
//! [`FakeRuntime`] keeps containers and networks in memory and serves each
//! exec from a thread on the far end of a socket pair, so the real exec
//! channel runs against it unchanged. What an exec does is decided by an
//! [`ExecHandler`].

use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use dockerdb_common::error::{DockerDbError, Result};
use dockerdb_common::types::{ContainerId, ExecId, ExecState, NetworkId};

use crate::backend::{
    ContainerDetails, ContainerRuntime, ContainerSpec, ContainerSummary, DuplexStream,
};
use crate::frames::{self, StreamKind};

/// What a fake exec writes back and how it exits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecReply {
    /// Bytes written to stdout.
    pub output: Vec<u8>,
    /// Exit code reported once the exec finishes.
    pub exit_code: i64,
}

impl ExecReply {
    /// Successful exit with the given output.
    pub fn ok(output: impl Into<Vec<u8>>) -> Self {
        Self {
            output: output.into(),
            exit_code: 0,
        }
    }

    /// Failed exit with the given code and output.
    pub fn failed(exit_code: i64, output: impl Into<Vec<u8>>) -> Self {
        Self {
            output: output.into(),
            exit_code,
        }
    }
}

/// Decides the behavior of fake execs.
pub trait ExecHandler: Send + Sync {
    /// Whether the process closes its output before reading any input.
    fn closes_output_early(&self, _command: &[String]) -> bool {
        false
    }

    /// Produces the reply once all input has been read.
    fn handle(&self, container: &ContainerId, command: &[String], stdin: &[u8]) -> ExecReply;
}

impl<F> ExecHandler for F
where
    F: Fn(&ContainerId, &[String], &[u8]) -> ExecReply + Send + Sync,
{
    fn handle(&self, container: &ContainerId, command: &[String], stdin: &[u8]) -> ExecReply {
        self(container, command, stdin)
    }
}

/// Process that closes its output immediately, never reads input, and
/// exits with a fixed code.
#[derive(Debug, Clone, Copy)]
pub struct CloseOutputEarly {
    /// Exit code reported by the process.
    pub exit_code: i64,
}

impl ExecHandler for CloseOutputEarly {
    fn closes_output_early(&self, _command: &[String]) -> bool {
        true
    }

    fn handle(&self, _container: &ContainerId, _command: &[String], _stdin: &[u8]) -> ExecReply {
        ExecReply::failed(self.exit_code, Vec::new())
    }
}

/// One exec served by the fake runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRecord {
    /// Exec identifier.
    pub id: ExecId,
    /// Container the exec ran in.
    pub container: ContainerId,
    /// Command line.
    pub command: Vec<String>,
    /// Input received before the exec finished.
    pub stdin: Vec<u8>,
}

struct FakeExec {
    container: ContainerId,
    command: Vec<String>,
    state: Arc<Mutex<ExecState>>,
}

#[derive(Default)]
struct State {
    containers: BTreeMap<ContainerId, (ContainerSpec, ContainerDetails)>,
    networks: BTreeMap<String, NetworkId>,
    execs: HashMap<ExecId, FakeExec>,
    created: Vec<ContainerSpec>,
    removed: Vec<ContainerId>,
    next_id: u64,
}

/// In-memory [`ContainerRuntime`].
pub struct FakeRuntime {
    state: Mutex<State>,
    records: Arc<Mutex<Vec<ExecRecord>>>,
    handler: RwLock<Arc<dyn ExecHandler>>,
    hold_exit: Arc<AtomicBool>,
    remove_delay: Mutex<Duration>,
}

impl std::fmt::Debug for FakeRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeRuntime").finish_non_exhaustive()
    }
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRuntime {
    /// Runtime whose execs read all input and exit 0 without output.
    #[must_use]
    pub fn new() -> Self {
        Self::with_handler(|_: &ContainerId, _: &[String], _: &[u8]| ExecReply::ok(Vec::new()))
    }

    /// Runtime whose execs are served by `handler`.
    pub fn with_handler(handler: impl ExecHandler + 'static) -> Self {
        Self {
            state: Mutex::new(State::default()),
            records: Arc::new(Mutex::new(Vec::new())),
            handler: RwLock::new(Arc::new(handler)),
            hold_exit: Arc::new(AtomicBool::new(false)),
            remove_delay: Mutex::new(Duration::ZERO),
        }
    }

    /// Replaces the exec handler for subsequent execs.
    pub fn set_handler(&self, handler: impl ExecHandler + 'static) {
        *self.handler.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(handler);
    }

    /// Keeps finished execs reported as running.
    pub fn hold_exit(&self, hold: bool) {
        self.hold_exit.store(hold, Ordering::SeqCst);
    }

    /// Makes every container removal take at least `delay`.
    pub fn slow_removal(&self, delay: Duration) {
        *self.remove_delay.lock().unwrap_or_else(PoisonError::into_inner) = delay;
    }

    /// Specs of every container created so far, in creation order.
    pub fn created(&self) -> Vec<ContainerSpec> {
        self.lock().created.clone()
    }

    /// Identifiers of containers that still exist.
    pub fn live_containers(&self) -> Vec<ContainerId> {
        self.lock().containers.keys().cloned().collect()
    }

    /// Identifiers removed through [`ContainerRuntime::remove_container`].
    pub fn removed(&self) -> Vec<ContainerId> {
        self.lock().removed.clone()
    }

    /// Names of networks created so far.
    pub fn networks(&self) -> Vec<String> {
        self.lock().networks.keys().cloned().collect()
    }

    /// Execs served so far, in start order.
    pub fn exec_records(&self) -> Vec<ExecRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Attaches a container to one more network.
    pub fn attach_network(&self, id: &ContainerId, network: &str, address: &str) {
        if let Some((_, details)) = self.lock().containers.get_mut(id) {
            let _ = details
                .networks
                .insert(network.to_string(), address.to_string());
        }
    }

    /// Deletes a container behind dockerdb's back.
    pub fn forget_container(&self, id: &ContainerId) {
        let _ = self.lock().containers.remove(id);
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handler(&self) -> Arc<dyn ExecHandler> {
        Arc::clone(&self.handler.read().unwrap_or_else(PoisonError::into_inner))
    }
}

fn not_found(kind: &'static str, id: impl ToString) -> DockerDbError {
    DockerDbError::NotFound {
        kind,
        id: id.to_string(),
    }
}

impl ContainerRuntime for FakeRuntime {
    fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn ensure_network(&self, name: &str) -> Result<NetworkId> {
        let mut state = self.lock();
        let id = state
            .networks
            .entry(name.to_string())
            .or_insert_with(|| NetworkId::new(format!("net-{name}")))
            .clone();
        Ok(id)
    }

    fn run_container(&self, spec: &ContainerSpec) -> Result<ContainerId> {
        let mut state = self.lock();
        if state.containers.values().any(|(s, _)| s.name == spec.name) {
            return Err(DockerDbError::Runtime {
                status: 409,
                message: format!("container name {} already in use", spec.name),
            });
        }
        state.next_id += 1;
        let n = state.next_id;
        let id = ContainerId::new(format!("fake{n:012}"));
        let address = format!("172.18.{}.{}", n / 250, n % 250 + 2);

        let (ip_address, networks) = match &spec.network {
            Some(network) => (String::new(), BTreeMap::from([(network.clone(), address)])),
            None => (address.clone(), BTreeMap::from([("bridge".to_string(), address)])),
        };
        let details = ContainerDetails {
            id: id.clone(),
            name: spec.name.clone(),
            running: true,
            ip_address,
            networks,
            labels: spec.labels.clone(),
        };
        state.created.push(spec.clone());
        let _ = state.containers.insert(id.clone(), (spec.clone(), details));
        Ok(id)
    }

    fn inspect_container(&self, id: &ContainerId) -> Result<ContainerDetails> {
        let state = self.lock();
        state
            .containers
            .get(id)
            .or_else(|| state.containers.values().find(|(spec, _)| spec.name == id.as_str()))
            .map(|(_, details)| details.clone())
            .ok_or_else(|| not_found("container", id))
    }

    fn list_containers(&self, label: &str) -> Result<Vec<ContainerSummary>> {
        Ok(self
            .lock()
            .containers
            .values()
            .filter(|(spec, _)| spec.labels.contains_key(label))
            .map(|(spec, details)| ContainerSummary {
                id: details.id.clone(),
                name: spec.name.clone(),
                image: spec.image.clone(),
                state: "running".into(),
                labels: spec.labels.clone(),
            })
            .collect())
    }

    fn remove_container(&self, id: &ContainerId) -> Result<()> {
        let delay = *self.remove_delay.lock().unwrap_or_else(PoisonError::into_inner);
        std::thread::sleep(delay);
        let mut state = self.lock();
        let key = state
            .containers
            .iter()
            .find(|(key, (spec, _))| *key == id || spec.name == id.as_str())
            .map(|(key, _)| key.clone())
            .ok_or_else(|| not_found("container", id))?;
        let _ = state.containers.remove(&key);
        state.removed.push(key);
        Ok(())
    }

    fn exec_create(
        &self,
        id: &ContainerId,
        command: &[String],
        _attach_stdin: bool,
    ) -> Result<ExecId> {
        let mut state = self.lock();
        if !state.containers.contains_key(id) {
            return Err(not_found("container", id));
        }
        state.next_id += 1;
        let exec = ExecId::new(format!("exec{}", state.next_id));
        let _ = state.execs.insert(
            exec.clone(),
            FakeExec {
                container: id.clone(),
                command: command.to_vec(),
                state: Arc::new(Mutex::new(ExecState {
                    running: true,
                    exit_code: None,
                })),
            },
        );
        Ok(exec)
    }

    fn exec_start(&self, exec: &ExecId) -> Result<Box<dyn DuplexStream>> {
        let (container, command, exec_state) = {
            let state = self.lock();
            let fake = state.execs.get(exec).ok_or_else(|| not_found("exec", exec))?;
            (
                fake.container.clone(),
                fake.command.clone(),
                Arc::clone(&fake.state),
            )
        };
        let (ours, mut theirs) = UnixStream::pair()
            .map_err(|e| DockerDbError::channel("creating fake exec socket", e))?;

        let handler = self.handler();
        let records = Arc::clone(&self.records);
        let hold_exit = Arc::clone(&self.hold_exit);
        let exec = exec.clone();

        let _ = std::thread::spawn(move || {
            let mut stdin = Vec::new();
            let reply = if handler.closes_output_early(&command) {
                let _ = theirs.shutdown(Shutdown::Write);
                drop(theirs);
                handler.handle(&container, &command, &stdin)
            } else {
                let _ = theirs.read_to_end(&mut stdin);
                let reply = handler.handle(&container, &command, &stdin);
                let _ = theirs.write_all(&frames::encode(StreamKind::Stdout, &reply.output));
                drop(theirs);
                reply
            };

            records
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(ExecRecord {
                    id: exec,
                    container,
                    command,
                    stdin,
                });
            if !hold_exit.load(Ordering::SeqCst) {
                *exec_state.lock().unwrap_or_else(PoisonError::into_inner) = ExecState {
                    running: false,
                    exit_code: Some(reply.exit_code),
                };
            }
        });

        Ok(Box::new(ours))
    }

    fn exec_inspect(&self, exec: &ExecId) -> Result<ExecState> {
        let state = self.lock();
        let fake = state.execs.get(exec).ok_or_else(|| not_found("exec", exec))?;
        let current = *fake.state.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, network: Option<&str>) -> ContainerSpec {
        ContainerSpec {
            name: name.into(),
            image: "mongo:latest".into(),
            network: network.map(str::to_string),
            labels: BTreeMap::from([("dockerdb.session".to_string(), "1".to_string())]),
            ..ContainerSpec::default()
        }
    }

    #[test]
    fn containers_on_a_network_have_one_address() {
        let runtime = FakeRuntime::new();
        let id = runtime.run_container(&spec("a", Some("dockerdb"))).unwrap();
        let details = runtime.inspect_container(&id).unwrap();
        assert!(details.ip_address.is_empty());
        assert!(details.network_address().is_ok());

        runtime.attach_network(&id, "other", "10.0.0.9");
        assert!(runtime.inspect_container(&id).unwrap().network_address().is_err());
    }

    #[test]
    fn removing_twice_reports_not_found() {
        let runtime = FakeRuntime::new();
        let id = runtime.run_container(&spec("a", None)).unwrap();
        runtime.remove_container(&id).unwrap();
        assert!(runtime.remove_container(&id).unwrap_err().is_not_found());
        assert_eq!(runtime.removed(), vec![id]);
    }

    #[test]
    fn duplicate_names_conflict() {
        let runtime = FakeRuntime::new();
        let _ = runtime.run_container(&spec("a", None)).unwrap();
        assert!(runtime.run_container(&spec("a", None)).is_err());
    }

    #[test]
    fn listing_filters_by_label() {
        let runtime = FakeRuntime::new();
        let _ = runtime.run_container(&spec("a", None)).unwrap();
        let _ = runtime
            .run_container(&ContainerSpec {
                name: "b".into(),
                ..ContainerSpec::default()
            })
            .unwrap();
        let listed = runtime.list_containers("dockerdb.session").unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "a");
    }
}
