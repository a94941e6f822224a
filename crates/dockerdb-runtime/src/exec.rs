//! Duplex exec channel.
//!
//! Streams a local byte source into a process running inside a container
//! while draining the process's combined output from the same socket, then
//! waits for the runtime to report the process's exit code.
//!
//! The channel is driven by a single-threaded `poll(2)` loop over the
//! non-blocking socket:
//!
//! 1. While the socket is writable, the next chunk of input is written.
//!    A zero-length read from the input ends the loop.
//! 2. While the socket is readable, output is appended to the capture
//!    buffer. A zero-length read (peer closed its output) ends the loop.
//! 3. The write half is shut down, trailing output is drained with a
//!    blocking read, and the socket is closed.
//! 4. The exec status is polled until a terminal exit code appears.
//!
//! Input left unsent when the peer closes its output is discarded.

use std::io::{ErrorKind, Read};
use std::time::Instant;

use dockerdb_common::config::ExecOptions;
use dockerdb_common::error::{DockerDbError, Result};
use dockerdb_common::types::{ContainerId, ExecId};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

use crate::backend::{ContainerRuntime, DuplexStream};
use crate::frames;

/// Upper bound of a single `poll(2)` wait, in milliseconds.
const POLL_SLICE_MS: u16 = 100;

/// Outcome of a finished exec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    /// Exit code reported by the runtime.
    pub exit_code: i64,
    /// Raw bytes captured from the exec stream, in arrival order.
    pub output: Vec<u8>,
}

impl ExecOutput {
    /// Returns `true` if the process exited with code zero.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Returns the combined output as text.
    ///
    /// Multiplexed streams are decoded first; undecodable bytes are
    /// replaced.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&frames::combined(&self.output)).into_owned()
    }
}

/// Why the interleaved phase stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpEnd {
    /// The input source reached EOF.
    InputExhausted,
    /// The peer closed its output stream.
    OutputClosed,
    /// The peer stopped accepting input (broken pipe or reset).
    InputRejected,
}

/// Summary of the interleaved phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpReport {
    /// Why the phase stopped.
    pub end: PumpEnd,
    /// Input bytes written to the peer.
    pub bytes_sent: u64,
    /// Output bytes received during the phase.
    pub bytes_received: u64,
}

/// A duplex stream attached to one exec session.
pub struct DuplexChannel {
    stream: Box<dyn DuplexStream>,
    options: ExecOptions,
    output: Vec<u8>,
}

impl std::fmt::Debug for DuplexChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuplexChannel")
            .field("options", &self.options)
            .field("captured", &self.output.len())
            .finish_non_exhaustive()
    }
}

impl DuplexChannel {
    /// Wraps an attached stream and switches it to non-blocking mode.
    ///
    /// # Errors
    ///
    /// Returns [`DockerDbError::Channel`] if the mode cannot be changed.
    pub fn new(stream: Box<dyn DuplexStream>, options: ExecOptions) -> Result<Self> {
        stream
            .set_nonblocking(true)
            .map_err(|e| DockerDbError::channel("switching exec stream to non-blocking", e))?;
        Ok(Self {
            stream,
            options,
            output: Vec::new(),
        })
    }

    /// Output captured so far.
    #[must_use]
    pub fn captured(&self) -> &[u8] {
        &self.output
    }

    /// Runs the interleaved write/read phase until input is exhausted or
    /// the peer closes its output.
    ///
    /// # Errors
    ///
    /// Returns [`DockerDbError::Channel`] on transport or input errors and
    /// [`DockerDbError::ChannelTimeout`] if neither direction makes progress
    /// within the configured I/O timeout.
    pub fn pump(&mut self, input: &mut dyn Read) -> Result<PumpReport> {
        let mut chunk = vec![0_u8; self.options.chunk_size];
        let mut incoming = vec![0_u8; self.options.chunk_size];
        let mut pending: Vec<u8> = Vec::with_capacity(self.options.chunk_size);
        let mut bytes_sent = 0_u64;
        let mut bytes_received = 0_u64;
        let mut last_progress = Instant::now();

        let end = loop {
            if last_progress.elapsed() >= self.options.io_timeout() {
                return Err(DockerDbError::ChannelTimeout {
                    operation: "exec stream progress".into(),
                    elapsed: last_progress.elapsed(),
                });
            }

            let Some(events) = self.poll_events()? else {
                continue;
            };
            if events.contains(PollFlags::POLLNVAL) {
                return Err(DockerDbError::channel(
                    "polling exec stream",
                    std::io::Error::from(Errno::EBADF),
                ));
            }

            if events.contains(PollFlags::POLLOUT) {
                if pending.is_empty() {
                    let read = read_input(input, &mut chunk)?;
                    if read == 0 {
                        break PumpEnd::InputExhausted;
                    }
                    pending.extend_from_slice(&chunk[..read]);
                }
                match self.stream.write(&pending) {
                    Ok(0) => break PumpEnd::InputRejected,
                    Ok(written) => {
                        let _ = pending.drain(..written);
                        bytes_sent += written as u64;
                        last_progress = Instant::now();
                    }
                    Err(e) if is_transient(&e) => {}
                    Err(e) if is_peer_gone(&e) => break PumpEnd::InputRejected,
                    Err(e) => return Err(DockerDbError::channel("writing exec input", e)),
                }
            }

            if events.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR) {
                match self.stream.read(&mut incoming) {
                    Ok(0) => break PumpEnd::OutputClosed,
                    Ok(read) => {
                        self.output.extend_from_slice(&incoming[..read]);
                        bytes_received += read as u64;
                        last_progress = Instant::now();
                    }
                    Err(e) if is_transient(&e) => {}
                    Err(e) if is_peer_gone(&e) => break PumpEnd::OutputClosed,
                    Err(e) => return Err(DockerDbError::channel("reading exec output", e)),
                }
            }
        };

        let report = PumpReport {
            end,
            bytes_sent,
            bytes_received,
        };
        tracing::debug!(?report, unsent = pending.len(), "exec stream interleaved phase done");
        Ok(report)
    }

    /// Signals end of input and drains the remaining output.
    ///
    /// The whole drain shares one deadline of the drain timeout; each read
    /// waits at most for what is left of it. Hitting the deadline stops the
    /// drain without failing, even if the peer is still sending.
    ///
    /// # Errors
    ///
    /// Returns [`DockerDbError::Channel`] if the stream cannot be
    /// half-closed or reading fails.
    pub fn close(&mut self) -> Result<()> {
        match self.stream.shutdown_write() {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotConnected || is_peer_gone(&e) => {}
            Err(e) => return Err(DockerDbError::channel("half-closing exec input", e)),
        }

        self.stream
            .set_nonblocking(false)
            .map_err(|e| DockerDbError::channel("switching exec stream to blocking", e))?;

        let timeout = self.options.drain_timeout();
        let deadline = Instant::now() + timeout;
        let mut buffer = vec![0_u8; self.options.drain_buffer];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracing::warn!(timeout = ?timeout, "exec output still open after drain timeout");
                break;
            }
            self.stream
                .set_read_timeout(Some(remaining))
                .map_err(|e| DockerDbError::channel("setting exec drain timeout", e))?;
            match self.stream.read(&mut buffer) {
                Ok(0) => break,
                Ok(read) => self.output.extend_from_slice(&buffer[..read]),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    tracing::warn!(timeout = ?timeout, "exec output still open after drain timeout");
                    break;
                }
                Err(e) if is_peer_gone(&e) => break,
                Err(e) => return Err(DockerDbError::channel("draining exec output", e)),
            }
        }
        Ok(())
    }

    /// Closes the stream and returns everything captured.
    #[must_use]
    pub fn into_output(self) -> Vec<u8> {
        self.output
    }

    fn poll_events(&self) -> Result<Option<PollFlags>> {
        let mut fds = [PollFd::new(
            self.stream.as_fd(),
            PollFlags::POLLIN | PollFlags::POLLOUT,
        )];
        match poll(&mut fds, PollTimeout::from(POLL_SLICE_MS)) {
            Ok(0) | Err(Errno::EINTR) => Ok(None),
            Ok(_) => Ok(fds[0].revents()),
            Err(errno) => Err(DockerDbError::channel(
                "polling exec stream",
                std::io::Error::from(errno),
            )),
        }
    }
}

/// Polls the exec status until the runtime reports a terminal exit code.
///
/// # Errors
///
/// Returns [`DockerDbError::ChannelTimeout`] if no exit code appears within
/// the exit timeout, or the runtime's error if inspection fails.
pub fn wait_for_exit(
    runtime: &dyn ContainerRuntime,
    exec: &ExecId,
    options: &ExecOptions,
) -> Result<i64> {
    let start = Instant::now();
    loop {
        let state = runtime.exec_inspect(exec)?;
        if let Some(code) = state.terminal_exit_code() {
            return Ok(code);
        }
        if start.elapsed() >= options.exit_timeout() {
            tracing::error!(exec = %exec, timeout = ?options.exit_timeout(), "exec never reported an exit code");
            return Err(DockerDbError::ChannelTimeout {
                operation: format!("exit code of exec {exec}"),
                elapsed: start.elapsed(),
            });
        }
        std::thread::sleep(options.exit_poll_interval());
    }
}

/// Runs `command` inside a container, streaming `input` to its stdin.
///
/// Creates one exec session, pumps the input while capturing output,
/// closes the stream, and returns the exit code with the captured output.
/// Transport failures are logged with the output captured so far.
///
/// # Errors
///
/// Returns [`DockerDbError::Config`] for an empty command,
/// [`DockerDbError::Channel`] on transport failure, and
/// [`DockerDbError::ChannelTimeout`] if the process never finishes.
pub fn run_exec(
    runtime: &dyn ContainerRuntime,
    container: &ContainerId,
    command: &[String],
    input: &mut dyn Read,
    options: &ExecOptions,
) -> Result<ExecOutput> {
    if command.is_empty() {
        return Err(DockerDbError::Config {
            message: "exec command is empty".into(),
        });
    }
    tracing::info!(container = %container, cmd = ?command, "exec into container");

    let exec = runtime.exec_create(container, command, true)?;
    let stream = runtime.exec_start(&exec)?;
    let mut channel = DuplexChannel::new(stream, options.clone())?;

    let streamed = channel.pump(input).and_then(|report| {
        channel.close()?;
        Ok(report)
    });
    if let Err(err) = streamed {
        tracing::error!(
            exec = %exec,
            error = %err,
            output = %String::from_utf8_lossy(&frames::combined(channel.captured())),
            "exec stream failed"
        );
        return Err(err);
    }

    let output = channel.into_output();
    let exit_code = wait_for_exit(runtime, &exec, options)?;
    tracing::info!(container = %container, exec = %exec, exit_code, bytes = output.len(), "exec finished");

    Ok(ExecOutput { exit_code, output })
}

fn read_input(input: &mut dyn Read, buffer: &mut [u8]) -> Result<usize> {
    loop {
        match input.read(buffer) {
            Ok(read) => return Ok(read),
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(DockerDbError::channel("reading exec input source", e)),
        }
    }
}

fn is_transient(err: &std::io::Error) -> bool {
    matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted)
}

fn is_peer_gone(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted
    )
}
