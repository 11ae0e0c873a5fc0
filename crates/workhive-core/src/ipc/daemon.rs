//! Host-side handle to one daemon process.

use std::fmt;
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

use serde_json::Value;

use crate::config::ProcessOptions;
use crate::error::{Error, Result};
use crate::work::{Failure, Outcome, WorkItem};

use super::protocol::{DaemonCommand, DaemonResponse, read_message, write_message};

/// Environment variable overriding daemon discovery.
pub const DAEMON_PATH_ENV: &str = "WORKHIVE_DAEMON_PATH";

/// Set in every daemon's environment so a host binary can tell it was
/// launched as a daemon.
pub const DAEMON_MARKER_ENV: &str = "WORKHIVE_DAEMON";

const DAEMON_BINARY: &str = if cfg!(windows) {
    "workhive-worker.exe"
} else {
    "workhive-worker"
};

static NEXT_DAEMON_ID: AtomicU64 = AtomicU64::new(1);

/// Pool-local identifier of a daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DaemonId(u64);

impl fmt::Display for DaemonId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "daemon_{}", self.0)
    }
}

/// Handle to a daemon process.
///
/// Provides methods to run work items and terminate the process.
pub struct DaemonHandle {
    id: DaemonId,
    child: Child,
    stdin: BufWriter<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    /// Pid reported by the daemon in its ready message.
    pid: u32,
    /// Set once the channel broke or the process was terminated.
    broken: bool,
}

impl DaemonHandle {
    /// Start a daemon process and wait up to `startup_timeout` for it to
    /// report ready.
    pub fn spawn(options: &ProcessOptions, startup_timeout: Duration) -> Result<Self> {
        let program = match &options.program {
            Some(program) => program.clone(),
            None => find_daemon_binary()?,
        };

        let mut command = Command::new(&program);
        command
            .args(&options.args)
            .envs(&options.env)
            .env(DAEMON_MARKER_ENV, "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit()); // Daemon logs go to our stderr
        if let Some(dir) = &options.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| {
            Error::Infrastructure(format!(
                "Failed to spawn daemon process '{}': {}",
                program.display(),
                e
            ))
        })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            abort_child(&mut child);
            return Err(Error::Infrastructure(
                "Failed to get daemon stdio".to_string(),
            ));
        };

        let id = DaemonId(NEXT_DAEMON_ID.fetch_add(1, Ordering::Relaxed));
        let mut stdin = BufWriter::new(stdin);
        if let Err(e) = write_message(&mut stdin, &DaemonCommand::Ping) {
            abort_child(&mut child);
            return Err(Error::Infrastructure(format!(
                "daemon {} ('{}') did not accept readiness ping: {}",
                id,
                program.display(),
                e
            )));
        }

        let (stdout, ready) = match await_ready(BufReader::new(stdout), startup_timeout) {
            Ok(ready) => ready,
            Err(e) => {
                abort_child(&mut child);
                return Err(Error::Infrastructure(format!(
                    "daemon {} ('{}') failed to start: {}",
                    id,
                    program.display(),
                    e
                )));
            }
        };

        let mut handle = Self {
            id,
            child,
            stdin,
            stdout,
            pid: 0,
            broken: false,
        };

        match ready {
            DaemonResponse::Ready { pid } => {
                handle.pid = pid;
                tracing::info!(daemon = %handle.id, pid, "daemon ready");
                Ok(handle)
            }
            other => {
                handle.terminate();
                Err(Error::Infrastructure(format!(
                    "Unexpected response from daemon: {:?}",
                    other
                )))
            }
        }
    }

    pub fn id(&self) -> DaemonId {
        self.id
    }

    /// Process id as reported by the daemon.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    fn send_command(&mut self, cmd: &DaemonCommand) -> Result<()> {
        if self.broken {
            return Err(Error::Ipc("Daemon channel is closed".to_string()));
        }
        write_message(&mut self.stdin, cmd).inspect_err(|e| {
            // Encoding failures happen before anything is written.
            if !matches!(e, Error::Serialization(_) | Error::MessageTooLarge(_)) {
                self.broken = true;
            }
        })
    }

    fn recv_response(&mut self) -> Result<DaemonResponse> {
        if self.broken {
            return Err(Error::Ipc("Daemon channel is closed".to_string()));
        }
        read_message(&mut self.stdout).inspect_err(|_| self.broken = true)
    }

    /// Run one work item and translate the reply into an outcome.
    ///
    /// Channel problems become infrastructure failures and mark the
    /// handle broken so the pool discards it. A request that cannot be
    /// encoded never reaches the channel and leaves the daemon usable.
    pub fn execute(&mut self, item: &WorkItem) -> Outcome {
        let command = match item.params().to_json_bytes() {
            Ok(params_json) => DaemonCommand::Execute {
                item_id: item.id().as_u64(),
                action: item.action().to_string(),
                params_json,
            },
            Err(e) => return unsendable(item, e),
        };

        match self.send_command(&command) {
            Ok(()) => {}
            Err(e @ (Error::Serialization(_) | Error::MessageTooLarge(_))) => {
                return unsendable(item, e);
            }
            Err(e) => return self.lost(item, e),
        }

        match self.recv_response() {
            Ok(response) => self.outcome_from(item, response),
            Err(e) => self.lost(item, e),
        }
    }

    fn outcome_from(&mut self, item: &WorkItem, response: DaemonResponse) -> Outcome {
        match response {
            DaemonResponse::Success { result_json } => {
                match serde_json::from_slice::<Value>(&result_json) {
                    Ok(value) => Outcome::Success(value),
                    Err(e) => Outcome::Failure(Failure::action(format!(
                        "undecodable daemon result for {}: {}",
                        item.id(),
                        e
                    ))),
                }
            }
            DaemonResponse::Failure { message } => Outcome::Failure(Failure::action(message)),
            DaemonResponse::Panic { message } => {
                Outcome::Failure(Failure::action(format!("action panicked: {}", message)))
            }
            other => self.lost(
                item,
                Error::Ipc(format!("Unexpected response when executing: {:?}", other)),
            ),
        }
    }

    /// Mark the daemon unusable and report the item as an infrastructure failure.
    fn lost(&mut self, item: &WorkItem, e: Error) -> Outcome {
        self.broken = true;
        let status = self.exit_status();
        tracing::warn!(daemon = %self.id, pid = self.pid, item = %item.id(), "daemon lost: {}", e);
        Outcome::Failure(Failure::infrastructure(format!(
            "daemon {} (pid {}) died while running {}{}: {}",
            self.id,
            self.pid,
            item.id(),
            status,
            e
        )))
    }

    fn exit_status(&mut self) -> String {
        match self.child.try_wait() {
            Ok(Some(status)) => format!(" ({})", status),
            _ => String::new(),
        }
    }

    /// Whether the daemon can take more work.
    pub fn is_alive(&mut self) -> bool {
        if self.broken {
            return false;
        }
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Ask the daemon to exit, then force-kill it if it lingers.
    pub fn terminate(&mut self) {
        if !self.broken {
            let _ = self.send_command(&DaemonCommand::Shutdown);
        }
        self.broken = true;

        // Give it a moment to shutdown gracefully
        for _ in 0..10 {
            if matches!(self.child.try_wait(), Ok(Some(_))) {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }

        if let Err(e) = self.child.kill() {
            // Already exited between the poll and the kill
            if e.kind() != std::io::ErrorKind::InvalidInput {
                tracing::warn!(daemon = %self.id, "Failed to kill daemon: {}", e);
            }
        }

        // Reap the zombie
        let _ = self.child.wait();
    }
}

impl fmt::Debug for DaemonHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DaemonHandle")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("broken", &self.broken)
            .finish()
    }
}

impl Drop for DaemonHandle {
    fn drop(&mut self) {
        if matches!(self.child.try_wait(), Ok(None)) {
            self.terminate();
        }
    }
}

/// Read the first response on a helper thread so a silent daemon cannot
/// hold the caller past `timeout`.
///
/// On timeout the thread stays blocked until the caller kills the child
/// and its stdout closes.
fn await_ready(
    mut stdout: BufReader<ChildStdout>,
    timeout: Duration,
) -> Result<(BufReader<ChildStdout>, DaemonResponse)> {
    let (tx, rx) = mpsc::channel();
    std::thread::Builder::new()
        .name("workhive-daemon-ready".to_string())
        .spawn(move || {
            let response = read_message::<_, DaemonResponse>(&mut stdout);
            let _ = tx.send((stdout, response));
        })?;

    match rx.recv_timeout(timeout) {
        Ok((stdout, response)) => Ok((stdout, response?)),
        Err(RecvTimeoutError::Timeout) => Err(Error::Infrastructure(format!(
            "no readiness reply within {:?}",
            timeout
        ))),
        Err(RecvTimeoutError::Disconnected) => Err(Error::Infrastructure(
            "readiness reader stopped unexpectedly".to_string(),
        )),
    }
}

/// Kill a child that never became a usable daemon, and reap it.
fn abort_child(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn unsendable(item: &WorkItem, e: Error) -> Outcome {
    Outcome::Failure(Failure::action(format!(
        "cannot send {} to daemon: {}",
        item.id(),
        e
    )))
}

/// Find the workhive-worker binary path.
///
/// Looks in the following order:
/// 1. `WORKHIVE_DAEMON_PATH` environment variable
/// 2. Same directory as the current executable (and its parent, for test binaries)
/// 3. System PATH
/// 4. `target/debug` or `target/release` of the workspace
pub fn find_daemon_binary() -> Result<PathBuf> {
    if let Ok(path) = std::env::var(DAEMON_PATH_ENV) {
        let path = PathBuf::from(path);
        if path.is_file() {
            return Ok(path);
        }
    }

    if let Ok(exe_path) = std::env::current_exe()
        && let Some(exe_dir) = exe_path.parent()
    {
        // Test binaries live in target/<profile>/deps
        for dir in [Some(exe_dir), exe_dir.parent()].into_iter().flatten() {
            let candidate = dir.join(DAEMON_BINARY);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }

    if let Ok(path) = which::which(DAEMON_BINARY) {
        return Ok(path);
    }

    if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
        for profile in ["debug", "release"] {
            let path = PathBuf::from(&manifest_dir)
                .join("..")
                .join("..")
                .join("target")
                .join(profile)
                .join(DAEMON_BINARY);
            if path.is_file() {
                return Ok(path.canonicalize().unwrap_or(path));
            }
        }
    }

    Err(Error::Infrastructure(format!(
        "Could not find {} binary. Set {} or ensure it's in PATH.",
        DAEMON_BINARY, DAEMON_PATH_ENV
    )))
}
