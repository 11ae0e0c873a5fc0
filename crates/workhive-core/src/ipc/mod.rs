//! Inter-process communication with Workhive daemon processes.
//!
//! This module provides the wire protocol, host-side daemon handles, the
//! daemon pool, and the daemon-side serve loop.

mod daemon;
mod pool;
pub mod protocol;
mod serve;

pub use daemon::{DAEMON_MARKER_ENV, DAEMON_PATH_ENV, DaemonHandle, DaemonId, find_daemon_binary};
pub use pool::{DaemonInfo, DaemonLease, DaemonPool, DaemonState, PoolStats};
pub use protocol::{DaemonCommand, DaemonResponse, read_message, write_message};
pub use serve::{serve, serve_stdio};
