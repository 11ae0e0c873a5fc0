//! Daemon-side request loop.
//!
//! A daemon executable builds its own [`ActionRegistry`] and hands it to
//! [`serve_stdio`]. Stdout carries protocol frames only, so actions and
//! logging must not write to it.

use std::io::{BufReader, BufWriter, Read, Write};

use crate::action::{ActionContext, ActionFailed, ActionRegistry, StaticStore, run_action};
use crate::config::IsolationStrategy;
use crate::error::{Error, Result};
use crate::work::{Parameters, WorkItemId};

use super::protocol::{DaemonCommand, DaemonResponse, read_message, write_message};

/// Serve requests on this process's stdin/stdout until told to shut down
/// or the host closes the channel.
pub fn serve_stdio(registry: &ActionRegistry) -> Result<()> {
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let mut reader = BufReader::new(stdin.lock());
    let mut writer = BufWriter::new(stdout.lock());
    serve(registry, &mut reader, &mut writer)
}

/// Serve requests from `reader`, writing replies to `writer`.
///
/// Static state lives for the whole loop, so sequential items on the same
/// daemon share it just like they share the process.
pub fn serve<R: Read, W: Write>(
    registry: &ActionRegistry,
    reader: &mut R,
    writer: &mut W,
) -> Result<()> {
    let statics = StaticStore::new();
    let pid = std::process::id();
    tracing::debug!(pid, actions = ?registry.names(), "daemon serving");

    loop {
        let command: DaemonCommand = match read_message(reader) {
            Ok(command) => command,
            Err(Error::Ipc(message)) => {
                // Host went away; nothing left to answer.
                tracing::debug!(pid, "daemon channel closed: {}", message);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let response = match command {
            DaemonCommand::Ping => DaemonResponse::Ready { pid },
            DaemonCommand::Execute {
                item_id,
                action,
                params_json,
            } => execute(
                registry,
                &statics,
                WorkItemId::new(item_id),
                &action,
                &params_json,
            ),
            DaemonCommand::Shutdown => {
                write_message(writer, &DaemonResponse::ShuttingDown)?;
                tracing::debug!(pid, "daemon shutting down");
                return Ok(());
            }
        };

        send_response(writer, pid, &response)?;
    }
}

/// Write a response. A result too large to frame goes back as a failure
/// so the loop, and the daemon, keep running.
fn send_response<W: Write>(writer: &mut W, pid: u32, response: &DaemonResponse) -> Result<()> {
    match write_message(writer, response) {
        Err(e @ (Error::MessageTooLarge(_) | Error::Serialization(_))) => {
            tracing::warn!(pid, "cannot send response: {}", e);
            write_message(
                writer,
                &DaemonResponse::Failure {
                    message: format!("result could not be sent to the host: {}", e),
                },
            )
        }
        other => other,
    }
}

fn execute(
    registry: &ActionRegistry,
    statics: &StaticStore,
    item_id: WorkItemId,
    action: &str,
    params_json: &[u8],
) -> DaemonResponse {
    let params = match Parameters::from_json_bytes(params_json) {
        Ok(params) => params,
        Err(e) => {
            return DaemonResponse::Failure {
                message: e.to_string(),
            };
        }
    };
    let instance = match registry.create(action) {
        Ok(instance) => instance,
        Err(e) => {
            return DaemonResponse::Failure {
                message: e.to_string(),
            };
        }
    };

    tracing::debug!(item = %item_id, action, "executing");
    let ctx = ActionContext::new(item_id, IsolationStrategy::IsolatedProcess, statics);
    match run_action(instance.as_ref(), &params, &ctx) {
        Ok(value) => match serde_json::to_vec(&value) {
            Ok(result_json) => DaemonResponse::Success { result_json },
            Err(e) => DaemonResponse::Failure {
                message: format!("failed to encode result: {}", e),
            },
        },
        Err(ActionFailed::Error(message)) => DaemonResponse::Failure { message },
        Err(ActionFailed::Panic(message)) => DaemonResponse::Panic { message },
    }
}
