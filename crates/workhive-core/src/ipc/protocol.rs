//! IPC protocol messages for Workhive daemon processes.
//!
//! Uses length-prefixed rkyv messages over stdin/stdout.
//! Format: 4-byte length (u32 LE) + rkyv-encoded message.

use std::io::{Read, Write};

use rkyv::{Archive, Deserialize, Serialize};

use crate::error::{Error, Result};

/// Messages above this size are rejected as corrupt.
pub const MAX_MESSAGE_LEN: usize = 100 * 1024 * 1024;

/// Command sent from the host to a daemon.
#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
pub enum DaemonCommand {
    /// Readiness check; the daemon answers with `Ready`.
    Ping,

    /// Run one action invocation.
    Execute {
        /// Work item id, for daemon-side logging.
        item_id: u64,
        /// Action-type identifier resolved by the daemon's registry.
        action: String,
        /// JSON-encoded parameter payload.
        params_json: Vec<u8>,
    },

    /// Exit the serve loop.
    Shutdown,
}

/// Response sent from a daemon to the host.
///
/// Every `Execute` gets exactly one of `Success`, `Failure` or `Panic`.
#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
pub enum DaemonResponse {
    /// Answer to `Ping`, carrying the daemon's process id.
    Ready { pid: u32 },

    /// Action completed.
    Success {
        /// JSON-encoded result value.
        result_json: Vec<u8>,
    },

    /// Action returned an error, or the request could not be decoded.
    Failure { message: String },

    /// Action panicked.
    Panic { message: String },

    /// Acknowledgement of `Shutdown`.
    ShuttingDown,
}

/// Write a message to a writer using length-prefixed rkyv encoding.
///
/// Encoding failures and oversized messages are reported before any byte
/// reaches the writer, so the stream stays usable after them.
pub fn write_message<W: Write>(
    writer: &mut W,
    message: &impl for<'a> Serialize<
        rkyv::rancor::Strategy<
            rkyv::ser::Serializer<
                rkyv::util::AlignedVec,
                rkyv::ser::allocator::ArenaHandle<'a>,
                rkyv::ser::sharing::Share,
            >,
            rkyv::rancor::Error,
        >,
    >,
) -> Result<()> {
    let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(message)
        .map_err(|e| Error::Serialization(format!("Failed to encode IPC message: {}", e)))?;

    if bytes.len() > MAX_MESSAGE_LEN {
        return Err(Error::MessageTooLarge(bytes.len()));
    }

    let len = bytes.len() as u32;
    writer
        .write_all(&len.to_le_bytes())
        .map_err(|e| Error::Ipc(format!("Failed to write IPC message length: {}", e)))?;
    writer
        .write_all(&bytes)
        .map_err(|e| Error::Ipc(format!("Failed to write IPC message body: {}", e)))?;
    writer
        .flush()
        .map_err(|e| Error::Ipc(format!("Failed to flush IPC stream: {}", e)))?;

    Ok(())
}

/// Read a message from a reader using length-prefixed rkyv encoding.
///
/// # Safety
///
/// Uses unchecked deserialization. Only safe when reading from trusted
/// sources: our own daemons, or the host that spawned us.
pub fn read_message<R: Read, T>(reader: &mut R) -> Result<T>
where
    T: Archive,
    T::Archived: Deserialize<T, rkyv::rancor::Strategy<rkyv::de::Pool, rkyv::rancor::Error>>,
{
    let mut len_bytes = [0u8; 4];
    reader
        .read_exact(&mut len_bytes)
        .map_err(|e| Error::Ipc(format!("Failed to read IPC message length: {}", e)))?;
    let len = u32::from_le_bytes(len_bytes) as usize;

    if len > MAX_MESSAGE_LEN {
        return Err(Error::Ipc(format!("IPC message too large: {} bytes", len)));
    }

    // rkyv needs an aligned buffer to read the archive in place.
    let mut bytes = rkyv::util::AlignedVec::<16>::with_capacity(len);
    bytes.resize(len, 0);
    reader
        .read_exact(&mut bytes)
        .map_err(|e| Error::Ipc(format!("Failed to read IPC message body: {}", e)))?;

    // SAFETY: the peer is a process we spawned, or the host that spawned us.
    let message = unsafe { rkyv::from_bytes_unchecked::<T, rkyv::rancor::Error>(&bytes) }
        .map_err(|e| Error::Deserialization(format!("Failed to decode IPC message: {}", e)))?;

    Ok(message)
}
