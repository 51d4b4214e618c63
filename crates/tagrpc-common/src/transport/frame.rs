//! Frame layout.
//!
//! ```text
//! [4-byte big-endian length, counting itself] [body] [zero padding]
//! ```
//!
//! Frames are never shorter than [`MIN_FRAME_SIZE`], so a reader can always
//! fetch the first block in one go and only issues a second read for larger
//! frames.

use bytes::{BufMut, BytesMut};

use crate::protocol::error::{Result, RpcError};

/// Size of the length prefix.
pub const LENGTH_PREFIX: usize = 4;

/// Smallest frame on the wire.
pub const MIN_FRAME_SIZE: usize = 256;

/// Default upper bound on a frame.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// How often the watchdog inspects open connections.
pub const CHECK_PERIOD_MS: u64 = 100;

/// I/O stalled longer than this closes the connection.
pub const DEFAULT_STALL_TIMEOUT_MS: u64 = 10_000;

/// Gap between warnings about a slow read or write.
pub const DEFAULT_WARNING_PERIOD_MS: u64 = 1_000 - CHECK_PERIOD_MS / 2;

/// Clears `buf` and reserves the length prefix.
pub fn begin_frame(buf: &mut BytesMut) {
    buf.clear();
    buf.put_u32(0);
}

/// Patches the length prefix and pads the frame.
///
/// # Errors
///
/// Returns `MessageTooLarge` when the frame exceeds `max`.
pub fn finish_frame(buf: &mut BytesMut, max: usize) -> Result<usize> {
    let len = buf.len();
    if len > max {
        return Err(RpcError::MessageTooLarge { size: len, max });
    }
    buf[..LENGTH_PREFIX].copy_from_slice(&(len as u32).to_be_bytes());
    if len < MIN_FRAME_SIZE {
        buf.resize(MIN_FRAME_SIZE, 0);
    }
    Ok(len)
}

/// Validates the length prefix of a received frame.
///
/// # Errors
///
/// Returns `StreamCorrupted` for lengths shorter than the prefix or larger
/// than `max`.
pub fn frame_length(prefix: [u8; LENGTH_PREFIX], max: usize) -> Result<usize> {
    let len = u32::from_be_bytes(prefix) as usize;
    if len < LENGTH_PREFIX || len > max {
        return Err(RpcError::StreamCorrupted(format!(
            "invalid frame length {len} (max {max} bytes)"
        )));
    }
    Ok(len)
}
