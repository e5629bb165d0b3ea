// crates/framepipe-core/src/error.rs

use thiserror::Error;

/// Failure modes of the SPSC slot queue.
///
/// `Full` and `Empty` are recoverable; the caller decides whether to drop
/// the frame, retry, or fall through to the next loop turn. `Disconnected` means the
/// peer endpoint is gone and the worker loop should treat it as
/// termination. `SizeExceeded` is a caller bug; it never consumes a slot.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue is full")]
    Full,

    #[error("queue is empty")]
    Empty,

    #[error("{len} bytes at offset {offset} do not fit a {item_size}-byte slot")]
    SizeExceeded {
        offset:    usize,
        len:       usize,
        item_size: usize,
    },

    #[error("peer endpoint disconnected")]
    Disconnected,
}
