//! Resumable chunked transfer engine.
//!
//! Orchestrates a single object's upload or download as a sequence of part
//! operations against a [`Transport`](blobsync_transport::Transport) backend
//! and a [`PartLedger`](blobsync_ledger::PartLedger), with bounded part
//! concurrency, part-level retry, and an ordered progress event stream.

mod event;
mod request;
mod retry;

pub use event::TransferEvent;
pub use request::{Operation, RequestState, TransferRequest};
pub use retry::RetryPolicy;

use blobsync_transport::TransportError;

/// Default part size: 4 MiB.
pub const DEFAULT_PART_SIZE: u64 = 4 * 1024 * 1024;

/// Default bound on part operations in flight.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 4;

/// Event channel capacity. The producer blocks when the consumer lags;
/// progress events are never dropped.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Errors terminating a transfer.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// Remote size disagrees with the caller-supplied expected size.
    /// Fatal and non-retryable: continuing would silently truncate or
    /// overrun the object.
    #[error("remote size {actual} disagrees with expected size {expected}")]
    SizeMismatch { expected: u64, actual: u64 },

    /// Measured transferred bytes exceed the expected size.
    #[error("transferred {bytes_done} bytes past expected size {expected}")]
    Overrun { bytes_done: u64, expected: u64 },

    /// A part operation kept failing transiently until retries ran out.
    #[error("part {index} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        index: u32,
        attempts: u32,
        #[source]
        last: TransportError,
    },

    #[error("transfer cancelled")]
    Cancelled,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("part worker failed: {0}")]
    Worker(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub(crate) fn sha256_hex(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
