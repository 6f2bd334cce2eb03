use std::path::PathBuf;

use blobsync_ledger::PartLedger;

use crate::TransferError;

/// Status event emitted by a transfer request.
///
/// Strictly ordered per request: zero or more `Update`s followed by exactly
/// one terminal `Done` or `Error`, after which the stream closes. `Update`
/// carries a snapshot of the ledger so the consumer can persist resume state
/// without sharing mutable ownership with the running request.
#[derive(Debug)]
pub enum TransferEvent {
    Update {
        /// Cumulative bytes confirmed transferred, monotonically
        /// non-decreasing across events regardless of part completion order.
        bytes_done: u64,
        bytes_total: u64,
        ledger: PartLedger,
    },
    Done {
        local_path: PathBuf,
        final_size: u64,
    },
    Error {
        cause: TransferError,
    },
}

impl TransferEvent {
    /// Whether this event terminates the stream.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Update { .. })
    }
}
