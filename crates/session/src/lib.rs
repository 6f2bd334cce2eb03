//! Session orchestrator.
//!
//! Owns one transfer request's lifecycle: loads the persisted ledger,
//! constructs the request, consumes its event stream, persists the ledger
//! whenever its fingerprint changes, and cleans up on the terminal event.
//! The orchestrator holds the cancellation token and is the only component
//! that cancels a running transfer.

mod session;
mod trace;

pub use session::{Session, SessionConfig, SessionOutcome};
pub use trace::{NoopTrace, TraceObserver};

use blobsync_engine::TransferError;
use blobsync_ledger::LedgerError;

/// Errors surfaced by a session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("transfer failed: {0}")]
    Transfer(#[from] TransferError),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("event stream closed without a terminal event")]
    MissingTerminal,

    #[error("transfer task failed: {0}")]
    Worker(String),
}
