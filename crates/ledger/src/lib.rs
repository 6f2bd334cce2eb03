//! Durable per-part transfer ledger.
//!
//! Tracks which fixed-size byte ranges of an object have been transferred,
//! persists that state to a JSON sidecar file, and restores it on restart so
//! an interrupted transfer resumes without repeating completed parts.

mod ledger;
mod part;

pub use ledger::PartLedger;
pub use part::{Part, PartState};

use std::path::{Path, PathBuf};

/// Suffix appended to the local file path to form the sidecar ledger path.
pub const PROGRESS_SUFFIX: &str = ".progress";

/// Errors produced when persisting a ledger.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Returns the sidecar ledger path for a local file (`<path>.progress`).
pub fn progress_path(local_path: &Path) -> PathBuf {
    let mut os = local_path.as_os_str().to_os_string();
    os.push(PROGRESS_SUFFIX);
    PathBuf::from(os)
}
