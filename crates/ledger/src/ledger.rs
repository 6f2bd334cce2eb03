use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::part::{Part, PartState};
use crate::LedgerError;

/// Ordered record of the parts of one object, keyed by index.
///
/// Indices are contiguous starting at 0 and cover exactly the object's total
/// size once planned. Serializes as a plain JSON array of part records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartLedger {
    parts: Vec<Part>,
}

impl PartLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a persisted ledger.
    ///
    /// A missing file yields an empty ledger. A corrupt or partial file is
    /// logged and also yields an empty ledger: restarting clean is preferred
    /// over refusing to make progress.
    pub fn load(path: &Path) -> PartLedger {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return PartLedger::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read ledger, starting fresh");
                return PartLedger::new();
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(ledger) => ledger,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "corrupt ledger, starting fresh");
                PartLedger::new()
            }
        }
    }

    /// Atomically persists the ledger.
    ///
    /// Writes to a sibling temp file and renames it over the target, so a
    /// concurrent [`load`](Self::load) never observes a half-written file.
    pub fn save(&self, path: &Path) -> Result<(), LedgerError> {
        let bytes = serde_json::to_vec(self)?;
        let mut tmp_os = path.as_os_str().to_os_string();
        tmp_os.push(".tmp");
        let tmp = Path::new(&tmp_os);
        fs::write(tmp, &bytes)?;
        fs::rename(tmp, path)?;
        Ok(())
    }

    /// Partitions the object into fixed-size parts (shorter final part),
    /// preserving prior progress when the existing parts already match the
    /// requested geometry.
    ///
    /// A geometry disagreement (different part size or total size) discards
    /// prior progress: the recorded offsets would no longer address the same
    /// bytes.
    pub fn plan(&mut self, total_size: u64, part_size: u64) {
        let planned = Self::partition(total_size, part_size);
        let matches = self.parts.len() == planned.len()
            && self
                .parts
                .iter()
                .zip(&planned)
                .all(|(a, b)| a.offset == b.offset && a.length == b.length);
        if !matches {
            if !self.parts.is_empty() {
                warn!(
                    prior_parts = self.parts.len(),
                    planned_parts = planned.len(),
                    "ledger geometry changed, discarding prior progress"
                );
            }
            self.parts = planned;
        }
    }

    fn partition(total_size: u64, part_size: u64) -> Vec<Part> {
        assert!(part_size > 0, "part size must be non-zero");
        let mut parts = Vec::new();
        let mut offset = 0u64;
        let mut index = 0u32;
        while offset < total_size {
            let length = part_size.min(total_size - offset);
            parts.push(Part::pending(index, offset, length));
            offset += length;
            index += 1;
        }
        parts
    }

    /// Index-keyed upsert of a part's new state.
    ///
    /// Never demotes a Done part: a stale or late completion for a part that
    /// already finished is ignored, keeping reported progress monotonic.
    /// Returns whether the ledger changed.
    pub fn merge(&mut self, incoming: Part) -> bool {
        let Some(slot) = self.parts.get_mut(incoming.index as usize) else {
            warn!(index = incoming.index, "merge for unplanned part index ignored");
            return false;
        };
        if slot.is_done() || *slot == incoming {
            return false;
        }
        *slot = incoming;
        true
    }

    /// Marks a pending part as dispatched.
    pub fn mark_in_flight(&mut self, index: u32) {
        if let Some(slot) = self.parts.get_mut(index as usize)
            && slot.state == PartState::Pending
        {
            slot.state = PartState::InFlight;
        }
    }

    /// Resets a part to Pending (resume-time hash validation failure, or an
    /// InFlight part left over from a crashed run).
    pub fn reset(&mut self, index: u32) {
        if let Some(slot) = self.parts.get_mut(index as usize) {
            slot.state = PartState::Pending;
            slot.content_hash.clear();
        }
    }

    /// Cumulative bytes confirmed Done, recomputed from full part state.
    pub fn bytes_done(&self) -> u64 {
        self.parts
            .iter()
            .filter(|p| p.is_done())
            .map(|p| p.length)
            .sum()
    }

    /// Total bytes covered by the plan.
    pub fn bytes_total(&self) -> u64 {
        self.parts.iter().map(|p| p.length).sum()
    }

    pub fn is_complete(&self) -> bool {
        self.parts.iter().all(Part::is_done)
    }

    /// Parts still to transfer (Pending or InFlight).
    pub fn remaining(&self) -> impl Iterator<Item = &Part> {
        self.parts.iter().filter(|p| !p.is_done())
    }

    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    pub fn get(&self, index: u32) -> Option<&Part> {
        self.parts.get(index as usize)
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Deterministic SHA-256 digest over ordered part state.
    ///
    /// Ledgers equal by content produce equal fingerprints; the orchestrator
    /// compares fingerprints to skip redundant persistence.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for p in &self.parts {
            hasher.update(p.index.to_be_bytes());
            hasher.update(p.offset.to_be_bytes());
            hasher.update(p.length.to_be_bytes());
            hasher.update([p.state as u8]);
            hasher.update(p.content_hash.as_bytes());
            // Field separator.
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }
}
