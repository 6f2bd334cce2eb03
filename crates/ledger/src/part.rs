use serde::{Deserialize, Serialize};

/// Transfer state of a single part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PartState {
    /// Not yet transferred.
    Pending,
    /// Dispatched to a worker; not confirmed.
    InFlight,
    /// Transferred and confirmed. Immutable from here on.
    Done,
}

/// One fixed-size byte range of an object, the unit of transfer and resume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    /// Ordinal position within the object.
    pub index: u32,
    /// Byte offset of this part within the object.
    pub offset: u64,
    /// Length in bytes (the final part may be shorter).
    pub length: u64,
    /// SHA-256 hex digest of the transferred bytes; empty until Done.
    /// Authoritative for resume-time validation.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content_hash: String,
    pub state: PartState,
}

impl Part {
    /// Creates a pending part covering `[offset, offset + length)`.
    pub fn pending(index: u32, offset: u64, length: u64) -> Self {
        Self {
            index,
            offset,
            length,
            content_hash: String::new(),
            state: PartState::Pending,
        }
    }

    /// Returns a copy marked Done with the given content hash.
    pub fn done(&self, content_hash: String) -> Self {
        Self {
            content_hash,
            state: PartState::Done,
            ..self.clone()
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == PartState::Done
    }
}
