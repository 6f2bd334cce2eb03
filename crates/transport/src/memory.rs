//! In-process backend.
//!
//! Backs engine and orchestrator tests and local dry runs with the same
//! staging/commit semantics the remote dialects provide: parts staged under
//! opaque block IDs, objects assembled in commit-list order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use md5::{Digest, Md5};

use crate::{ObjectMeta, Transport, TransportError};

#[derive(Debug, Default)]
struct State {
    /// `<container>/<key>` -> object bytes.
    objects: HashMap<String, Vec<u8>>,
    /// `<container>/<key>` -> staged blocks by ID.
    staged: HashMap<String, HashMap<String, Vec<u8>>>,
}

/// In-memory block store.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<State>>,
    serve_ranges: bool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(State::default())),
            serve_ranges: true,
        }
    }

    /// A store that refuses sub-object range reads, for exercising the
    /// whole-object fallback path.
    pub fn without_range_support() -> Self {
        Self {
            serve_ranges: false,
            ..Self::new()
        }
    }

    fn object_key(container: &str, key: &str) -> String {
        format!("{container}/{key}")
    }

    /// Seeds a complete object (test/setup helper).
    pub fn put_object(&self, container: &str, key: &str, data: Vec<u8>) {
        let mut state = self.inner.lock().unwrap();
        state.objects.insert(Self::object_key(container, key), data);
    }

    /// Returns a copy of an object's bytes, if present.
    pub fn object(&self, container: &str, key: &str) -> Option<Vec<u8>> {
        let state = self.inner.lock().unwrap();
        state.objects.get(&Self::object_key(container, key)).cloned()
    }

    /// Number of blocks currently staged for an object.
    pub fn staged_blocks(&self, container: &str, key: &str) -> usize {
        let state = self.inner.lock().unwrap();
        state
            .staged
            .get(&Self::object_key(container, key))
            .map_or(0, HashMap::len)
    }
}

impl Transport for MemoryStore {
    async fn list(&self, container: &str, prefix: &str) -> Result<Vec<String>, TransportError> {
        let state = self.inner.lock().unwrap();
        let scope = format!("{container}/");
        let mut keys: Vec<String> = state
            .objects
            .keys()
            .filter_map(|k| k.strip_prefix(&scope))
            .filter(|k| k.starts_with(prefix))
            .map(String::from)
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn metadata(&self, container: &str, key: &str) -> Result<ObjectMeta, TransportError> {
        let state = self.inner.lock().unwrap();
        let data = state
            .objects
            .get(&Self::object_key(container, key))
            .ok_or(TransportError::NotFound)?;
        let mut hasher = Md5::new();
        hasher.update(data);
        Ok(ObjectMeta {
            size: data.len() as u64,
            content_md5: hex::encode(hasher.finalize()),
        })
    }

    async fn get_range(
        &self,
        container: &str,
        key: &str,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>, TransportError> {
        let state = self.inner.lock().unwrap();
        let data = state
            .objects
            .get(&Self::object_key(container, key))
            .ok_or(TransportError::NotFound)?;
        let whole = offset == 0 && length == data.len() as u64;
        if !self.serve_ranges && !whole {
            return Err(TransportError::RangeUnsupported);
        }
        let end = offset
            .checked_add(length)
            .filter(|end| *end <= data.len() as u64)
            .ok_or(TransportError::Backend {
                status: 416,
                message: "requested range not satisfiable".into(),
            })?;
        Ok(data[offset as usize..end as usize].to_vec())
    }

    async fn put_part(
        &self,
        container: &str,
        key: &str,
        block_id: &str,
        data: Vec<u8>,
    ) -> Result<(), TransportError> {
        let mut state = self.inner.lock().unwrap();
        state
            .staged
            .entry(Self::object_key(container, key))
            .or_default()
            .insert(block_id.to_string(), data);
        Ok(())
    }

    async fn commit_parts(
        &self,
        container: &str,
        key: &str,
        block_ids: &[String],
    ) -> Result<(), TransportError> {
        let mut state = self.inner.lock().unwrap();
        let object_key = Self::object_key(container, key);
        let staged = state.staged.get(&object_key);

        let missing: Vec<String> = block_ids
            .iter()
            .filter(|id| !staged.is_some_and(|blocks| blocks.contains_key(*id)))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(TransportError::IncompleteParts { missing });
        }

        let blocks = state.staged.remove(&object_key).unwrap_or_default();
        let mut assembled = Vec::new();
        for id in block_ids {
            assembled.extend_from_slice(&blocks[id]);
        }
        state.objects.insert(object_key, assembled);
        Ok(())
    }

    async fn delete(&self, container: &str, key: &str) -> Result<(), TransportError> {
        let mut state = self.inner.lock().unwrap();
        state
            .objects
            .remove(&Self::object_key(container, key))
            .map(|_| ())
            .ok_or(TransportError::NotFound)
    }

    fn sign_temporary_url(
        &self,
        container: &str,
        key: &str,
        ttl: Duration,
    ) -> Result<String, TransportError> {
        let expires = Utc::now() + ChronoDuration::seconds(ttl.as_secs() as i64);
        Ok(format!(
            "memory://{container}/{key}?expires={}",
            expires.timestamp()
        ))
    }
}
