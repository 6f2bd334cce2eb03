//! Blob store transport clients.
//!
//! A single capability set ([`Transport`]) over a block-addressable remote
//! store, with one implementation per backend: Azure block blobs, an
//! S3-compatible dialect, and an in-process store for tests and local runs.
//! The backend is selected at construction time via [`BlockStore`]; provider
//! wire formats stay behind this boundary.

pub mod azure;
pub mod error;
pub mod memory;
pub mod s3;
mod sign;
mod xml;

pub use azure::AzureStore;
pub use error::TransportError;
pub use memory::MemoryStore;
pub use s3::S3Store;

use std::future::Future;
use std::time::Duration;

/// Backend-specific authentication input.
#[derive(Debug, Clone)]
pub struct AuthInput {
    /// Scheme selector understood by the backend (e.g. "password", "s3").
    pub auth_type: String,
    /// Account name or access key ID.
    pub username: String,
    /// Account key or secret access key.
    pub secret: String,
}

/// Metadata for a remote object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    /// Object size in bytes.
    pub size: u64,
    /// Backend-reported content hash (hex MD5; may be empty).
    pub content_md5: String,
}

/// Capability set every backend implements.
///
/// Part staging is idempotent per block ID, and `commit_parts` assembles the
/// object in the order of the supplied ID list regardless of staging order.
pub trait Transport: Send + Sync {
    /// Lists object keys under `prefix` in `container`.
    fn list(
        &self,
        container: &str,
        prefix: &str,
    ) -> impl Future<Output = Result<Vec<String>, TransportError>> + Send;

    /// Fetches object size and content hash. Fails with
    /// [`TransportError::NotFound`] if the object is absent.
    fn metadata(
        &self,
        container: &str,
        key: &str,
    ) -> impl Future<Output = Result<ObjectMeta, TransportError>> + Send;

    /// Reads `length` bytes starting at `offset`. Fails with
    /// [`TransportError::RangeUnsupported`] if the backend cannot serve
    /// partial content.
    fn get_range(
        &self,
        container: &str,
        key: &str,
        offset: u64,
        length: u64,
    ) -> impl Future<Output = Result<Vec<u8>, TransportError>> + Send;

    /// Stages one part under a caller-chosen opaque block ID. Re-staging the
    /// same ID with identical bytes is harmless.
    fn put_part(
        &self,
        container: &str,
        key: &str,
        block_id: &str,
        data: Vec<u8>,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Atomically assembles the object from staged parts, in list order.
    /// Fails with [`TransportError::IncompleteParts`] if any referenced ID
    /// was never staged.
    fn commit_parts(
        &self,
        container: &str,
        key: &str,
        block_ids: &[String],
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Deletes an object.
    fn delete(
        &self,
        container: &str,
        key: &str,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Produces a time-bounded, credential-free access URL. The TTL is
    /// enforced by the backend, not by this client.
    fn sign_temporary_url(
        &self,
        container: &str,
        key: &str,
        ttl: Duration,
    ) -> Result<String, TransportError>;
}

/// Backend variant selected at construction time by configuration.
#[derive(Debug, Clone)]
pub enum BlockStore {
    Azure(AzureStore),
    S3(S3Store),
    Memory(MemoryStore),
}

impl BlockStore {
    /// Azure block blob backend for the given account endpoint.
    pub fn azure(endpoint: &str, auth: &AuthInput) -> Result<Self, TransportError> {
        Ok(Self::Azure(AzureStore::new(endpoint, auth)?))
    }

    /// S3-compatible backend for the given region.
    pub fn s3(region: &str, auth: &AuthInput) -> Result<Self, TransportError> {
        Ok(Self::S3(S3Store::new(region, auth)))
    }

    /// In-process backend.
    pub fn memory() -> Self {
        Self::Memory(MemoryStore::new())
    }
}

impl Transport for BlockStore {
    async fn list(&self, container: &str, prefix: &str) -> Result<Vec<String>, TransportError> {
        match self {
            Self::Azure(s) => s.list(container, prefix).await,
            Self::S3(s) => s.list(container, prefix).await,
            Self::Memory(s) => s.list(container, prefix).await,
        }
    }

    async fn metadata(&self, container: &str, key: &str) -> Result<ObjectMeta, TransportError> {
        match self {
            Self::Azure(s) => s.metadata(container, key).await,
            Self::S3(s) => s.metadata(container, key).await,
            Self::Memory(s) => s.metadata(container, key).await,
        }
    }

    async fn get_range(
        &self,
        container: &str,
        key: &str,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>, TransportError> {
        match self {
            Self::Azure(s) => s.get_range(container, key, offset, length).await,
            Self::S3(s) => s.get_range(container, key, offset, length).await,
            Self::Memory(s) => s.get_range(container, key, offset, length).await,
        }
    }

    async fn put_part(
        &self,
        container: &str,
        key: &str,
        block_id: &str,
        data: Vec<u8>,
    ) -> Result<(), TransportError> {
        match self {
            Self::Azure(s) => s.put_part(container, key, block_id, data).await,
            Self::S3(s) => s.put_part(container, key, block_id, data).await,
            Self::Memory(s) => s.put_part(container, key, block_id, data).await,
        }
    }

    async fn commit_parts(
        &self,
        container: &str,
        key: &str,
        block_ids: &[String],
    ) -> Result<(), TransportError> {
        match self {
            Self::Azure(s) => s.commit_parts(container, key, block_ids).await,
            Self::S3(s) => s.commit_parts(container, key, block_ids).await,
            Self::Memory(s) => s.commit_parts(container, key, block_ids).await,
        }
    }

    async fn delete(&self, container: &str, key: &str) -> Result<(), TransportError> {
        match self {
            Self::Azure(s) => s.delete(container, key).await,
            Self::S3(s) => s.delete(container, key).await,
            Self::Memory(s) => s.delete(container, key).await,
        }
    }

    fn sign_temporary_url(
        &self,
        container: &str,
        key: &str,
        ttl: Duration,
    ) -> Result<String, TransportError> {
        match self {
            Self::Azure(s) => s.sign_temporary_url(container, key, ttl),
            Self::S3(s) => s.sign_temporary_url(container, key, ttl),
            Self::Memory(s) => s.sign_temporary_url(container, key, ttl),
        }
    }
}
