//! Transfer request state machine.
//!
//! Drives one object's upload or download: plans parts against the ledger
//! and remote metadata, runs part operations on a bounded worker pool,
//! merges out-of-order completions back through the ledger so reported
//! progress stays monotonic, and finishes with an index-ordered commit
//! (upload) or a final size check (download).

use std::collections::VecDeque;
use std::future::Future;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use blobsync_ledger::{Part, PartLedger, PartState};
use blobsync_transport::{Transport, TransportError};

use crate::{
    DEFAULT_MAX_IN_FLIGHT, DEFAULT_PART_SIZE, RetryPolicy, TransferError, TransferEvent,
    sha256_hex,
};

/// Transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Upload,
    Download,
}

/// Lifecycle states of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Created,
    Planning,
    InProgress,
    /// Upload only: all parts staged, block list being committed.
    Committing,
    Done,
    Cancelled,
    Failed,
}

/// Deterministic, base64-safe block ID for a part index.
///
/// Stable across retries and sessions, so a re-staged part reuses its ID and
/// the commit list built in index order always references the right blocks.
pub(crate) fn block_id(index: u32) -> String {
    BASE64.encode(format!("part-{index:08}"))
}

/// A single object transfer bound to a transport backend and a part ledger.
///
/// Exactly one request is active per (remote key, direction) at a time; the
/// request owns its ledger exclusively until it reaches a terminal state.
pub struct TransferRequest<T: Transport> {
    op: Operation,
    store: Arc<T>,
    container: String,
    remote_key: String,
    local_path: PathBuf,
    expected_size: u64,
    part_size: u64,
    max_in_flight: usize,
    retry: RetryPolicy,
    ledger: PartLedger,
    cancel: CancellationToken,
    events: mpsc::Sender<TransferEvent>,
    state: RequestState,
}

impl<T: Transport + 'static> TransferRequest<T> {
    pub fn new(
        op: Operation,
        store: Arc<T>,
        container: impl Into<String>,
        remote_key: impl Into<String>,
        local_path: impl Into<PathBuf>,
        expected_size: u64,
        events: mpsc::Sender<TransferEvent>,
    ) -> Self {
        Self {
            op,
            store,
            container: container.into(),
            remote_key: remote_key.into(),
            local_path: local_path.into(),
            expected_size,
            part_size: DEFAULT_PART_SIZE,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            retry: RetryPolicy::default(),
            ledger: PartLedger::new(),
            cancel: CancellationToken::new(),
            events,
            state: RequestState::Created,
        }
    }

    /// Seeds resume state from a previously persisted ledger.
    pub fn with_ledger(mut self, ledger: PartLedger) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_part_size(mut self, part_size: u64) -> Self {
        self.part_size = part_size.max(1);
        self
    }

    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    /// Runs the transfer to a terminal state, emitting ordered events.
    ///
    /// The event stream closes after the terminal event when the request
    /// (and with it the sender) is dropped.
    pub async fn run(mut self) -> RequestState {
        info!(
            op = ?self.op,
            container = %self.container,
            key = %self.remote_key,
            expected_size = self.expected_size,
            "transfer starting"
        );
        match self.execute().await {
            Ok(final_size) => {
                self.state = RequestState::Done;
                info!(key = %self.remote_key, final_size, "transfer done");
                let _ = self
                    .events
                    .send(TransferEvent::Done {
                        local_path: self.local_path.clone(),
                        final_size,
                    })
                    .await;
            }
            Err(cause) => {
                self.state = if matches!(cause, TransferError::Cancelled) {
                    RequestState::Cancelled
                } else {
                    RequestState::Failed
                };
                warn!(key = %self.remote_key, state = ?self.state, error = %cause, "transfer terminated");
                let _ = self.events.send(TransferEvent::Error { cause }).await;
            }
        }
        self.state
    }

    async fn execute(&mut self) -> Result<u64, TransferError> {
        if self.cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        self.state = RequestState::Planning;
        match self.op {
            Operation::Download => self.download().await,
            Operation::Upload => self.upload().await,
        }
    }

    async fn download(&mut self) -> Result<u64, TransferError> {
        let meta = self.store.metadata(&self.container, &self.remote_key).await?;
        if meta.size != self.expected_size {
            return Err(TransferError::SizeMismatch {
                expected: self.expected_size,
                actual: meta.size,
            });
        }

        self.ledger.plan(self.expected_size, self.part_size);
        self.revalidate_local().await;
        self.prepare_destination().await?;

        self.state = RequestState::InProgress;
        let remaining: Vec<Part> = self.ledger.remaining().cloned().collect();
        match self.run_pool(remaining, self.expected_size).await {
            Ok(()) => {}
            Err(TransferError::Transport(TransportError::RangeUnsupported)) => {
                // Backend cannot serve partial content: re-plan as a single
                // whole-object part. Prior resume state no longer applies.
                warn!(key = %self.remote_key, "partial content unsupported, whole-object fallback");
                self.ledger.plan(self.expected_size, self.expected_size.max(1));
                let remaining: Vec<Part> = self.ledger.remaining().cloned().collect();
                self.run_pool(remaining, self.expected_size).await?;
            }
            Err(e) => return Err(e),
        }

        let final_size = self.ledger.bytes_done();
        if final_size != self.expected_size {
            return Err(TransferError::SizeMismatch {
                expected: self.expected_size,
                actual: final_size,
            });
        }
        Ok(final_size)
    }

    async fn upload(&mut self) -> Result<u64, TransferError> {
        let local = tokio::fs::metadata(&self.local_path).await?;
        let total = local.len();
        if self.expected_size != 0 && self.expected_size != total {
            return Err(TransferError::SizeMismatch {
                expected: self.expected_size,
                actual: total,
            });
        }

        self.ledger.plan(total, self.part_size);
        self.revalidate_local().await;

        self.state = RequestState::InProgress;
        let remaining: Vec<Part> = self.ledger.remaining().cloned().collect();
        self.run_pool(remaining, total).await?;

        if self.cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        self.state = RequestState::Committing;
        // Block IDs in original index order, never completion order.
        let ids: Vec<String> = self.ledger.parts().iter().map(|p| block_id(p.index)).collect();
        debug!(key = %self.remote_key, blocks = ids.len(), "committing staged parts");
        self.store
            .commit_parts(&self.container, &self.remote_key, &ids)
            .await?;
        Ok(total)
    }

    /// Re-validates resume state against local bytes.
    ///
    /// InFlight parts left by a crashed run go back to Pending. Done parts
    /// whose local bytes no longer match their recorded content hash are
    /// demoted and re-transferred.
    async fn revalidate_local(&mut self) {
        let stale: Vec<u32> = self
            .ledger
            .parts()
            .iter()
            .filter(|p| p.state == PartState::InFlight)
            .map(|p| p.index)
            .collect();
        for index in stale {
            self.ledger.reset(index);
        }

        let done: Vec<Part> = self
            .ledger
            .parts()
            .iter()
            .filter(|p| p.is_done())
            .cloned()
            .collect();
        if done.is_empty() {
            return;
        }

        let mut file = match tokio::fs::File::open(&self.local_path).await {
            Ok(f) => f,
            Err(_) => {
                // No local bytes to trust.
                for part in &done {
                    self.ledger.reset(part.index);
                }
                return;
            }
        };
        for part in done {
            let mut buf = vec![0u8; part.length as usize];
            let matches = file.seek(SeekFrom::Start(part.offset)).await.is_ok()
                && file.read_exact(&mut buf).await.is_ok()
                && sha256_hex(&buf) == part.content_hash;
            if !matches {
                debug!(part = part.index, "resume validation failed, re-transferring");
                self.ledger.reset(part.index);
            }
        }
    }

    /// Opens the destination at full size so parts can be written at their
    /// exact offsets in any order.
    async fn prepare_destination(&self) -> Result<(), TransferError> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.local_path)
            .await?;
        file.set_len(self.expected_size).await?;
        Ok(())
    }

    /// Runs part operations with bounded concurrency.
    ///
    /// Completions may arrive in any order; each one is merged through the
    /// ledger and cumulative progress is recomputed from full part state, so
    /// emitted `Update`s never regress. Cancellation stops dispatch at the
    /// next safe point; in-flight operations finish or fail on their own.
    async fn run_pool(&mut self, parts: Vec<Part>, total: u64) -> Result<(), TransferError> {
        let mut queue: VecDeque<Part> = parts.into();
        let mut join_set: JoinSet<Result<Part, TransferError>> = JoinSet::new();
        let mut fatal: Option<TransferError> = None;

        loop {
            while fatal.is_none()
                && !self.cancel.is_cancelled()
                && join_set.len() < self.max_in_flight
                && let Some(part) = queue.pop_front()
            {
                self.ledger.mark_in_flight(part.index);
                self.spawn_part(&mut join_set, part, total);
            }

            let Some(joined) = join_set.join_next().await else {
                break;
            };
            match joined {
                Ok(Ok(done)) => {
                    if self.ledger.merge(done) {
                        let bytes_done = self.ledger.bytes_done();
                        if bytes_done > total {
                            fatal.get_or_insert(TransferError::Overrun {
                                bytes_done,
                                expected: total,
                            });
                            continue;
                        }
                        let _ = self
                            .events
                            .send(TransferEvent::Update {
                                bytes_done,
                                bytes_total: total,
                                ledger: self.ledger.clone(),
                            })
                            .await;
                    }
                }
                Ok(Err(e)) => {
                    // First failure wins; in-flight parts drain on their own.
                    fatal.get_or_insert(e);
                }
                Err(join_err) => {
                    fatal.get_or_insert(TransferError::Worker(join_err.to_string()));
                }
            }
        }

        if let Some(e) = fatal {
            return Err(e);
        }
        if !self.ledger.is_complete() {
            return Err(TransferError::Cancelled);
        }
        Ok(())
    }

    fn spawn_part(
        &self,
        join_set: &mut JoinSet<Result<Part, TransferError>>,
        part: Part,
        total: u64,
    ) {
        let store = Arc::clone(&self.store);
        let container = self.container.clone();
        let key = self.remote_key.clone();
        let path = self.local_path.clone();
        let retry = self.retry.clone();
        let cancel = self.cancel.clone();
        let op = self.op;
        join_set.spawn(async move {
            match op {
                Operation::Download => {
                    download_part(&*store, &container, &key, &path, &part, total, &retry, &cancel)
                        .await
                }
                Operation::Upload => {
                    upload_part(&*store, &container, &key, &path, &part, &retry, &cancel).await
                }
            }
        });
    }
}

/// Retries a transient-failing operation with backoff.
///
/// Non-transient errors propagate immediately; exhausted retries surface as
/// [`TransferError::RetriesExhausted`]. The backoff sleep is a cancellation
/// safe point.
async fn with_retry<V, F, Fut>(
    index: u32,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<V, TransferError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<V, TransportError>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() => {
                if attempt >= policy.max_attempts {
                    return Err(TransferError::RetriesExhausted {
                        index,
                        attempts: attempt,
                        last: e,
                    });
                }
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    part = index,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "part operation failed, retrying"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn download_part<T: Transport>(
    store: &T,
    container: &str,
    key: &str,
    local_path: &Path,
    part: &Part,
    total: u64,
    retry: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<Part, TransferError> {
    let data = with_retry(part.index, retry, cancel, || async move {
        let data = store.get_range(container, key, part.offset, part.length).await?;
        if (data.len() as u64) < part.length {
            // Truncated body; the connection likely dropped mid-read.
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "short range read",
            )));
        }
        Ok(data)
    })
    .await?;

    if data.len() as u64 > part.length {
        // Data-integrity guard: abort before writing past the expected
        // boundary.
        return Err(TransferError::Overrun {
            bytes_done: part.offset + data.len() as u64,
            expected: total,
        });
    }

    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .open(local_path)
        .await?;
    file.seek(SeekFrom::Start(part.offset)).await?;
    file.write_all(&data).await?;

    Ok(part.done(sha256_hex(&data)))
}

async fn upload_part<T: Transport>(
    store: &T,
    container: &str,
    key: &str,
    local_path: &Path,
    part: &Part,
    retry: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<Part, TransferError> {
    let mut file = tokio::fs::File::open(local_path).await?;
    file.seek(SeekFrom::Start(part.offset)).await?;
    let mut data = vec![0u8; part.length as usize];
    file.read_exact(&mut data).await?;

    let block = block_id(part.index);
    let block_ref = block.as_str();
    with_retry(part.index, retry, cancel, || {
        let payload = data.clone();
        async move { store.put_part(container, key, block_ref, payload).await }
    })
    .await?;

    Ok(part.done(sha256_hex(&data)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use blobsync_transport::{MemoryStore, ObjectMeta};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    /// Memory-store wrapper with failure/delay/padding injection and
    /// operation counters.
    #[derive(Clone, Default)]
    struct Hooks {
        /// Delay range reads starting at these offsets.
        get_delay: HashMap<u64, Duration>,
        /// Delay staging of these block IDs.
        put_delay: HashMap<String, Duration>,
        /// Inject 500s into the first N range reads.
        fail_first_gets: u32,
        /// Always fail range reads at this offset.
        fail_gets_at: Option<u64>,
        /// Extra bytes appended to every range read.
        pad: usize,
    }

    #[derive(Clone)]
    struct TestStore {
        inner: MemoryStore,
        hooks: Hooks,
        gets: Arc<AtomicU32>,
        puts: Arc<AtomicU32>,
        injected_failures: Arc<AtomicU32>,
    }

    impl TestStore {
        fn new(inner: MemoryStore, hooks: Hooks) -> Self {
            let injected = hooks.fail_first_gets;
            Self {
                inner,
                hooks,
                gets: Arc::new(AtomicU32::new(0)),
                puts: Arc::new(AtomicU32::new(0)),
                injected_failures: Arc::new(AtomicU32::new(injected)),
            }
        }

        fn plain(inner: MemoryStore) -> Self {
            Self::new(inner, Hooks::default())
        }

        fn server_error() -> TransportError {
            TransportError::Backend {
                status: 500,
                message: "injected".into(),
            }
        }
    }

    impl Transport for TestStore {
        async fn list(&self, container: &str, prefix: &str) -> Result<Vec<String>, TransportError> {
            self.inner.list(container, prefix).await
        }

        async fn metadata(&self, container: &str, key: &str) -> Result<ObjectMeta, TransportError> {
            self.inner.metadata(container, key).await
        }

        async fn get_range(
            &self,
            container: &str,
            key: &str,
            offset: u64,
            length: u64,
        ) -> Result<Vec<u8>, TransportError> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.hooks.get_delay.get(&offset) {
                tokio::time::sleep(*delay).await;
            }
            if self.hooks.fail_gets_at == Some(offset) {
                return Err(Self::server_error());
            }
            let take_failure = self
                .injected_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
                .is_ok();
            if take_failure {
                return Err(Self::server_error());
            }
            let mut data = self.inner.get_range(container, key, offset, length).await?;
            data.extend(std::iter::repeat_n(0u8, self.hooks.pad));
            Ok(data)
        }

        async fn put_part(
            &self,
            container: &str,
            key: &str,
            block_id: &str,
            data: Vec<u8>,
        ) -> Result<(), TransportError> {
            self.puts.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.hooks.put_delay.get(block_id) {
                tokio::time::sleep(*delay).await;
            }
            self.inner.put_part(container, key, block_id, data).await
        }

        async fn commit_parts(
            &self,
            container: &str,
            key: &str,
            block_ids: &[String],
        ) -> Result<(), TransportError> {
            self.inner.commit_parts(container, key, block_ids).await
        }

        async fn delete(&self, container: &str, key: &str) -> Result<(), TransportError> {
            self.inner.delete(container, key).await
        }

        fn sign_temporary_url(
            &self,
            container: &str,
            key: &str,
            ttl: Duration,
        ) -> Result<String, TransportError> {
            self.inner.sign_temporary_url(container, key, ttl)
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_factor: 2.0,
        }
    }

    fn object_30() -> Vec<u8> {
        (0u8..30).collect()
    }

    async fn drain(mut rx: mpsc::Receiver<TransferEvent>) -> Vec<TransferEvent> {
        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }
        events
    }

    fn updates(events: &[TransferEvent]) -> Vec<u64> {
        events
            .iter()
            .filter_map(|e| match e {
                TransferEvent::Update { bytes_done, .. } => Some(*bytes_done),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn download_reports_monotonic_progress_across_out_of_order_completions() {
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("obj.bin");

        let mem = MemoryStore::new();
        mem.put_object("c", "obj", object_30());
        // Force completion order [1, 0, 2]: delay part 0 a little, part 2 more.
        let store = TestStore::new(
            mem,
            Hooks {
                get_delay: HashMap::from([
                    (0u64, Duration::from_millis(30)),
                    (20u64, Duration::from_millis(60)),
                ]),
                ..Hooks::default()
            },
        );

        let (tx, rx) = mpsc::channel(crate::EVENT_CHANNEL_CAPACITY);
        let req = TransferRequest::new(
            Operation::Download,
            Arc::new(store),
            "c",
            "obj",
            &local,
            30,
            tx,
        )
        .with_part_size(10)
        .with_max_in_flight(3)
        .with_retry(fast_retry());

        let state = req.run().await;
        assert_eq!(state, RequestState::Done);

        let events = drain(rx).await;
        assert_eq!(updates(&events), vec![10, 20, 30]);
        match events.last().unwrap() {
            TransferEvent::Done { final_size, .. } => assert_eq!(*final_size, 30),
            other => panic!("expected Done, got {other:?}"),
        }
        assert_eq!(std::fs::read(&local).unwrap(), object_30());
    }

    #[tokio::test]
    async fn resume_issues_exactly_one_operation_for_the_missing_part() {
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("obj.bin");
        let data = object_30();

        // Local file already holds the first two parts.
        let mut seeded = data.clone();
        seeded[20..].fill(0);
        std::fs::write(&local, &seeded).unwrap();

        let mut ledger = PartLedger::new();
        ledger.plan(30, 10);
        ledger.merge(Part::pending(0, 0, 10).done(sha256_hex(&data[0..10])));
        ledger.merge(Part::pending(1, 10, 10).done(sha256_hex(&data[10..20])));

        let mem = MemoryStore::new();
        mem.put_object("c", "obj", data.clone());
        let store = TestStore::plain(mem);
        let gets = Arc::clone(&store.gets);

        let (tx, rx) = mpsc::channel(crate::EVENT_CHANNEL_CAPACITY);
        let req = TransferRequest::new(
            Operation::Download,
            Arc::new(store),
            "c",
            "obj",
            &local,
            30,
            tx,
        )
        .with_part_size(10)
        .with_ledger(ledger)
        .with_retry(fast_retry());

        assert_eq!(req.run().await, RequestState::Done);
        assert_eq!(gets.load(Ordering::SeqCst), 1);
        assert_eq!(updates(&drain(rx).await), vec![30]);
        assert_eq!(std::fs::read(&local).unwrap(), data);
    }

    #[tokio::test]
    async fn failed_run_resumes_to_identical_bytes() {
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("obj.bin");
        let data = object_30();

        // First run: part 2 keeps failing until retries run out.
        let mem = MemoryStore::new();
        mem.put_object("c", "obj", data.clone());
        let store = TestStore::new(
            mem.clone(),
            Hooks {
                fail_gets_at: Some(20),
                ..Hooks::default()
            },
        );

        let (tx, rx) = mpsc::channel(crate::EVENT_CHANNEL_CAPACITY);
        let req = TransferRequest::new(
            Operation::Download,
            Arc::new(store),
            "c",
            "obj",
            &local,
            30,
            tx,
        )
        .with_part_size(10)
        .with_retry(fast_retry());
        assert_eq!(req.run().await, RequestState::Failed);

        // The last update snapshot is what an orchestrator would persist.
        let events = drain(rx).await;
        let persisted = events
            .iter()
            .rev()
            .find_map(|e| match e {
                TransferEvent::Update { ledger, .. } => Some(ledger.clone()),
                _ => None,
            })
            .expect("parts 0 and 1 completed");
        assert_eq!(persisted.bytes_done(), 20);
        assert!(matches!(
            events.last().unwrap(),
            TransferEvent::Error {
                cause: TransferError::RetriesExhausted { index: 2, .. }
            }
        ));

        // Second run from the persisted ledger, against a healthy store.
        let store = TestStore::plain(mem);
        let gets = Arc::clone(&store.gets);
        let (tx, rx) = mpsc::channel(crate::EVENT_CHANNEL_CAPACITY);
        let req = TransferRequest::new(
            Operation::Download,
            Arc::new(store),
            "c",
            "obj",
            &local,
            30,
            tx,
        )
        .with_part_size(10)
        .with_ledger(persisted)
        .with_retry(fast_retry());
        assert_eq!(req.run().await, RequestState::Done);
        assert_eq!(gets.load(Ordering::SeqCst), 1);
        drain(rx).await;

        assert_eq!(std::fs::read(&local).unwrap(), data);
    }

    #[tokio::test]
    async fn oversized_range_read_aborts_with_overrun() {
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("obj.bin");

        let mem = MemoryStore::new();
        mem.put_object("c", "obj", object_30());
        let store = TestStore::new(
            mem,
            Hooks {
                pad: 1,
                ..Hooks::default()
            },
        );

        let (tx, rx) = mpsc::channel(crate::EVENT_CHANNEL_CAPACITY);
        let req = TransferRequest::new(
            Operation::Download,
            Arc::new(store),
            "c",
            "obj",
            &local,
            30,
            tx,
        )
        .with_part_size(10)
        .with_retry(fast_retry());

        assert_eq!(req.run().await, RequestState::Failed);
        let events = drain(rx).await;
        assert!(updates(&events).is_empty());
        assert!(matches!(
            events.last().unwrap(),
            TransferEvent::Error {
                cause: TransferError::Overrun { .. }
            }
        ));
        // Nothing was written: the destination is still all zeroes.
        assert!(std::fs::read(&local).unwrap().iter().all(|b| *b == 0));
    }

    #[tokio::test]
    async fn size_mismatch_is_fatal_before_any_part_io() {
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("obj.bin");

        let mem = MemoryStore::new();
        mem.put_object("c", "obj", object_30());
        let store = TestStore::plain(mem);
        let gets = Arc::clone(&store.gets);

        let (tx, rx) = mpsc::channel(crate::EVENT_CHANNEL_CAPACITY);
        let req = TransferRequest::new(
            Operation::Download,
            Arc::new(store),
            "c",
            "obj",
            &local,
            31,
            tx,
        )
        .with_part_size(10);

        assert_eq!(req.run().await, RequestState::Failed);
        assert_eq!(gets.load(Ordering::SeqCst), 0);
        let events = drain(rx).await;
        assert!(matches!(
            events.last().unwrap(),
            TransferEvent::Error {
                cause: TransferError::SizeMismatch {
                    expected: 31,
                    actual: 30
                }
            }
        ));
        // The destination file was never created.
        assert!(!local.exists());
    }

    #[tokio::test]
    async fn missing_remote_object_surfaces_not_found() {
        let dir = TempDir::new().unwrap();
        let store = TestStore::plain(MemoryStore::new());

        let (tx, rx) = mpsc::channel(crate::EVENT_CHANNEL_CAPACITY);
        let req = TransferRequest::new(
            Operation::Download,
            Arc::new(store),
            "c",
            "missing",
            dir.path().join("out.bin"),
            10,
            tx,
        );

        assert_eq!(req.run().await, RequestState::Failed);
        let events = drain(rx).await;
        assert!(matches!(
            events.last().unwrap(),
            TransferEvent::Error {
                cause: TransferError::Transport(TransportError::NotFound)
            }
        ));
    }

    #[tokio::test]
    async fn upload_commits_in_index_order_for_any_staging_order() {
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("src.bin");
        let data: Vec<u8> = (0u8..25).collect();
        std::fs::write(&local, &data).unwrap();

        let mem = MemoryStore::new();
        // Delay part 0 so staging completes out of index order.
        let store = TestStore::new(
            mem.clone(),
            Hooks {
                put_delay: HashMap::from([(block_id(0), Duration::from_millis(40))]),
                ..Hooks::default()
            },
        );

        let (tx, rx) = mpsc::channel(crate::EVENT_CHANNEL_CAPACITY);
        let req = TransferRequest::new(
            Operation::Upload,
            Arc::new(store),
            "c",
            "obj",
            &local,
            25,
            tx,
        )
        .with_part_size(10)
        .with_max_in_flight(3)
        .with_retry(fast_retry());

        assert_eq!(req.run().await, RequestState::Done);
        let events = drain(rx).await;
        let progress = updates(&events);
        assert_eq!(progress.last(), Some(&25));
        assert!(progress.windows(2).all(|w| w[0] <= w[1]), "{progress:?}");

        // Assembled in index order despite staging order.
        assert_eq!(mem.object("c", "obj").unwrap(), data);
        assert_eq!(mem.staged_blocks("c", "obj"), 0);
    }

    #[tokio::test]
    async fn upload_resume_stages_only_missing_parts() {
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("src.bin");
        let data = object_30();
        std::fs::write(&local, &data).unwrap();

        let mem = MemoryStore::new();
        // Blocks 0 and 1 are already staged remotely from a previous run.
        mem.put_part("c", "obj", &block_id(0), data[0..10].to_vec())
            .await
            .unwrap();
        mem.put_part("c", "obj", &block_id(1), data[10..20].to_vec())
            .await
            .unwrap();

        let mut ledger = PartLedger::new();
        ledger.plan(30, 10);
        ledger.merge(Part::pending(0, 0, 10).done(sha256_hex(&data[0..10])));
        ledger.merge(Part::pending(1, 10, 10).done(sha256_hex(&data[10..20])));

        let store = TestStore::plain(mem.clone());
        let puts = Arc::clone(&store.puts);

        let (tx, rx) = mpsc::channel(crate::EVENT_CHANNEL_CAPACITY);
        let req = TransferRequest::new(
            Operation::Upload,
            Arc::new(store),
            "c",
            "obj",
            &local,
            30,
            tx,
        )
        .with_part_size(10)
        .with_ledger(ledger)
        .with_retry(fast_retry());

        assert_eq!(req.run().await, RequestState::Done);
        assert_eq!(puts.load(Ordering::SeqCst), 1);
        drain(rx).await;
        assert_eq!(mem.object("c", "obj").unwrap(), data);
    }

    #[tokio::test]
    async fn commit_with_lost_blocks_fails_and_keeps_ledger_state() {
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("src.bin");
        let data = object_30();
        std::fs::write(&local, &data).unwrap();

        // Ledger claims parts 0 and 1 were staged, but the store has no
        // record of them (lost blocks).
        let mut ledger = PartLedger::new();
        ledger.plan(30, 10);
        ledger.merge(Part::pending(0, 0, 10).done(sha256_hex(&data[0..10])));
        ledger.merge(Part::pending(1, 10, 10).done(sha256_hex(&data[10..20])));

        let store = TestStore::plain(MemoryStore::new());
        let (tx, rx) = mpsc::channel(crate::EVENT_CHANNEL_CAPACITY);
        let req = TransferRequest::new(
            Operation::Upload,
            Arc::new(store),
            "c",
            "obj",
            &local,
            30,
            tx,
        )
        .with_part_size(10)
        .with_ledger(ledger)
        .with_retry(fast_retry());

        assert_eq!(req.run().await, RequestState::Failed);
        let events = drain(rx).await;
        match events.last().unwrap() {
            TransferEvent::Error {
                cause: TransferError::Transport(TransportError::IncompleteParts { missing }),
            } => {
                assert_eq!(missing.len(), 2);
            }
            other => panic!("expected IncompleteParts, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_any_part_io() {
        let dir = TempDir::new().unwrap();
        let mem = MemoryStore::new();
        mem.put_object("c", "obj", object_30());
        let store = TestStore::plain(mem);
        let gets = Arc::clone(&store.gets);

        let cancel = CancellationToken::new();
        cancel.cancel();

        let (tx, rx) = mpsc::channel(crate::EVENT_CHANNEL_CAPACITY);
        let req = TransferRequest::new(
            Operation::Download,
            Arc::new(store),
            "c",
            "obj",
            dir.path().join("out.bin"),
            30,
            tx,
        )
        .with_cancel(cancel);

        assert_eq!(req.run().await, RequestState::Cancelled);
        assert_eq!(gets.load(Ordering::SeqCst), 0);
        let events = drain(rx).await;
        assert!(matches!(
            events.last().unwrap(),
            TransferEvent::Error {
                cause: TransferError::Cancelled
            }
        ));
    }

    #[tokio::test]
    async fn transient_failures_are_retried_to_success() {
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("obj.bin");
        let mem = MemoryStore::new();
        mem.put_object("c", "obj", object_30());
        let store = TestStore::new(
            mem,
            Hooks {
                fail_first_gets: 2,
                ..Hooks::default()
            },
        );
        let gets = Arc::clone(&store.gets);

        let (tx, rx) = mpsc::channel(crate::EVENT_CHANNEL_CAPACITY);
        let req = TransferRequest::new(
            Operation::Download,
            Arc::new(store),
            "c",
            "obj",
            &local,
            30,
            tx,
        )
        .with_part_size(10)
        .with_retry(fast_retry());

        assert_eq!(req.run().await, RequestState::Done);
        // 3 parts + 2 retried failures.
        assert_eq!(gets.load(Ordering::SeqCst), 5);
        drain(rx).await;
        assert_eq!(std::fs::read(&local).unwrap(), object_30());
    }

    #[tokio::test]
    async fn range_unsupported_falls_back_to_whole_object() {
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("obj.bin");
        let mem = MemoryStore::without_range_support();
        mem.put_object("c", "obj", object_30());
        let store = TestStore::plain(mem);

        let (tx, rx) = mpsc::channel(crate::EVENT_CHANNEL_CAPACITY);
        let req = TransferRequest::new(
            Operation::Download,
            Arc::new(store),
            "c",
            "obj",
            &local,
            30,
            tx,
        )
        .with_part_size(10)
        .with_retry(fast_retry());

        assert_eq!(req.run().await, RequestState::Done);
        let events = drain(rx).await;
        assert_eq!(updates(&events).last(), Some(&30));
        assert_eq!(std::fs::read(&local).unwrap(), object_30());
    }

    #[tokio::test]
    async fn zero_byte_object_completes_without_part_operations() {
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("empty.bin");
        let mem = MemoryStore::new();
        mem.put_object("c", "obj", Vec::new());
        let store = TestStore::plain(mem);
        let gets = Arc::clone(&store.gets);

        let (tx, rx) = mpsc::channel(crate::EVENT_CHANNEL_CAPACITY);
        let req = TransferRequest::new(
            Operation::Download,
            Arc::new(store),
            "c",
            "obj",
            &local,
            0,
            tx,
        );

        assert_eq!(req.run().await, RequestState::Done);
        assert_eq!(gets.load(Ordering::SeqCst), 0);
        let events = drain(rx).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            TransferEvent::Done { final_size: 0, .. }
        ));
        assert!(std::fs::read(&local).unwrap().is_empty());
    }

    #[test]
    fn block_ids_are_deterministic_and_distinct() {
        assert_eq!(block_id(0), block_id(0));
        assert_ne!(block_id(0), block_id(1));
        let decoded = BASE64.decode(block_id(7)).unwrap();
        assert_eq!(decoded, b"part-00000007");
    }
}
