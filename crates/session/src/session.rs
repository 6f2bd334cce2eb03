use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use blobsync_engine::{
    DEFAULT_MAX_IN_FLIGHT, DEFAULT_PART_SIZE, EVENT_CHANNEL_CAPACITY, Operation, RetryPolicy,
    TransferEvent, TransferRequest,
};
use blobsync_ledger::{PartLedger, progress_path};
use blobsync_transport::Transport;

use crate::trace::{NoopTrace, TraceObserver};
use crate::SessionError;

/// Parameters for one object transfer.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub container: String,
    pub remote_key: String,
    pub local_path: PathBuf,
    pub expected_size: u64,
    pub part_size: u64,
    pub max_in_flight: usize,
    pub retry: RetryPolicy,
}

impl SessionConfig {
    pub fn new(
        container: impl Into<String>,
        remote_key: impl Into<String>,
        local_path: impl Into<PathBuf>,
        expected_size: u64,
    ) -> Self {
        Self {
            container: container.into(),
            remote_key: remote_key.into(),
            local_path: local_path.into(),
            expected_size,
            part_size: DEFAULT_PART_SIZE,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            retry: RetryPolicy::default(),
        }
    }
}

/// Result of a completed transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    pub local_path: PathBuf,
    pub final_size: u64,
}

/// Drives one transfer request to completion.
///
/// The sidecar ledger file is only ever written here, serializing writers by
/// construction: one session owns one object transfer at a time. The on-disk
/// ledger outlives terminal states until [`clear_ledger`](Self::clear_ledger)
/// is called, so a crashed-and-restarted session can resume.
pub struct Session<T: Transport + 'static> {
    id: String,
    store: Arc<T>,
    config: SessionConfig,
    cancel: CancellationToken,
    trace: Arc<dyn TraceObserver>,
}

impl<T: Transport + 'static> Session<T> {
    pub fn new(store: Arc<T>, config: SessionConfig) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            store,
            config,
            cancel: CancellationToken::new(),
            trace: Arc::new(NoopTrace),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn with_trace(mut self, trace: Arc<dyn TraceObserver>) -> Self {
        self.trace = trace;
        self
    }

    /// Requests cooperative cancellation of the running transfer.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Handle for cancelling from another task (e.g. a signal handler).
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs one transfer, persisting resume state as it progresses.
    pub async fn run(&mut self, op: Operation) -> Result<SessionOutcome, SessionError> {
        let ledger_path = progress_path(&self.config.local_path);
        let ledger = PartLedger::load(&ledger_path);
        let mut last_persisted = ledger.fingerprint();
        info!(
            session = %self.id,
            container = %self.config.container,
            key = %self.config.remote_key,
            resumed_bytes = ledger.bytes_done(),
            "session starting"
        );

        let (events_tx, mut events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let request = TransferRequest::new(
            op,
            Arc::clone(&self.store),
            &self.config.container,
            &self.config.remote_key,
            &self.config.local_path,
            self.config.expected_size,
            events_tx,
        )
        .with_part_size(self.config.part_size)
        .with_max_in_flight(self.config.max_in_flight)
        .with_retry(self.config.retry.clone())
        .with_ledger(ledger)
        .with_cancel(self.cancel.clone());

        let transfer = tokio::spawn(request.run());

        let mut terminal = None;
        while let Some(event) = events_rx.recv().await {
            match event {
                TransferEvent::Update {
                    bytes_done,
                    bytes_total,
                    ledger,
                } => {
                    debug!(bytes_done, bytes_total, "progress");
                    let fingerprint = ledger.fingerprint();
                    if fingerprint != last_persisted {
                        match ledger.save(&ledger_path) {
                            Ok(()) => last_persisted = fingerprint,
                            Err(e) => {
                                warn!(path = %ledger_path.display(), error = %e, "ledger persist failed")
                            }
                        }
                    }
                    self.trace.capture("transfer-progress");
                }
                event => terminal = Some(event),
            }
        }

        let final_state = transfer
            .await
            .map_err(|e| SessionError::Worker(e.to_string()))?;
        debug!(state = ?final_state, "transfer task finished");

        match terminal {
            Some(TransferEvent::Done {
                local_path,
                final_size,
            }) => {
                self.trace.capture("transfer-done");
                info!(path = %local_path.display(), final_size, "session done");
                Ok(SessionOutcome {
                    local_path,
                    final_size,
                })
            }
            Some(TransferEvent::Error { cause }) => {
                self.trace.capture("transfer-error");
                Err(SessionError::Transfer(cause))
            }
            Some(TransferEvent::Update { .. }) | None => Err(SessionError::MissingTerminal),
        }
    }

    /// Removes the persisted ledger, abandoning resume state.
    pub fn clear_ledger(&self) -> Result<(), SessionError> {
        let path = progress_path(&self.config.local_path);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SessionError::Ledger(e.into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blobsync_engine::TransferError;
    use blobsync_transport::{MemoryStore, ObjectMeta, TransportError};
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    struct RecordingTrace {
        labels: Mutex<Vec<String>>,
    }

    impl RecordingTrace {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                labels: Mutex::new(Vec::new()),
            })
        }

        fn labels(&self) -> Vec<String> {
            self.labels.lock().unwrap().clone()
        }
    }

    impl TraceObserver for RecordingTrace {
        fn capture(&self, label: &str) {
            self.labels.lock().unwrap().push(label.to_string());
        }
    }

    /// Memory-store wrapper that always fails range reads at one offset.
    #[derive(Clone)]
    struct FlakyStore {
        inner: MemoryStore,
        fail_at: u64,
    }

    impl Transport for FlakyStore {
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
            if offset == self.fail_at {
                return Err(TransportError::Backend {
                    status: 500,
                    message: "injected".into(),
                });
            }
            self.inner.get_range(container, key, offset, length).await
        }

        async fn put_part(
            &self,
            container: &str,
            key: &str,
            block_id: &str,
            data: Vec<u8>,
        ) -> Result<(), TransportError> {
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
            max_attempts: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_factor: 2.0,
        }
    }

    fn object_30() -> Vec<u8> {
        (0u8..30).collect()
    }

    fn config(local: &std::path::Path, expected: u64) -> SessionConfig {
        let mut config = SessionConfig::new("c", "obj", local, expected);
        config.part_size = 10;
        config.retry = fast_retry();
        config
    }

    #[tokio::test]
    async fn download_session_persists_ledger_and_clears_on_request() {
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("obj.bin");
        let mem = MemoryStore::new();
        mem.put_object("c", "obj", object_30());

        let trace = RecordingTrace::new();
        let mut session = Session::new(Arc::new(mem), config(&local, 30))
            .with_trace(Arc::clone(&trace) as Arc<dyn TraceObserver>);

        let outcome = session.run(Operation::Download).await.unwrap();
        assert_eq!(outcome.final_size, 30);
        assert_eq!(outcome.local_path, local);
        assert_eq!(std::fs::read(&local).unwrap(), object_30());

        // Sidecar retained after completion, fully populated.
        let sidecar = progress_path(&local);
        assert!(sidecar.exists());
        let persisted = PartLedger::load(&sidecar);
        assert!(persisted.is_complete());
        assert_eq!(persisted.bytes_done(), 30);

        // Trace observer saw progress and the terminal event.
        let labels = trace.labels();
        assert!(labels.contains(&"transfer-progress".to_string()));
        assert_eq!(labels.last().unwrap(), "transfer-done");

        session.clear_ledger().unwrap();
        assert!(!sidecar.exists());
        // Clearing twice is fine.
        session.clear_ledger().unwrap();
    }

    #[tokio::test]
    async fn interrupted_session_resumes_from_sidecar() {
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("obj.bin");
        let data = object_30();
        let mem = MemoryStore::new();
        mem.put_object("c", "obj", data.clone());

        // First session: part at offset 20 never succeeds.
        let flaky = FlakyStore {
            inner: mem.clone(),
            fail_at: 20,
        };
        let mut session = Session::new(Arc::new(flaky), config(&local, 30));
        let err = session.run(Operation::Download).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Transfer(TransferError::RetriesExhausted { index: 2, .. })
        ));

        // Partial progress survived in the sidecar.
        let persisted = PartLedger::load(&progress_path(&local));
        assert_eq!(persisted.bytes_done(), 20);

        // Second session against a healthy backend finishes the object.
        let mut session = Session::new(Arc::new(mem), config(&local, 30));
        let outcome = session.run(Operation::Download).await.unwrap();
        assert_eq!(outcome.final_size, 30);
        assert_eq!(std::fs::read(&local).unwrap(), data);
    }

    #[tokio::test]
    async fn failure_before_progress_leaves_no_sidecar() {
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("obj.bin");

        let mut session = Session::new(Arc::new(MemoryStore::new()), config(&local, 30));
        let err = session.run(Operation::Download).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Transfer(TransferError::Transport(TransportError::NotFound))
        ));
        assert!(!progress_path(&local).exists());
    }

    #[tokio::test]
    async fn upload_session_roundtrip() {
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("src.bin");
        let data: Vec<u8> = (0u8..25).collect();
        std::fs::write(&local, &data).unwrap();

        let mem = MemoryStore::new();
        let mut session = Session::new(Arc::new(mem.clone()), config(&local, 25));
        let outcome = session.run(Operation::Upload).await.unwrap();
        assert_eq!(outcome.final_size, 25);
        assert_eq!(mem.object("c", "obj").unwrap(), data);

        let persisted = PartLedger::load(&progress_path(&local));
        assert!(persisted.is_complete());
    }

    #[tokio::test]
    async fn cancelled_session_surfaces_cancellation() {
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("obj.bin");
        let mem = MemoryStore::new();
        mem.put_object("c", "obj", object_30());

        let mut session = Session::new(Arc::new(mem), config(&local, 30));
        session.cancel();
        let err = session.run(Operation::Download).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Transfer(TransferError::Cancelled)
        ));
    }
}
