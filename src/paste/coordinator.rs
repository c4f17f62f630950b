//! Transfer coordination: the synchronous submit path and the background
//! job pipeline.
//!
//! [`TransferCoordinator::submit`] is the engine's front door. It resolves
//! the terminal's context, computes the destination path and returns it
//! without touching the network; everything slow happens afterwards, in a
//! bounded pool of worker tasks that move [`TransferJob`]s through
//! `Queued -> Probing -> Uploading -> Completed`, with retry-with-backoff on
//! transient failures and an immediate abort on permanent ones.
//!
//! Two shared indexes keep the pipeline honest: the dedup cache remembers
//! which `(identity, hash)` pairs are already delivered, and the in-flight
//! index coalesces a repeated submission onto the active job instead of
//! starting a duplicate upload. At most one transfer is ever active for a
//! given pair.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Local;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::paste::config::{EngineConfig, MAX_RETRY_DELAY};
use crate::paste::dedup::DedupCache;
use crate::paste::error::{SubmitError, TransferError};
use crate::paste::payload::{ImagePayload, join_root};
use crate::paste::pool::ConnectionPool;
use crate::paste::resolver::ContextResolver;
use crate::paste::types::{
    CompletionEvent, JobKey, JobState, TerminalContext, TransferJob, TransferOutcome,
};

/// Completion events buffered per subscriber before old ones are dropped.
const EVENT_CHANNEL_CAPACITY: usize = 64;

struct CoordinatorInner {
    config: EngineConfig,
    resolver: Arc<ContextResolver>,
    dedup: Arc<DedupCache>,
    pool: Arc<ConnectionPool>,
    /// Destination path of the active job per `(identity, hash)` pair.
    in_flight: DashMap<JobKey, String>,
    job_tx: mpsc::UnboundedSender<TransferJob>,
    events_tx: broadcast::Sender<CompletionEvent>,
    token: CancellationToken,
}

/// Orchestrates context resolution, path computation and background
/// transfers.
pub struct TransferCoordinator {
    inner: Arc<CoordinatorInner>,
    job_rx: Arc<Mutex<mpsc::UnboundedReceiver<TransferJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl TransferCoordinator {
    pub fn new(
        config: EngineConfig,
        resolver: Arc<ContextResolver>,
        dedup: Arc<DedupCache>,
        pool: Arc<ConnectionPool>,
    ) -> Self {
        let (job_tx, job_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(CoordinatorInner {
                config,
                resolver,
                dedup,
                pool,
                in_flight: DashMap::new(),
                job_tx,
                events_tx,
                token: CancellationToken::new(),
            }),
            job_rx: Arc::new(Mutex::new(job_rx)),
            workers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Spawn the worker pool and the pool's idle sweeper. Idempotent.
    ///
    /// Jobs submitted before `start` simply wait in the queue.
    pub async fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut workers = self.workers.lock().await;
        for worker_id in 0..self.inner.config.worker_count {
            let inner = Arc::clone(&self.inner);
            let job_rx = Arc::clone(&self.job_rx);
            workers.push(tokio::spawn(worker_loop(worker_id, inner, job_rx)));
        }
        workers.push(
            Arc::clone(&self.inner.pool).spawn_sweeper(self.inner.token.child_token()),
        );

        info!(
            workers = self.inner.config.worker_count,
            "Transfer coordinator started"
        );
    }

    /// Accept a pasted image and return its destination path immediately.
    ///
    /// Never blocks on network I/O: context resolution is cache-backed and
    /// the transfer itself is queued for the background workers. The
    /// returned path is a reservation, not a confirmation; for a remote
    /// context the matching [`CompletionEvent`] reports whether the bytes
    /// arrived.
    ///
    /// The only synchronous rejection is a payload over the configured size
    /// limit, refused here so the caller never holds a path that cannot be
    /// honored.
    pub fn submit(
        &self,
        payload: ImagePayload,
        terminal_pid: u32,
    ) -> Result<String, SubmitError> {
        let inner = &self.inner;

        if payload.len() > inner.config.max_payload_bytes {
            return Err(SubmitError::PayloadTooLarge {
                size: payload.len(),
                limit: inner.config.max_payload_bytes,
            });
        }

        let now = Local::now();
        let target = match inner.resolver.resolve(terminal_pid) {
            TerminalContext::Local => {
                // Local pastes need no transfer; the filesystem collaborator
                // writes the bytes to the returned path.
                let path = join_root(&inner.config.local_temp_dir, &payload.file_name(now));
                debug!(pid = terminal_pid, path, "Local context, no transfer queued");
                return Ok(path);
            }
            TerminalContext::Remote(target) => target,
        };

        let key = JobKey::new(target.identity.clone(), payload.content_hash());

        // Already delivered: hand back the exact path that was confirmed.
        if let Some(existing) = inner.dedup.confirmed_path(&key) {
            debug!(identity = %key.identity, "Content already confirmed on remote");
            return Ok(existing);
        }

        let destination = join_root(&inner.config.remote_temp_dir, &payload.file_name(now));

        match inner.in_flight.entry(key) {
            // A transfer of this content to this identity is active;
            // coalesce onto it instead of uploading twice.
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                entry.insert(destination.clone());
                let job = TransferJob::new(target, payload, destination.clone());
                info!(
                    job_id = %job.id,
                    identity = %job.target.identity,
                    destination = %job.destination,
                    "Transfer queued"
                );
                if inner.job_tx.send(job).is_err() {
                    warn!("Transfer queue closed; job dropped during shutdown");
                }
                Ok(destination)
            }
        }
    }

    /// Subscribe to job completion events.
    pub fn subscribe(&self) -> broadcast::Receiver<CompletionEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Stop the workers, report still-queued jobs as cancelled and close
    /// every pooled connection.
    pub async fn shutdown(&self) {
        self.inner.token.cancel();

        let handles: Vec<JoinHandle<()>> = self.workers.lock().await.drain(..).collect();
        futures::future::join_all(handles).await;

        // Jobs that never reached a worker still owe their completion
        // event.
        let mut job_rx = self.job_rx.lock().await;
        while let Ok(job) = job_rx.try_recv() {
            self.inner
                .finish(
                    job,
                    TransferOutcome::Failed,
                    Some(TransferError::Cancelled.to_string()),
                )
                .await;
        }

        self.inner.pool.close_all().await;
        info!("Transfer coordinator stopped");
    }

    #[cfg(test)]
    pub(crate) fn in_flight_len(&self) -> usize {
        self.inner.in_flight.len()
    }
}

async fn worker_loop(
    worker_id: usize,
    inner: Arc<CoordinatorInner>,
    job_rx: Arc<Mutex<mpsc::UnboundedReceiver<TransferJob>>>,
) {
    debug!(worker_id, "Transfer worker started");
    loop {
        let job = {
            let mut rx = job_rx.lock().await;
            tokio::select! {
                _ = inner.token.cancelled() => break,
                job = rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            }
        };
        Arc::clone(&inner).process(job).await;
    }
    debug!(worker_id, "Transfer worker stopped");
}

impl CoordinatorInner {
    /// Run one processing attempt of a job to a terminal state or back into
    /// the queue.
    async fn process(self: Arc<Self>, mut job: TransferJob) {
        job.attempts += 1;
        job.state = JobState::Probing;
        let key = job.key();
        debug!(job_id = %job.id, attempt = job.attempts, "Probing destination");

        // The cache can only vouch for the exact path this job promised.
        if self.dedup.confirmed_path(&key).as_deref() == Some(job.destination.as_str()) {
            self.finish(job, TransferOutcome::Skipped, None).await;
            return;
        }

        let result = tokio::select! {
            _ = self.token.cancelled() => Err(TransferError::Cancelled),
            result = self.transfer(&mut job) => result,
        };

        match result {
            Ok(outcome) => {
                self.dedup.mark_confirmed(key, job.destination.clone());
                self.finish(job, outcome, None).await;
            }
            Err(error) if error.is_retryable() && job.attempts < self.config.max_attempts => {
                job.state = JobState::Failed;
                warn!(
                    job_id = %job.id,
                    attempt = job.attempts,
                    error = %error,
                    "Transfer failed, will retry"
                );
                self.requeue_with_backoff(job);
            }
            Err(error) => {
                job.state = JobState::Aborted;
                self.finish(job, TransferOutcome::Failed, Some(error.to_string()))
                    .await;
            }
        }
    }

    /// Probe the destination and upload when it is absent. Every exit path
    /// returns the connection to the pool or discards it.
    async fn transfer(&self, job: &mut TransferJob) -> Result<TransferOutcome, TransferError> {
        let conn = self.pool.acquire(&job.target).await?;

        let probe = tokio::time::timeout(
            self.config.probe_timeout(),
            conn.transport().exists(&job.destination),
        )
        .await;

        match probe {
            Ok(Ok(Some(size))) if size == job.payload.len() => {
                info!(
                    job_id = %job.id,
                    destination = %job.destination,
                    "Destination already holds the content, skipping upload"
                );
                self.pool.release(conn).await;
                return Ok(TransferOutcome::Skipped);
            }
            // Absent, or a stale file of another size: upload over it.
            Ok(Ok(_)) => {}
            Ok(Err(error)) => {
                self.pool.discard(conn).await;
                return Err(error);
            }
            Err(_) => {
                self.pool.discard(conn).await;
                return Err(TransferError::Timeout(format!(
                    "Existence probe for {} timed out after {:?}",
                    job.destination,
                    self.config.probe_timeout()
                )));
            }
        }

        job.state = JobState::Uploading;
        debug!(job_id = %job.id, bytes = job.payload.len(), "Uploading");

        let upload = tokio::time::timeout(
            self.config.transfer_timeout(),
            conn.transport().upload(&job.destination, job.payload.bytes()),
        )
        .await;

        match upload {
            Ok(Ok(())) => {
                self.pool.release(conn).await;
                Ok(TransferOutcome::Uploaded)
            }
            Ok(Err(error)) => {
                self.pool.discard(conn).await;
                Err(error)
            }
            Err(_) => {
                self.pool.discard(conn).await;
                Err(TransferError::Timeout(format!(
                    "Upload to {} timed out after {:?}",
                    job.destination,
                    self.config.transfer_timeout()
                )))
            }
        }
    }

    /// Put a failed job back in the queue after its backoff delay.
    fn requeue_with_backoff(self: Arc<Self>, mut job: TransferJob) {
        let delay = self.retry_delay_for(job.attempts);
        let inner = self;
        tokio::spawn(async move {
            tokio::select! {
                _ = inner.token.cancelled() => {
                    inner
                        .finish(
                            job,
                            TransferOutcome::Failed,
                            Some(TransferError::Cancelled.to_string()),
                        )
                        .await;
                }
                _ = tokio::time::sleep(delay) => {
                    if inner.token.is_cancelled() {
                        inner
                            .finish(
                                job,
                                TransferOutcome::Failed,
                                Some(TransferError::Cancelled.to_string()),
                            )
                            .await;
                        return;
                    }
                    job.state = JobState::Queued;
                    if inner.job_tx.send(job).is_err() {
                        warn!("Transfer queue closed before a retry could be enqueued");
                    }
                }
            }
        });
    }

    /// Exponential backoff from the configured initial delay, capped.
    fn retry_delay_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(10);
        self.config
            .retry_delay()
            .saturating_mul(1u32 << exponent)
            .min(MAX_RETRY_DELAY)
    }

    /// Move a job to its terminal state and emit the completion event.
    async fn finish(&self, mut job: TransferJob, outcome: TransferOutcome, reason: Option<String>) {
        job.state = match outcome {
            TransferOutcome::Failed => JobState::Aborted,
            _ => JobState::Completed,
        };
        self.in_flight.remove(&job.key());

        match outcome {
            TransferOutcome::Failed => warn!(
                job_id = %job.id,
                destination = %job.destination,
                attempts = job.attempts,
                reason = reason.as_deref().unwrap_or("unknown"),
                "Transfer aborted"
            ),
            _ => info!(
                job_id = %job.id,
                destination = %job.destination,
                outcome = %outcome,
                "Transfer finished"
            ),
        }

        let event = CompletionEvent {
            job_id: job.id,
            destination: job.destination,
            identity: job.target.identity,
            outcome,
            reason,
            attempts: job.attempts,
            finished_at: Local::now().to_rfc3339(),
        };
        // No subscribers is fine; completion feedback is optional.
        let _ = self.events_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paste::client::{Transport, TransportFactory};
    use crate::paste::process::{ProcessRecord, ProcessSnapshot};
    use crate::paste::ssh_config::EmptyLookup;
    use crate::paste::types::RemoteTarget;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    struct StaticSnapshot {
        records: Vec<ProcessRecord>,
    }

    impl ProcessSnapshot for StaticSnapshot {
        fn process(&self, pid: u32) -> Option<ProcessRecord> {
            self.records.iter().find(|record| record.pid == pid).cloned()
        }

        fn processes(&self) -> Vec<ProcessRecord> {
            self.records.clone()
        }
    }

    fn record(pid: u32, ppid: u32, argv: &[&str]) -> ProcessRecord {
        ProcessRecord {
            pid,
            ppid,
            argv: argv.iter().map(|arg| arg.to_string()).collect(),
            start_time: u64::from(pid),
            tty_nr: 34816,
        }
    }

    /// Terminal pid 300 whose parent chain holds `ssh deploy@build`.
    fn remote_records() -> Vec<ProcessRecord> {
        vec![
            record(100, 1, &["zsh"]),
            record(200, 100, &["ssh", "deploy@build"]),
            record(300, 200, &["bash"]),
        ]
    }

    fn local_records() -> Vec<ProcessRecord> {
        vec![record(1, 0, &["/sbin/init"]), record(300, 1, &["bash"])]
    }

    #[derive(Default)]
    struct Counters {
        connects: AtomicUsize,
        probes: AtomicUsize,
        uploads: AtomicUsize,
        closes: AtomicUsize,
    }

    struct ScriptedTransport {
        counters: Arc<Counters>,
        exists_size: Option<u64>,
        upload_error: Option<TransferError>,
        upload_delay: Duration,
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn exists(&self, _path: &str) -> Result<Option<u64>, TransferError> {
            self.counters.probes.fetch_add(1, Ordering::SeqCst);
            Ok(self.exists_size)
        }

        async fn upload(&self, _path: &str, _bytes: &[u8]) -> Result<(), TransferError> {
            self.counters.uploads.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.upload_delay).await;
            match &self.upload_error {
                Some(error) => Err(error.clone()),
                None => Ok(()),
            }
        }

        async fn close(&mut self) {
            self.counters.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct ScriptedFactory {
        counters: Arc<Counters>,
        /// Fail this many leading connect attempts with a transient error.
        fail_first_connects: usize,
        connect_error: Option<TransferError>,
        exists_size: Option<u64>,
        upload_error: Option<TransferError>,
        upload_delay: Duration,
    }

    impl Default for ScriptedFactory {
        fn default() -> Self {
            Self {
                counters: Arc::new(Counters::default()),
                fail_first_connects: 0,
                connect_error: None,
                exists_size: None,
                upload_error: None,
                upload_delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl TransportFactory for ScriptedFactory {
        async fn connect(
            &self,
            _target: &RemoteTarget,
        ) -> Result<Box<dyn Transport>, TransferError> {
            let attempt = self.counters.connects.fetch_add(1, Ordering::SeqCst);
            if attempt < self.fail_first_connects {
                return Err(TransferError::Connection(
                    "connection reset by peer".to_string(),
                ));
            }
            if let Some(error) = &self.connect_error {
                return Err(error.clone());
            }
            Ok(Box::new(ScriptedTransport {
                counters: self.counters.clone(),
                exists_size: self.exists_size,
                upload_error: self.upload_error.clone(),
                upload_delay: self.upload_delay,
            }))
        }
    }

    fn fast_config() -> EngineConfig {
        EngineConfig {
            remote_temp_dir: "/remote/tmp".to_string(),
            retry_delay_ms: 1,
            ..Default::default()
        }
    }

    fn build(
        config: EngineConfig,
        records: Vec<ProcessRecord>,
        factory: Arc<ScriptedFactory>,
    ) -> TransferCoordinator {
        let snapshot = Arc::new(StaticSnapshot { records });
        let resolver = Arc::new(ContextResolver::new(
            snapshot,
            Arc::new(EmptyLookup),
            "me",
            config.resolve_cache_ttl(),
        ));
        let dedup = Arc::new(DedupCache::new(config.dedup_capacity));
        let pool = Arc::new(ConnectionPool::new(factory, &config));
        TransferCoordinator::new(config, resolver, dedup, pool)
    }

    fn png_payload() -> ImagePayload {
        let mut bytes = vec![0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];
        bytes.extend_from_slice(b"image body");
        ImagePayload::new(bytes)
    }

    async fn next_event(rx: &mut broadcast::Receiver<CompletionEvent>) -> CompletionEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for completion event")
            .expect("event channel closed")
    }

    mod submit_path {
        use super::*;

        #[tokio::test]
        async fn test_local_context_queues_nothing() {
            let factory = Arc::new(ScriptedFactory::default());
            let coordinator = build(fast_config(), local_records(), factory.clone());

            let path = coordinator.submit(png_payload(), 300).unwrap();
            assert!(path.starts_with("/tmp/clipboard_image_"));
            assert!(path.ends_with(".png"));
            assert_eq!(coordinator.in_flight_len(), 0);
            assert_eq!(factory.counters.connects.load(Ordering::SeqCst), 0);
        }

        #[tokio::test]
        async fn test_remote_context_path_uses_remote_root() {
            let factory = Arc::new(ScriptedFactory::default());
            let coordinator = build(fast_config(), remote_records(), factory);

            let path = coordinator.submit(png_payload(), 300).unwrap();
            assert!(path.starts_with("/remote/tmp/clipboard_image_"));
            assert_eq!(coordinator.in_flight_len(), 1);
        }

        #[tokio::test]
        async fn test_oversized_payload_rejected_before_any_path() {
            let config = EngineConfig {
                max_payload_bytes: 4,
                ..fast_config()
            };
            let coordinator = build(config, remote_records(), Arc::new(ScriptedFactory::default()));

            let result = coordinator.submit(png_payload(), 300);
            assert!(matches!(result, Err(SubmitError::PayloadTooLarge { .. })));
            assert_eq!(coordinator.in_flight_len(), 0);
        }

        #[tokio::test]
        async fn test_submit_returns_within_latency_budget() {
            // A five-second upload must not show up in submit latency.
            let factory = Arc::new(ScriptedFactory {
                upload_delay: Duration::from_secs(5),
                ..Default::default()
            });
            let coordinator = build(fast_config(), remote_records(), factory);
            coordinator.start().await;

            let started = Instant::now();
            let path = coordinator.submit(png_payload(), 300).unwrap();
            assert!(started.elapsed() < Duration::from_millis(50));
            assert!(!path.is_empty());

            coordinator.shutdown().await;
        }
    }

    mod pipeline {
        use super::*;

        #[tokio::test]
        async fn test_round_trip_uploads_and_confirms() {
            let factory = Arc::new(ScriptedFactory::default());
            let coordinator = build(fast_config(), remote_records(), factory.clone());
            coordinator.start().await;
            let mut events = coordinator.subscribe();

            let path = coordinator.submit(png_payload(), 300).unwrap();
            let event = next_event(&mut events).await;

            assert_eq!(event.outcome, TransferOutcome::Uploaded);
            assert_eq!(event.destination, path);
            assert_eq!(event.identity.to_string(), "deploy@build:22");
            assert_eq!(event.attempts, 1);
            assert!(event.reason.is_none());

            assert_eq!(factory.counters.connects.load(Ordering::SeqCst), 1);
            assert_eq!(factory.counters.probes.load(Ordering::SeqCst), 1);
            assert_eq!(factory.counters.uploads.load(Ordering::SeqCst), 1);
            assert_eq!(coordinator.in_flight_len(), 0);

            coordinator.shutdown().await;
        }

        #[tokio::test]
        async fn test_completed_transfer_never_uploads_again() {
            let factory = Arc::new(ScriptedFactory::default());
            let coordinator = build(fast_config(), remote_records(), factory.clone());
            coordinator.start().await;
            let mut events = coordinator.subscribe();

            let first = coordinator.submit(png_payload(), 300).unwrap();
            next_event(&mut events).await;

            // The path promised first is the one confirmed; a later paste of
            // the same image gets that exact path back, not a fresh one.
            let second = coordinator.submit(png_payload(), 300).unwrap();
            assert_eq!(first, second);
            assert_eq!(factory.counters.uploads.load(Ordering::SeqCst), 1);
            assert_eq!(factory.counters.connects.load(Ordering::SeqCst), 1);

            coordinator.shutdown().await;
        }

        #[tokio::test]
        async fn test_existing_remote_file_skips_upload() {
            let payload = png_payload();
            let factory = Arc::new(ScriptedFactory {
                exists_size: Some(payload.len()),
                ..Default::default()
            });
            let coordinator = build(fast_config(), remote_records(), factory.clone());
            coordinator.start().await;
            let mut events = coordinator.subscribe();

            coordinator.submit(payload, 300).unwrap();
            let event = next_event(&mut events).await;

            assert_eq!(event.outcome, TransferOutcome::Skipped);
            assert_eq!(factory.counters.uploads.load(Ordering::SeqCst), 0);

            coordinator.shutdown().await;
        }

        #[tokio::test]
        async fn test_size_mismatch_on_probe_still_uploads() {
            // A stale file of another size at the destination is not proof
            // of delivery.
            let factory = Arc::new(ScriptedFactory {
                exists_size: Some(1),
                ..Default::default()
            });
            let coordinator = build(fast_config(), remote_records(), factory.clone());
            coordinator.start().await;
            let mut events = coordinator.subscribe();

            coordinator.submit(png_payload(), 300).unwrap();
            let event = next_event(&mut events).await;

            assert_eq!(event.outcome, TransferOutcome::Uploaded);
            assert_eq!(factory.counters.uploads.load(Ordering::SeqCst), 1);

            coordinator.shutdown().await;
        }

        #[tokio::test]
        async fn test_rapid_duplicate_submissions_coalesce() {
            let factory = Arc::new(ScriptedFactory {
                upload_delay: Duration::from_millis(100),
                ..Default::default()
            });
            let coordinator = build(fast_config(), remote_records(), factory.clone());
            coordinator.start().await;
            let mut events = coordinator.subscribe();

            let first = coordinator.submit(png_payload(), 300).unwrap();
            let second = coordinator.submit(png_payload(), 300).unwrap();
            assert_eq!(first, second);

            let event = next_event(&mut events).await;
            assert_eq!(event.outcome, TransferOutcome::Uploaded);
            assert_eq!(factory.counters.uploads.load(Ordering::SeqCst), 1);

            coordinator.shutdown().await;
        }
    }

    mod failure_handling {
        use super::*;

        #[tokio::test]
        async fn test_auth_failure_aborts_on_first_attempt() {
            let factory = Arc::new(ScriptedFactory {
                connect_error: Some(TransferError::Authentication("rejected".to_string())),
                ..Default::default()
            });
            let coordinator = build(fast_config(), remote_records(), factory.clone());
            coordinator.start().await;
            let mut events = coordinator.subscribe();

            coordinator.submit(png_payload(), 300).unwrap();
            let event = next_event(&mut events).await;

            assert_eq!(event.outcome, TransferOutcome::Failed);
            assert_eq!(event.attempts, 1);
            assert!(event.reason.unwrap().contains("authentication"));
            assert_eq!(factory.counters.connects.load(Ordering::SeqCst), 1);
            assert_eq!(coordinator.in_flight_len(), 0);

            coordinator.shutdown().await;
        }

        #[tokio::test]
        async fn test_retryable_failures_abort_after_max_attempts() {
            let factory = Arc::new(ScriptedFactory {
                connect_error: Some(TransferError::Connection(
                    "connection refused".to_string(),
                )),
                ..Default::default()
            });
            let config = EngineConfig {
                max_attempts: 2,
                ..fast_config()
            };
            let coordinator = build(config, remote_records(), factory.clone());
            coordinator.start().await;
            let mut events = coordinator.subscribe();

            coordinator.submit(png_payload(), 300).unwrap();
            let event = next_event(&mut events).await;

            assert_eq!(event.outcome, TransferOutcome::Failed);
            assert_eq!(event.attempts, 2);
            assert!(event.reason.unwrap().contains("connection"));
            assert_eq!(factory.counters.connects.load(Ordering::SeqCst), 2);

            coordinator.shutdown().await;
        }

        #[tokio::test]
        async fn test_transient_failure_then_success() {
            let factory = Arc::new(ScriptedFactory {
                fail_first_connects: 1,
                ..Default::default()
            });
            let coordinator = build(fast_config(), remote_records(), factory.clone());
            coordinator.start().await;
            let mut events = coordinator.subscribe();

            coordinator.submit(png_payload(), 300).unwrap();
            let event = next_event(&mut events).await;

            assert_eq!(event.outcome, TransferOutcome::Uploaded);
            assert_eq!(event.attempts, 2);
            assert_eq!(factory.counters.uploads.load(Ordering::SeqCst), 1);

            coordinator.shutdown().await;
        }

        #[tokio::test]
        async fn test_remote_rejection_aborts_and_discards_session() {
            let factory = Arc::new(ScriptedFactory {
                upload_error: Some(TransferError::RemoteRejection(
                    "permission denied".to_string(),
                )),
                ..Default::default()
            });
            let coordinator = build(fast_config(), remote_records(), factory.clone());
            coordinator.start().await;
            let mut events = coordinator.subscribe();

            coordinator.submit(png_payload(), 300).unwrap();
            let event = next_event(&mut events).await;

            // Remote rejections are permanent; one attempt, session
            // discarded rather than pooled.
            assert_eq!(event.outcome, TransferOutcome::Failed);
            assert_eq!(event.attempts, 1);
            assert_eq!(factory.counters.closes.load(Ordering::SeqCst), 1);

            coordinator.shutdown().await;
        }
    }

    mod lifecycle {
        use super::*;

        #[tokio::test]
        async fn test_shutdown_reports_queued_jobs_cancelled() {
            let factory = Arc::new(ScriptedFactory::default());
            let coordinator = build(fast_config(), remote_records(), factory.clone());
            // Workers never started: the job stays queued.
            let mut events = coordinator.subscribe();

            coordinator.submit(png_payload(), 300).unwrap();
            coordinator.shutdown().await;

            let event = next_event(&mut events).await;
            assert_eq!(event.outcome, TransferOutcome::Failed);
            assert!(event.reason.unwrap().contains("cancelled"));
            assert_eq!(coordinator.in_flight_len(), 0);
            assert_eq!(factory.counters.connects.load(Ordering::SeqCst), 0);
        }

        #[tokio::test]
        async fn test_start_is_idempotent() {
            let coordinator = build(
                fast_config(),
                remote_records(),
                Arc::new(ScriptedFactory::default()),
            );
            coordinator.start().await;
            coordinator.start().await;
            coordinator.shutdown().await;
        }
    }

    mod backoff {
        use super::*;

        #[tokio::test]
        async fn test_retry_delay_grows_exponentially_and_caps() {
            let coordinator = build(
                EngineConfig {
                    retry_delay_ms: 1000,
                    ..fast_config()
                },
                remote_records(),
                Arc::new(ScriptedFactory::default()),
            );
            let inner = &coordinator.inner;

            assert_eq!(inner.retry_delay_for(1), Duration::from_secs(1));
            assert_eq!(inner.retry_delay_for(2), Duration::from_secs(2));
            assert_eq!(inner.retry_delay_for(3), Duration::from_secs(4));
            // Capped at the global maximum regardless of attempt count.
            assert_eq!(inner.retry_delay_for(30), MAX_RETRY_DELAY);
        }
    }
}
