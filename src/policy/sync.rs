//! Background write-back for MOUNT_CACHED buckets
//!
//! Each bucket runtime owns one [`SyncQueue`]. A write lands in the local
//! cache first and is then queued. The queue is an ordered log: writes to
//! overlapping paths (the same key, or a directory and anything below it)
//! reach the provider in the order they were queued, while writes to
//! unrelated paths run in parallel. A write replaces the queued entry of
//! the same key when nothing overlapping was queued after it, so only the
//! latest state of a path is pushed. Every entry gets a worker
//! task that applies it with capped exponential backoff; when attempts run
//! out the failure is recorded in the shared [`FaultLog`] instead of being
//! dropped.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info};
use uuid::Uuid;

use super::retry::{bounded, RetryPolicy};
use crate::errors::GatewayError;
use crate::metrics::{SYNC_FAILURES, SYNC_PENDING};
use crate::storage::{StorageBackend, StorageError, StorageResult};

/// Faults kept per process
const FAULT_LOG_CAPACITY: usize = 100;

/// Provider-side effect of a queued write
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOp {
    Put,
    Delete,
    Mkdir,
}

/// A write that never reached its provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncFault {
    pub bucket_id: Uuid,
    pub path: String,
    pub op: SyncOp,
    pub attempts: u32,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

impl SyncFault {
    pub fn to_error(&self) -> GatewayError {
        GatewayError::SyncFailed {
            path: self.path.clone(),
            attempts: self.attempts,
            reason: self.error.clone(),
        }
    }
}

/// Most recent sync faults across all buckets
#[derive(Clone, Default)]
pub struct FaultLog {
    faults: Arc<Mutex<VecDeque<SyncFault>>>,
}

impl FaultLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, fault: SyncFault) {
        let mut faults = self.faults.lock().await;
        if faults.len() == FAULT_LOG_CAPACITY {
            faults.pop_front();
        }
        faults.push_back(fault);
    }

    /// Faults of one bucket, oldest first
    pub async fn for_bucket(&self, bucket_id: Uuid) -> Vec<SyncFault> {
        self.faults
            .lock()
            .await
            .iter()
            .filter(|f| f.bucket_id == bucket_id)
            .cloned()
            .collect()
    }

    pub async fn clear_bucket(&self, bucket_id: Uuid) {
        self.faults.lock().await.retain(|f| f.bucket_id != bucket_id);
    }
}

#[derive(Debug, Clone)]
struct Pending {
    key: String,
    op: SyncOp,
    generation: u64,
}

/// Queued writes by position; a position never changes once assigned
type Log = BTreeMap<u64, Pending>;

struct QueueInner {
    bucket_id: Uuid,
    provider: Arc<dyn StorageBackend>,
    cache: Arc<dyn StorageBackend>,
    pending: Mutex<Log>,
    slots: Arc<Semaphore>,
    counter: AtomicU64,
    /// Signalled whenever an entry leaves the log
    changed: Notify,
    retry: RetryPolicy,
    timeout: Duration,
    faults: FaultLog,
}

/// Per-runtime queue of writes awaiting the provider
#[derive(Clone)]
pub struct SyncQueue {
    inner: Arc<QueueInner>,
}

impl SyncQueue {
    /// `capacity` bounds the number of queued writes; writers wait once it
    /// is reached
    pub fn new(
        bucket_id: Uuid,
        provider: Arc<dyn StorageBackend>,
        cache: Arc<dyn StorageBackend>,
        capacity: usize,
        retry: RetryPolicy,
        timeout: Duration,
        faults: FaultLog,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                bucket_id,
                provider,
                cache,
                pending: Mutex::new(BTreeMap::new()),
                slots: Arc::new(Semaphore::new(capacity.max(1))),
                counter: AtomicU64::new(0),
                changed: Notify::new(),
                retry,
                timeout,
                faults,
            }),
        }
    }

    /// Queue `op` for `key` behind every overlapping write already queued
    ///
    /// Deleting a directory also turns queued writes below it into deletes.
    pub async fn enqueue(&self, key: &str, op: SyncOp) -> StorageResult<()> {
        let inner = &self.inner;
        let mut slot = None;
        loop {
            let mut pending = inner.pending.lock().await;
            if op == SyncOp::Delete && key.ends_with('/') {
                for entry in pending
                    .values_mut()
                    .filter(|e| e.op != SyncOp::Delete && is_below(&e.key, key))
                {
                    entry.op = SyncOp::Delete;
                    entry.generation = inner.next();
                }
            }
            if let Some(entry) = coalesce_target(&mut pending, key, op) {
                entry.op = op;
                entry.generation = inner.next();
                debug!(bucket_id = %inner.bucket_id, key, ?op, "Coalesced queued write");
                return Ok(());
            }

            let Some(permit) = slot.take() else {
                drop(pending);
                let permit = inner
                    .slots
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| StorageError::Unavailable("sync queue closed".to_string()))?;
                slot = Some(permit);
                continue;
            };

            let position = inner.next();
            pending.insert(
                position,
                Pending {
                    key: key.to_string(),
                    op,
                    generation: position,
                },
            );
            SYNC_PENDING.inc();
            drop(pending);

            debug!(bucket_id = %inner.bucket_id, key, ?op, position, "Queued write for sync");
            tokio::spawn(run_worker(Arc::clone(inner), position, permit));
            return Ok(());
        }
    }

    /// What the provider will see for `key` once the queue drains
    ///
    /// A queued delete of an ancestor directory counts as a delete of `key`
    /// unless a later write to `key` follows it.
    pub async fn state_of(&self, key: &str) -> Option<SyncOp> {
        self.inner
            .pending
            .lock()
            .await
            .values()
            .fold(None, |state, entry| {
                if entry.key == key {
                    Some(entry.op)
                } else if entry.op == SyncOp::Delete && is_below(key, &entry.key) {
                    Some(SyncOp::Delete)
                } else {
                    state
                }
            })
    }

    /// Whether `key` will exist on the provider once the queue drains, when
    /// queued writes decide it
    ///
    /// A directory exists after any later write below it.
    pub async fn exists_after(&self, key: &str) -> Option<bool> {
        self.inner
            .pending
            .lock()
            .await
            .values()
            .fold(None, |state, entry| {
                if entry.key == key {
                    Some(entry.op != SyncOp::Delete)
                } else if entry.op == SyncOp::Delete && is_below(key, &entry.key) {
                    Some(false)
                } else if entry.op != SyncOp::Delete && is_below(&entry.key, key) {
                    Some(true)
                } else {
                    state
                }
            })
    }

    /// Whether a queued delete of `dir` or of one of its ancestors will
    /// wipe what the provider currently holds below `dir`
    pub async fn clears(&self, dir: &str) -> bool {
        self.inner
            .pending
            .lock()
            .await
            .values()
            .any(|e| e.op == SyncOp::Delete && (e.key == dir || is_below(dir, &e.key)))
    }

    /// Queued keys with their operations, in queue order
    pub async fn snapshot(&self) -> Vec<(String, SyncOp)> {
        self.inner
            .pending
            .lock()
            .await
            .values()
            .map(|e| (e.key.clone(), e.op))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.pending.lock().await.len()
    }

    /// Wait until every queued write has been applied or has failed
    ///
    /// Returns the number of writes still queued when `timeout` elapses.
    pub async fn drain(&self, timeout: Duration) -> Result<(), usize> {
        let inner = &self.inner;
        let wait = async {
            loop {
                let changed = inner.changed.notified();
                if inner.pending.lock().await.is_empty() {
                    return;
                }
                changed.await;
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(()) => Ok(()),
            Err(_) => Err(self.len().await),
        }
    }
}

/// Whether `key` lies strictly below the directory key `dir`
fn is_below(key: &str, dir: &str) -> bool {
    dir.ends_with('/') && key.len() > dir.len() && key.starts_with(dir)
}

/// Whether writes to `a` and `b` may give a different result when
/// reordered: the same path, or one a directory containing the other
fn overlaps(a: &str, b: &str) -> bool {
    let (a, b) = (a.trim_end_matches('/'), b.trim_end_matches('/'));
    let contains = |dir: &str, key: &str| {
        key.len() > dir.len() && key.starts_with(dir) && key.as_bytes()[dir.len()] == b'/'
    };
    a.is_empty() || b.is_empty() || a == b || contains(a, b) || contains(b, a)
}

/// The queued entry a new `op` on `key` can replace
///
/// Only the newest overlapping entry qualifies, and only when it is for
/// `key` itself. A queued directory delete is never replaced by a later
/// mkdir: the delete still has to clear what the provider holds.
fn coalesce_target<'a>(pending: &'a mut Log, key: &str, op: SyncOp) -> Option<&'a mut Pending> {
    let position = *pending.iter().rev().find(|(_, e)| overlaps(&e.key, key))?.0;
    let entry = pending.get_mut(&position)?;
    let keeps_delete = entry.op == SyncOp::Delete && op != SyncOp::Delete && key.ends_with('/');
    if entry.key != key || keeps_delete {
        return None;
    }
    Some(entry)
}

impl QueueInner {
    fn next(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Wait until no earlier queued write overlaps the entry at `position`
    async fn turn(&self, position: u64) -> Option<Pending> {
        loop {
            let changed = self.changed.notified();
            {
                let pending = self.pending.lock().await;
                let entry = pending.get(&position)?;
                if !pending
                    .range(..position)
                    .any(|(_, earlier)| overlaps(&earlier.key, &entry.key))
                {
                    return Some(entry.clone());
                }
            }
            changed.await;
        }
    }

    async fn apply(&self, key: &str, op: SyncOp) -> StorageResult<()> {
        match op {
            SyncOp::Put => {
                let data = self.cache.get(key).await?;
                bounded(self.timeout, self.provider.put(key, data)).await
            }
            SyncOp::Delete => match bounded(self.timeout, self.provider.delete(key)).await {
                Err(StorageError::NotFound(_)) => Ok(()),
                other => other,
            },
            SyncOp::Mkdir => bounded(self.timeout, self.provider.mkdir(key)).await,
        }
    }
}

async fn run_worker(inner: Arc<QueueInner>, position: u64, _slot: OwnedSemaphorePermit) {
    loop {
        let Some(Pending { key, op, generation }) = inner.turn(position).await else {
            break;
        };

        let (result, attempts) = inner
            .retry
            .run(inner.timeout, || inner.apply(&key, op))
            .await;

        let mut pending = inner.pending.lock().await;
        if pending.get(&position).map(|p| p.generation) != Some(generation) {
            // A newer write replaced this one while it was in flight.
            continue;
        }
        pending.remove(&position);
        SYNC_PENDING.dec();
        let idle = pending.is_empty();
        drop(pending);
        inner.changed.notify_waiters();

        match result {
            Ok(()) => {
                debug!(bucket_id = %inner.bucket_id, key = %key, ?op, attempts, "Write synced to provider");
            }
            Err(e) => {
                let fault = SyncFault {
                    bucket_id: inner.bucket_id,
                    path: format!("/{}", key),
                    op,
                    attempts,
                    error: e.to_string(),
                    failed_at: Utc::now(),
                };
                error!(
                    bucket_id = %inner.bucket_id,
                    ?op,
                    error = %fault.to_error(),
                    "Write failed to reach provider"
                );
                SYNC_FAILURES.inc();
                inner.faults.record(fault).await;
            }
        }

        if idle {
            info!(bucket_id = %inner.bucket_id, "Sync queue drained");
        }
        break;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FileEntry, LocalBackend};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::AtomicU32;

    /// Local provider whose writes fail a fixed number of times; every write
    /// passes through `gate` so tests can hold it in flight
    struct FlakyProvider {
        inner: LocalBackend,
        failures_left: AtomicU32,
        puts: AtomicU32,
        gate: Arc<Semaphore>,
    }

    impl FlakyProvider {
        async fn new(root: std::path::PathBuf, failures: u32) -> Self {
            Self {
                inner: LocalBackend::create(root).await.unwrap(),
                failures_left: AtomicU32::new(failures),
                puts: AtomicU32::new(0),
                gate: Arc::new(Semaphore::new(1)),
            }
        }

        fn fail(&self) -> StorageResult<()> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(StorageError::Unavailable("provider down".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl StorageBackend for FlakyProvider {
        async fn list(&self, key: &str) -> StorageResult<Vec<FileEntry>> {
            self.inner.list(key).await
        }
        async fn get(&self, key: &str) -> StorageResult<Bytes> {
            self.inner.get(key).await
        }
        async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
            let _open = self.gate.acquire().await;
            self.puts.fetch_add(1, Ordering::SeqCst);
            self.fail()?;
            self.inner.put(key, data).await
        }
        async fn delete(&self, key: &str) -> StorageResult<()> {
            let _open = self.gate.acquire().await;
            self.fail()?;
            self.inner.delete(key).await
        }
        async fn mkdir(&self, key: &str) -> StorageResult<()> {
            let _open = self.gate.acquire().await;
            self.fail()?;
            self.inner.mkdir(key).await
        }
        async fn stat(&self, key: &str) -> StorageResult<FileEntry> {
            self.inner.stat(key).await
        }
        async fn walk(&self, key: &str) -> StorageResult<Vec<String>> {
            self.inner.walk(key).await
        }
        async fn purge(&self) -> StorageResult<()> {
            self.inner.purge().await
        }
        fn describe(&self) -> String {
            "flaky".to_string()
        }
    }

    fn retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        }
    }

    async fn setup(
        failures: u32,
        max_attempts: u32,
    ) -> (tempfile::TempDir, Arc<FlakyProvider>, Arc<LocalBackend>, SyncQueue, FaultLog) {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(FlakyProvider::new(dir.path().join("remote"), failures).await);
        let cache = Arc::new(LocalBackend::create(dir.path().join("cache")).await.unwrap());
        let faults = FaultLog::new();
        let queue = SyncQueue::new(
            Uuid::new_v4(),
            provider.clone(),
            cache.clone(),
            8,
            retry(max_attempts),
            Duration::from_secs(5),
            faults.clone(),
        );
        (dir, provider, cache, queue, faults)
    }

    #[tokio::test]
    async fn test_put_reaches_provider_after_transient_failures() {
        let (_dir, provider, cache, queue, faults) = setup(2, 5).await;
        cache.put("a.csv", Bytes::from("x,y")).await.unwrap();
        queue.enqueue("a.csv", SyncOp::Put).await.unwrap();

        queue.drain(Duration::from_secs(5)).await.unwrap();
        assert_eq!(provider.inner.get("a.csv").await.unwrap(), Bytes::from("x,y"));
        assert_eq!(provider.puts.load(Ordering::SeqCst), 3);
        assert!(faults.for_bucket(queue.inner.bucket_id).await.is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_retries_recorded_as_fault() {
        let (_dir, provider, cache, queue, faults) = setup(u32::MAX, 3).await;
        cache.put("a.csv", Bytes::from("x")).await.unwrap();
        queue.enqueue("a.csv", SyncOp::Put).await.unwrap();

        queue.drain(Duration::from_secs(5)).await.unwrap();
        let recorded = faults.for_bucket(queue.inner.bucket_id).await;
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].path, "/a.csv");
        assert_eq!(recorded[0].op, SyncOp::Put);
        assert_eq!(recorded[0].attempts, 3);
        assert!(matches!(
            recorded[0].to_error(),
            GatewayError::SyncFailed { attempts: 3, .. }
        ));
        assert!(provider.inner.get("a.csv").await.is_err());
    }

    #[tokio::test]
    async fn test_pending_state_visible_until_synced() {
        let (_dir, provider, cache, queue, _faults) = setup(0, 3).await;
        let closed = provider.gate.acquire().await.unwrap();

        cache.put("a.csv", Bytes::from("v1")).await.unwrap();
        queue.enqueue("a.csv", SyncOp::Put).await.unwrap();
        assert_eq!(queue.state_of("a.csv").await, Some(SyncOp::Put));

        // Second write while the first is blocked is coalesced into the same slot.
        cache.put("a.csv", Bytes::from("v2")).await.unwrap();
        queue.enqueue("a.csv", SyncOp::Put).await.unwrap();
        assert_eq!(queue.len().await, 1);

        drop(closed);
        queue.drain(Duration::from_secs(5)).await.unwrap();
        assert_eq!(queue.state_of("a.csv").await, None);
        assert_eq!(provider.inner.get("a.csv").await.unwrap(), Bytes::from("v2"));
    }

    #[tokio::test]
    async fn test_directory_delete_supersedes_children() {
        let (_dir, provider, cache, queue, _faults) = setup(0, 3).await;
        let closed = provider.gate.acquire().await.unwrap();

        cache.put("d/a.csv", Bytes::from("x")).await.unwrap();
        queue.enqueue("d/a.csv", SyncOp::Put).await.unwrap();
        queue.enqueue("d/", SyncOp::Delete).await.unwrap();

        assert_eq!(queue.state_of("d/a.csv").await, Some(SyncOp::Delete));
        assert_eq!(queue.state_of("d/other.csv").await, Some(SyncOp::Delete));
        assert_eq!(queue.state_of("e.csv").await, None);

        drop(closed);
        queue.drain(Duration::from_secs(5)).await.unwrap();
        assert!(provider.inner.stat("d/a.csv").await.is_err());
    }

    #[tokio::test]
    async fn test_write_after_directory_delete_lands_last() {
        let (_dir, provider, cache, queue, faults) = setup(0, 3).await;
        provider.inner.put("d/old.csv", Bytes::from("old")).await.unwrap();
        let closed = provider.gate.acquire().await.unwrap();

        queue.enqueue("d/", SyncOp::Delete).await.unwrap();
        cache.put("d/new.csv", Bytes::from("new")).await.unwrap();
        queue.enqueue("d/new.csv", SyncOp::Put).await.unwrap();

        assert_eq!(queue.state_of("d/new.csv").await, Some(SyncOp::Put));
        assert_eq!(queue.state_of("d/old.csv").await, Some(SyncOp::Delete));
        assert!(queue.clears("d/").await);
        assert!(!queue.clears("e/").await);
        assert_eq!(queue.exists_after("d/").await, Some(true));
        assert_eq!(queue.exists_after("d/old.csv").await, Some(false));
        assert_eq!(queue.exists_after("e.csv").await, None);
        assert_eq!(
            queue.snapshot().await,
            vec![
                ("d/".to_string(), SyncOp::Delete),
                ("d/new.csv".to_string(), SyncOp::Put)
            ]
        );

        drop(closed);
        queue.drain(Duration::from_secs(5)).await.unwrap();
        assert_eq!(provider.inner.get("d/new.csv").await.unwrap(), Bytes::from("new"));
        assert!(provider.inner.stat("d/old.csv").await.is_err());
        assert!(faults.for_bucket(queue.inner.bucket_id).await.is_empty());
    }

    #[tokio::test]
    async fn test_mkdir_does_not_replace_queued_directory_delete() {
        let (_dir, provider, _cache, queue, faults) = setup(1, 5).await;
        provider.inner.put("d/old.csv", Bytes::from("old")).await.unwrap();
        let closed = provider.gate.acquire().await.unwrap();

        queue.enqueue("d/", SyncOp::Delete).await.unwrap();
        queue.enqueue("d/", SyncOp::Mkdir).await.unwrap();
        assert_eq!(
            queue.snapshot().await,
            vec![
                ("d/".to_string(), SyncOp::Delete),
                ("d/".to_string(), SyncOp::Mkdir)
            ]
        );
        assert_eq!(queue.state_of("d/").await, Some(SyncOp::Mkdir));
        assert_eq!(queue.state_of("d/old.csv").await, Some(SyncOp::Delete));

        drop(closed);
        queue.drain(Duration::from_secs(5)).await.unwrap();
        assert!(provider.inner.list("d/").await.unwrap().is_empty());
        assert!(faults.for_bucket(queue.inner.bucket_id).await.is_empty());
    }

    #[tokio::test]
    async fn test_unrelated_writes_do_not_wait_on_each_other() {
        let (_dir, provider, cache, queue, _faults) = setup(0, 3).await;
        cache.put("a.csv", Bytes::from("a")).await.unwrap();
        cache.put("b.csv", Bytes::from("b")).await.unwrap();
        queue.enqueue("a.csv", SyncOp::Put).await.unwrap();
        queue.enqueue("b.csv", SyncOp::Put).await.unwrap();

        queue.drain(Duration::from_secs(5)).await.unwrap();
        assert_eq!(provider.inner.get("a.csv").await.unwrap(), Bytes::from("a"));
        assert_eq!(provider.inner.get("b.csv").await.unwrap(), Bytes::from("b"));
    }

    #[test]
    fn test_overlaps() {
        assert!(overlaps("d/", "d/a.csv"));
        assert!(overlaps("d/a.csv", "d/"));
        assert!(overlaps("a.csv", "a.csv/"));
        assert!(overlaps("", "x/y.csv"));
        assert!(overlaps("d/e/", "d/e/f/g.csv"));
        assert!(!overlaps("d/", "dx/a.csv"));
        assert!(!overlaps("a.csv", "b.csv"));
        assert!(is_below("d/a.csv", "d/"));
        assert!(!is_below("d/", "d/"));
        assert!(!is_below("d/a.csv", "d"));
    }

    #[tokio::test]
    async fn test_drain_times_out_with_remaining_count() {
        let (_dir, provider, cache, queue, _faults) = setup(0, 3).await;
        let _closed = provider.gate.acquire().await.unwrap();

        cache.put("a.csv", Bytes::from("x")).await.unwrap();
        queue.enqueue("a.csv", SyncOp::Put).await.unwrap();
        assert_eq!(queue.drain(Duration::from_millis(20)).await, Err(1));
    }

    #[tokio::test]
    async fn test_fault_log_is_bounded() {
        let log = FaultLog::new();
        let id = Uuid::new_v4();
        for i in 0..(FAULT_LOG_CAPACITY + 5) {
            log.record(SyncFault {
                bucket_id: id,
                path: format!("/{}", i),
                op: SyncOp::Put,
                attempts: 1,
                error: "boom".into(),
                failed_at: Utc::now(),
            })
            .await;
        }
        let faults = log.for_bucket(id).await;
        assert_eq!(faults.len(), FAULT_LOG_CAPACITY);
        assert_eq!(faults[0].path, "/5");
        log.clear_bucket(id).await;
        assert!(log.for_bucket(id).await.is_empty());
    }
}
