//! Mode policy engine
//!
//! Routes every file operation of a bucket according to its effective mode:
//!
//! - `MOUNT`: straight to the provider, reads retried on transient faults
//! - `COPY`: the source is copied once into a local working area; all later
//!   reads and writes stay local and never reach the source
//! - `MOUNT_CACHED`: reads fill a local cache, writes land in the cache and
//!   are pushed to the provider by a background [`SyncQueue`]
//!
//! Runtimes are created lazily per (bucket, source, mode) and kept until the
//! bucket's access settings change or the bucket is purged.

mod retry;
mod runtime;
mod sync;

use bytes::Bytes;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{Config, SyncConfig};
use crate::errors::{GatewayError, Result};
use crate::metrics::{record_storage_op, STORAGE_OPERATION_DURATION};
use crate::registry::{Bucket, Mode};
use crate::resolver::CanonicalPath;
use crate::storage::{
    FileEntry, LocalBackend, ProviderFactory, SourceLocation, StorageError, StoreKind, DIR_MARKER,
};

pub use sync::{SyncFault, SyncOp};

use retry::RetryPolicy;
use runtime::{BucketRuntime, Settings};
use sync::{FaultLog, SyncQueue};

/// Marker written next to a COPY working area once prefetch completed
const PREFETCH_MARKER: &str = "PREFETCHED";

/// Per-request replacements for a bucket's stored access settings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    pub source: Option<String>,
    pub store: Option<StoreKind>,
    pub mode: Option<Mode>,
}

/// Effective access settings of one operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub bucket_id: Uuid,
    pub mode: Mode,
    pub location: SourceLocation,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RuntimeKey {
    bucket_id: Uuid,
    location: String,
    mode: Mode,
}

impl RuntimeKey {
    fn of(target: &Target) -> Self {
        Self {
            bucket_id: target.bucket_id,
            location: target.location.to_string(),
            mode: target.mode,
        }
    }

    /// Stable directory name for this runtime's local data
    fn dir_name(&self) -> String {
        let seed = format!("{}#{}", self.location, self.mode);
        Uuid::new_v5(&Uuid::NAMESPACE_URL, seed.as_bytes()).to_string()
    }
}

/// A queued write as reported to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingWrite {
    pub path: String,
    pub op: SyncOp,
}

/// Background sync state of one bucket
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub bucket_id: Uuid,
    pub pending: Vec<PendingWrite>,
    pub faults: Vec<SyncFault>,
}

pub struct PolicyEngine {
    factory: ProviderFactory,
    cache_root: PathBuf,
    local_override_root: Option<PathBuf>,
    settings: Settings,
    sync: SyncConfig,
    faults: FaultLog,
    runtimes: RwLock<HashMap<RuntimeKey, Arc<BucketRuntime>>>,
}

impl PolicyEngine {
    pub fn new(factory: ProviderFactory, config: &Config) -> Self {
        let settings = Settings {
            timeout: config.storage.operation_timeout(),
            read_retry: RetryPolicy {
                max_attempts: config.storage.read_attempts.max(1),
                initial_backoff: Duration::from_millis(config.sync.initial_backoff_ms),
                max_backoff: Duration::from_millis(config.sync.max_backoff_ms),
            },
            cache_ttl: config.cache.ttl_secs.map(Duration::from_secs),
        };
        Self {
            factory,
            cache_root: config.cache.root.clone(),
            local_override_root: config.storage.local_override_root.clone(),
            settings,
            sync: config.sync.clone(),
            faults: FaultLog::new(),
            runtimes: RwLock::new(HashMap::new()),
        }
    }

    /// Combine a bucket's stored settings with request overrides
    ///
    /// A source override without a store override lets the store be
    /// inferred from the new source. Local source overrides must stay under
    /// the configured override root.
    pub fn target(&self, bucket: &Bucket, overrides: &Overrides) -> Result<Target> {
        let override_source = overrides
            .source
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());
        let (source, store) = match override_source {
            Some(source) => (Some(source), overrides.store),
            None => (bucket.source.as_deref(), overrides.store.or(bucket.store)),
        };
        let location = self
            .factory
            .locate(bucket.id, store, source)
            .map_err(GatewayError::InvalidRequest)?;
        if let (Some(_), SourceLocation::Local { root }) = (override_source, &location) {
            self.check_local_override(root)?;
        }
        Ok(Target {
            bucket_id: bucket.id,
            mode: overrides.mode.unwrap_or(bucket.mode),
            location,
        })
    }

    fn check_local_override(&self, root: &Path) -> Result<()> {
        let Some(allowed) = &self.local_override_root else {
            return Err(GatewayError::InvalidRequest(
                "local source overrides are not enabled".to_string(),
            ));
        };
        let escapes = root
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::CurDir));
        if escapes || !root.starts_with(allowed) {
            warn!(root = %root.display(), "Rejected local source override");
            return Err(GatewayError::InvalidRequest(format!(
                "local source {} is outside the allowed root",
                root.display()
            )));
        }
        Ok(())
    }

    pub async fn list(&self, target: &Target, dir: &CanonicalPath) -> Result<Vec<FileEntry>> {
        observe("list", async {
            let runtime = self.runtime(target).await?;
            Ok(runtime.list(&dir.as_dir().key()).await?)
        })
        .await
    }

    pub async fn get(&self, target: &Target, file: &CanonicalPath) -> Result<Bytes> {
        observe("get", async {
            let runtime = self.runtime(target).await?;
            Ok(runtime.get(&file.as_file()?.key()).await?)
        })
        .await
    }

    /// Write a file; the directory marker name is reserved in every mode
    pub async fn put(&self, target: &Target, file: &CanonicalPath, data: Bytes) -> Result<()> {
        if file.name() == Some(DIR_MARKER) {
            return Err(GatewayError::InvalidPath(format!(
                "{} is a reserved file name",
                DIR_MARKER
            )));
        }
        observe("put", async {
            let runtime = self.runtime(target).await?;
            Ok(runtime.put(&file.as_file()?.key(), data).await?)
        })
        .await
    }

    /// Delete a file, or a directory with its contents
    ///
    /// A path without trailing `/` that names no file is retried as a
    /// directory.
    pub async fn delete(&self, target: &Target, path: &CanonicalPath) -> Result<()> {
        if path.is_root() {
            return Err(GatewayError::InvalidPath(
                "the bucket root cannot be deleted".to_string(),
            ));
        }
        observe("delete", async {
            let runtime = self.runtime(target).await?;
            if path.is_dir() {
                return Ok(runtime.delete(&path.key()).await?);
            }
            match runtime.delete(&path.key()).await {
                Err(StorageError::NotFound(_)) => Ok(runtime.delete(&path.as_dir().key()).await?),
                other => Ok(other?),
            }
        })
        .await
    }

    /// Create a directory; existing directories are left alone
    pub async fn mkdir(&self, target: &Target, dir: &CanonicalPath) -> Result<()> {
        if dir.is_root() {
            return Ok(());
        }
        observe("mkdir", async {
            let runtime = self.runtime(target).await?;
            Ok(runtime.mkdir(&dir.as_dir().key()).await?)
        })
        .await
    }

    /// Queued writes and recorded faults of a bucket
    pub async fn sync_status(&self, bucket_id: Uuid) -> SyncStatus {
        let mut pending = Vec::new();
        for runtime in self.runtimes_of(bucket_id).await {
            if let Some(queue) = runtime.sync_queue() {
                pending.extend(queue.snapshot().await.into_iter().map(|(key, op)| PendingWrite {
                    path: format!("/{}", key),
                    op,
                }));
            }
        }
        SyncStatus {
            bucket_id,
            pending,
            faults: self.faults.for_bucket(bucket_id).await,
        }
    }

    /// Drop local state before a bucket's source, store or mode changes
    ///
    /// Refused while MOUNT_CACHED writes are still on their way to the old
    /// provider. COPY working areas are discarded with their local edits.
    pub async fn reconcile(&self, bucket_id: Uuid) -> Result<()> {
        let mut runtimes = self.runtimes.write().await;
        for (_, runtime) in runtimes.iter().filter(|(k, _)| k.bucket_id == bucket_id) {
            if let Some(queue) = runtime.sync_queue() {
                let pending = queue.len().await;
                if pending > 0 {
                    return Err(GatewayError::Conflict(format!(
                        "bucket {} has {} writes still syncing",
                        bucket_id, pending
                    )));
                }
            }
        }
        runtimes.retain(|k, _| k.bucket_id != bucket_id);
        drop(runtimes);

        self.remove_local_data(bucket_id).await?;
        info!(bucket_id = %bucket_id, "Bucket runtimes reconciled");
        Ok(())
    }

    /// Release everything held for a bucket ahead of its purge
    ///
    /// Pending syncs are drained first. Backing data is removed unless the
    /// bucket is persistent.
    pub async fn release(&self, bucket: &Bucket) -> Result<()> {
        let drain_timeout = Duration::from_secs(self.sync.drain_timeout_secs);
        for runtime in self.runtimes_of(bucket.id).await {
            if let Some(queue) = runtime.sync_queue() {
                if let Err(left) = queue.drain(drain_timeout).await {
                    return Err(GatewayError::Conflict(format!(
                        "bucket {} still has {} writes syncing",
                        bucket.id, left
                    )));
                }
            }
        }
        self.runtimes
            .write()
            .await
            .retain(|k, _| k.bucket_id != bucket.id);
        self.remove_local_data(bucket.id).await?;
        self.faults.clear_bucket(bucket.id).await;

        if !bucket.persistent {
            let target = self.target(bucket, &Overrides::default())?;
            let provider = self.factory.open(&target.location).await?;
            provider.purge().await?;
            info!(bucket_id = %bucket.id, location = %provider.describe(), "Backing data purged");
        }
        Ok(())
    }

    /// Give in-flight syncs a chance to finish before exit
    pub async fn shutdown(&self) {
        let drain_timeout = Duration::from_secs(self.sync.drain_timeout_secs);
        let runtimes: Vec<Arc<BucketRuntime>> = self.runtimes.read().await.values().cloned().collect();
        for runtime in runtimes {
            if let Some(queue) = runtime.sync_queue() {
                if let Err(left) = queue.drain(drain_timeout).await {
                    warn!(pending = left, "Exiting with writes not yet synced");
                }
            }
        }
    }

    async fn runtimes_of(&self, bucket_id: Uuid) -> Vec<Arc<BucketRuntime>> {
        self.runtimes
            .read()
            .await
            .iter()
            .filter(|(k, _)| k.bucket_id == bucket_id)
            .map(|(_, runtime)| runtime.clone())
            .collect()
    }

    async fn runtime(&self, target: &Target) -> Result<Arc<BucketRuntime>> {
        let key = RuntimeKey::of(target);
        if let Some(runtime) = self.runtimes.read().await.get(&key) {
            return Ok(runtime.clone());
        }

        let provider = self.factory.open(&target.location).await?;
        let dir = self
            .cache_root
            .join(target.bucket_id.to_string())
            .join(key.dir_name());
        let runtime = match target.mode {
            Mode::Mount => BucketRuntime::mount(target.bucket_id, provider, self.settings),
            Mode::Copy => {
                let cache = Arc::new(LocalBackend::create(dir.join("data")).await?);
                BucketRuntime::copy(
                    target.bucket_id,
                    provider,
                    cache,
                    dir.join(PREFETCH_MARKER),
                    self.settings,
                )
            }
            Mode::MountCached => {
                let cache = Arc::new(LocalBackend::create(dir.join("data")).await?);
                let queue = SyncQueue::new(
                    target.bucket_id,
                    provider.clone(),
                    cache.clone(),
                    self.sync.queue_capacity,
                    RetryPolicy::from_sync(&self.sync),
                    self.settings.timeout,
                    self.faults.clone(),
                );
                BucketRuntime::cached(target.bucket_id, provider, cache, queue, self.settings)
            }
        };
        info!(
            bucket_id = %target.bucket_id,
            mode = %target.mode,
            location = %runtime.provider().describe(),
            "Bucket runtime started"
        );

        let mut runtimes = self.runtimes.write().await;
        Ok(runtimes.entry(key).or_insert_with(|| Arc::new(runtime)).clone())
    }

    async fn remove_local_data(&self, bucket_id: Uuid) -> Result<()> {
        let dir = self.cache_root.join(bucket_id.to_string());
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Record count and duration of one engine operation
async fn observe<T, Fut>(operation: &str, call: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    let timer = STORAGE_OPERATION_DURATION.start_timer();
    let result = call.await;
    timer.observe_duration();
    record_storage_op(operation, result.is_ok());
    result
}
