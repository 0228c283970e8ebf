//! Per-bucket access runtime
//!
//! A runtime binds one effective access setting (bucket, source, mode) to
//! an opened provider and, for the caching modes, a local working area.

use bytes::Bytes;
use chrono::Utc;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::retry::{bounded, RetryPolicy};
use super::sync::{SyncOp, SyncQueue};
use crate::storage::{
    sort_entries, FileEntry, LocalBackend, StorageBackend, StorageError, StorageResult,
};

/// Knobs shared by every runtime of an engine
#[derive(Debug, Clone, Copy)]
pub(crate) struct Settings {
    pub timeout: Duration,
    pub read_retry: RetryPolicy,
    pub cache_ttl: Option<Duration>,
}

enum Strategy {
    Mount,
    Copy {
        cache: Arc<LocalBackend>,
        marker: PathBuf,
        prefetched: OnceCell<()>,
    },
    Cached {
        cache: Arc<LocalBackend>,
        sync: SyncQueue,
        fresh: Mutex<HashMap<String, Instant>>,
    },
}

pub(crate) struct BucketRuntime {
    bucket_id: Uuid,
    provider: Arc<dyn StorageBackend>,
    strategy: Strategy,
    settings: Settings,
    /// Serializes structural changes and cache fills
    writes: Mutex<()>,
}

impl BucketRuntime {
    pub fn mount(bucket_id: Uuid, provider: Arc<dyn StorageBackend>, settings: Settings) -> Self {
        Self::with_strategy(bucket_id, provider, Strategy::Mount, settings)
    }

    /// `marker` records a completed prefetch so restarts skip it
    pub fn copy(
        bucket_id: Uuid,
        provider: Arc<dyn StorageBackend>,
        cache: Arc<LocalBackend>,
        marker: PathBuf,
        settings: Settings,
    ) -> Self {
        let strategy = Strategy::Copy {
            cache,
            marker,
            prefetched: OnceCell::new(),
        };
        Self::with_strategy(bucket_id, provider, strategy, settings)
    }

    pub fn cached(
        bucket_id: Uuid,
        provider: Arc<dyn StorageBackend>,
        cache: Arc<LocalBackend>,
        sync: SyncQueue,
        settings: Settings,
    ) -> Self {
        let strategy = Strategy::Cached {
            cache,
            sync,
            fresh: Mutex::new(HashMap::new()),
        };
        Self::with_strategy(bucket_id, provider, strategy, settings)
    }

    fn with_strategy(
        bucket_id: Uuid,
        provider: Arc<dyn StorageBackend>,
        strategy: Strategy,
        settings: Settings,
    ) -> Self {
        Self {
            bucket_id,
            provider,
            strategy,
            settings,
            writes: Mutex::new(()),
        }
    }

    pub fn sync_queue(&self) -> Option<&SyncQueue> {
        match &self.strategy {
            Strategy::Cached { sync, .. } => Some(sync),
            _ => None,
        }
    }

    pub fn provider(&self) -> &Arc<dyn StorageBackend> {
        &self.provider
    }

    /// Provider read with timeout and retry of transient faults
    async fn read<T, F, Fut>(&self, call: F) -> StorageResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        self.settings.read_retry.run(self.settings.timeout, call).await.0
    }

    /// Provider mutation with timeout; never retried here
    async fn write<T, Fut>(&self, call: Fut) -> StorageResult<T>
    where
        Fut: Future<Output = StorageResult<T>>,
    {
        bounded(self.settings.timeout, call).await
    }

    pub async fn list(&self, key: &str) -> StorageResult<Vec<FileEntry>> {
        let provider = &self.provider;
        match &self.strategy {
            Strategy::Mount => self.read(move || provider.list(key)).await,
            Strategy::Copy { cache, .. } => {
                self.ensure_prefetched().await?;
                cache.list(key).await
            }
            Strategy::Cached { cache, sync, .. } => {
                let decided = sync.exists_after(key).await;
                if decided == Some(false) {
                    return Err(StorageError::NotFound(key.to_string()));
                }
                let (mut entries, missing) = if sync.clears(key).await {
                    // The provider's current children are about to go.
                    (Vec::new(), true)
                } else {
                    match self.read(move || provider.list(key)).await {
                        Ok(entries) => (entries, false),
                        Err(StorageError::NotFound(_)) => (Vec::new(), true),
                        Err(e) => return Err(e),
                    }
                };

                let pending: Vec<(String, SyncOp)> = sync
                    .snapshot()
                    .await
                    .into_iter()
                    .filter(|(k, _)| k.len() > key.len() && k.starts_with(key))
                    .collect();
                overlay_pending(&mut entries, key, &pending, cache).await;

                if missing && decided != Some(true) {
                    return Err(StorageError::NotFound(key.to_string()));
                }
                sort_entries(&mut entries);
                Ok(entries)
            }
        }
    }

    pub async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let provider = &self.provider;
        match &self.strategy {
            Strategy::Mount => self.read(move || provider.get(key)).await,
            Strategy::Copy { cache, .. } => {
                self.ensure_prefetched().await?;
                cache.get(key).await
            }
            Strategy::Cached { cache, sync, fresh } => {
                match sync.state_of(key).await {
                    Some(SyncOp::Delete) => return Err(StorageError::NotFound(key.to_string())),
                    Some(_) => return cache.get(key).await,
                    None => {}
                }
                if self.is_fresh(fresh, key).await {
                    match cache.get(key).await {
                        Ok(data) => {
                            debug!(bucket_id = %self.bucket_id, key, "Served from cache");
                            return Ok(data);
                        }
                        Err(StorageError::NotFound(_)) => {}
                        Err(e) => return Err(e),
                    }
                }

                let data = self.read(move || provider.get(key)).await?;

                let _guard = self.writes.lock().await;
                if sync.state_of(key).await.is_some() {
                    // A local write landed while fetching; it wins.
                    return cache.get(key).await;
                }
                match cache.put(key, data.clone()).await {
                    Ok(()) => {
                        fresh.lock().await.insert(key.to_string(), Instant::now());
                    }
                    Err(e) => warn!(bucket_id = %self.bucket_id, key, error = %e, "Cache fill failed"),
                }
                Ok(data)
            }
        }
    }

    pub async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        match &self.strategy {
            Strategy::Mount => self.write(self.provider.put(key, data)).await,
            Strategy::Copy { cache, .. } => {
                self.ensure_prefetched().await?;
                cache.put(key, data).await
            }
            Strategy::Cached { cache, sync, fresh } => {
                let _guard = self.writes.lock().await;
                cache.put(key, data).await?;
                fresh.lock().await.insert(key.to_string(), Instant::now());
                sync.enqueue(key, SyncOp::Put).await
            }
        }
    }

    pub async fn delete(&self, key: &str) -> StorageResult<()> {
        match &self.strategy {
            Strategy::Mount => {
                let _guard = self.writes.lock().await;
                self.write(self.provider.delete(key)).await
            }
            Strategy::Copy { cache, .. } => {
                self.ensure_prefetched().await?;
                let _guard = self.writes.lock().await;
                cache.delete(key).await
            }
            Strategy::Cached { cache, sync, fresh } => {
                let _guard = self.writes.lock().await;
                if !self.cached_exists(sync, key).await? {
                    return Err(StorageError::NotFound(key.to_string()));
                }
                match cache.delete(key).await {
                    Ok(()) | Err(StorageError::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
                fresh
                    .lock()
                    .await
                    .retain(|k, _| !(k == key || (key.ends_with('/') && k.starts_with(key))));
                sync.enqueue(key, SyncOp::Delete).await
            }
        }
    }

    pub async fn mkdir(&self, key: &str) -> StorageResult<()> {
        let provider = &self.provider;
        let _guard = self.writes.lock().await;
        match &self.strategy {
            Strategy::Mount => self.write(provider.mkdir(key)).await,
            Strategy::Copy { cache, .. } => {
                self.ensure_prefetched().await?;
                cache.mkdir(key).await
            }
            Strategy::Cached { cache, sync, .. } => {
                let file_key = key.trim_end_matches('/');
                if self.cached_exists(sync, file_key).await? {
                    return Err(StorageError::Conflict(format!("{} is a file", file_key)));
                }
                let remote_exists = self.cached_exists(sync, key).await?;
                cache.mkdir(key).await?;
                if !remote_exists {
                    sync.enqueue(key, SyncOp::Mkdir).await?;
                }
                Ok(())
            }
        }
    }

    /// Whether `key` exists as the provider will see it after queued writes
    async fn cached_exists(&self, sync: &SyncQueue, key: &str) -> StorageResult<bool> {
        if let Some(exists) = sync.exists_after(key).await {
            return Ok(exists);
        }
        let provider = &self.provider;
        match self.read(move || provider.stat(key)).await {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn is_fresh(&self, fresh: &Mutex<HashMap<String, Instant>>, key: &str) -> bool {
        match fresh.lock().await.get(key) {
            Some(filled) => self
                .settings
                .cache_ttl
                .map_or(true, |ttl| filled.elapsed() < ttl),
            None => false,
        }
    }

    /// Copy the whole source into the working area once
    async fn ensure_prefetched(&self) -> StorageResult<()> {
        let Strategy::Copy {
            cache,
            marker,
            prefetched,
        } = &self.strategy
        else {
            return Ok(());
        };
        let provider = &self.provider;

        prefetched
            .get_or_try_init(|| async {
                if fs::try_exists(marker).await? {
                    debug!(bucket_id = %self.bucket_id, "Working copy already present");
                    return Ok(());
                }
                let started = Instant::now();
                let keys = self.read(move || provider.walk("")).await?;
                for key in &keys {
                    if key.ends_with('/') {
                        cache.mkdir(key).await?;
                    } else {
                        let key = key.as_str();
                        let data = self.read(move || provider.get(key)).await?;
                        cache.put(key, data).await?;
                    }
                }
                fs::write(marker, Utc::now().to_rfc3339()).await?;
                info!(
                    bucket_id = %self.bucket_id,
                    source = %provider.describe(),
                    entries = keys.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Working copy prefetched"
                );
                Ok::<(), StorageError>(())
            })
            .await?;
        Ok(())
    }
}

/// Apply queued writes below `dir` to a provider listing of it, in queue
/// order
async fn overlay_pending(
    entries: &mut Vec<FileEntry>,
    dir: &str,
    pending: &[(String, SyncOp)],
    cache: &LocalBackend,
) {
    for (key, op) in pending {
        let rest = &key[dir.len()..];
        match (op, rest.split_once('/')) {
            (SyncOp::Delete, Some((name, ""))) => {
                debug!(key = %key, "Hiding pending delete from listing");
                entries.retain(|e| !(e.is_dir() && e.name == name));
            }
            (SyncOp::Delete, None) => {
                debug!(key = %key, "Hiding pending delete from listing");
                entries.retain(|e| !(!e.is_dir() && e.name == rest));
            }
            (SyncOp::Delete, Some(_)) => {}
            (_, Some((name, _))) => {
                if !entries.iter().any(|e| e.is_dir() && e.name == name) {
                    entries.push(FileEntry::directory(name));
                }
            }
            (_, None) => {
                let entry = cache
                    .stat(key)
                    .await
                    .unwrap_or_else(|_| FileEntry::file(rest, 0, None));
                entries.retain(|e| !(e.name == rest && !e.is_dir()));
                entries.push(entry);
            }
        }
    }
}
