//! Object store adapter
//!
//! Shared implementation for every backend reachable through the
//! object_store crate. Provider-specific modules only build the client.
//! Directories are virtual: a directory exists while any object lives under
//! its prefix, and `mkdir` writes an empty marker object so that empty
//! directories stay addressable.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::StreamExt;
use object_store::path::Path;
use object_store::{ObjectMeta, ObjectStore};
use std::sync::Arc;
use tracing::debug;

use crate::storage::{sort_entries, FileEntry, StorageBackend, StorageError, StorageResult};

/// Name of the marker object that keeps an empty directory visible
pub const DIR_MARKER: &str = ".keep";

/// Adapter over any `object_store` implementation
pub struct ObjectStoreBackend {
    store: Arc<dyn ObjectStore>,
    location: String,
    prefix: String,
}

impl ObjectStoreBackend {
    /// Wrap a store; every key is placed below `prefix`
    pub fn new(store: Arc<dyn ObjectStore>, location: String, prefix: String) -> Self {
        let prefix = prefix.trim_matches('/').to_string();
        Self {
            store,
            location,
            prefix,
        }
    }

    /// Full object path for a bucket key
    fn full_path(&self, key: &str) -> Path {
        self.prefix
            .split('/')
            .chain(key.split('/'))
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// `None` addresses the whole store
    fn dir_path(&self, key: &str) -> Option<Path> {
        let path = self.full_path(key);
        if path.as_ref().is_empty() {
            None
        } else {
            Some(path)
        }
    }

    /// Bucket key of an object, relative to the prefix
    fn relative_key(&self, location: &Path) -> String {
        let full = location.as_ref();
        if self.prefix.is_empty() {
            return full.to_string();
        }
        full.strip_prefix(&self.prefix)
            .map(|rest| rest.trim_start_matches('/').to_string())
            .unwrap_or_else(|| full.to_string())
    }

    async fn objects_under(&self, key: &str) -> StorageResult<Vec<ObjectMeta>> {
        let prefix = self.dir_path(key);
        let mut results = vec![];
        let mut stream = self.store.list(prefix.as_ref());

        while let Some(meta) = stream.next().await {
            results.push(meta?);
        }

        Ok(results)
    }

    async fn dir_exists(&self, key: &str) -> StorageResult<bool> {
        if key.trim_matches('/').is_empty() {
            return Ok(true);
        }
        let listing = self
            .store
            .list_with_delimiter(self.dir_path(key).as_ref())
            .await?;
        Ok(!listing.objects.is_empty() || !listing.common_prefixes.is_empty())
    }

    async fn file_exists(&self, key: &str) -> StorageResult<bool> {
        match self.store.head(&self.full_path(key)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Refuse keys that would place an object below an existing file
    async fn ensure_no_file_ancestor(&self, key: &str) -> StorageResult<()> {
        let name = key.trim_end_matches('/');
        for (end, _) in name.match_indices('/') {
            let ancestor = &name[..end];
            if self.file_exists(ancestor).await? {
                return Err(StorageError::Conflict(format!("{} is a file", ancestor)));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for ObjectStoreBackend {
    async fn list(&self, key: &str) -> StorageResult<Vec<FileEntry>> {
        let prefix = self.dir_path(key);
        let listing = self.store.list_with_delimiter(prefix.as_ref()).await?;

        if !key.is_empty() && listing.objects.is_empty() && listing.common_prefixes.is_empty() {
            return Err(StorageError::NotFound(key.to_string()));
        }

        let mut entries: Vec<FileEntry> = listing
            .common_prefixes
            .iter()
            .filter_map(|p| p.filename().map(FileEntry::directory))
            .collect();

        entries.extend(listing.objects.iter().filter_map(|meta| {
            let name = meta.location.filename()?;
            if name == DIR_MARKER {
                return None;
            }
            Some(FileEntry::file(
                name,
                meta.size as u64,
                Some(meta.last_modified),
            ))
        }));

        sort_entries(&mut entries);
        debug!(key = %key, count = entries.len(), "Listed objects");
        Ok(entries)
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let data = self.store.get(&self.full_path(key)).await?;
        let bytes = data.bytes().await?;
        Ok(bytes)
    }

    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        if key.rsplit('/').next() == Some(DIR_MARKER) {
            return Err(StorageError::Invalid(format!(
                "{} is reserved for directory markers",
                DIR_MARKER
            )));
        }
        if self.dir_exists(&format!("{}/", key)).await? {
            return Err(StorageError::Conflict(format!("{} is a directory", key)));
        }
        self.ensure_no_file_ancestor(key).await?;
        self.store.put(&self.full_path(key), data.into()).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        if !key.is_empty() && !key.ends_with('/') {
            if !self.file_exists(key).await? {
                return Err(StorageError::NotFound(key.to_string()));
            }
            self.store.delete(&self.full_path(key)).await?;
            return Ok(());
        }

        let objects = self.objects_under(key).await?;
        if objects.is_empty() && !key.is_empty() {
            return Err(StorageError::NotFound(key.to_string()));
        }
        for meta in objects {
            match self.store.delete(&meta.location).await {
                Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn mkdir(&self, key: &str) -> StorageResult<()> {
        let name = key.trim_end_matches('/');
        if name.is_empty() {
            return Ok(());
        }
        if self.file_exists(name).await? {
            return Err(StorageError::Conflict(format!("{} is a file", name)));
        }
        self.ensure_no_file_ancestor(key).await?;
        let marker = self.full_path(&format!("{}/{}", name, DIR_MARKER));
        self.store.put(&marker, Bytes::new().into()).await?;
        Ok(())
    }

    async fn stat(&self, key: &str) -> StorageResult<FileEntry> {
        let name = key
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();

        if key.is_empty() || key.ends_with('/') {
            return if self.dir_exists(key).await? {
                Ok(FileEntry::directory(name))
            } else {
                Err(StorageError::NotFound(key.to_string()))
            };
        }

        let meta = self.store.head(&self.full_path(key)).await?;
        Ok(FileEntry::file(name, meta.size as u64, Some(meta.last_modified)))
    }

    async fn walk(&self, key: &str) -> StorageResult<Vec<String>> {
        let mut keys: Vec<String> = self
            .objects_under(key)
            .await?
            .iter()
            .map(|meta| {
                let relative = self.relative_key(&meta.location);
                match relative.strip_suffix(DIR_MARKER) {
                    Some(dir) if dir.is_empty() || dir.ends_with('/') => dir.to_string(),
                    _ => relative,
                }
            })
            .filter(|k| !k.is_empty())
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn purge(&self) -> StorageResult<()> {
        self.delete("").await
    }

    fn describe(&self) -> String {
        if self.prefix.is_empty() {
            self.location.clone()
        } else {
            format!("{}/{}", self.location, self.prefix)
        }
    }
}
