//! Local filesystem adapter
//!
//! Used for `file://` and plain-path sources, for buckets created without a
//! source, and as the on-disk cache and working copy of the cached modes.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use crate::storage::{sort_entries, FileEntry, StorageBackend, StorageError, StorageResult};

/// Adapter rooted at an absolute or working-directory relative path
#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    /// Open the adapter, creating the root directory when missing
    pub async fn create(root: PathBuf) -> StorageResult<Self> {
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn resolve(&self, key: &str) -> StorageResult<PathBuf> {
        let relative = Path::new(key.trim_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(StorageError::Invalid(format!("unsafe key {}", key)));
        }
        Ok(self.root.join(relative))
    }

    /// Fails with `Conflict` when a path component above `path` is a file
    async fn ensure_no_file_ancestor(&self, path: &Path) -> StorageResult<()> {
        let mut current = path.parent();
        while let Some(dir) = current {
            if dir == self.root || !dir.starts_with(&self.root) {
                break;
            }
            match fs::metadata(dir).await {
                Ok(meta) if meta.is_file() => {
                    return Err(StorageError::Conflict(format!(
                        "{} is a file",
                        dir.display()
                    )))
                }
                Ok(_) => break,
                // Missing, or below a file that a higher iteration reports.
                Err(_) => {}
            }
            current = dir.parent();
        }
        Ok(())
    }

    fn modified(meta: &std::fs::Metadata) -> Option<DateTime<Utc>> {
        meta.modified().ok().map(DateTime::<Utc>::from)
    }

    fn entry_name(key: &str) -> String {
        key.trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string()
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    async fn list(&self, key: &str) -> StorageResult<Vec<FileEntry>> {
        let dir = self.resolve(key)?;
        let meta = fs::metadata(&dir).await?;
        if !meta.is_dir() {
            return Err(StorageError::Conflict(format!("{} is not a directory", key)));
        }

        let mut entries = Vec::new();
        let mut read_dir = fs::read_dir(&dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            // Staging files of in-flight writes.
            if name.starts_with(".upload-") {
                continue;
            }
            let meta = entry.metadata().await?;
            if meta.is_dir() {
                entries.push(FileEntry::directory(name));
            } else {
                entries.push(FileEntry::file(name, meta.len(), Self::modified(&meta)));
            }
        }

        sort_entries(&mut entries);
        Ok(entries)
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let path = self.resolve(key)?;
        if fs::metadata(&path).await?.is_dir() {
            return Err(StorageError::Conflict(format!("{} is a directory", key)));
        }
        Ok(Bytes::from(fs::read(&path).await?))
    }

    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()> {
        let path = self.resolve(key)?;
        if path == self.root {
            return Err(StorageError::Invalid("cannot write to the bucket root".to_string()));
        }
        if let Ok(meta) = fs::metadata(&path).await {
            if meta.is_dir() {
                return Err(StorageError::Conflict(format!("{} is a directory", key)));
            }
        }
        self.ensure_no_file_ancestor(&path).await?;

        let parent = path.parent().unwrap_or(&self.root).to_path_buf();
        fs::create_dir_all(&parent).await?;

        // Write to a staging file and rename so readers never see a torn file.
        let staging = parent.join(format!(".upload-{}", Uuid::new_v4()));
        let mut file = fs::File::create(&staging).await?;
        let written = async {
            file.write_all(&data).await?;
            file.sync_all().await
        }
        .await;
        if let Err(e) = written {
            let _ = fs::remove_file(&staging).await;
            return Err(e.into());
        }
        fs::rename(&staging, &path).await?;
        debug!(path = %path.display(), size = data.len(), "Wrote local file");
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.resolve(key)?;
        let meta = fs::metadata(&path).await?;
        if meta.is_dir() {
            if path == self.root {
                let mut read_dir = fs::read_dir(&path).await?;
                while let Some(entry) = read_dir.next_entry().await? {
                    if entry.file_type().await?.is_dir() {
                        fs::remove_dir_all(entry.path()).await?;
                    } else {
                        fs::remove_file(entry.path()).await?;
                    }
                }
            } else {
                fs::remove_dir_all(&path).await?;
            }
        } else {
            fs::remove_file(&path).await?;
        }
        Ok(())
    }

    async fn mkdir(&self, key: &str) -> StorageResult<()> {
        let path = self.resolve(key)?;
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => return Ok(()),
            Ok(_) => {
                return Err(StorageError::Conflict(format!(
                    "{} is a file",
                    key.trim_end_matches('/')
                )))
            }
            Err(_) => {}
        }
        self.ensure_no_file_ancestor(&path).await?;
        // create_dir_all tolerates a concurrent creator of the same directory
        fs::create_dir_all(&path).await?;
        Ok(())
    }

    async fn stat(&self, key: &str) -> StorageResult<FileEntry> {
        let path = self.resolve(key)?;
        let meta = fs::metadata(&path).await?;
        let name = Self::entry_name(key);
        let wants_dir = key.is_empty() || key.ends_with('/');
        match (meta.is_dir(), wants_dir) {
            (true, true) => Ok(FileEntry::directory(name)),
            (false, false) => Ok(FileEntry::file(name, meta.len(), Self::modified(&meta))),
            _ => Err(StorageError::NotFound(key.to_string())),
        }
    }

    async fn walk(&self, key: &str) -> StorageResult<Vec<String>> {
        let base = key.trim_matches('/');
        let mut keys = Vec::new();
        let mut pending = vec![base.to_string()];

        while let Some(dir_key) = pending.pop() {
            let mut read_dir = fs::read_dir(self.resolve(&dir_key)?).await?;
            while let Some(entry) = read_dir.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with(".upload-") {
                    continue;
                }
                let child = if dir_key.is_empty() {
                    name
                } else {
                    format!("{}/{}", dir_key, name)
                };
                if entry.file_type().await?.is_dir() {
                    keys.push(format!("{}/", child));
                    pending.push(child);
                } else {
                    keys.push(child);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn purge(&self) -> StorageResult<()> {
        match fs::remove_dir_all(&self.root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn describe(&self) -> String {
        format!("file://{}", self.root.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::EntryType;
    use tempfile::TempDir;

    async fn backend() -> (TempDir, LocalBackend) {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::create(dir.path().join("root")).await.unwrap();
        (dir, backend)
    }

    #[tokio::test]
    async fn test_put_list_get_delete() {
        let (_dir, backend) = backend().await;
        assert!(backend.list("").await.unwrap().is_empty());

        backend.put("a.csv", Bytes::from_static(b"x,y")).await.unwrap();
        let listing = backend.list("").await.unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].name, "a.csv");
        assert_eq!(listing[0].entry_type, EntryType::File);
        assert_eq!(listing[0].size, 3);
        assert!(listing[0].last_modified.is_some());

        assert_eq!(backend.get("a.csv").await.unwrap(), Bytes::from_static(b"x,y"));
        backend.delete("a.csv").await.unwrap();
        assert!(backend.list("").await.unwrap().is_empty());
        assert!(matches!(
            backend.delete("a.csv").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_put_creates_parents() {
        let (_dir, backend) = backend().await;
        backend.put("x/y/z.bin", Bytes::from_static(b"1")).await.unwrap();
        assert_eq!(backend.list("x/").await.unwrap(), vec![FileEntry::directory("y")]);
    }

    #[tokio::test]
    async fn test_mkdir_idempotent_and_conflicts_with_file() {
        let (_dir, backend) = backend().await;
        backend.mkdir("nested/dir/").await.unwrap();
        backend.mkdir("nested/dir/").await.unwrap();
        assert_eq!(
            backend.list("nested/").await.unwrap(),
            vec![FileEntry::directory("dir")]
        );

        backend.put("file", Bytes::from_static(b"f")).await.unwrap();
        assert!(matches!(
            backend.mkdir("file/").await,
            Err(StorageError::Conflict(_))
        ));
        assert!(matches!(
            backend.mkdir("file/sub/").await,
            Err(StorageError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_mkdir_of_same_directory() {
        let (_dir, backend) = backend().await;
        let (a, b) = tokio::join!(backend.mkdir("shared/deep/"), backend.mkdir("shared/deep/"));
        a.unwrap();
        b.unwrap();
        assert_eq!(
            backend.list("shared/").await.unwrap(),
            vec![FileEntry::directory("deep")]
        );
    }

    #[tokio::test]
    async fn test_put_over_directory_conflicts() {
        let (_dir, backend) = backend().await;
        backend.mkdir("d/").await.unwrap();
        assert!(matches!(
            backend.put("d", Bytes::from_static(b"x")).await,
            Err(StorageError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_unsafe_keys_rejected() {
        let (_dir, backend) = backend().await;
        assert!(matches!(
            backend.get("../escape").await,
            Err(StorageError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_walk_and_purge() {
        let (dir, backend) = backend().await;
        backend.put("a", Bytes::from_static(b"a")).await.unwrap();
        backend.put("d/b", Bytes::from_static(b"b")).await.unwrap();
        backend.mkdir("e/").await.unwrap();

        assert_eq!(backend.walk("").await.unwrap(), vec!["a", "d/", "d/b", "e/"]);

        backend.purge().await.unwrap();
        assert!(!dir.path().join("root").exists());
    }

    #[tokio::test]
    async fn test_stat_distinguishes_files_and_directories() {
        let (_dir, backend) = backend().await;
        backend.put("f", Bytes::from_static(b"abc")).await.unwrap();
        backend.mkdir("d/").await.unwrap();

        assert_eq!(backend.stat("f").await.unwrap().size, 3);
        assert!(backend.stat("d/").await.unwrap().is_dir());
        assert!(backend.stat("").await.unwrap().is_dir());
        assert!(matches!(backend.stat("d").await, Err(StorageError::NotFound(_))));
        assert!(matches!(backend.stat("f/").await, Err(StorageError::NotFound(_))));
    }
}
