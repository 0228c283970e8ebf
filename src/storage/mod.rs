//! Provider adapter layer
//!
//! Every backend (S3-compatible stores, GCS, Azure Blob, local filesystem)
//! is exposed through the same [`StorageBackend`] capability trait. Keys
//! handed to an adapter are canonical bucket paths with the leading `/`
//! stripped: directory keys end with `/`, file keys never do, and the empty
//! key addresses the bucket root.

mod aws;
mod azure;
mod gcp;
mod local;
mod location;
mod object;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::config::ProvidersConfig;

pub use local::LocalBackend;
pub use location::{SourceLocation, StoreKind};
pub use object::{ObjectStoreBackend, DIR_MARKER};

/// Errors raised by provider adapters
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Key does not exist at the provider
    #[error("not found: {0}")]
    NotFound(String),

    /// Credentials lack the privilege for the operation
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Transient network or service fault
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// Structural clash, e.g. a directory over an existing file
    #[error("conflict: {0}")]
    Conflict(String),

    /// The provider rejected the key or the adapter configuration
    #[error("invalid: {0}")]
    Invalid(String),
}

impl StorageError {
    /// Whether retrying the same call may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Unavailable(_))
    }
}

impl From<object_store::Error> for StorageError {
    fn from(err: object_store::Error) -> Self {
        match err {
            object_store::Error::NotFound { path, .. } => StorageError::NotFound(path),
            object_store::Error::AlreadyExists { path, .. }
            | object_store::Error::Precondition { path, .. } => StorageError::Conflict(path),
            object_store::Error::PermissionDenied { path, .. }
            | object_store::Error::Unauthenticated { path, .. } => {
                StorageError::PermissionDenied(path)
            }
            object_store::Error::InvalidPath { source } => StorageError::Invalid(source.to_string()),
            object_store::Error::UnknownConfigurationKey { store, key } => {
                StorageError::Invalid(format!("unknown {} configuration key {}", store, key))
            }
            other => StorageError::Unavailable(other.to_string()),
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::NotFound | ErrorKind::NotADirectory => StorageError::NotFound(err.to_string()),
            ErrorKind::IsADirectory => StorageError::Conflict(err.to_string()),
            ErrorKind::PermissionDenied => StorageError::PermissionDenied(err.to_string()),
            ErrorKind::AlreadyExists => StorageError::Conflict(err.to_string()),
            ErrorKind::InvalidInput | ErrorKind::InvalidData => {
                StorageError::Invalid(err.to_string())
            }
            _ => StorageError::Unavailable(err.to_string()),
        }
    }
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Kind of a listed entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    File,
    Directory,
}

/// One item of a directory listing
///
/// `name` is relative to the listed directory. Directories carry no
/// authoritative size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub entry_type: EntryType,
    pub last_modified: Option<DateTime<Utc>>,
}

impl FileEntry {
    pub fn file(name: impl Into<String>, size: u64, last_modified: Option<DateTime<Utc>>) -> Self {
        Self {
            name: name.into(),
            size,
            entry_type: EntryType::File,
            last_modified,
        }
    }

    pub fn directory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size: 0,
            entry_type: EntryType::Directory,
            last_modified: None,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.entry_type == EntryType::Directory
    }
}

/// Sorts a listing directories first, then by name.
pub fn sort_entries(entries: &mut [FileEntry]) {
    entries.sort_by(|a, b| {
        b.is_dir()
            .cmp(&a.is_dir())
            .then_with(|| a.name.cmp(&b.name))
    });
}

/// Storage backend trait for uniform provider operations
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Immediate children of a directory key
    async fn list(&self, key: &str) -> StorageResult<Vec<FileEntry>>;

    /// Read a whole file
    async fn get(&self, key: &str) -> StorageResult<Bytes>;

    /// Write a whole file, replacing any previous content
    async fn put(&self, key: &str, data: Bytes) -> StorageResult<()>;

    /// Delete a file, or a directory together with everything under it
    async fn delete(&self, key: &str) -> StorageResult<()>;

    /// Create a directory; succeeds if it already exists
    async fn mkdir(&self, key: &str) -> StorageResult<()>;

    /// Metadata for a single file or directory key
    async fn stat(&self, key: &str) -> StorageResult<FileEntry>;

    /// Every file and directory key below a directory key, recursively
    async fn walk(&self, key: &str) -> StorageResult<Vec<String>>;

    /// Remove all data addressed by this backend
    async fn purge(&self) -> StorageResult<()>;

    /// Human readable location, for logs
    fn describe(&self) -> String;
}

/// Opens provider adapters for bucket sources
#[derive(Clone)]
pub struct ProviderFactory {
    providers: ProvidersConfig,
    managed_root: PathBuf,
}

impl ProviderFactory {
    pub fn new(providers: ProvidersConfig, managed_root: PathBuf) -> Self {
        Self {
            providers,
            managed_root,
        }
    }

    /// Resolve where a bucket's data lives without opening anything
    pub fn locate(
        &self,
        bucket_id: Uuid,
        store: Option<StoreKind>,
        source: Option<&str>,
    ) -> Result<SourceLocation, String> {
        match SourceLocation::parse(store, source)? {
            Some(location) => Ok(location),
            None => match store {
                None => Ok(SourceLocation::Local {
                    root: self.managed_root.join(bucket_id.to_string()),
                }),
                Some(kind) => {
                    let container = self.providers.default_container(kind).ok_or_else(|| {
                        format!("no default container configured for store {}", kind)
                    })?;
                    Ok(SourceLocation::Cloud {
                        kind,
                        container,
                        prefix: bucket_id.to_string(),
                    })
                }
            },
        }
    }

    /// Open an adapter for the given location
    pub async fn open(&self, location: &SourceLocation) -> StorageResult<Arc<dyn StorageBackend>> {
        let backend: Arc<dyn StorageBackend> = match location {
            SourceLocation::Local { root } => Arc::new(LocalBackend::create(root.clone()).await?),
            SourceLocation::Cloud {
                kind,
                container,
                prefix,
            } => {
                let store = match kind {
                    StoreKind::S3 => aws::build_s3(&self.providers.s3, container)?,
                    StoreKind::R2 => aws::build_r2(&self.providers.r2, container)?,
                    StoreKind::Ibm => aws::build_ibm(&self.providers.ibm, container)?,
                    StoreKind::Gcs => gcp::build(&self.providers.gcs, container)?,
                    StoreKind::Azure => azure::build(&self.providers.azure, container)?,
                };
                Arc::new(ObjectStoreBackend::new(
                    store,
                    format!("{}://{}", kind.scheme(), container),
                    prefix.clone(),
                ))
            }
        };
        info!(location = %backend.describe(), "Provider adapter opened");
        Ok(backend)
    }
}
