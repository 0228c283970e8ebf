//! Gateway service
//!
//! Ties the registry, path resolver and policy engine together behind the
//! operations the HTTP routes expose. Every file operation resolves an
//! active bucket of the caller's organization first; unknown and inactive
//! bucket ids are `NotFound`.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::errors::{GatewayError, Result};
use crate::policy::{Overrides, PolicyEngine, SyncStatus, Target};
use crate::registry::{Bucket, CreateBucket, Mode, Registry, UpdateBucket};
use crate::resolver::{PathResolver, ResolvedPath};
use crate::storage::{FileEntry, SourceLocation, StoreKind};

/// Per-call access overrides sent by clients as `storage_options`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageOptions {
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub store: Option<StoreKind>,
    #[serde(default)]
    pub mode: Option<Mode>,
    /// Provider hints this gateway does not interpret
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl StorageOptions {
    fn overrides(&self) -> Overrides {
        if !self.extra.is_empty() {
            debug!(keys = ?self.extra.keys().collect::<Vec<_>>(), "Ignoring unknown storage options");
        }
        Overrides {
            source: self.source.clone(),
            store: self.store,
            mode: self.mode,
        }
    }
}

/// Body of the JSON file operations
#[derive(Debug, Clone, Deserialize)]
pub struct FileRequest {
    pub path: String,
    /// Directory that relative paths are anchored at
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub storage_options: Option<StorageOptions>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListResponse {
    pub items: Vec<FileEntry>,
    pub path: String,
    /// Directory one level up, for navigation
    pub parent: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
    pub path: String,
}

impl StatusResponse {
    fn ok(path: String) -> Self {
        Self { status: "ok", path }
    }
}

/// A file read, with the path it was read from
#[derive(Debug)]
pub struct FileContent {
    pub path: String,
    pub name: String,
    pub data: Bytes,
}

pub struct Gateway {
    registry: Registry,
    engine: PolicyEngine,
}

impl Gateway {
    pub fn new(registry: Registry, engine: PolicyEngine) -> Self {
        Self { registry, engine }
    }

    pub fn engine(&self) -> &PolicyEngine {
        &self.engine
    }

    #[instrument(skip(self, req), fields(name = %req.name))]
    pub async fn create_bucket(&self, organization: &str, req: CreateBucket) -> Result<Bucket> {
        check_source(req.store, req.source.as_deref())?;
        self.registry.create(organization, req).await
    }

    pub async fn list_buckets(&self, organization: &str) -> Result<Vec<Bucket>> {
        self.registry.list(organization).await
    }

    pub async fn get_bucket(&self, organization: &str, id: Uuid) -> Result<Bucket> {
        self.registry.get_active(organization, id).await
    }

    /// Update a bucket; changing how data is accessed first reconciles the
    /// local state kept under the old settings
    ///
    /// The update is validated in full before anything local is touched.
    #[instrument(skip(self, req))]
    pub async fn update_bucket(
        &self,
        organization: &str,
        id: Uuid,
        req: UpdateBucket,
    ) -> Result<Bucket> {
        let current = self.registry.get_active(organization, id).await?;
        let staged = self.registry.stage_update(organization, id, req).await?;
        if staged.source != current.source || staged.store != current.store {
            check_source(staged.store, staged.source.as_deref())?;
        }
        if staged.access_differs(&current) {
            info!(bucket_id = %id, "Access settings change, reconciling local state");
            self.engine.reconcile(id).await?;
        }
        self.registry.commit(staged).await
    }

    /// Soft delete
    pub async fn delete_bucket(&self, organization: &str, id: Uuid) -> Result<Bucket> {
        self.registry.deactivate(organization, id).await
    }

    pub async fn restore_bucket(&self, organization: &str, id: Uuid) -> Result<Bucket> {
        self.registry.restore(organization, id).await
    }

    /// Irreversible removal of a soft-deleted bucket
    #[instrument(skip(self))]
    pub async fn purge_bucket(&self, organization: &str, id: Uuid) -> Result<()> {
        let bucket = self.registry.find(organization, id).await?;
        if bucket.is_active {
            return Err(GatewayError::Conflict(format!(
                "bucket {} must be deleted before it is purged",
                id
            )));
        }
        self.engine.release(&bucket).await?;
        self.registry.remove(organization, id).await?;
        info!(bucket_id = %id, persistent = bucket.persistent, "Bucket purged");
        Ok(())
    }

    pub async fn sync_status(&self, organization: &str, id: Uuid) -> Result<SyncStatus> {
        let bucket = self.registry.find(organization, id).await?;
        Ok(self.engine.sync_status(bucket.id).await)
    }

    #[instrument(skip(self, req), fields(path = %req.path))]
    pub async fn list(&self, organization: &str, id: Uuid, req: &FileRequest) -> Result<ListResponse> {
        let (target, resolved) = self.prepare(organization, id, req).await?;
        let dir = resolved.canonical.as_dir();
        let items = self.engine.list(&target, &dir).await?;
        Ok(ListResponse {
            items,
            path: dir.to_string(),
            parent: dir.parent().to_string(),
        })
    }

    #[instrument(skip(self, req), fields(path = %req.path))]
    pub async fn get_file(&self, organization: &str, id: Uuid, req: &FileRequest) -> Result<FileContent> {
        let (target, resolved) = self.prepare(organization, id, req).await?;
        if resolved.canonical.is_dir() {
            return Err(GatewayError::InvalidPath(format!(
                "{} is a directory",
                resolved.canonical
            )));
        }
        let data = self.engine.get(&target, &resolved.canonical).await?;
        Ok(FileContent {
            path: resolved.canonical.to_string(),
            name: resolved.canonical.name().unwrap_or_default().to_string(),
            data,
        })
    }

    /// Store `data` as `file_name` inside the directory `req.path`
    #[instrument(skip(self, req, data), fields(path = %req.path, size = data.len()))]
    pub async fn upload_file(
        &self,
        organization: &str,
        id: Uuid,
        req: &FileRequest,
        file_name: &str,
        data: Bytes,
    ) -> Result<StatusResponse> {
        let (target, resolved) = self.prepare(organization, id, req).await?;
        let file = resolved.canonical.as_dir().child(file_name, false)?;
        self.engine.put(&target, &file, data).await?;
        info!(bucket_id = %id, path = %file, "File uploaded");
        Ok(StatusResponse::ok(file.to_string()))
    }

    #[instrument(skip(self, req), fields(path = %req.path))]
    pub async fn delete_file(&self, organization: &str, id: Uuid, req: &FileRequest) -> Result<StatusResponse> {
        let (target, resolved) = self.prepare(organization, id, req).await?;
        self.engine.delete(&target, &resolved.canonical).await?;
        info!(bucket_id = %id, path = %resolved.canonical, "Path deleted");
        Ok(StatusResponse::ok(resolved.canonical.to_string()))
    }

    #[instrument(skip(self, req), fields(path = %req.path))]
    pub async fn create_dir(&self, organization: &str, id: Uuid, req: &FileRequest) -> Result<StatusResponse> {
        let (target, resolved) = self.prepare(organization, id, req).await?;
        let dir = resolved.canonical.as_dir();
        self.engine.mkdir(&target, &dir).await?;
        Ok(StatusResponse::ok(dir.to_string()))
    }

    async fn prepare(
        &self,
        organization: &str,
        id: Uuid,
        req: &FileRequest,
    ) -> Result<(Target, ResolvedPath)> {
        let bucket = self.registry.get_active(organization, id).await?;
        let resolved = PathResolver::new(&bucket.remote_path)?.resolve(req.cwd.as_deref(), &req.path)?;
        let overrides = req
            .storage_options
            .as_ref()
            .map(StorageOptions::overrides)
            .unwrap_or_default();
        let target = self.engine.target(&bucket, &overrides)?;
        debug!(bucket_id = %id, mounted = %resolved.mounted, mode = %target.mode, "Resolved request");
        Ok((target, resolved))
    }
}

fn check_source(store: Option<StoreKind>, source: Option<&str>) -> Result<()> {
    SourceLocation::parse(store, source)
        .map(|_| ())
        .map_err(GatewayError::InvalidRequest)
}
