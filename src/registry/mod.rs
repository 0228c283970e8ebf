//! Bucket registry
//!
//! Durable record of bucket definitions and the lifecycle authority for
//! creating, updating, soft-deleting, restoring and purging them. The
//! record is metadata only; backing data is handled by the policy engine.
//!
//! Storage of records is behind [`BucketRepository`] so that the registry
//! can run in memory (tests, ephemeral deployments) or on SQLite.

mod memory;
mod model;
mod sqlite;

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::config::RegistryConfig;
use crate::errors::{GatewayError, Result};
use crate::resolver::canonical_mount;

pub use memory::MemoryRepository;
pub use model::{Bucket, CreateBucket, Mode, UpdateBucket};
pub use sqlite::SqliteRepository;

/// Persistence of bucket records
///
/// `insert` and `save` enforce that, among active buckets of one
/// organization, no two share a mount point or a name.
#[async_trait]
pub trait BucketRepository: Send + Sync {
    async fn insert(&self, bucket: Bucket) -> Result<Bucket>;

    async fn get(&self, id: Uuid) -> Result<Option<Bucket>>;

    async fn list_active(&self, organization: &str) -> Result<Vec<Bucket>>;

    async fn save(&self, bucket: Bucket) -> Result<Bucket>;

    async fn remove(&self, id: Uuid) -> Result<()>;
}

/// Checks a candidate against the active buckets it must not collide with
pub(crate) fn check_unique<'a>(
    candidate: &Bucket,
    others: impl IntoIterator<Item = &'a Bucket>,
) -> Result<()> {
    if !candidate.is_active {
        return Ok(());
    }
    for other in others {
        if other.id == candidate.id
            || !other.is_active
            || other.organization != candidate.organization
        {
            continue;
        }
        if other.remote_path == candidate.remote_path {
            return Err(GatewayError::DuplicateMountPoint {
                remote_path: candidate.remote_path.clone(),
                existing: other.name.clone(),
            });
        }
        if other.name == candidate.name {
            return Err(GatewayError::Conflict(format!(
                "bucket name {} is already in use",
                candidate.name
            )));
        }
    }
    Ok(())
}

/// Registry service over an injected repository
#[derive(Clone)]
pub struct Registry {
    repo: Arc<dyn BucketRepository>,
}

impl Registry {
    pub fn new(repo: Arc<dyn BucketRepository>) -> Self {
        Self { repo }
    }

    /// Registry backed by SQLite when a database URL is configured
    pub async fn connect(config: &RegistryConfig) -> Result<Self> {
        let repo: Arc<dyn BucketRepository> = match &config.database_url {
            Some(url) => Arc::new(SqliteRepository::connect(url).await?),
            None => {
                info!("No registry database configured, keeping buckets in memory");
                Arc::new(MemoryRepository::new())
            }
        };
        Ok(Self::new(repo))
    }

    pub async fn create(&self, organization: &str, req: CreateBucket) -> Result<Bucket> {
        let name = validate_name(&req.name)?;
        let remote_path = validate_remote_path(&req.remote_path)?;
        let now = Utc::now();

        let bucket = Bucket {
            id: Uuid::new_v4(),
            organization: organization.to_string(),
            name,
            remote_path,
            source: normalize_source(req.source),
            store: req.store,
            mode: req.mode,
            persistent: req.persistent,
            is_active: true,
            created_at: now,
            updated_at: now,
        };

        let bucket = self.repo.insert(bucket).await?;
        info!(bucket_id = %bucket.id, name = %bucket.name, mount = %bucket.remote_path, mode = %bucket.mode, "Bucket created");
        Ok(bucket)
    }

    /// Any bucket of the organization, active or not
    pub async fn find(&self, organization: &str, id: Uuid) -> Result<Bucket> {
        match self.repo.get(id).await? {
            Some(bucket) if bucket.organization == organization => Ok(bucket),
            _ => Err(GatewayError::NotFound(format!("bucket {}", id))),
        }
    }

    /// An active bucket of the organization
    pub async fn get_active(&self, organization: &str, id: Uuid) -> Result<Bucket> {
        let bucket = self.find(organization, id).await?;
        if !bucket.is_active {
            return Err(GatewayError::NotFound(format!("bucket {}", id)));
        }
        Ok(bucket)
    }

    pub async fn list(&self, organization: &str) -> Result<Vec<Bucket>> {
        self.repo.list_active(organization).await
    }

    /// Apply an update; the id never changes
    pub async fn update(&self, organization: &str, id: Uuid, req: UpdateBucket) -> Result<Bucket> {
        let bucket = self.stage_update(organization, id, req).await?;
        self.commit(bucket).await
    }

    /// Apply an update to a copy of the record and validate it, without
    /// saving
    pub async fn stage_update(
        &self,
        organization: &str,
        id: Uuid,
        req: UpdateBucket,
    ) -> Result<Bucket> {
        let mut bucket = self.get_active(organization, id).await?;

        if let Some(name) = req.name {
            bucket.name = validate_name(&name)?;
        }
        if let Some(remote_path) = req.remote_path {
            bucket.remote_path = validate_remote_path(&remote_path)?;
        }
        if let Some(source) = req.source {
            bucket.source = normalize_source(Some(source));
        }
        if let Some(store) = req.store {
            bucket.store = store;
        }
        if let Some(mode) = req.mode {
            bucket.mode = mode;
        }
        if let Some(persistent) = req.persistent {
            bucket.persistent = persistent;
        }
        bucket.updated_at = Utc::now();

        check_unique(&bucket, &self.repo.list_active(organization).await?)?;
        Ok(bucket)
    }

    /// Save a record produced by [`Registry::stage_update`]
    pub async fn commit(&self, bucket: Bucket) -> Result<Bucket> {
        let bucket = self.repo.save(bucket).await?;
        info!(bucket_id = %bucket.id, "Bucket updated");
        Ok(bucket)
    }

    /// Soft delete; reversible through [`Registry::restore`]
    pub async fn deactivate(&self, organization: &str, id: Uuid) -> Result<Bucket> {
        let mut bucket = self.get_active(organization, id).await?;
        bucket.is_active = false;
        bucket.updated_at = Utc::now();
        let bucket = self.repo.save(bucket).await?;
        info!(bucket_id = %bucket.id, "Bucket deactivated");
        Ok(bucket)
    }

    /// Undo a soft delete, provided the mount point is still free
    pub async fn restore(&self, organization: &str, id: Uuid) -> Result<Bucket> {
        let mut bucket = self.find(organization, id).await?;
        if bucket.is_active {
            return Ok(bucket);
        }
        bucket.is_active = true;
        bucket.updated_at = Utc::now();
        let bucket = self.repo.save(bucket).await?;
        info!(bucket_id = %bucket.id, "Bucket restored");
        Ok(bucket)
    }

    /// Drop the record of an inactive bucket
    pub async fn remove(&self, organization: &str, id: Uuid) -> Result<()> {
        let bucket = self.find(organization, id).await?;
        if bucket.is_active {
            return Err(GatewayError::Conflict(format!(
                "bucket {} must be deleted before it is purged",
                id
            )));
        }
        self.repo.remove(id).await?;
        info!(bucket_id = %id, "Bucket record removed");
        Ok(())
    }
}

fn validate_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(GatewayError::InvalidRequest("bucket name is required".to_string()));
    }
    Ok(name.to_string())
}

fn validate_remote_path(remote_path: &str) -> Result<String> {
    let remote_path = remote_path.trim();
    if remote_path.is_empty() {
        return Err(GatewayError::InvalidRequest("remote_path is required".to_string()));
    }
    Ok(canonical_mount(remote_path)?.to_string())
}

fn normalize_source(source: Option<String>) -> Option<String> {
    source
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoreKind;

    fn registry() -> Registry {
        Registry::new(Arc::new(MemoryRepository::new()))
    }

    fn create_req(name: &str, remote_path: &str) -> CreateBucket {
        CreateBucket {
            name: name.to_string(),
            remote_path: remote_path.to_string(),
            source: None,
            store: None,
            persistent: false,
            mode: Mode::Mount,
        }
    }

    #[tokio::test]
    async fn test_create_canonicalizes_mount_point() {
        let registry = registry();
        let bucket = registry.create("org", create_req("ml-data", "//data")).await.unwrap();
        assert_eq!(bucket.remote_path, "/data/");
        assert!(bucket.is_active);
        assert_eq!(registry.get_active("org", bucket.id).await.unwrap(), bucket);
    }

    #[tokio::test]
    async fn test_create_validates_fields() {
        let registry = registry();
        assert!(matches!(
            registry.create("org", create_req(" ", "/data")).await,
            Err(GatewayError::InvalidRequest(_))
        ));
        assert!(matches!(
            registry.create("org", create_req("a", "")).await,
            Err(GatewayError::InvalidRequest(_))
        ));
        assert!(matches!(
            registry.create("org", create_req("a", "data")).await,
            Err(GatewayError::InvalidPath(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_mount_point_rejected_while_active() {
        let registry = registry();
        let first = registry.create("org", create_req("ml-data", "/data")).await.unwrap();

        let err = registry
            .create("org", create_req("other", "/data/"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::DuplicateMountPoint { .. }));

        // Other organizations have their own mount namespace.
        registry.create("org2", create_req("other", "/data")).await.unwrap();

        registry.deactivate("org", first.id).await.unwrap();
        let second = registry.create("org", create_req("other", "/data")).await.unwrap();

        // The first bucket cannot come back while the second holds the mount.
        assert!(matches!(
            registry.restore("org", first.id).await,
            Err(GatewayError::DuplicateMountPoint { .. })
        ));
        registry.deactivate("org", second.id).await.unwrap();
        assert!(registry.restore("org", first.id).await.unwrap().is_active);
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let registry = registry();
        registry.create("org", create_req("ml-data", "/a")).await.unwrap();
        assert!(matches!(
            registry.create("org", create_req("ml-data", "/b")).await,
            Err(GatewayError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_update_keeps_id_and_checks_mount() {
        let registry = registry();
        let a = registry.create("org", create_req("a", "/a")).await.unwrap();
        registry.create("org", create_req("b", "/b")).await.unwrap();

        let updated = registry
            .update(
                "org",
                a.id,
                UpdateBucket {
                    name: Some("renamed".into()),
                    mode: Some(Mode::Copy),
                    ..UpdateBucket::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.id, a.id);
        assert_eq!(updated.name, "renamed");
        assert_eq!(updated.mode, Mode::Copy);
        assert_eq!(updated.created_at, a.created_at);

        let err = registry
            .update(
                "org",
                a.id,
                UpdateBucket {
                    remote_path: Some("/b".into()),
                    ..UpdateBucket::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::DuplicateMountPoint { .. }));
    }

    #[tokio::test]
    async fn test_inactive_buckets_hidden_and_purgeable() {
        let registry = registry();
        let bucket = registry.create("org", create_req("a", "/a")).await.unwrap();

        assert!(matches!(
            registry.remove("org", bucket.id).await,
            Err(GatewayError::Conflict(_))
        ));

        registry.deactivate("org", bucket.id).await.unwrap();
        assert!(registry.list("org").await.unwrap().is_empty());
        assert!(matches!(
            registry.get_active("org", bucket.id).await,
            Err(GatewayError::NotFound(_))
        ));
        assert!(!registry.find("org", bucket.id).await.unwrap().is_active);

        registry.remove("org", bucket.id).await.unwrap();
        assert!(registry.find("org", bucket.id).await.is_err());
    }

    #[tokio::test]
    async fn test_other_organization_sees_not_found() {
        let registry = registry();
        let bucket = registry.create("org", create_req("a", "/a")).await.unwrap();
        assert!(matches!(
            registry.get_active("intruder", bucket.id).await,
            Err(GatewayError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_staged_update_validated_but_not_saved() {
        let registry = registry();
        let a = registry.create("org", create_req("a", "/a")).await.unwrap();
        registry.create("org", create_req("b", "/b")).await.unwrap();

        let staged = registry
            .stage_update(
                "org",
                a.id,
                UpdateBucket {
                    mode: Some(Mode::MountCached),
                    ..UpdateBucket::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(staged.mode, Mode::MountCached);
        assert!(staged.access_differs(&a));
        assert_eq!(registry.get_active("org", a.id).await.unwrap().mode, a.mode);

        for rejected in [
            UpdateBucket {
                remote_path: Some("/b".into()),
                ..UpdateBucket::default()
            },
            UpdateBucket {
                name: Some("b".into()),
                ..UpdateBucket::default()
            },
            UpdateBucket {
                name: Some("  ".into()),
                ..UpdateBucket::default()
            },
        ] {
            assert!(registry.stage_update("org", a.id, rejected).await.is_err());
        }
    }

    #[tokio::test]
    async fn test_update_clears_store_with_null() {
        let registry = registry();
        let mut req = create_req("a", "/a");
        req.source = Some("s3://data".into());
        req.store = Some(StoreKind::S3);
        let a = registry.create("org", req).await.unwrap();

        let update: UpdateBucket = serde_json::from_str(r#"{"store":null}"#).unwrap();
        let updated = registry.update("org", a.id, update).await.unwrap();
        assert_eq!(updated.store, None);
        assert_eq!(updated.source.as_deref(), Some("s3://data"));

        // An absent field leaves the store alone.
        let update: UpdateBucket = serde_json::from_str(r#"{"store":"s3"}"#).unwrap();
        registry.update("org", a.id, update).await.unwrap();
        let rename: UpdateBucket = serde_json::from_str(r#"{"name":"b"}"#).unwrap();
        let renamed = registry.update("org", a.id, rename).await.unwrap();
        assert_eq!(renamed.store, Some(StoreKind::S3));
    }

    #[test]
    fn test_access_change_detection() {
        let now = Utc::now();
        let bucket = Bucket {
            id: Uuid::new_v4(),
            organization: "org".into(),
            name: "a".into(),
            remote_path: "/a/".into(),
            source: Some("s3://b".into()),
            store: None,
            mode: Mode::Mount,
            persistent: true,
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        let renamed = Bucket {
            name: "b".into(),
            persistent: false,
            ..bucket.clone()
        };
        assert!(!renamed.access_differs(&bucket));
        let remode = Bucket {
            mode: Mode::MountCached,
            ..bucket.clone()
        };
        assert!(remode.access_differs(&bucket));
        let restore = Bucket {
            store: Some(StoreKind::S3),
            ..bucket.clone()
        };
        assert!(restore.access_differs(&bucket));
    }
}
