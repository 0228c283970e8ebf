//! SQLite bucket repository
//!
//! The schema lives in `migrations/0001_buckets.sql` and is applied on
//! connect. Partial unique indexes back the active mount point and name
//! rules, so concurrent creators cannot both win.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

use super::{check_unique, Bucket, BucketRepository, Mode};
use crate::errors::{GatewayError, Result};
use crate::storage::StoreKind;

const MIGRATION: &str = include_str!("../../migrations/0001_buckets.sql");

const COLUMNS: &str = "id, organization, name, remote_path, source, store, mode, persistent, is_active, created_at, updated_at";

pub struct SqliteRepository {
    pool: SqlitePool,
}

impl SqliteRepository {
    /// Open the database, creating it if missing, and apply the schema
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        // Every connection to an in-memory database sees its own database.
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let repo = Self { pool };
        repo.migrate().await?;
        info!(url = %url, "Registry database ready");
        Ok(repo)
    }

    async fn migrate(&self) -> Result<()> {
        for stmt in MIGRATION.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }

    fn from_row(row: &SqliteRow) -> Result<Bucket> {
        let id: String = row.try_get("id")?;
        let store: Option<String> = row.try_get("store")?;
        let mode: String = row.try_get("mode")?;

        Ok(Bucket {
            id: Uuid::parse_str(&id)
                .map_err(|e| GatewayError::Internal(format!("corrupt bucket id {}: {}", id, e)))?,
            organization: row.try_get("organization")?,
            name: row.try_get("name")?,
            remote_path: row.try_get("remote_path")?,
            source: row.try_get("source")?,
            store: store
                .map(|s| StoreKind::from_str(&s))
                .transpose()
                .map_err(GatewayError::Internal)?,
            mode: Mode::from_str(&mode).map_err(GatewayError::Internal)?,
            persistent: row.try_get("persistent")?,
            is_active: row.try_get("is_active")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    async fn active_in(&self, organization: &str) -> Result<Vec<Bucket>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM buckets WHERE organization = ? AND is_active = 1 ORDER BY created_at, name",
            COLUMNS
        ))
        .bind(organization)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::from_row).collect()
    }

    /// Translate a unique index violation into the registry's errors
    fn map_write_error(err: sqlx::Error, bucket: &Bucket) -> GatewayError {
        if let sqlx::Error::Database(db) = &err {
            if db.is_unique_violation() {
                return if db.message().contains("remote_path") {
                    GatewayError::DuplicateMountPoint {
                        remote_path: bucket.remote_path.clone(),
                        existing: "another bucket".to_string(),
                    }
                } else {
                    GatewayError::Conflict(format!("bucket name {} is already in use", bucket.name))
                };
            }
        }
        GatewayError::Registry(err)
    }
}

#[async_trait]
impl BucketRepository for SqliteRepository {
    async fn insert(&self, bucket: Bucket) -> Result<Bucket> {
        check_unique(&bucket, &self.active_in(&bucket.organization).await?)?;

        sqlx::query(&format!(
            "INSERT INTO buckets ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            COLUMNS
        ))
        .bind(bucket.id.to_string())
        .bind(&bucket.organization)
        .bind(&bucket.name)
        .bind(&bucket.remote_path)
        .bind(&bucket.source)
        .bind(bucket.store.map(|s| s.as_str()))
        .bind(bucket.mode.as_str())
        .bind(bucket.persistent)
        .bind(bucket.is_active)
        .bind(bucket.created_at)
        .bind(bucket.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::map_write_error(e, &bucket))?;

        Ok(bucket)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Bucket>> {
        let row = sqlx::query(&format!("SELECT {} FROM buckets WHERE id = ?", COLUMNS))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::from_row).transpose()
    }

    async fn list_active(&self, organization: &str) -> Result<Vec<Bucket>> {
        self.active_in(organization).await
    }

    async fn save(&self, bucket: Bucket) -> Result<Bucket> {
        check_unique(&bucket, &self.active_in(&bucket.organization).await?)?;

        let result = sqlx::query(
            "UPDATE buckets SET name = ?, remote_path = ?, source = ?, store = ?, mode = ?, \
             persistent = ?, is_active = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&bucket.name)
        .bind(&bucket.remote_path)
        .bind(&bucket.source)
        .bind(bucket.store.map(|s| s.as_str()))
        .bind(bucket.mode.as_str())
        .bind(bucket.persistent)
        .bind(bucket.is_active)
        .bind(bucket.updated_at)
        .bind(bucket.id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| Self::map_write_error(e, &bucket))?;

        if result.rows_affected() == 0 {
            return Err(GatewayError::NotFound(format!("bucket {}", bucket.id)));
        }
        Ok(bucket)
    }

    async fn remove(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM buckets WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(GatewayError::NotFound(format!("bucket {}", id)));
        }
        Ok(())
    }
}
