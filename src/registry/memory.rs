//! In-memory bucket repository

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{check_unique, Bucket, BucketRepository};
use crate::errors::{GatewayError, Result};

/// Records live for the lifetime of the process
#[derive(Default)]
pub struct MemoryRepository {
    buckets: RwLock<HashMap<Uuid, Bucket>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BucketRepository for MemoryRepository {
    async fn insert(&self, bucket: Bucket) -> Result<Bucket> {
        let mut buckets = self.buckets.write().await;
        if buckets.contains_key(&bucket.id) {
            return Err(GatewayError::Conflict(format!("bucket id {} exists", bucket.id)));
        }
        check_unique(&bucket, buckets.values())?;
        buckets.insert(bucket.id, bucket.clone());
        Ok(bucket)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Bucket>> {
        Ok(self.buckets.read().await.get(&id).cloned())
    }

    async fn list_active(&self, organization: &str) -> Result<Vec<Bucket>> {
        let mut buckets: Vec<Bucket> = self
            .buckets
            .read()
            .await
            .values()
            .filter(|b| b.is_active && b.organization == organization)
            .cloned()
            .collect();
        buckets.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        Ok(buckets)
    }

    async fn save(&self, bucket: Bucket) -> Result<Bucket> {
        let mut buckets = self.buckets.write().await;
        if !buckets.contains_key(&bucket.id) {
            return Err(GatewayError::NotFound(format!("bucket {}", bucket.id)));
        }
        check_unique(&bucket, buckets.values())?;
        buckets.insert(bucket.id, bucket.clone());
        Ok(bucket)
    }

    async fn remove(&self, id: Uuid) -> Result<()> {
        self.buckets
            .write()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| GatewayError::NotFound(format!("bucket {}", id)))
    }
}
