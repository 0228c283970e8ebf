//! S3-compatible store clients
//!
//! AWS S3, Cloudflare R2 and IBM Cloud Object Storage all speak the S3
//! protocol and are built with `object_store::aws::AmazonS3Builder`.
//!
//! Without explicit keys the builder starts from the environment and
//! falls back to the default AWS credential chain:
//! - IRSA role annotations in Kubernetes
//! - Environment variables (AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY)
//! - EC2 instance metadata
//! - ECS task role

use object_store::aws::AmazonS3Builder;
use object_store::ObjectStore;
use std::sync::Arc;

use crate::config::{IbmConfig, R2Config, S3Config};
use crate::storage::{StorageError, StorageResult};

fn with_keys(
    builder: AmazonS3Builder,
    access_key_id: &Option<String>,
    secret_access_key: &Option<String>,
) -> AmazonS3Builder {
    match (access_key_id, secret_access_key) {
        (Some(id), Some(secret)) => builder
            .with_access_key_id(id)
            .with_secret_access_key(secret),
        _ => builder,
    }
}

/// AWS S3, or any S3-compatible endpoint such as MinIO
pub fn build_s3(config: &S3Config, bucket: &str) -> StorageResult<Arc<dyn ObjectStore>> {
    let mut builder = AmazonS3Builder::from_env()
        .with_bucket_name(bucket)
        .with_region(&config.region);

    // Configure endpoint (for S3-compatible services like MinIO)
    if let Some(endpoint) = &config.endpoint {
        builder = builder.with_endpoint(endpoint);
    }
    if config.allow_http {
        builder = builder.with_allow_http(true);
    }
    builder = with_keys(builder, &config.access_key_id, &config.secret_access_key);

    Ok(Arc::new(builder.build().map_err(StorageError::from)?))
}

/// Cloudflare R2; the endpoint is derived from the account id
pub fn build_r2(config: &R2Config, bucket: &str) -> StorageResult<Arc<dyn ObjectStore>> {
    let account_id = config
        .account_id
        .as_deref()
        .ok_or_else(|| StorageError::Invalid("R2 requires providers.r2.account_id".to_string()))?;

    let builder = AmazonS3Builder::new()
        .with_bucket_name(bucket)
        .with_region("auto")
        .with_endpoint(format!("https://{}.r2.cloudflarestorage.com", account_id));
    let builder = with_keys(builder, &config.access_key_id, &config.secret_access_key);

    Ok(Arc::new(builder.build().map_err(StorageError::from)?))
}

/// IBM Cloud Object Storage via its S3 endpoint
pub fn build_ibm(config: &IbmConfig, bucket: &str) -> StorageResult<Arc<dyn ObjectStore>> {
    let endpoint = config
        .endpoint
        .clone()
        .unwrap_or_else(|| format!("https://s3.{}.cloud-object-storage.appdomain.cloud", config.region));

    let builder = AmazonS3Builder::new()
        .with_bucket_name(bucket)
        .with_region(&config.region)
        .with_endpoint(endpoint);
    let builder = with_keys(builder, &config.access_key_id, &config.secret_access_key);

    Ok(Arc::new(builder.build().map_err(StorageError::from)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_r2_requires_account_id() {
        let err = build_r2(&R2Config::default(), "bucket").err().unwrap();
        assert!(matches!(err, StorageError::Invalid(_)));
    }

    #[test]
    fn test_ibm_builds_with_explicit_keys() {
        let config = IbmConfig {
            access_key_id: Some("id".to_string()),
            secret_access_key: Some("secret".to_string()),
            ..IbmConfig::default()
        };
        assert!(build_ibm(&config, "bucket").is_ok());
    }
}
