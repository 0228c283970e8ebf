//! Google Cloud Storage client
//!
//! Uses object_store::gcp::GoogleCloudStorage. Authentication follows the
//! explicit service account file when configured, otherwise the ADC chain:
//! - Workload Identity in GKE
//! - GOOGLE_APPLICATION_CREDENTIALS environment variable
//! - GCE metadata server

use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::ObjectStore;
use std::sync::Arc;

use crate::config::GcsConfig;
use crate::storage::{StorageError, StorageResult};

/// Build a client addressing one GCS bucket
pub fn build(config: &GcsConfig, bucket: &str) -> StorageResult<Arc<dyn ObjectStore>> {
    let mut builder = GoogleCloudStorageBuilder::from_env().with_bucket_name(bucket);

    if let Some(path) = &config.service_account_path {
        builder = builder.with_service_account_path(path);
    }

    Ok(Arc::new(builder.build().map_err(StorageError::from)?))
}
