//! Azure Blob Storage client
//!
//! Uses object_store::azure::MicrosoftAzure. Without an explicit access key
//! the builder reads the environment (AZURE_STORAGE_ACCOUNT_NAME,
//! AZURE_CLIENT_ID, AZURE_TENANT_ID, ...) and falls back to managed identity
//! or workload identity in AKS.

use object_store::azure::MicrosoftAzureBuilder;
use object_store::ObjectStore;
use std::sync::Arc;

use crate::config::AzureConfig;
use crate::storage::{StorageError, StorageResult};

/// Build a client addressing one container
pub fn build(config: &AzureConfig, container: &str) -> StorageResult<Arc<dyn ObjectStore>> {
    let mut builder = MicrosoftAzureBuilder::from_env().with_container_name(container);

    if let Some(account) = &config.account {
        builder = builder.with_account(account);
    }
    if let Some(key) = &config.access_key {
        builder = builder.with_access_key(key);
    }
    if config.use_emulator {
        builder = builder.with_use_emulator(true);
    }

    Ok(Arc::new(builder.build().map_err(StorageError::from)?))
}
