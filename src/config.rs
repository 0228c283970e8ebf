//! Configuration management for the bucket gateway
//!
//! Supports configuration via:
//! - Optional TOML config file (named by BUCKET_GATEWAY_CONFIG_FILE)
//! - Environment variables
//!
//! Environment variables take precedence over config file values.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::storage::StoreKind;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0:8080)
    pub bind_address: SocketAddr,

    /// Request timeout in seconds (default: 300)
    pub timeout_secs: u64,

    /// Max request body size in bytes (default: 5GB)
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([0, 0, 0, 0], 8080)),
            timeout_secs: 300,
            max_body_size: 5 * 1024 * 1024 * 1024,
        }
    }
}

/// Bucket registry configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// SQLite URL, e.g. `sqlite://./data/registry.db`; in-memory when unset
    pub database_url: Option<String>,
}

/// Provider access configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root of the directories backing buckets created without a source
    pub managed_root: PathBuf,

    /// Upper bound for a single provider call, in seconds
    pub operation_timeout_secs: u64,

    /// Attempts for idempotent reads when the provider is unavailable
    pub read_attempts: u32,

    /// Directory that per-request local source overrides must stay under;
    /// local overrides are refused when unset
    pub local_override_root: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            managed_root: PathBuf::from("./data/buckets"),
            operation_timeout_secs: 120,
            read_attempts: 3,
            local_override_root: None,
        }
    }
}

impl StorageConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

/// Local cache and working copy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Root directory of caches and COPY working copies
    pub root: PathBuf,

    /// Age after which a clean MOUNT_CACHED entry is fetched again
    pub ttl_secs: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./data/cache"),
            ttl_secs: None,
        }
    }
}

/// Background sync configuration for MOUNT_CACHED buckets
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Attempts per pending write before it fails terminally
    pub max_attempts: u32,

    /// First retry delay in milliseconds; doubles per attempt
    pub initial_backoff_ms: u64,

    /// Retry delay ceiling in milliseconds
    pub max_backoff_ms: u64,

    /// Queued writes per bucket before writers wait
    pub queue_capacity: usize,

    /// How long purge and shutdown wait for pending writes, in seconds
    pub drain_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 200,
            max_backoff_ms: 30_000,
            queue_capacity: 256,
            drain_timeout_secs: 30,
        }
    }
}

/// AWS S3 (and S3-compatible endpoints such as MinIO)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct S3Config {
    pub region: String,
    pub endpoint: Option<String>,
    pub allow_http: bool,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    /// Bucket holding empty-source buckets of this store
    pub default_bucket: Option<String>,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            endpoint: None,
            allow_http: false,
            access_key_id: None,
            secret_access_key: None,
            default_bucket: None,
        }
    }
}

/// Cloudflare R2
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct R2Config {
    pub account_id: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub default_bucket: Option<String>,
}

/// IBM Cloud Object Storage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IbmConfig {
    pub region: String,
    pub endpoint: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub default_bucket: Option<String>,
}

impl Default for IbmConfig {
    fn default() -> Self {
        Self {
            region: "us-south".to_string(),
            endpoint: None,
            access_key_id: None,
            secret_access_key: None,
            default_bucket: None,
        }
    }
}

/// Google Cloud Storage
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GcsConfig {
    pub service_account_path: Option<String>,
    pub default_bucket: Option<String>,
}

/// Azure Blob Storage
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AzureConfig {
    pub account: Option<String>,
    pub access_key: Option<String>,
    pub use_emulator: bool,
    pub default_container: Option<String>,
}

/// Per-store provider settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    pub s3: S3Config,
    pub r2: R2Config,
    pub ibm: IbmConfig,
    pub gcs: GcsConfig,
    pub azure: AzureConfig,
}

impl ProvidersConfig {
    /// Container that hosts empty-source buckets of the given store
    pub fn default_container(&self, kind: StoreKind) -> Option<String> {
        match kind {
            StoreKind::S3 => self.s3.default_bucket.clone(),
            StoreKind::R2 => self.r2.default_bucket.clone(),
            StoreKind::Ibm => self.ibm.default_bucket.clone(),
            StoreKind::Gcs => self.gcs.default_bucket.clone(),
            StoreKind::Azure => self.azure.default_container.clone(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub registry: RegistryConfig,
    pub storage: StorageConfig,
    pub cache: CacheConfig,
    pub sync: SyncConfig,
    pub providers: ProvidersConfig,

    /// Log level used when RUST_LOG is unset (default: info)
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            registry: RegistryConfig::default(),
            storage: StorageConfig::default(),
            cache: CacheConfig::default(),
            sync: SyncConfig::default(),
            providers: ProvidersConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

fn env(name: &str) -> Option<String> {
    std::env::var(format!("BUCKET_GATEWAY_{}", name)).ok()
}

fn parse_env<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env(name)
        .map(|value| {
            value
                .parse::<T>()
                .with_context(|| format!("parsing BUCKET_GATEWAY_{} value `{}`", name, value))
        })
        .transpose()
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Environment variables (all prefixed with BUCKET_GATEWAY_):
    /// - CONFIG_FILE: optional path to TOML config file
    /// - BIND_ADDRESS, TIMEOUT_SECS, MAX_BODY_SIZE: HTTP server
    /// - DATABASE_URL: SQLite registry URL
    /// - MANAGED_ROOT, OPERATION_TIMEOUT_SECS, READ_ATTEMPTS,
    ///   LOCAL_OVERRIDE_ROOT: provider access
    /// - CACHE_ROOT, CACHE_TTL_SECS: local cache
    /// - SYNC_MAX_ATTEMPTS, SYNC_INITIAL_BACKOFF_MS, SYNC_MAX_BACKOFF_MS,
    ///   SYNC_QUEUE_CAPACITY, SYNC_DRAIN_TIMEOUT_SECS: MOUNT_CACHED sync
    /// - S3_REGION, S3_ENDPOINT, S3_DEFAULT_BUCKET, R2_ACCOUNT_ID,
    ///   GCS_SERVICE_ACCOUNT_PATH, AZURE_ACCOUNT: providers
    /// - LOG_LEVEL: log level (default: info)
    pub fn from_env() -> Result<Self> {
        let mut config = match env("CONFIG_FILE") {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };

        if let Some(addr) = parse_env("BIND_ADDRESS")? {
            config.server.bind_address = addr;
        }
        if let Some(timeout) = parse_env("TIMEOUT_SECS")? {
            config.server.timeout_secs = timeout;
        }
        if let Some(size) = parse_env("MAX_BODY_SIZE")? {
            config.server.max_body_size = size;
        }

        if let Some(url) = env("DATABASE_URL") {
            config.registry.database_url = Some(url);
        }

        if let Some(root) = env("MANAGED_ROOT") {
            config.storage.managed_root = PathBuf::from(root);
        }
        if let Some(timeout) = parse_env("OPERATION_TIMEOUT_SECS")? {
            config.storage.operation_timeout_secs = timeout;
        }
        if let Some(attempts) = parse_env("READ_ATTEMPTS")? {
            config.storage.read_attempts = attempts;
        }
        if let Some(root) = env("LOCAL_OVERRIDE_ROOT") {
            config.storage.local_override_root = Some(PathBuf::from(root));
        }

        if let Some(root) = env("CACHE_ROOT") {
            config.cache.root = PathBuf::from(root);
        }
        if let Some(ttl) = parse_env("CACHE_TTL_SECS")? {
            config.cache.ttl_secs = Some(ttl);
        }

        if let Some(attempts) = parse_env("SYNC_MAX_ATTEMPTS")? {
            config.sync.max_attempts = attempts;
        }
        if let Some(ms) = parse_env("SYNC_INITIAL_BACKOFF_MS")? {
            config.sync.initial_backoff_ms = ms;
        }
        if let Some(ms) = parse_env("SYNC_MAX_BACKOFF_MS")? {
            config.sync.max_backoff_ms = ms;
        }
        if let Some(capacity) = parse_env("SYNC_QUEUE_CAPACITY")? {
            config.sync.queue_capacity = capacity;
        }
        if let Some(secs) = parse_env("SYNC_DRAIN_TIMEOUT_SECS")? {
            config.sync.drain_timeout_secs = secs;
        }

        if let Some(region) = env("S3_REGION") {
            config.providers.s3.region = region;
        }
        if let Some(endpoint) = env("S3_ENDPOINT") {
            config.providers.s3.endpoint = Some(endpoint);
        }
        if let Some(bucket) = env("S3_DEFAULT_BUCKET") {
            config.providers.s3.default_bucket = Some(bucket);
        }
        if let Some(account) = env("R2_ACCOUNT_ID") {
            config.providers.r2.account_id = Some(account);
        }
        if let Some(path) = env("GCS_SERVICE_ACCOUNT_PATH") {
            config.providers.gcs.service_account_path = Some(path);
        }
        if let Some(account) = env("AZURE_ACCOUNT") {
            config.providers.azure.account = Some(account);
        }

        if let Some(level) = env("LOG_LEVEL") {
            config.log_level = level;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from TOML file
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path))?;
        let config: Config =
            toml::from_str(&content).with_context(|| format!("parsing config file {}", path))?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.sync.max_attempts == 0 {
            anyhow::bail!("sync.max_attempts must be at least 1");
        }
        if self.sync.queue_capacity == 0 {
            anyhow::bail!("sync.queue_capacity must be at least 1");
        }
        if self.storage.read_attempts == 0 {
            anyhow::bail!("storage.read_attempts must be at least 1");
        }
        Ok(())
    }
}
