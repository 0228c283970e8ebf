//! Bucket record and request payloads

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::storage::StoreKind;

/// Access mode of a bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Mode {
    /// Every operation goes straight to the provider
    Mount,
    /// Full prefetch into a local working copy; writes stay local
    Copy,
    /// Lazily filled cache; writes are synced to the provider in background
    MountCached,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Mount => "MOUNT",
            Mode::Copy => "COPY",
            Mode::MountCached => "MOUNT_CACHED",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "MOUNT" => Ok(Mode::Mount),
            "COPY" => Ok(Mode::Copy),
            "MOUNT_CACHED" => Ok(Mode::MountCached),
            _ => Err(format!("Unknown mode: {}", s)),
        }
    }
}

/// A registered bucket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    /// System-generated, never reused
    pub id: Uuid,

    /// Scope in which name and mount point are unique
    pub organization: String,

    /// Display label
    pub name: String,

    /// Canonical mount point, always ending with `/`
    pub remote_path: String,

    /// Origin of the data; `None` for a bucket created empty
    pub source: Option<String>,

    /// Explicit provider; inferred from `source` when absent
    pub store: Option<StoreKind>,

    pub mode: Mode,

    /// Backing data survives purge of the record
    pub persistent: bool,

    /// Soft-delete flag
    pub is_active: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Body of `POST /buckets`
#[derive(Debug, Clone, Deserialize)]
pub struct CreateBucket {
    pub name: String,
    pub remote_path: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub store: Option<StoreKind>,
    #[serde(default)]
    pub persistent: bool,
    #[serde(default = "default_mode")]
    pub mode: Mode,
}

fn default_mode() -> Mode {
    Mode::Mount
}

impl Bucket {
    /// Whether `other` reaches its data differently: another source, store
    /// or mode
    pub fn access_differs(&self, other: &Bucket) -> bool {
        self.source != other.source || self.store != other.store || self.mode != other.mode
    }
}

/// Body of `PUT /buckets/{id}`; absent fields keep their value
///
/// `store` distinguishes an absent field from an explicit `null`, which
/// clears the store so that it is inferred from the source again.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateBucket {
    pub name: Option<String>,
    pub remote_path: Option<String>,
    pub source: Option<String>,
    #[serde(default, deserialize_with = "present")]
    pub store: Option<Option<StoreKind>>,
    pub mode: Option<Mode>,
    pub persistent: Option<bool>,
}

/// Maps a present field, `null` included, to `Some`
fn present<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_wire_format() {
        assert_eq!(serde_json::to_string(&Mode::MountCached).unwrap(), "\"MOUNT_CACHED\"");
        let mode: Mode = serde_json::from_str("\"COPY\"").unwrap();
        assert_eq!(mode, Mode::Copy);
        assert_eq!(Mode::from_str("mount").unwrap(), Mode::Mount);
        assert!(Mode::from_str("SYNC").is_err());
    }

    #[test]
    fn test_create_defaults() {
        let req: CreateBucket =
            serde_json::from_str(r#"{"name":"ml-data","remote_path":"/data"}"#).unwrap();
        assert_eq!(req.mode, Mode::Mount);
        assert!(!req.persistent);
        assert!(req.source.is_none());
    }

    #[test]
    fn test_update_store_absent_null_or_set() {
        let absent: UpdateBucket = serde_json::from_str(r#"{"name":"a"}"#).unwrap();
        assert_eq!(absent.store, None);
        let cleared: UpdateBucket = serde_json::from_str(r#"{"store":null}"#).unwrap();
        assert_eq!(cleared.store, Some(None));
        let set: UpdateBucket = serde_json::from_str(r#"{"store":"gcs"}"#).unwrap();
        assert_eq!(set.store, Some(Some(StoreKind::Gcs)));
    }

    #[test]
    fn test_create_rejects_unknown_store() {
        let res: Result<CreateBucket, _> = serde_json::from_str(
            r#"{"name":"a","remote_path":"/a","store":"dropbox"}"#,
        );
        assert!(res.is_err());
    }
}
