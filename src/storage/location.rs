//! Source URI parsing
//!
//! Establishes the provider and native addressing of a bucket from its
//! optional `store` selector and `source` URI.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use url::Url;

/// Explicit provider selector of a bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// AWS S3
    S3,
    /// Google Cloud Storage
    Gcs,
    /// Azure Blob Storage
    Azure,
    /// Cloudflare R2
    R2,
    /// IBM Cloud Object Storage
    Ibm,
}

impl StoreKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreKind::S3 => "s3",
            StoreKind::Gcs => "gcs",
            StoreKind::Azure => "azure",
            StoreKind::R2 => "r2",
            StoreKind::Ibm => "ibm",
        }
    }

    /// URI scheme used when describing locations of this store
    pub fn scheme(&self) -> &'static str {
        match self {
            StoreKind::S3 => "s3",
            StoreKind::Gcs => "gs",
            StoreKind::Azure => "az",
            StoreKind::R2 => "r2",
            StoreKind::Ibm => "cos",
        }
    }

    /// Stores reachable through the S3 protocol
    pub fn is_s3_compatible(&self) -> bool {
        matches!(self, StoreKind::S3 | StoreKind::R2 | StoreKind::Ibm)
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StoreKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "s3" | "aws" => Ok(StoreKind::S3),
            "gcs" | "gs" | "gcp" => Ok(StoreKind::Gcs),
            "azure" | "az" => Ok(StoreKind::Azure),
            "r2" | "cloudflare" => Ok(StoreKind::R2),
            "ibm" | "cos" => Ok(StoreKind::Ibm),
            _ => Err(format!("Unknown store: {}", s)),
        }
    }
}

/// Where a bucket's data physically lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceLocation {
    /// Directory on the gateway host
    Local { root: PathBuf },
    /// Container (bucket) plus key prefix on an object store
    Cloud {
        kind: StoreKind,
        container: String,
        prefix: String,
    },
}

impl SourceLocation {
    /// Parse a bucket source
    ///
    /// Returns `Ok(None)` for an absent or blank source, which means a new
    /// empty bucket whose location the caller decides.
    pub fn parse(store: Option<StoreKind>, source: Option<&str>) -> Result<Option<Self>, String> {
        let source = match source.map(str::trim) {
            None | Some("") => return Ok(None),
            Some(s) => s,
        };

        if let Some(path) = source.strip_prefix("file://") {
            return Self::local(store, path).map(Some);
        }
        if !source.contains("://") {
            return Self::local(store, source).map(Some);
        }

        let url = Url::parse(source).map_err(|e| format!("invalid source URI {}: {}", source, e))?;
        let scheme_kind = match url.scheme() {
            "s3" | "s3a" => StoreKind::S3,
            "gs" | "gcs" => StoreKind::Gcs,
            "az" | "azure" | "abfs" => StoreKind::Azure,
            "r2" => StoreKind::R2,
            "cos" | "ibm" => StoreKind::Ibm,
            other => return Err(format!("unsupported source scheme: {}", other)),
        };

        let kind = match store {
            None => scheme_kind,
            Some(explicit) if explicit == scheme_kind => explicit,
            // An S3 URI may point at any S3-compatible store.
            Some(explicit) if scheme_kind == StoreKind::S3 && explicit.is_s3_compatible() => explicit,
            Some(explicit) => {
                return Err(format!(
                    "source scheme {} does not match store {}",
                    url.scheme(),
                    explicit
                ))
            }
        };

        let container = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| format!("source URI {} names no bucket", source))?
            .to_string();
        let prefix = url
            .path()
            .split('/')
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("/");

        Ok(Some(SourceLocation::Cloud {
            kind,
            container,
            prefix,
        }))
    }

    fn local(store: Option<StoreKind>, path: &str) -> Result<Self, String> {
        if let Some(kind) = store {
            return Err(format!("local source {} cannot use store {}", path, kind));
        }
        if path.is_empty() {
            return Err("local source path is empty".to_string());
        }
        Ok(SourceLocation::Local {
            root: PathBuf::from(path),
        })
    }

    pub fn store(&self) -> Option<StoreKind> {
        match self {
            SourceLocation::Local { .. } => None,
            SourceLocation::Cloud { kind, .. } => Some(*kind),
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceLocation::Local { root } => write!(f, "file://{}", root.display()),
            SourceLocation::Cloud {
                kind,
                container,
                prefix,
            } => write!(f, "{}://{}/{}", kind.scheme(), container, prefix),
        }
    }
}
