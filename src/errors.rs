//! Error types for the bucket gateway
//!
//! Every operation of the gateway API fails with a [`GatewayError`]; the
//! HTTP layer renders it as a JSON body with a matching status code.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::storage::StorageError;

/// Main error type for gateway operations
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Malformed path, or a path escaping the bucket root
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Malformed request payload or bucket definition
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Bucket or object absent
    #[error("Not found: {0}")]
    NotFound(String),

    /// Structural clash, e.g. mkdir over a file
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Another active bucket already claims the mount point
    #[error("Mount point {remote_path} is already used by bucket {existing}")]
    DuplicateMountPoint {
        remote_path: String,
        existing: String,
    },

    /// Provider rejected the credentials
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Transient provider fault
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// Background propagation of a MOUNT_CACHED write exhausted its retries
    #[error("Sync of {path} failed after {attempts} attempts: {reason}")]
    SyncFailed {
        path: String,
        attempts: u32,
        reason: String,
    },

    /// Registry persistence failed
    #[error("Registry error: {0}")]
    Registry(#[from] sqlx::Error),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GatewayError {
    /// Stable machine-readable code for clients
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::InvalidPath(_) => "InvalidPath",
            GatewayError::InvalidRequest(_) => "InvalidRequest",
            GatewayError::NotFound(_) => "NotFound",
            GatewayError::Conflict(_) => "Conflict",
            GatewayError::DuplicateMountPoint { .. } => "DuplicateMountPoint",
            GatewayError::PermissionDenied(_) => "PermissionDenied",
            GatewayError::ProviderUnavailable(_) => "ProviderUnavailable",
            GatewayError::SyncFailed { .. } => "SyncFailed",
            GatewayError::Registry(_)
            | GatewayError::Internal(_)
            | GatewayError::Io(_)
            | GatewayError::Serialization(_) => "InternalError",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::InvalidPath(_) | GatewayError::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Conflict(_) | GatewayError::DuplicateMountPoint { .. } => {
                StatusCode::CONFLICT
            }
            GatewayError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            GatewayError::ProviderUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::SyncFailed { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StorageError> for GatewayError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(key) => GatewayError::NotFound(key),
            StorageError::PermissionDenied(msg) => GatewayError::PermissionDenied(msg),
            StorageError::Unavailable(msg) => GatewayError::ProviderUnavailable(msg),
            StorageError::Conflict(msg) => GatewayError::Conflict(msg),
            StorageError::Invalid(msg) => GatewayError::InvalidRequest(msg),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({
            "error": self.code(),
            "message": self.to_string(),
        }));

        (status, body).into_response()
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_errors_map_to_gateway_taxonomy() {
        let err: GatewayError = StorageError::Unavailable("timeout".into()).into();
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.code(), "ProviderUnavailable");

        let err: GatewayError = StorageError::Conflict("file".into()).into();
        assert_eq!(err.status(), StatusCode::CONFLICT);

        let err: GatewayError = StorageError::PermissionDenied("key".into()).into();
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_duplicate_mount_point_is_conflict() {
        let err = GatewayError::DuplicateMountPoint {
            remote_path: "/data/".into(),
            existing: "ml-data".into(),
        };
        assert_eq!(err.status(), StatusCode::CONFLICT);
        assert!(err.to_string().contains("/data/"));
    }
}
