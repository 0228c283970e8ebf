//! Request handlers for the gateway API

use axum::{
    body::Body,
    extract::{Multipart, Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use crate::errors::{GatewayError, Result};
use crate::gateway::{FileRequest, Gateway, ListResponse, StatusResponse, StorageOptions};
use crate::policy::SyncStatus;
use crate::registry::{Bucket, CreateBucket, UpdateBucket};

/// Header naming the caller's organization
pub const ORGANIZATION_HEADER: &str = "x-organization-id";

const DEFAULT_ORGANIZATION: &str = "default";

fn organization(headers: &HeaderMap) -> String {
    headers
        .get(ORGANIZATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(DEFAULT_ORGANIZATION)
        .to_string()
}

/// Health check endpoint
#[instrument]
pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// Readiness probe: the registry must answer
#[instrument(skip(gateway))]
pub async fn ready(State(gateway): State<Arc<Gateway>>) -> impl IntoResponse {
    match gateway.list_buckets(DEFAULT_ORGANIZATION).await {
        Ok(_) => (StatusCode::OK, "Ready"),
        Err(e) => {
            error!(error = %e, "Registry not ready");
            (StatusCode::SERVICE_UNAVAILABLE, "Not ready")
        }
    }
}

/// Prometheus metrics endpoint
#[instrument]
pub async fn metrics() -> Result<String> {
    crate::metrics::render().map_err(|e| GatewayError::Internal(format!("metrics: {}", e)))
}

/// POST /buckets
#[instrument(skip(gateway, headers, req))]
pub async fn create_bucket(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
    Json(req): Json<CreateBucket>,
) -> Result<(StatusCode, Json<Bucket>)> {
    let bucket = gateway.create_bucket(&organization(&headers), req).await?;
    Ok((StatusCode::CREATED, Json(bucket)))
}

/// GET /buckets
#[instrument(skip(gateway, headers))]
pub async fn list_buckets(
    State(gateway): State<Arc<Gateway>>,
    headers: HeaderMap,
) -> Result<Json<Vec<Bucket>>> {
    Ok(Json(gateway.list_buckets(&organization(&headers)).await?))
}

/// GET /buckets/{id}
#[instrument(skip(gateway, headers))]
pub async fn get_bucket(
    State(gateway): State<Arc<Gateway>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<Bucket>> {
    Ok(Json(gateway.get_bucket(&organization(&headers), id).await?))
}

/// PUT /buckets/{id}
#[instrument(skip(gateway, headers, req))]
pub async fn update_bucket(
    State(gateway): State<Arc<Gateway>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(req): Json<UpdateBucket>,
) -> Result<Json<Bucket>> {
    Ok(Json(gateway.update_bucket(&organization(&headers), id, req).await?))
}

/// DELETE /buckets/{id}: soft delete
#[instrument(skip(gateway, headers))]
pub async fn delete_bucket(
    State(gateway): State<Arc<Gateway>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<Bucket>> {
    Ok(Json(gateway.delete_bucket(&organization(&headers), id).await?))
}

/// POST /buckets/{id}/restore
#[instrument(skip(gateway, headers))]
pub async fn restore_bucket(
    State(gateway): State<Arc<Gateway>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<Bucket>> {
    Ok(Json(gateway.restore_bucket(&organization(&headers), id).await?))
}

/// POST /buckets/{id}/purge
#[instrument(skip(gateway, headers))]
pub async fn purge_bucket(
    State(gateway): State<Arc<Gateway>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<StatusCode> {
    gateway.purge_bucket(&organization(&headers), id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /buckets/{id}/sync
#[instrument(skip(gateway, headers))]
pub async fn sync_status(
    State(gateway): State<Arc<Gateway>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<SyncStatus>> {
    Ok(Json(gateway.sync_status(&organization(&headers), id).await?))
}

/// POST /buckets/{id}/list
#[instrument(skip(gateway, headers, req))]
pub async fn list_files(
    State(gateway): State<Arc<Gateway>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(req): Json<FileRequest>,
) -> Result<Json<ListResponse>> {
    Ok(Json(gateway.list(&organization(&headers), id, &req).await?))
}

/// POST /buckets/{id}/get-file
#[instrument(skip(gateway, headers, req))]
pub async fn get_file(
    State(gateway): State<Arc<Gateway>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(req): Json<FileRequest>,
) -> Result<Response> {
    let content = gateway.get_file(&organization(&headers), id, &req).await?;
    let content_type = mime_guess::from_path(&content.path).first_or_octet_stream();

    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type.as_ref())
        .header(header::CONTENT_LENGTH, content.data.len())
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", content.name),
        )
        .body(Body::from(content.data))
        .map_err(|e| GatewayError::Internal(format!("Failed to build response: {}", e)))?;

    Ok(response)
}

/// POST /buckets/{id}/upload-file
///
/// Multipart fields: `file` (with a file name), `path` (target directory),
/// optional `cwd` and `storage_options` (JSON text).
#[instrument(skip(gateway, headers, multipart))]
pub async fn upload_file(
    State(gateway): State<Arc<Gateway>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<StatusResponse>> {
    let mut path = None;
    let mut cwd = None;
    let mut storage_options = None;
    let mut file: Option<(String, Bytes)> = None;

    while let Some(field) = multipart.next_field().await.map_err(bad_multipart)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let file_name = field
                    .file_name()
                    .map(str::to_string)
                    .filter(|n| !n.is_empty())
                    .ok_or_else(|| {
                        GatewayError::InvalidRequest("file field has no file name".to_string())
                    })?;
                let data = field.bytes().await.map_err(bad_multipart)?;
                file = Some((file_name, data));
            }
            "path" => path = Some(field.text().await.map_err(bad_multipart)?),
            "cwd" => cwd = Some(field.text().await.map_err(bad_multipart)?),
            "storage_options" => {
                let text = field.text().await.map_err(bad_multipart)?;
                if !text.trim().is_empty() {
                    let options: StorageOptions = serde_json::from_str(&text).map_err(|e| {
                        GatewayError::InvalidRequest(format!("storage_options: {}", e))
                    })?;
                    storage_options = Some(options);
                }
            }
            other => debug!(field = other, "Ignoring multipart field"),
        }
    }

    let (file_name, data) =
        file.ok_or_else(|| GatewayError::InvalidRequest("missing file field".to_string()))?;
    info!(bucket_id = %id, file = %file_name, size = data.len(), "Upload request");

    let req = FileRequest {
        path: path.unwrap_or_else(|| "/".to_string()),
        cwd,
        storage_options,
    };
    let status = gateway
        .upload_file(&organization(&headers), id, &req, &file_name, data)
        .await?;
    Ok(Json(status))
}

/// POST /buckets/{id}/delete-file
#[instrument(skip(gateway, headers, req))]
pub async fn delete_file(
    State(gateway): State<Arc<Gateway>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(req): Json<FileRequest>,
) -> Result<Json<StatusResponse>> {
    Ok(Json(gateway.delete_file(&organization(&headers), id, &req).await?))
}

/// POST /buckets/{id}/create-dir
#[instrument(skip(gateway, headers, req))]
pub async fn create_dir(
    State(gateway): State<Arc<Gateway>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(req): Json<FileRequest>,
) -> Result<Json<StatusResponse>> {
    Ok(Json(gateway.create_dir(&organization(&headers), id, &req).await?))
}

fn bad_multipart(err: axum::extract::multipart::MultipartError) -> GatewayError {
    GatewayError::InvalidRequest(format!("multipart: {}", err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_organization_header_defaults() {
        let mut headers = HeaderMap::new();
        assert_eq!(organization(&headers), "default");
        headers.insert(ORGANIZATION_HEADER, "acme".parse().unwrap());
        assert_eq!(organization(&headers), "acme");
        headers.insert(ORGANIZATION_HEADER, "  ".parse().unwrap());
        assert_eq!(organization(&headers), "default");
    }
}
