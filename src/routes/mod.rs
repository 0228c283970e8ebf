//! HTTP routes of the gateway API
//!
//! Bucket lifecycle:
//! - POST /buckets, GET /buckets
//! - GET/PUT/DELETE /buckets/{id}
//! - POST /buckets/{id}/restore, POST /buckets/{id}/purge
//! - GET /buckets/{id}/sync
//!
//! File operations, all scoped to one bucket:
//! - POST /buckets/{id}/list
//! - POST /buckets/{id}/get-file
//! - POST /buckets/{id}/upload-file (multipart)
//! - POST /buckets/{id}/delete-file
//! - POST /buckets/{id}/create-dir

mod handlers;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::gateway::Gateway;

pub use handlers::ORGANIZATION_HEADER;

/// Create the gateway API router
pub fn create_router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/healthz", get(handlers::health))
        .route("/ready", get(handlers::ready))
        .route("/metrics", get(handlers::metrics))
        .route("/buckets", post(handlers::create_bucket).get(handlers::list_buckets))
        .route(
            "/buckets/:id",
            get(handlers::get_bucket)
                .put(handlers::update_bucket)
                .delete(handlers::delete_bucket),
        )
        .route("/buckets/:id/restore", post(handlers::restore_bucket))
        .route("/buckets/:id/purge", post(handlers::purge_bucket))
        .route("/buckets/:id/sync", get(handlers::sync_status))
        .route("/buckets/:id/list", post(handlers::list_files))
        .route("/buckets/:id/get-file", post(handlers::get_file))
        .route("/buckets/:id/upload-file", post(handlers::upload_file))
        .route("/buckets/:id/delete-file", post(handlers::delete_file))
        .route("/buckets/:id/create-dir", post(handlers::create_dir))
        .with_state(gateway)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::policy::PolicyEngine;
    use crate::registry::{MemoryRepository, Registry};
    use crate::storage::ProviderFactory;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn app(dir: &std::path::Path) -> Router {
        let mut config = Config::default();
        config.storage.managed_root = dir.join("managed");
        config.cache.root = dir.join("cache");
        let factory = ProviderFactory::new(config.providers.clone(), config.storage.managed_root.clone());
        let gateway = Gateway::new(
            Registry::new(Arc::new(MemoryRepository::new())),
            PolicyEngine::new(factory, &config),
        );
        create_router(Arc::new(gateway))
    }

    fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .header(ORGANIZATION_HEADER, "acme")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let dir = tempfile::tempdir().unwrap();
        let response = app(dir.path())
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_bucket_and_file_round_trip_over_http() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path());

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/buckets",
                json!({"name": "ml-data", "remote_path": "/data", "mode": "MOUNT", "source": ""}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let bucket = body_json(response).await;
        let id = bucket["id"].as_str().unwrap().to_string();
        assert_eq!(bucket["remote_path"], "/data/");

        let boundary = "gatewayboundary";
        let multipart = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"path\"\r\n\r\n/\r\n\
             --{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"a.csv\"\r\n\
             Content-Type: text/csv\r\n\r\nx,y\r\n\
             --{b}--\r\n",
            b = boundary
        );
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/buckets/{}/upload-file", id))
                    .header(
                        header::CONTENT_TYPE,
                        format!("multipart/form-data; boundary={}", boundary),
                    )
                    .header(ORGANIZATION_HEADER, "acme")
                    .body(Body::from(multipart))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({"status": "ok", "path": "/a.csv"}));

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                &format!("/buckets/{}/list", id),
                json!({"path": "/", "storage_options": {}}),
            ))
            .await
            .unwrap();
        let listing = body_json(response).await;
        assert_eq!(listing["path"], "/");
        assert_eq!(listing["items"][0]["name"], "a.csv");
        assert_eq!(listing["items"][0]["type"], "file");

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                &format!("/buckets/{}/get-file", id),
                json!({"path": "a.csv"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/csv");
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"x,y");
    }

    #[tokio::test]
    async fn test_errors_render_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path());

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                &format!("/buckets/{}/list", uuid::Uuid::new_v4()),
                json!({"path": "/"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["error"], "NotFound");

        let create = |name: &str| {
            json_request("POST", "/buckets", json!({"name": name, "remote_path": "/data"}))
        };
        let response = app.clone().oneshot(create("ml-data")).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app.clone().oneshot(create("ml-data-2")).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(body_json(response).await["error"], "DuplicateMountPoint");
    }
}
