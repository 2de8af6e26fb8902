use crate::config::ApiConfig;
use crate::orchestrator::{IngestRequest, IngestionOrchestrator, PipelineError};
use crate::record_store::ImageRecord;
use anyhow::{Context, Result};
use axum::{
    extract::{
        multipart::MultipartError, rejection::QueryRejection, DefaultBodyLimit, Multipart, Path,
        Query, State,
    },
    http::{HeaderValue, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<IngestionOrchestrator>,
    pub max_list_limit: u32,
}

/// Query parameters for the image list
#[derive(Debug, Deserialize)]
pub struct ListQuery {
    /// Number of records to skip
    #[serde(default)]
    pub skip: u32,
    /// Maximum results
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    10
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn status_for(err: &PipelineError) -> StatusCode {
    match err {
        PipelineError::InvalidInput { .. } => StatusCode::BAD_REQUEST,
        PipelineError::NotFound => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn pipeline_error(err: &PipelineError) -> ApiError {
    (
        status_for(err),
        Json(ErrorResponse {
            error: err.to_string(),
            code: err.reason().to_ascii_uppercase(),
        }),
    )
}

fn multipart_error(err: MultipartError) -> ApiError {
    (
        err.status(),
        Json(ErrorResponse {
            error: err.body_text(),
            code: "INVALID_MULTIPART".to_string(),
        }),
    )
}

fn invalid_query(message: String) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: message,
            code: "INVALID_QUERY".to_string(),
        }),
    )
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<HeaderValue> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/", get(root))
        .route("/healthcheck", get(health_check))
        .route("/api/images", get(list_images).post(upload_image))
        .route("/api/images/", get(list_images).post(upload_image))
        .route("/api/images/:image_id", get(get_image))
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn root() -> impl IntoResponse {
    Json(serde_json::json!({ "message": "Image Recognition API" }))
}

/// Liveness probe covering the record store and the blob bucket
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.orchestrator.check_health().await;

    if report.is_healthy() {
        return (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "healthy" })),
        );
    }

    let mut body = serde_json::json!({ "status": "degraded" });
    if let Some(database_error) = report.database_error {
        body["database_error"] = database_error.into();
    }
    if let Some(storage_error) = report.storage_error {
        body["storage_error"] = storage_error.into();
    }

    (StatusCode::SERVICE_UNAVAILABLE, Json(body))
}

/// Accept a multipart upload (field `file`) and ingest it
#[instrument(skip(state, multipart))]
async fn upload_image(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<ImageRecord>, ApiError> {
    let mut request = None;

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some("file") {
            continue;
        }

        let filename = field.file_name().unwrap_or("upload").to_string();
        let content_type = field.content_type().unwrap_or_default().to_string();
        let bytes = field.bytes().await.map_err(multipart_error)?;

        request = Some(IngestRequest {
            filename,
            content_type,
            bytes,
        });
        break;
    }

    let request = request.ok_or_else(|| {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "Missing multipart field 'file'".to_string(),
                code: "MISSING_FILE".to_string(),
            }),
        )
    })?;

    let record = state.orchestrator.ingest(request).await.map_err(|e| {
        match status_for(&e) {
            StatusCode::BAD_REQUEST => warn!(error = %e, "Upload rejected"),
            _ => error!(error = %e, "Upload failed"),
        }
        pipeline_error(&e)
    })?;

    Ok(Json(record))
}

/// Get a single image record
#[instrument(skip(state))]
async fn get_image(
    State(state): State<AppState>,
    Path(image_id): Path<String>,
) -> Result<Json<ImageRecord>, ApiError> {
    // An id that is not a UUID cannot name a stored record
    let id = Uuid::parse_str(&image_id).map_err(|_| pipeline_error(&PipelineError::NotFound))?;

    let record = state.orchestrator.get_by_id(id).await.map_err(|e| {
        if !matches!(e, PipelineError::NotFound) {
            error!(error = %e, "Failed to get image");
        }
        pipeline_error(&e)
    })?;

    Ok(Json(record))
}

/// List image records in store order
#[instrument(skip(state))]
async fn list_images(
    State(state): State<AppState>,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> Result<Json<Vec<ImageRecord>>, ApiError> {
    let Query(params) = query.map_err(|rejection| invalid_query(rejection.body_text()))?;

    // A short page must mean the end of the list
    let max = state.max_list_limit;
    if params.limit > max {
        return Err(invalid_query(format!("limit must not exceed {max}")));
    }

    let records = state
        .orchestrator
        .list(params.skip, params.limit)
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to list images");
            pipeline_error(&e)
        })?;

    Ok(Json(records))
}

/// Serve the HTTP API until `shutdown` resolves, then drain in-flight requests
pub async fn start_api_server<F>(state: AppState, config: &ApiConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting image API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::{BlobStore, MemoryBlobStore};
    use crate::object_detector::DetectorHandle;
    use crate::record_store::MemoryRecordStore;
    use crate::test_support::solid_png;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request};
    use bytes::Bytes;
    use tower::ServiceExt;

    const BOUNDARY: &str = "recognition-test-boundary";

    async fn test_state(with_bucket: bool) -> AppState {
        let blobs = Arc::new(MemoryBlobStore::new("http://minio:9000", "images"));
        if with_bucket {
            blobs.ensure_container().await.unwrap();
        }

        AppState {
            orchestrator: Arc::new(IngestionOrchestrator::new(
                blobs,
                Arc::new(MemoryRecordStore::new()),
                Arc::new(DetectorHandle::disabled()),
            )),
            max_list_limit: 100,
        }
    }

    fn multipart_upload(filename: &str, content_type: &str, data: &[u8]) -> Request<Body> {
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\nContent-Type: {content_type}\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri("/api/images/")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_root_message() {
        let app = create_router(test_state(true).await, &ApiConfig::default());

        let response = app.oneshot(get("/")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["message"], "Image Recognition API");
    }

    #[tokio::test]
    async fn test_upload_then_fetch() {
        let app = create_router(test_state(true).await, &ApiConfig::default());

        let response = app
            .clone()
            .oneshot(multipart_upload("cat.png", "image/png", &solid_png(4, 4, [10, 10, 200])))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let created = json_body(response).await;
        assert_eq!(created["filename"], "cat.png");
        let id = created["id"].as_str().unwrap().to_string();
        assert!(created["object_url"]
            .as_str()
            .unwrap()
            .ends_with(&format!("/images/{id}/cat.png")));

        let response = app
            .oneshot(get(&format!("/api/images/{id}")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, created);
    }

    #[tokio::test]
    async fn test_upload_rejects_non_image() {
        let app = create_router(test_state(true).await, &ApiConfig::default());

        let response = app
            .oneshot(multipart_upload("notes.txt", "text/plain", b"hello"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["error"], "File must be an image");
        assert_eq!(body["code"], "INVALID_INPUT");
    }

    #[tokio::test]
    async fn test_upload_storage_failure_is_500() {
        // No bucket: the blob store refuses the upload
        let app = create_router(test_state(false).await, &ApiConfig::default());

        let response = app
            .oneshot(multipart_upload("cat.png", "image/png", &solid_png(2, 2, [0, 0, 0])))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(response).await;
        assert!(body["error"].as_str().unwrap().starts_with("Storage error:"));
        assert_eq!(body["code"], "STORAGE_FAILED");
    }

    #[tokio::test]
    async fn test_get_missing_and_malformed_ids() {
        let app = create_router(test_state(true).await, &ApiConfig::default());

        for uri in [
            format!("/api/images/{}", Uuid::new_v4()),
            "/api/images/not-a-uuid".to_string(),
        ] {
            let response = app.clone().oneshot(get(&uri)).await.unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND);
            assert_eq!(json_body(response).await["error"], "Image not found");
        }
    }

    #[tokio::test]
    async fn test_list_defaults_and_paging() {
        let state = test_state(true).await;
        for i in 0..12 {
            state
                .orchestrator
                .ingest(IngestRequest {
                    filename: format!("{i}.png"),
                    content_type: "image/png".to_string(),
                    bytes: Bytes::from(solid_png(2, 2, [i * 10, 0, 0])),
                })
                .await
                .unwrap();
        }
        let app = create_router(state, &ApiConfig::default());

        let page = json_body(app.clone().oneshot(get("/api/images/")).await.unwrap()).await;
        assert_eq!(page.as_array().unwrap().len(), 10);
        assert_eq!(page[0]["filename"], "0.png");

        let rest = json_body(
            app.clone()
                .oneshot(get("/api/images/?skip=10&limit=10"))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(rest.as_array().unwrap().len(), 2);
        assert_eq!(rest[0]["filename"], "10.png");

        let beyond = json_body(app.oneshot(get("/api/images?skip=50")).await.unwrap()).await;
        assert!(beyond.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_rejects_limit_above_max() {
        let mut state = test_state(true).await;
        state.max_list_limit = 5;
        for i in 0..6 {
            state
                .orchestrator
                .ingest(IngestRequest {
                    filename: format!("{i}.png"),
                    content_type: "image/png".to_string(),
                    bytes: Bytes::from(solid_png(2, 2, [0, i * 10, 0])),
                })
                .await
                .unwrap();
        }
        let app = create_router(state, &ApiConfig::default());

        let response = app
            .clone()
            .oneshot(get("/api/images/?limit=6"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["code"], "INVALID_QUERY");
        assert_eq!(body["error"], "limit must not exceed 5");

        let page = json_body(app.oneshot(get("/api/images/?limit=5")).await.unwrap()).await;
        assert_eq!(page.as_array().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_list_over_default_max_is_rejected() {
        let app = create_router(test_state(true).await, &ApiConfig::default());

        let response = app
            .oneshot(get("/api/images/?skip=0&limit=150"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["code"], "INVALID_QUERY");
    }

    #[tokio::test]
    async fn test_list_malformed_query_is_json_error() {
        let app = create_router(test_state(true).await, &ApiConfig::default());

        let response = app.oneshot(get("/api/images/?skip=-1")).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["code"], "INVALID_QUERY");
        assert!(body["error"]
            .as_str()
            .unwrap()
            .starts_with("Failed to deserialize query string"));
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = create_router(test_state(true).await, &ApiConfig::default());
        let response = app.oneshot(get("/healthcheck")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "healthy");

        let app = create_router(test_state(false).await, &ApiConfig::default());
        let response = app.oneshot(get("/healthcheck")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body = json_body(response).await;
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["storage_error"], "Bucket not found");
        assert!(body.get("database_error").is_none());
    }
}
