//! HTTP surface: notification webhook, record queries and presigned links.

use crate::config::ApiConfig;
use crate::object_store::LinkSigner;
use crate::pipeline::{BatchError, BatchReport, EnrichmentPipeline};
use crate::record::image_id;
use crate::record_store::{item_to_record, item_to_wire, RecordStore};
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};

const MAX_LIST_LIMIT: usize = 500;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<EnrichmentPipeline>,
    pub record_store: Arc<dyn RecordStore>,
    pub link_signer: Arc<dyn LinkSigner>,
    /// Bucket presigned uploads go to; uploads are refused when unset
    pub upload_bucket: Option<String>,
    pub presigned_url_expiry: Duration,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: &str, code: &str) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            code: code.to_string(),
        }),
    )
}

/// Outcome of a notification batch delivered over HTTP
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResponse {
    pub status_code: u16,
    #[serde(flatten)]
    pub report: BatchReport,
}

/// Query parameters for the image list
#[derive(Debug, Deserialize)]
pub struct ImageListQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

/// Image list response
#[derive(Debug, Serialize)]
pub struct ImageListResponse {
    pub images: Vec<serde_json::Value>,
    pub count: usize,
}

/// Presigned download link
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadUrlResponse {
    pub image_id: String,
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

/// Presigned upload request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadUrlRequest {
    pub key: String,
    pub content_type: Option<String>,
}

/// Presigned upload link
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadUrlResponse {
    /// Id the record will get once the upload has been processed
    pub image_id: String,
    pub bucket: String,
    pub key: String,
    pub url: String,
    pub expires_at: DateTime<Utc>,
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
            let origins: Vec<_> = config
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
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/v1/notifications", post(receive_notifications))
        .route("/api/v1/images", get(list_images))
        .route("/api/v1/images/:image_id", get(get_image))
        .route("/api/v1/images/:image_id/download-url", get(get_download_url))
        .route("/api/v1/upload-url", post(create_upload_url))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "enrichment-service"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.record_store.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "record_store": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "record_store": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

/// Webhook entry point for bucket notification batches
#[instrument(skip(state, body), fields(body_len = body.len()))]
async fn receive_notifications(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<BatchResponse>, ApiError> {
    match state.pipeline.process_payload(&body).await {
        Ok(report) => Ok(Json(BatchResponse {
            status_code: StatusCode::OK.as_u16(),
            report,
        })),
        Err(e @ BatchError::InvalidInput(_)) => Err(api_error(
            StatusCode::BAD_REQUEST,
            &e.to_string(),
            "BATCH_INPUT_ERROR",
        )),
        Err(e @ BatchError::Persistence { .. }) => {
            error!(error = %e, "Notification batch failed");
            Err(api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to persist records",
                "PERSISTENCE_ERROR",
            ))
        }
    }
}

/// List stored records, most recently processed first
#[instrument(skip(state))]
async fn list_images(
    State(state): State<AppState>,
    Query(params): Query<ImageListQuery>,
) -> Result<Json<ImageListResponse>, ApiError> {
    let limit = params.limit.clamp(1, MAX_LIST_LIMIT);

    let items = state.record_store.scan(limit).await.map_err(|e| {
        error!(error = %e, "Failed to scan records");
        api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to query images",
            "QUERY_ERROR",
        )
    })?;

    let images: Vec<serde_json::Value> = items.iter().map(item_to_wire).collect();

    Ok(Json(ImageListResponse {
        count: images.len(),
        images,
    }))
}

/// Get single image record
#[instrument(skip(state))]
async fn get_image(
    State(state): State<AppState>,
    Path(image_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let item = fetch_item(&state, &image_id).await?;
    Ok(Json(item_to_wire(&item)))
}

/// Get presigned download URL for an image
#[instrument(skip(state))]
async fn get_download_url(
    State(state): State<AppState>,
    Path(image_id): Path<String>,
) -> Result<Json<DownloadUrlResponse>, ApiError> {
    let item = fetch_item(&state, &image_id).await?;

    let record = item_to_record(&image_id, &item).map_err(|e| {
        error!(error = %e, "Stored record is unreadable");
        api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Stored record is unreadable",
            "QUERY_ERROR",
        )
    })?;

    let url = state
        .link_signer
        .presign_get(
            &record.container_id,
            &record.object_key,
            state.presigned_url_expiry,
        )
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to generate presigned URL");
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to generate presigned URL",
                "PRESIGN_ERROR",
            )
        })?;

    Ok(Json(DownloadUrlResponse {
        image_id,
        url,
        expires_at: expires_at(state.presigned_url_expiry),
    }))
}

/// Get presigned upload URL for a new object
#[instrument(skip(state, request), fields(key = %request.key))]
async fn create_upload_url(
    State(state): State<AppState>,
    Json(request): Json<UploadUrlRequest>,
) -> Result<Json<UploadUrlResponse>, ApiError> {
    let bucket = state.upload_bucket.clone().ok_or_else(|| {
        api_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "Uploads are not configured",
            "UPLOAD_DISABLED",
        )
    })?;

    if request.key.trim().is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "Object key must not be empty",
            "INVALID_KEY",
        ));
    }

    let url = state
        .link_signer
        .presign_put(
            &bucket,
            &request.key,
            request.content_type.clone(),
            state.presigned_url_expiry,
        )
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to generate presigned upload URL");
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to generate presigned URL",
                "PRESIGN_ERROR",
            )
        })?;

    Ok(Json(UploadUrlResponse {
        image_id: image_id(&bucket, &request.key),
        bucket,
        key: request.key,
        url,
        expires_at: expires_at(state.presigned_url_expiry),
    }))
}

async fn fetch_item(
    state: &AppState,
    image_id: &str,
) -> Result<crate::record_store::StoreItem, ApiError> {
    let item = state.record_store.get(image_id).await.map_err(|e| {
        error!(error = %e, "Failed to get image record");
        api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to get image",
            "QUERY_ERROR",
        )
    })?;

    item.ok_or_else(|| api_error(StatusCode::NOT_FOUND, "Image not found", "NOT_FOUND"))
}

fn expires_at(expiry: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(expiry).unwrap_or_else(|_| chrono::Duration::zero())
}

/// Start the API server, returning once the token is cancelled
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting enrichment API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("API server error")?;

    Ok(())
}
