use crate::config::Config;
use crate::error::{panic_response, ApiError};
use crate::generation_task::GenerationTask;
use crate::prompts::{PoemLanguage, PoemStyle};
use crate::record_store::{ImageRecord, RecordStore, StorageBackend};
use crate::upload::{IncomingFile, UploadMeta, UploadService};
use anyhow::{Context, Result};
use axum::{
    extract::{
        multipart::MultipartRejection,
        rejection::{JsonRejection, PathRejection, QueryRejection},
        ConnectInfo, DefaultBodyLimit, Multipart, Path, Query, State,
    },
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};

/// Room for multipart framing on top of the file itself
const MULTIPART_OVERHEAD_BYTES: usize = 64 * 1024;

const MAX_PAGE_SIZE: i64 = 100;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub records: RecordStore,
    pub uploads: Arc<UploadService>,
    pub generation: GenerationTask,
    pub config: Arc<Config>,
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self::Validation(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::Validation(rejection.body_text())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::Validation(rejection.body_text())
    }
}

impl From<MultipartRejection> for ApiError {
    fn from(rejection: MultipartRejection) -> Self {
        Self::InvalidFile(rejection.body_text())
    }
}

#[derive(Debug, Deserialize)]
pub struct UploadParams {
    #[serde(default = "default_true")]
    pub auto_generate_poetry: bool,
    pub style: Option<String>,
    pub language: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub image_id: i64,
    pub style: Option<String>,
    pub language: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    #[serde(default)]
    pub skip: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    20
}

fn default_true() -> bool {
    true
}

/// Stored-file details returned after an upload
#[derive(Debug, Serialize)]
pub struct ImageMetadata {
    pub filename: String,
    pub original_filename: String,
    pub file_size: i64,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub mime_type: String,
    pub storage_backend: StorageBackend,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub success: bool,
    pub message: String,
    pub image_id: i64,
    pub image_url: String,
    pub created_at: DateTime<Utc>,
    pub metadata: ImageMetadata,
}

impl UploadResponse {
    fn new(record: ImageRecord, message: String) -> Self {
        Self {
            success: true,
            message,
            image_id: record.id,
            image_url: format!("/api/v1/images/{}/file", record.id),
            created_at: record.created_at,
            metadata: ImageMetadata {
                filename: record.filename,
                original_filename: record.original_filename,
                file_size: record.file_size,
                width: record.width,
                height: record.height,
                mime_type: record.mime_type,
                storage_backend: record.storage_backend,
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    pub success: bool,
    pub message: String,
    pub image_id: i64,
    pub title: String,
    pub poetry: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct GenerationStatus {
    pub image_id: i64,
    pub generation_complete: bool,
    pub has_body: bool,
    pub title: Option<String>,
    pub file_available: bool,
    pub updated_at: DateTime<Utc>,
}

fn parse_style(value: Option<&str>) -> Result<PoemStyle, ApiError> {
    value
        .map(|v| v.parse::<PoemStyle>().map_err(|e| ApiError::Validation(format!("{e}"))))
        .transpose()
        .map(Option::unwrap_or_default)
}

fn parse_language(value: Option<&str>) -> Result<PoemLanguage, ApiError> {
    value
        .map(|v| v.parse::<PoemLanguage>().map_err(|e| ApiError::Validation(format!("{e}"))))
        .transpose()
        .map(Option::unwrap_or_default)
}

/// Create the API router
pub fn create_router(state: AppState, config: &Config) -> Router {
    let cors = if config.api.cors_enabled {
        match config.cors_origins() {
            None => CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
            Some(origins) => {
                let origins: Vec<HeaderValue> =
                    origins.iter().filter_map(|o| o.parse().ok()).collect();
                CorsLayer::new()
                    .allow_origin(origins)
                    .allow_methods(Any)
                    .allow_headers(Any)
            }
        }
    } else {
        CorsLayer::new()
    };

    let body_limit = config.storage.max_file_size_bytes + MULTIPART_OVERHEAD_BYTES;

    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/v1/images", get(list_images))
        .route("/api/v1/images/", get(list_images))
        .route("/api/v1/images/upload", post(upload_image))
        .route("/api/v1/images/generate-poetry", post(generate_poetry))
        .route("/api/v1/images/:id", get(get_image).delete(delete_image))
        .route("/api/v1/images/:id/file", get(get_image_file))
        .route("/api/v1/images/:id/status", get(get_generation_status))
        .route("/api/v1/storage/status", get(storage_status))
        .route("/api/v1/storage/config", get(storage_config))
        .route("/api/v1/storage/s3/test", get(test_s3_connection))
        .fallback(route_not_found)
        .method_not_allowed_fallback(method_not_allowed)
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn route_not_found() -> ApiError {
    ApiError::not_found("Resource")
}

async fn method_not_allowed() -> ApiError {
    ApiError::MethodNotAllowed
}

async fn root() -> impl IntoResponse {
    Json(json!({
        "message": "Image Poet API Server",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": "imagepoet-api"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.records.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({
                "status": "ready",
                "database": "connected",
                "poetry_generation": state.generation.is_configured()
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

fn client_ip(
    headers: &HeaderMap,
    connect_info: Option<&ConnectInfo<SocketAddr>>,
    trust_forwarded_for: bool,
) -> Option<String> {
    let forwarded = trust_forwarded_for
        .then(|| headers.get("x-forwarded-for"))
        .flatten()
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    forwarded.or_else(|| connect_info.map(|ConnectInfo(addr)| addr.ip().to_string()))
}

/// Pull the `file` field out of the form
async fn read_file_field(mut multipart: Multipart, max_bytes: usize) -> Result<IncomingFile, ApiError> {
    let too_large = || ApiError::FileTooLarge(format!(
        "File too large. Maximum size is {} MB",
        max_bytes / (1024 * 1024)
    ));

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => return Err(ApiError::InvalidFile("No file provided".to_string())),
            Err(e) if e.status() == StatusCode::PAYLOAD_TOO_LARGE => return Err(too_large()),
            Err(e) => return Err(ApiError::InvalidFile(e.body_text())),
        };

        if field.name() != Some("file") {
            continue;
        }

        let filename = field.file_name().map(str::to_string);
        let content_type = field.content_type().map(str::to_string);
        let bytes = match field.bytes().await {
            Ok(bytes) => bytes,
            Err(e) if e.status() == StatusCode::PAYLOAD_TOO_LARGE => return Err(too_large()),
            Err(e) => return Err(ApiError::InvalidFile(e.body_text())),
        };

        return Ok(IncomingFile {
            bytes: bytes.to_vec(),
            filename,
            content_type,
        });
    }
}

#[instrument(skip_all)]
async fn upload_image(
    State(state): State<AppState>,
    params: Result<Query<UploadParams>, QueryRejection>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<UploadResponse>, ApiError> {
    let Query(params) = params?;
    let style = parse_style(params.style.as_deref())?;
    let language = parse_language(params.language.as_deref())?;

    let file = read_file_field(multipart?, state.config.storage.max_file_size_bytes).await?;
    let meta = UploadMeta {
        upload_ip: client_ip(
            &headers,
            connect_info.as_ref(),
            state.config.api.trust_forwarded_for,
        ),
        user_agent: headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    };

    let record = state.uploads.store(file, meta).await?;

    let mut message = "Image uploaded successfully".to_string();
    if params.auto_generate_poetry {
        // Detached; the outcome is only logged
        drop(state.generation.spawn(record.id, style, language));
        message.push_str(". Poetry generation started in background.");
    }

    Ok(Json(UploadResponse::new(record, message)))
}

#[instrument(skip_all)]
async fn generate_poetry(
    State(state): State<AppState>,
    request: Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<Json<GenerateResponse>, ApiError> {
    let Json(request) = request?;
    let style = parse_style(request.style.as_deref())?;
    let language = parse_language(request.language.as_deref())?;

    let record = state
        .records
        .get(request.image_id)
        .await
        .map_err(ApiError::Database)?
        .ok_or_else(|| ApiError::not_found("Image"))?;

    let poem = state
        .generation
        .generate_once(&record, style, language)
        .await?;

    let updated = state
        .records
        .mark_generated(record.id, &poem.title, &poem.body)
        .await
        .map_err(ApiError::Database)?
        .ok_or_else(|| ApiError::not_found("Image"))?;

    info!(image_id = record.id, style = %style, language = %language, "Poetry generated on demand");

    Ok(Json(GenerateResponse {
        success: true,
        message: "Poetry generated successfully".to_string(),
        image_id: updated.id,
        title: poem.title,
        poetry: poem.body,
        created_at: updated.updated_at,
    }))
}

async fn find_image(state: &AppState, id: i64) -> Result<ImageRecord, ApiError> {
    state
        .records
        .get(id)
        .await
        .map_err(ApiError::Database)?
        .ok_or_else(|| ApiError::not_found("Image"))
}

async fn get_image(
    State(state): State<AppState>,
    path: Result<Path<i64>, PathRejection>,
) -> Result<Json<ImageRecord>, ApiError> {
    let Path(id) = path?;
    Ok(Json(find_image(&state, id).await?))
}

/// Percent-encode for an RFC 5987 `filename*` parameter
fn encode_ext_value(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(byte as char)
            }
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    encoded
}

fn content_disposition(filename: &str) -> HeaderValue {
    let fallback: String = filename
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_ascii_graphic() || c == ' ' => c,
            _ => '_',
        })
        .collect();
    let value = format!(
        "inline; filename=\"{fallback}\"; filename*=UTF-8''{}",
        encode_ext_value(filename)
    );
    HeaderValue::from_str(&value).unwrap_or_else(|_| HeaderValue::from_static("inline"))
}

async fn get_image_file(
    State(state): State<AppState>,
    path: Result<Path<i64>, PathRejection>,
) -> Result<Response, ApiError> {
    let Path(id) = path?;
    let record = find_image(&state, id).await?;

    let bytes = state
        .uploads
        .read_image(&record)
        .await
        .map_err(|e| ApiError::storage("Failed to read image", e))?
        .ok_or_else(|| ApiError::not_found("Image file"))?;

    let content_type = HeaderValue::from_str(&record.mime_type)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));

    Ok((
        [
            (header::CONTENT_TYPE, content_type),
            (
                header::CONTENT_DISPOSITION,
                content_disposition(&record.original_filename),
            ),
        ],
        bytes,
    )
        .into_response())
}

#[instrument(skip(state))]
async fn list_images(
    State(state): State<AppState>,
    params: Result<Query<ListParams>, QueryRejection>,
) -> Result<Json<Vec<ImageRecord>>, ApiError> {
    let Query(params) = params?;
    if params.skip < 0 || params.limit < 0 {
        return Err(ApiError::Validation(
            "skip and limit must not be negative".to_string(),
        ));
    }

    let limit = params.limit.min(MAX_PAGE_SIZE);
    let records = state
        .records
        .list(params.skip, limit)
        .await
        .map_err(ApiError::Database)?;

    Ok(Json(records))
}

async fn delete_image(
    State(state): State<AppState>,
    path: Result<Path<i64>, PathRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let Path(id) = path?;
    let record = state
        .records
        .delete(id)
        .await
        .map_err(ApiError::Database)?
        .ok_or_else(|| ApiError::not_found("Image"))?;

    state.uploads.remove_image(&record).await;

    Ok(Json(json!({
        "success": true,
        "message": "Image deleted successfully"
    })))
}

async fn get_generation_status(
    State(state): State<AppState>,
    path: Result<Path<i64>, PathRejection>,
) -> Result<Json<GenerationStatus>, ApiError> {
    let Path(id) = path?;
    let record = find_image(&state, id).await?;
    let file_available = match state.uploads.image_exists(&record).await {
        Ok(exists) => exists,
        Err(e) => {
            warn!(image_id = id, error = %e, "Failed to check image file");
            false
        }
    };

    Ok(Json(GenerationStatus {
        image_id: record.id,
        generation_complete: record.poem_generated,
        has_body: record.has_body(),
        title: record.poem_title,
        file_available,
        updated_at: record.updated_at,
    }))
}

async fn storage_status(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let local = state.uploads.local();
    let local_usage = match local.usage().await {
        Ok(usage) => json!({
            "upload_dir": local.base_dir().display().to_string(),
            "file_count": usage.file_count,
            "total_size_bytes": usage.total_bytes,
            "total_size_mb": usage.total_mb,
        }),
        Err(e) => {
            warn!(error = %e, "Failed to read upload directory usage");
            json!({
                "upload_dir": local.base_dir().display().to_string(),
                "error": e.to_string(),
            })
        }
    };

    let s3 = match state.uploads.objects() {
        Some(objects) => {
            let bucket_info = match objects.bucket_info().await {
                Ok(info) => json!(info),
                Err(e) => json!({ "error": e.to_string() }),
            };
            json!({
                "enabled": true,
                "bucket": objects.bucket(),
                "region": objects.region(),
                "bucket_info": bucket_info,
            })
        }
        None => json!({
            "enabled": false,
            "bucket": state.config.s3.bucket,
            "region": state.config.s3.region,
        }),
    };

    let stats = state.records.stats().await.map_err(ApiError::Database)?;

    Ok(Json(json!({
        "storage_mode": state.uploads.backend(),
        "local_storage": local_usage,
        "s3": s3,
        "records": stats,
    })))
}

async fn storage_config(State(state): State<AppState>) -> impl IntoResponse {
    let config = &state.config;
    Json(json!({
        "use_s3_storage": config.storage.use_s3,
        "s3_configured": config.s3_enabled(),
        "s3_region": config.s3.region,
        "s3_bucket": config.s3.bucket,
        "environment": config.service.environment,
    }))
}

async fn test_s3_connection(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let objects = state.uploads.objects().ok_or_else(|| {
        ApiError::StorageNotConfigured("S3 storage is not configured".to_string())
    })?;

    let info = objects
        .bucket_info()
        .await
        .map_err(|e| ApiError::storage(format!("S3 connection test failed: {e}"), e.into()))?;

    Ok(Json(json!({
        "status": "connected",
        "message": format!("Successfully connected to S3 bucket '{}'", objects.bucket()),
        "bucket_info": info,
    })))
}

/// Start the HTTP API server
pub async fn start_api_server(state: AppState, config: &Config) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.api.host, config.api.port);

    info!(address = %addr, "Starting Image Poet API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("API server error")?;

    Ok(())
}
