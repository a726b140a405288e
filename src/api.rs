//! HTTP surface: JSON routes under `/api/v1`, shared-secret authentication,
//! per-request ids and the error envelope. Handlers translate between wire
//! DTOs and [`StorageService`] commands; no business rules live here.

use crate::config::ServiceConfig;
use crate::error::{ErrorKind, ServiceError};
use crate::model::{Bucket, ObjectRecord};
use crate::service::{
    CreateBucketParams, CreateUploadSessionParams, StorageService, UpdateBucketParams,
};
use anyhow::{Context, Result};
use axum::{
    async_trait,
    extract::{FromRequestParts, Path, Query, Request, State},
    http::{request::Parts, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPool;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

pub const API_KEY_HEADER: &str = "x-storage-api-key";
const REQUEST_ID_HEADER: &str = "x-request-id";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<StorageService>,
    pub pool: PgPool,
    pub api_key: Arc<String>,
}

/// Per-request id, generated in middleware and echoed everywhere.
#[derive(Debug, Clone, Default)]
pub struct RequestId(pub String);

/// Request metadata every handler threads into its errors.
pub struct Meta {
    pub request_id: String,
    pub path: String,
}

impl Meta {
    fn wrap(&self, err: ServiceError) -> ApiError {
        ApiError {
            error: err.with_request_id(self.request_id.clone()),
            path: self.path.clone(),
            request_id: self.request_id.clone(),
        }
    }
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Meta {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let request_id = parts
            .extensions
            .get::<RequestId>()
            .map(|id| id.0.clone())
            .unwrap_or_default();
        Ok(Meta {
            request_id,
            path: parts.uri.path().to_string(),
        })
    }
}

/// Envelope rendered for every non-2xx response.
#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    status_code: u16,
    message: String,
    path: String,
    request_id: String,
}

pub struct ApiError {
    error: ServiceError,
    path: String,
    request_id: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.error.kind.status();

        // Public fields only; the wrapped cause stays in the logs.
        if self.error.kind == ErrorKind::Unknown {
            error!(
                operation = self.error.operation,
                request_id = %self.request_id,
                error = %self.error,
                cause = ?self.error.source,
                "Request failed"
            );
        }

        let envelope = ErrorEnvelope {
            status_code: status.as_u16(),
            message: self.error.message,
            path: self.path,
            request_id: self.request_id,
        };
        (status, Json(envelope)).into_response()
    }
}

// ---- wire DTOs ----

#[derive(Debug, Deserialize)]
struct CreateBucketBody {
    name: String,
    allowed_mime_types: Option<Vec<String>>,
    max_allowed_object_size: Option<i64>,
    #[serde(default)]
    public: bool,
}

#[derive(Debug, Deserialize)]
struct UpdateBucketBody {
    allowed_mime_types: Option<Vec<String>>,
    /// Absent leaves the limit alone; an explicit `null` clears it.
    #[serde(default, deserialize_with = "double_option")]
    max_allowed_object_size: Option<Option<i64>>,
    public: Option<bool>,
}

/// Maps a present-but-null field to `Some(None)`, so it stays
/// distinguishable from an absent field (`None` via the default).
fn double_option<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: serde::Deserialize<'de>,
    D: serde::Deserializer<'de>,
{
    serde::Deserialize::deserialize(deserializer).map(Some)
}

#[derive(Debug, Deserialize)]
struct CreateUploadSessionBody {
    name: String,
    mime_type: Option<String>,
    size: i64,
    metadata: Option<serde_json::Value>,
    expires_in: Option<u64>,
}

#[derive(Debug, Serialize)]
struct UploadSessionResponse {
    object_id: String,
    mime_type: String,
    url: String,
    method: &'static str,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct SessionResponse {
    object_id: String,
    url: String,
    method: &'static str,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct ListBucketsQuery {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DownloadQuery {
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    object_path: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

#[derive(Debug, Serialize)]
struct BucketSizeResponse {
    bucket_id: String,
    size: i64,
}

// ---- router ----

/// Create the API router
pub fn create_router(state: AppState, config: &ServiceConfig) -> Router {
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

    let api = Router::new()
        .route("/buckets", post(create_bucket).get(list_buckets))
        .route(
            "/buckets/:bucket_id",
            get(get_bucket).patch(update_bucket).delete(delete_bucket),
        )
        .route("/buckets/:bucket_id/empty", post(empty_bucket))
        .route("/buckets/:bucket_id/enable", post(enable_bucket))
        .route("/buckets/:bucket_id/disable", post(disable_bucket))
        .route("/buckets/:bucket_id/size", get(get_bucket_size))
        .route(
            "/objects/pre-signed/upload/:bucket_id",
            post(create_upload_session),
        )
        .route(
            "/objects/pre-signed/upload/:bucket_id/:object_id/complete",
            post(complete_upload_session),
        )
        .route(
            "/objects/pre-signed/download/:bucket_id/:object_id",
            get(create_download_session),
        )
        .route("/objects/search/:bucket_id", get(search_objects))
        .route(
            "/objects/:bucket_id/:object_id",
            get(get_object).delete(delete_object),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .nest("/api/v1", api)
        .layer(middleware::from_fn(assign_request_id))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// ---- middleware ----

async fn assign_request_id(mut req: Request, next: Next) -> Response {
    let id = ulid::Ulid::new().to_string();
    req.extensions_mut().insert(RequestId(id.clone()));

    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

async fn require_api_key(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let provided = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok());

    if provided == Some(state.api_key.as_str()) {
        return next.run(req).await;
    }

    let request_id = req
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_default();
    ApiError {
        error: ServiceError::unauthorized("auth", "missing or invalid API key"),
        path: req.uri().path().to_string(),
        request_id,
    }
    .into_response()
}

// ---- health ----

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "coffer"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match sqlx::query("SELECT 1").fetch_one(&state.pool).await {
        Ok(_) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

// ---- bucket handlers ----

async fn create_bucket(
    State(state): State<AppState>,
    meta: Meta,
    Json(body): Json<CreateBucketBody>,
) -> Result<(StatusCode, Json<Bucket>), ApiError> {
    let bucket = state
        .service
        .create_bucket(CreateBucketParams {
            name: body.name,
            allowed_mime_types: body.allowed_mime_types,
            max_allowed_object_size: body.max_allowed_object_size,
            public: body.public,
        })
        .await
        .map_err(|e| meta.wrap(e))?;
    Ok((StatusCode::CREATED, Json(bucket)))
}

async fn update_bucket(
    State(state): State<AppState>,
    meta: Meta,
    Path(bucket_id): Path<String>,
    Json(body): Json<UpdateBucketBody>,
) -> Result<Json<Bucket>, ApiError> {
    let bucket = state
        .service
        .update_bucket(
            &bucket_id,
            UpdateBucketParams {
                allowed_mime_types: body.allowed_mime_types,
                max_allowed_object_size: body.max_allowed_object_size,
                public: body.public,
            },
        )
        .await
        .map_err(|e| meta.wrap(e))?;
    Ok(Json(bucket))
}

async fn get_bucket(
    State(state): State<AppState>,
    meta: Meta,
    Path(bucket_id): Path<String>,
) -> Result<Json<Bucket>, ApiError> {
    let bucket = state
        .service
        .get_bucket(&bucket_id)
        .await
        .map_err(|e| meta.wrap(e))?;
    Ok(Json(bucket))
}

async fn get_bucket_size(
    State(state): State<AppState>,
    meta: Meta,
    Path(bucket_id): Path<String>,
) -> Result<Json<BucketSizeResponse>, ApiError> {
    let size = state
        .service
        .get_bucket_size(&bucket_id)
        .await
        .map_err(|e| meta.wrap(e))?;
    Ok(Json(BucketSizeResponse { bucket_id, size }))
}

async fn list_buckets(
    State(state): State<AppState>,
    meta: Meta,
    Query(query): Query<ListBucketsQuery>,
) -> Result<Json<Vec<Bucket>>, ApiError> {
    let buckets = state
        .service
        .list_buckets(query.name.as_deref())
        .await
        .map_err(|e| meta.wrap(e))?;
    Ok(Json(buckets))
}

async fn enable_bucket(
    State(state): State<AppState>,
    meta: Meta,
    Path(bucket_id): Path<String>,
) -> Result<Json<Bucket>, ApiError> {
    let bucket = state
        .service
        .enable_bucket(&bucket_id)
        .await
        .map_err(|e| meta.wrap(e))?;
    Ok(Json(bucket))
}

async fn disable_bucket(
    State(state): State<AppState>,
    meta: Meta,
    Path(bucket_id): Path<String>,
) -> Result<Json<Bucket>, ApiError> {
    let bucket = state
        .service
        .disable_bucket(&bucket_id)
        .await
        .map_err(|e| meta.wrap(e))?;
    Ok(Json(bucket))
}

async fn empty_bucket(
    State(state): State<AppState>,
    meta: Meta,
    Path(bucket_id): Path<String>,
) -> Result<(StatusCode, Json<Bucket>), ApiError> {
    let bucket = state
        .service
        .empty_bucket(&bucket_id)
        .await
        .map_err(|e| meta.wrap(e))?;
    Ok((StatusCode::ACCEPTED, Json(bucket)))
}

async fn delete_bucket(
    State(state): State<AppState>,
    meta: Meta,
    Path(bucket_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state
        .service
        .delete_bucket(&bucket_id)
        .await
        .map_err(|e| meta.wrap(e))?;
    Ok(StatusCode::NO_CONTENT)
}

// ---- object handlers ----

async fn create_upload_session(
    State(state): State<AppState>,
    meta: Meta,
    Path(bucket_id): Path<String>,
    Json(body): Json<CreateUploadSessionBody>,
) -> Result<(StatusCode, Json<UploadSessionResponse>), ApiError> {
    let session = state
        .service
        .create_upload_session(
            &bucket_id,
            CreateUploadSessionParams {
                object_name: body.name,
                mime_type: body.mime_type,
                size: body.size,
                metadata: body.metadata,
                expires_in_secs: body.expires_in,
            },
        )
        .await
        .map_err(|e| meta.wrap(e))?;
    Ok((
        StatusCode::CREATED,
        Json(UploadSessionResponse {
            object_id: session.object_id,
            mime_type: session.mime_type,
            url: session.url,
            method: session.method,
            expires_at: session.expires_at,
        }),
    ))
}

async fn complete_upload_session(
    State(state): State<AppState>,
    meta: Meta,
    Path((bucket_id, object_id)): Path<(String, String)>,
) -> Result<Json<ObjectRecord>, ApiError> {
    let object = state
        .service
        .complete_upload_session(&bucket_id, &object_id)
        .await
        .map_err(|e| meta.wrap(e))?;
    Ok(Json(object))
}

async fn create_download_session(
    State(state): State<AppState>,
    meta: Meta,
    Path((bucket_id, object_id)): Path<(String, String)>,
    Query(query): Query<DownloadQuery>,
) -> Result<Json<SessionResponse>, ApiError> {
    let session = state
        .service
        .create_download_session(&bucket_id, &object_id, query.expires_in)
        .await
        .map_err(|e| meta.wrap(e))?;
    Ok(Json(SessionResponse {
        object_id: session.object_id,
        url: session.url,
        method: session.method,
        expires_at: session.expires_at,
    }))
}

async fn delete_object(
    State(state): State<AppState>,
    meta: Meta,
    Path((bucket_id, object_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    state
        .service
        .delete_object(&bucket_id, &object_id)
        .await
        .map_err(|e| meta.wrap(e))?;
    Ok(StatusCode::ACCEPTED)
}

async fn get_object(
    State(state): State<AppState>,
    meta: Meta,
    Path((bucket_id, object_id)): Path<(String, String)>,
) -> Result<Json<ObjectRecord>, ApiError> {
    let object = state
        .service
        .get_object(&bucket_id, &object_id)
        .await
        .map_err(|e| meta.wrap(e))?;
    Ok(Json(object))
}

async fn search_objects(
    State(state): State<AppState>,
    meta: Meta,
    Path(bucket_id): Path<String>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Vec<ObjectRecord>>, ApiError> {
    let objects = state
        .service
        .search_objects(
            &bucket_id,
            query.object_path.as_deref().unwrap_or(""),
            query.limit,
            query.offset,
        )
        .await
        .map_err(|e| meta.wrap(e))?;
    Ok(Json(objects))
}

// ---- server ----

/// Serve the router until the shutdown token fires.
pub async fn serve(
    router: Router,
    host: &str,
    port: u16,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr = format!("{host}:{port}");
    info!(address = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_body_distinguishes_absent_from_null() {
        let body: UpdateBucketBody = serde_json::from_str(r#"{"public": true}"#).unwrap();
        assert_eq!(body.max_allowed_object_size, None);

        let body: UpdateBucketBody =
            serde_json::from_str(r#"{"max_allowed_object_size": null}"#).unwrap();
        assert_eq!(body.max_allowed_object_size, Some(None));

        let body: UpdateBucketBody =
            serde_json::from_str(r#"{"max_allowed_object_size": 1048576}"#).unwrap();
        assert_eq!(body.max_allowed_object_size, Some(Some(1_048_576)));
    }

    #[test]
    fn test_error_envelope_field_names() {
        let envelope = ErrorEnvelope {
            status_code: 403,
            message: "bucket \"avatar\" is locked for bucket.emptying".to_string(),
            path: "/api/v1/buckets/bkt_1".to_string(),
            request_id: "01HV3XYZ".to_string(),
        };
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["status_code"], 403);
        assert_eq!(value["path"], "/api/v1/buckets/bkt_1");
        assert_eq!(value["request_id"], "01HV3XYZ");
        assert!(value["message"].as_str().unwrap().contains("locked"));
    }

    #[test]
    fn test_api_error_renders_service_kind() {
        let err = ApiError {
            error: ServiceError::not_found("object.get", "object \"obj_1\" not found"),
            path: "/api/v1/objects/bkt_1/obj_1".to_string(),
            request_id: "01HV3ABC".to_string(),
        };
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/json"
        );
    }
}
