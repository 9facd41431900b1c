pub mod diagnostics;
pub mod downloads;
pub mod files;
pub mod video_info;

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::Request,
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::config::Config;
use crate::engine::MediaEngine;
use crate::errors::DownloadError;
use crate::rate_limit::RateGovernor;
use crate::tasks::TaskStore;
use crate::tasks::worker::DownloadWorker;
use crate::workers::WorkerPool;

/// Everything the handlers share. Built once at startup.
pub struct AppState {
    pub config: Config,
    pub store: Arc<TaskStore>,
    pub governor: Arc<RateGovernor>,
    pub engine: Arc<dyn MediaEngine>,
    pub worker: Arc<DownloadWorker>,
    pub pool: Mutex<WorkerPool>,
}

pub type SharedState = Arc<AppState>;

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/api/health", get(diagnostics::health))
        .route("/api/video-info", post(video_info::video_info))
        .route("/api/download", post(downloads::start_staged_download))
        .route("/api/download-direct", post(downloads::prepare_direct_download))
        .route("/api/download-stream/{download_id}", get(downloads::stream_download))
        .route("/api/download-status/{task_id}", get(downloads::download_status))
        .route("/api/download-cancel/{task_id}", post(downloads::cancel_download))
        .route("/api/downloads", get(downloads::list_tasks))
        .route("/api/downloads/files", get(files::list_files))
        .route("/api/downloads/files/{name}", get(files::fetch_file))
        .route("/api/cookie-status", get(diagnostics::cookie_status))
        .route("/api/system-status", get(diagnostics::system_status))
        .layer(middleware::from_fn(cors))
        .with_state(state)
}

/// Taxonomy error as an HTTP response: machine-readable kind, message,
/// suggestions, and a retry hint for throttling.
#[derive(Debug)]
pub struct ApiError(pub DownloadError);

#[derive(Serialize)]
struct ErrorBody {
    error_kind: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    suggestions: Vec<String>,
}

impl From<DownloadError> for ApiError {
    fn from(err: DownloadError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            DownloadError::ExtractionFailure(_) => StatusCode::UNPROCESSABLE_ENTITY,
            DownloadError::VideoUnavailable(_) => StatusCode::GONE,
            DownloadError::AgeRestricted => StatusCode::FORBIDDEN,
            DownloadError::UpstreamThrottled { .. } => StatusCode::TOO_MANY_REQUESTS,
            DownloadError::NotFound(_) => StatusCode::NOT_FOUND,
            DownloadError::Conflict(_) | DownloadError::Cancelled => StatusCode::CONFLICT,
            DownloadError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            error_kind: self.0.kind(),
            message: self.0.to_string(),
            retry_after: self.0.retry_after(),
            suggestions: self.0.suggestions(),
        };
        (status, Json(body)).into_response()
    }
}

/// The frontend is served from another origin, so every response gets
/// permissive CORS headers, preflights included.
async fn cors(request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        let mut response = StatusCode::NO_CONTENT.into_response();
        apply_cors_headers(response.headers_mut());
        return response;
    }
    let mut response = next.run(request).await;
    apply_cors_headers(response.headers_mut());
    response
}

fn apply_cors_headers(headers: &mut HeaderMap) {
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type, Authorization"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, PUT, DELETE, OPTIONS"),
    );
}

/// Best-effort content type from the file extension; the gateway never
/// sniffs bytes.
pub(crate) fn content_type_for(extension: &str) -> &'static str {
    match extension {
        "mp4" | "m4v" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mov" => "video/quicktime",
        "m4a" => "audio/mp4",
        "mp3" => "audio/mpeg",
        "ogg" | "opus" => "audio/ogg",
        "aac" => "audio/aac",
        _ => "application/octet-stream",
    }
}
