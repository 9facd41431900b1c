use axum::{Json, extract::State};
use serde::Serialize;

use super::SharedState;
use crate::cookies::{CookieStatus, inspect_cookie_jar};
use crate::engine::is_executable_present;
use crate::rate_limit::GovernorSnapshot;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub message: &'static str,
    pub version: &'static str,
}

/// GET /api/health
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        message: "ytdl-server is running",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// GET /api/cookie-status — operator view of the extraction-credential
/// collaborator.
pub async fn cookie_status(State(state): State<SharedState>) -> Json<CookieStatus> {
    Json(inspect_cookie_jar(&state.config.cookies_file))
}

#[derive(Debug, Serialize)]
pub struct BinaryStatus {
    pub present: bool,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SystemStatus {
    pub yt_dlp: BinaryStatus,
    pub ffmpeg: BinaryStatus,
    pub downloads_dir: String,
    pub downloads_dir_writable: bool,
    pub active_tasks: usize,
    pub total_tasks: usize,
    pub rate_governor: GovernorSnapshot,
}

/// GET /api/system-status — binary presence/versions plus orchestrator
/// counters. Version probing execs local binaries only; no upstream
/// traffic, so no governor admission.
pub async fn system_status(State(state): State<SharedState>) -> Json<SystemStatus> {
    let yt_dlp_path = state.config.yt_dlp_path();
    let yt_dlp_version = binary_version(&yt_dlp_path).await;
    let ffmpeg_path = state.config.ffmpeg_path();

    let (active_tasks, total_tasks) = state.store.counts();
    let downloads_dir = &state.config.downloads_dir;

    Json(SystemStatus {
        yt_dlp: BinaryStatus {
            present: is_executable_present(&yt_dlp_path),
            path: yt_dlp_path.display().to_string(),
            version: yt_dlp_version,
        },
        ffmpeg: BinaryStatus {
            present: is_executable_present(&ffmpeg_path),
            path: ffmpeg_path.display().to_string(),
            version: None,
        },
        downloads_dir: downloads_dir.display().to_string(),
        downloads_dir_writable: !downloads_dir
            .metadata()
            .map(|m| m.permissions().readonly())
            .unwrap_or(true),
        active_tasks,
        total_tasks,
        rate_governor: state.governor.snapshot(),
    })
}

async fn binary_version(path: &std::path::Path) -> Option<String> {
    let output = tokio::process::Command::new(path)
        .arg("--version")
        .output()
        .await
        .ok()?;
    output
        .status
        .success()
        .then(|| String::from_utf8_lossy(&output.stdout).trim().to_string())
        .filter(|v| !v.is_empty())
}
