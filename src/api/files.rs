use std::path::Path as FsPath;

use axum::{
    Json,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::io::ReaderStream;

use super::{ApiError, SharedState, content_type_for};
use crate::errors::DownloadError;

/// One file in the staged downloads area.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadedFile {
    pub name: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub path: String,
}

#[derive(Debug, Serialize)]
pub struct FilesResponse {
    pub files: Vec<DownloadedFile>,
    pub download_path: String,
}

/// GET /api/downloads/files — list the staged downloads area, newest
/// first. Hidden entries (the staging subdirectory, .gitkeep) are
/// skipped.
pub async fn list_files(
    State(state): State<SharedState>,
) -> Result<Json<FilesResponse>, ApiError> {
    let dir = &state.config.downloads_dir;
    let mut files = Vec::new();

    if dir.exists() {
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| DownloadError::Internal(format!("could not list files: {}", e)))?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with('.') || !path.is_file() {
                continue;
            }
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            let modified: DateTime<Utc> = meta
                .modified()
                .map(DateTime::from)
                .unwrap_or_else(|_| Utc::now());
            files.push(DownloadedFile {
                name: name.to_string(),
                size: meta.len(),
                modified,
                path: path.display().to_string(),
            });
        }
    }

    files.sort_by(|a, b| b.modified.cmp(&a.modified));
    Ok(Json(FilesResponse {
        files,
        download_path: dir.display().to_string(),
    }))
}

/// GET /api/downloads/files/{name} — stream one staged file with
/// download headers and an exact content length.
pub async fn fetch_file(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    if !is_safe_file_name(&name) {
        return Err(DownloadError::NotFound(format!("file {}", name)).into());
    }

    let path = state.config.downloads_dir.join(&name);
    if !path.is_file() {
        return Err(DownloadError::NotFound(format!("file {}", name)).into());
    }

    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|e| DownloadError::Internal(format!("could not open {}: {}", name, e)))?;
    let size = file
        .metadata()
        .await
        .map_err(|e| DownloadError::Internal(format!("could not stat {}: {}", name, e)))?
        .len();

    let extension = FsPath::new(&name)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("");

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        content_type_for(extension).parse().unwrap(),
    );
    headers.insert(header::CONTENT_LENGTH, size.to_string().parse().unwrap());
    headers.insert(
        header::CONTENT_DISPOSITION,
        super::downloads::attachment_header(&name),
    );

    let body = Body::from_stream(ReaderStream::new(file));
    Ok((StatusCode::OK, headers, body).into_response())
}

/// Staged files are fetched by bare name only; anything that could
/// navigate out of the downloads directory is treated as unknown.
fn is_safe_file_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains("..")
}
