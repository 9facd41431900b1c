use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json,
    body::{Body, Bytes},
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::SinkExt;
use futures::channel::mpsc;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;

use super::{ApiError, SharedState, content_type_for};
use crate::engine::formats::{Selection, build_catalog, safe_title};
use crate::errors::DownloadError;
use crate::tasks::{DeliveryMode, NewTask, Task, TaskStatus, TaskStore};

#[derive(Debug, Deserialize)]
pub struct DownloadRequest {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub quality: Option<String>,
    #[serde(default)]
    pub video_format_id: Option<String>,
    #[serde(default)]
    pub audio_format_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StagedDownloadResponse {
    pub task_id: String,
    pub status: TaskStatus,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct DirectDownloadResponse {
    pub download_id: String,
    pub download_url: String,
    pub title: String,
    pub safe_title: String,
    pub file_extension: String,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub task_id: String,
    pub cancelled: bool,
}

fn validate_url(raw: &str) -> Result<&str, ApiError> {
    let url = raw.trim();
    if url.is_empty() {
        return Err(DownloadError::ExtractionFailure("URL is required".to_string()).into());
    }
    Ok(url)
}

async fn spawn_worker(state: &SharedState, task_id: String) {
    let worker = Arc::clone(&state.worker);
    let mut pool = state.pool.lock().await;
    pool.spawn(async move { worker.run(&task_id).await });
}

/// POST /api/download — staged mode. The task id returns immediately;
/// the worker resolves formats and fetches in the background, and the
/// finished file lands in the durable downloads directory.
pub async fn start_staged_download(
    State(state): State<SharedState>,
    Json(request): Json<DownloadRequest>,
) -> Result<Json<StagedDownloadResponse>, ApiError> {
    let url = validate_url(&request.url)?;

    let task = state.store.create(NewTask {
        url: url.to_string(),
        mode: Some(DeliveryMode::Staged),
        quality: request.quality,
        video_format_id: request.video_format_id,
        audio_format_id: request.audio_format_id,
    });
    log::info!("Staged download {} created for {}", task.id, url);
    spawn_worker(&state, task.id.clone()).await;

    Ok(Json(StagedDownloadResponse {
        task_id: task.id,
        status: task.status,
        message: "Download started successfully".to_string(),
    }))
}

/// POST /api/download-direct — preparation step before streaming.
/// Resolves the catalog up front so the response can carry the title
/// and expected extension, then starts the fetch into a per-task temp
/// area that `download-stream` will drain.
pub async fn prepare_direct_download(
    State(state): State<SharedState>,
    Json(request): Json<DownloadRequest>,
) -> Result<Json<DirectDownloadResponse>, ApiError> {
    let url = validate_url(&request.url)?;

    let _permit = state.governor.admit()?;
    let info = match state.engine.probe(url).await {
        Ok(info) => {
            state.governor.record_success();
            info
        }
        Err(err) => {
            if let DownloadError::UpstreamThrottled { retry_after } = err {
                state
                    .governor
                    .record_throttled(Some(Duration::from_secs(retry_after)));
            }
            return Err(err.into());
        }
    };

    let catalog = build_catalog(&info);
    let selection = Selection::resolve(
        &catalog,
        request.video_format_id,
        request.audio_format_id,
        request.quality.as_deref(),
    );
    let (format_spec, remux) = selection.format_spec();
    let safe = safe_title(&info.title);
    let extension = selection.file_extension(&catalog);
    let label = selection.describe(&catalog);

    let task = state.store.create(NewTask {
        url: url.to_string(),
        mode: Some(DeliveryMode::Direct),
        quality: request.quality,
        video_format_id: selection.video_id.clone(),
        audio_format_id: selection.audio_id.clone(),
    });

    let staging_dir = std::env::temp_dir().join(format!("ytdl-direct-{}", task.id));
    tokio::fs::create_dir_all(&staging_dir)
        .await
        .map_err(|e| DownloadError::Internal(format!("could not stage: {}", e)))?;

    let stem = format!("{}-{}", safe, &task.id[..8]);
    let title = info.title.clone();
    {
        let safe = safe.clone();
        let extension = extension.clone();
        let staging_dir = staging_dir.clone();
        let stem = stem.clone();
        state.store.update(&task.id, move |t| {
            t.title = Some(title);
            t.safe_title = Some(safe);
            t.file_extension = Some(extension);
            t.format_spec = Some(format_spec);
            t.remux = remux;
            t.file_stem = Some(stem);
            t.staging_dir = Some(staging_dir);
            t.message = format!("Selected format: {}", label);
        })?;
    }

    log::info!("Direct download {} prepared for {}", task.id, url);
    spawn_worker(&state, task.id.clone()).await;

    Ok(Json(DirectDownloadResponse {
        download_url: format!("/api/download-stream/{}", task.id),
        download_id: task.id,
        title: info.title,
        safe_title: safe,
        file_extension: extension,
    }))
}

/// GET /api/download-stream/{download_id} — drain a direct task to the
/// client. 409 while the task is still preparing; otherwise the body
/// follows the staged file as the worker produces it and the temp area
/// is removed once fully streamed.
pub async fn stream_download(
    State(state): State<SharedState>,
    Path(download_id): Path<String>,
) -> Result<Response, ApiError> {
    let task = state.store.get(&download_id)?;
    if task.mode != DeliveryMode::Direct {
        return Err(DownloadError::Conflict(format!(
            "task {} is not a direct download",
            download_id
        ))
        .into());
    }

    match task.status {
        TaskStatus::Preparing => {
            Err(DownloadError::Conflict("nothing to stream yet".to_string()).into())
        }
        TaskStatus::Error => {
            let detail = task
                .error
                .map(|e| e.message)
                .unwrap_or_else(|| "unknown error".to_string());
            Err(DownloadError::Conflict(format!("download failed: {}", detail)).into())
        }
        TaskStatus::Downloading | TaskStatus::Completed => {
            let staging_dir = task.staging_dir.clone().ok_or_else(|| {
                DownloadError::Internal("direct task has no staging directory".to_string())
            })?;
            let stem = task.file_stem.clone().ok_or_else(|| {
                DownloadError::Internal("direct task has no file stem".to_string())
            })?;

            let mut content_length = None;
            if task.status == TaskStatus::Completed {
                // Already-drained tasks have had their temp area removed.
                match locate_stream_file(&staging_dir, &stem, task.remux) {
                    Some(path) => {
                        content_length = tokio::fs::metadata(&path).await.ok().map(|m| m.len());
                    }
                    None => {
                        return Err(DownloadError::NotFound(format!(
                            "file for task {}",
                            download_id
                        ))
                        .into());
                    }
                }
            }

            let extension = task.file_extension.clone().unwrap_or_else(|| "mp4".to_string());
            let filename = format!(
                "{}.{}",
                task.safe_title.clone().unwrap_or_else(|| "video".to_string()),
                extension
            );

            let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(16);
            tokio::spawn(feed_stream(
                Arc::clone(&state.store),
                download_id,
                staging_dir,
                stem,
                task.remux,
                tx,
            ));

            let mut headers = HeaderMap::new();
            headers.insert(
                header::CONTENT_TYPE,
                content_type_for(&extension).parse().unwrap(),
            );
            headers.insert(
                header::CONTENT_DISPOSITION,
                attachment_header(&filename),
            );
            headers.insert(header::CACHE_CONTROL, "no-cache".parse().unwrap());
            if let Some(len) = content_length {
                headers.insert(header::CONTENT_LENGTH, len.to_string().parse().unwrap());
            }

            Ok((StatusCode::OK, headers, Body::from_stream(rx)).into_response())
        }
    }
}

/// GET /api/download-status/{task_id} — current truth, immediately.
pub async fn download_status(
    State(state): State<SharedState>,
    Path(task_id): Path<String>,
) -> Result<Json<Task>, ApiError> {
    Ok(Json(state.store.get(&task_id)?))
}

/// POST /api/download-cancel/{task_id} — flip the cooperative flag;
/// the worker stops at its next checkpoint.
pub async fn cancel_download(
    State(state): State<SharedState>,
    Path(task_id): Path<String>,
) -> Result<Json<CancelResponse>, ApiError> {
    state.store.request_cancel(&task_id)?;
    log::info!("Cancellation requested for task {}", task_id);
    Ok(Json(CancelResponse {
        task_id,
        cancelled: true,
    }))
}

/// GET /api/downloads — every retained task record, newest first.
pub async fn list_tasks(State(state): State<SharedState>) -> Json<Vec<Task>> {
    Json(state.store.list())
}

/// Titles can carry characters that are not legal in a header value;
/// fall back to a bare attachment rather than failing the download.
pub(crate) fn attachment_header(filename: &str) -> axum::http::HeaderValue {
    format!("attachment; filename=\"{}\"", filename)
        .parse()
        .unwrap_or_else(|_| axum::http::HeaderValue::from_static("attachment"))
}

/// Find the deliverable in the staging area. While a mux is pending
/// only the merged container counts; the stream fragments must never be
/// served.
fn locate_stream_file(dir: &FsPath, stem: &str, remux: bool) -> Option<PathBuf> {
    if remux {
        let merged = dir.join(format!("{}.mp4", stem));
        return merged.is_file().then_some(merged);
    }
    let prefix = format!("{}.", stem);
    std::fs::read_dir(dir).ok()?.flatten().find_map(|entry| {
        let path = entry.path();
        let name = path.file_name()?.to_str()?;
        let usable = name.starts_with(&prefix)
            && !name.ends_with(".part")
            && !name.ends_with(".ytdl")
            && path.is_file();
        usable.then_some(path)
    })
}

/// Pump file bytes into the response channel, tailing the file while
/// the worker is still writing. A dropped receiver means the client
/// went away: request cancellation so the worker stops wasting
/// upstream bandwidth.
async fn feed_stream(
    store: Arc<TaskStore>,
    task_id: String,
    staging_dir: PathBuf,
    stem: String,
    remux: bool,
    mut tx: mpsc::Sender<Result<Bytes, std::io::Error>>,
) {
    // Wait for the deliverable to appear (the merge step only produces
    // it at the very end).
    let path = loop {
        if let Some(path) = locate_stream_file(&staging_dir, &stem, remux) {
            break path;
        }
        match store.get(&task_id) {
            Ok(task) if task.status == TaskStatus::Error => return,
            Ok(task) if task.status == TaskStatus::Completed => {
                match locate_stream_file(&staging_dir, &stem, remux) {
                    Some(path) => break path,
                    None => return,
                }
            }
            Ok(_) => tokio::time::sleep(Duration::from_millis(300)).await,
            Err(_) => return,
        }
    };

    let mut file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(e) => {
            let _ = tx.send(Err(e)).await;
            return;
        }
    };

    let mut buf = vec![0u8; 64 * 1024];
    let mut task_finished = false;
    loop {
        match file.read(&mut buf).await {
            Ok(0) => {
                if task_finished {
                    break;
                }
                match store.get(&task_id).map(|t| t.status) {
                    Ok(TaskStatus::Completed) | Ok(TaskStatus::Error) | Err(_) => {
                        // One more read pass catches bytes appended
                        // between our last read and the transition.
                        task_finished = true;
                    }
                    Ok(_) => tokio::time::sleep(Duration::from_millis(200)).await,
                }
            }
            Ok(n) => {
                if tx.send(Ok(Bytes::copy_from_slice(&buf[..n]))).await.is_err() {
                    log::info!("Client dropped stream for task {}, cancelling", task_id);
                    let _ = store.request_cancel(&task_id);
                    return;
                }
            }
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        }
    }

    // Fully streamed; direct delivery keeps no durable copy.
    if store
        .get(&task_id)
        .map(|t| t.status == TaskStatus::Completed)
        .unwrap_or(true)
    {
        if let Err(e) = tokio::fs::remove_dir_all(&staging_dir).await {
            log::warn!("Failed to remove direct staging {:?}: {}", staging_dir, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_locate_stream_file_ignores_fragments_while_muxing() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("clip-abc.f137.mp4"), b"video").unwrap();
        std::fs::write(dir.path().join("clip-abc.f140.m4a"), b"audio").unwrap();
        assert!(locate_stream_file(dir.path(), "clip-abc", true).is_none());

        std::fs::write(dir.path().join("clip-abc.mp4"), b"merged").unwrap();
        assert_eq!(
            locate_stream_file(dir.path(), "clip-abc", true),
            Some(dir.path().join("clip-abc.mp4"))
        );
    }

    #[test]
    fn test_locate_stream_file_single_stream() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("clip-abc.webm"), b"bytes").unwrap();
        assert_eq!(
            locate_stream_file(dir.path(), "clip-abc", false),
            Some(dir.path().join("clip-abc.webm"))
        );
        // Other tasks' files don't match.
        assert!(locate_stream_file(dir.path(), "clip-xyz", false).is_none());
    }

    #[tokio::test]
    async fn test_feed_stream_drains_completed_file_and_cleans_up() {
        use futures::StreamExt;

        let store = Arc::new(TaskStore::new());
        let task = store.create(NewTask {
            url: "u".to_string(),
            mode: Some(DeliveryMode::Direct),
            ..NewTask::default()
        });
        let staging = TempDir::new().unwrap();
        let staging_path = staging.path().join("work");
        std::fs::create_dir_all(&staging_path).unwrap();
        std::fs::write(staging_path.join("clip-abc.mp4"), vec![7u8; 150_000]).unwrap();

        store.mark_downloading(&task.id, "t").unwrap();
        store
            .complete(&task.id, vec!["clip-abc.mp4".to_string()], "done")
            .unwrap();

        let (tx, rx) = mpsc::channel(16);
        feed_stream(
            Arc::clone(&store),
            task.id.clone(),
            staging_path.clone(),
            "clip-abc".to_string(),
            true,
            tx,
        )
        .await;

        let chunks: Vec<_> = rx.collect().await;
        let total: usize = chunks.iter().map(|c| c.as_ref().unwrap().len()).sum();
        assert_eq!(total, 150_000);
        // No durable copy retained after direct delivery.
        assert!(!staging_path.exists());
    }

    #[tokio::test]
    async fn test_feed_stream_gives_up_on_failed_task() {
        use futures::StreamExt;

        let store = Arc::new(TaskStore::new());
        let task = store.create(NewTask {
            url: "u".to_string(),
            mode: Some(DeliveryMode::Direct),
            ..NewTask::default()
        });
        let staging = TempDir::new().unwrap();
        store.mark_downloading(&task.id, "t").unwrap();
        store.fail(&task.id, &DownloadError::Cancelled).unwrap();

        let (tx, rx) = mpsc::channel(16);
        feed_stream(
            Arc::clone(&store),
            task.id.clone(),
            staging.path().to_path_buf(),
            "clip-abc".to_string(),
            false,
            tx,
        )
        .await;

        let chunks: Vec<_> = rx.collect().await;
        assert!(chunks.is_empty());
    }
}
