use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::fs;

use super::{DeliveryMode, Task, TaskStore};
use crate::engine::formats::{Selection, build_catalog, safe_title};
use crate::engine::{FetchProgress, FetchRequest, MediaEngine, ProgressFn};
use crate::errors::DownloadError;
use crate::rate_limit::RateGovernor;

/// Executes exactly one task: resolve the selection, fetch through the
/// governor, finalize or clean up. Never holds the task itself, only
/// its id; every mutation goes through the store.
pub struct DownloadWorker {
    store: Arc<TaskStore>,
    engine: Arc<dyn MediaEngine>,
    governor: Arc<RateGovernor>,
    downloads_dir: PathBuf,
    timeout: Duration,
}

impl DownloadWorker {
    pub fn new(
        store: Arc<TaskStore>,
        engine: Arc<dyn MediaEngine>,
        governor: Arc<RateGovernor>,
        downloads_dir: PathBuf,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            engine,
            governor,
            downloads_dir,
            timeout,
        }
    }

    pub async fn run(&self, task_id: &str) {
        let task = match self.store.get(task_id) {
            Ok(task) => task,
            Err(e) => {
                log::error!("Worker started for unknown task {}: {}", task_id, e);
                return;
            }
        };

        if let Err(err) = self.execute(&task).await {
            self.cleanup_staging(task_id).await;
            match self.store.fail(task_id, &err) {
                Ok(()) => log::warn!("Task {} failed: {}", task_id, err),
                Err(e) => log::error!("Could not record failure for task {}: {}", task_id, e),
            }
        }
    }

    async fn execute(&self, task: &Task) -> Result<(), DownloadError> {
        // Checkpoint: selection not yet resolved.
        if self.store.cancel_requested(&task.id) {
            return Err(DownloadError::Cancelled);
        }

        let (format_spec, remux, file_stem) = match &task.format_spec {
            // Direct downloads arrive with the selection already
            // resolved by the preparation endpoint.
            Some(spec) => (
                spec.clone(),
                task.remux,
                task.file_stem
                    .clone()
                    .ok_or_else(|| DownloadError::Internal("resolved task has no file stem".to_string()))?,
            ),
            None => self.resolve_selection(task).await?,
        };

        let staging_dir = self.prepare_staging(task).await?;

        // Checkpoint: transfer about to start.
        if self.store.cancel_requested(&task.id) {
            return Err(DownloadError::Cancelled);
        }
        let title = self
            .store
            .get(&task.id)?
            .title
            .unwrap_or_else(|| "video".to_string());
        self.store
            .mark_downloading(&task.id, &format!("Downloading: {}", title))?;

        let _permit = self.governor.admit()?;
        let request = FetchRequest {
            url: task.url.clone(),
            format_spec,
            output_dir: staging_dir.clone(),
            file_stem,
            remux_mp4: remux,
        };
        let produced = match tokio::time::timeout(
            self.timeout,
            self.engine.fetch(&request, self.progress_sink(&task.id)),
        )
        .await
        {
            Err(_) => {
                return Err(DownloadError::Internal(format!(
                    "download timed out after {}s",
                    self.timeout.as_secs()
                )));
            }
            Ok(Err(err)) => {
                if let DownloadError::UpstreamThrottled { retry_after } = err {
                    self.governor
                        .record_throttled(Some(Duration::from_secs(retry_after)));
                }
                return Err(err);
            }
            Ok(Ok(path)) => path,
        };
        self.governor.record_success();

        // Checkpoint: transfer finished.
        if self.store.cancel_requested(&task.id) {
            return Err(DownloadError::Cancelled);
        }

        let file_name = produced
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| DownloadError::Internal("produced file has no name".to_string()))?;

        if task.mode == DeliveryMode::Staged {
            let dest = self.downloads_dir.join(&file_name);
            fs::rename(&produced, &dest)
                .await
                .map_err(|e| DownloadError::Internal(format!("could not finalize file: {}", e)))?;
            let _ = fs::remove_dir_all(&staging_dir).await;
        }

        self.store.complete(
            &task.id,
            vec![file_name],
            &format!("Successfully downloaded: {}", title),
        )?;
        Ok(())
    }

    /// Probe the engine, classify the catalog and pin the selection
    /// onto the task.
    async fn resolve_selection(
        &self,
        task: &Task,
    ) -> Result<(String, bool, String), DownloadError> {
        self.store.update(&task.id, |t| {
            t.message = "Extracting video information...".to_string();
        })?;

        let _permit = self.governor.admit()?;
        let info = match self.engine.probe(&task.url).await {
            Ok(info) => info,
            Err(err) => {
                if let DownloadError::UpstreamThrottled { retry_after } = err {
                    self.governor
                        .record_throttled(Some(Duration::from_secs(retry_after)));
                }
                return Err(err);
            }
        };
        self.governor.record_success();

        let catalog = build_catalog(&info);
        let selection = Selection::resolve(
            &catalog,
            task.video_format_id.clone(),
            task.audio_format_id.clone(),
            task.quality.as_deref(),
        );

        let (spec, remux) = selection.format_spec();
        let safe = safe_title(&info.title);
        let extension = selection.file_extension(&catalog);
        let stem = format!("{}-{}", safe, &task.id[..8]);
        let label = selection.describe(&catalog);

        self.store.update(&task.id, |t| {
            t.title = Some(info.title.clone());
            t.safe_title = Some(safe.clone());
            t.file_extension = Some(extension.clone());
            t.video_format_id = selection.video_id.clone();
            t.audio_format_id = selection.audio_id.clone();
            t.format_spec = Some(spec.clone());
            t.remux = remux;
            t.file_stem = Some(stem.clone());
            t.message = format!("Selected format: {}", label);
        })?;

        Ok((spec, remux, stem))
    }

    async fn prepare_staging(&self, task: &Task) -> Result<PathBuf, DownloadError> {
        match task.mode {
            // The preparation endpoint already allocated the temp area.
            DeliveryMode::Direct => self.store.get(&task.id)?.staging_dir.ok_or_else(|| {
                DownloadError::Internal("direct task has no staging directory".to_string())
            }),
            DeliveryMode::Staged => {
                let dir = self.downloads_dir.join(".staging").join(&task.id);
                fs::create_dir_all(&dir)
                    .await
                    .map_err(|e| DownloadError::Internal(format!("could not stage: {}", e)))?;
                let dir_clone = dir.clone();
                self.store
                    .update(&task.id, move |t| t.staging_dir = Some(dir_clone))?;
                Ok(dir)
            }
        }
    }

    fn progress_sink(&self, task_id: &str) -> ProgressFn {
        let store = Arc::clone(&self.store);
        let id = task_id.to_string();
        let mut last_reported = 0.0f64;
        Box::new(move |progress: FetchProgress| {
            // Percent ticks below 1% apart are noise for pollers.
            if progress.percent - last_reported >= 1.0 {
                last_reported = progress.percent;
                let _ = store.update(&id, |t| {
                    t.message = format!(
                        "Downloading: {:.1}% ({:.1} MB)",
                        progress.percent,
                        progress.total_bytes as f64 / 1_048_576.0
                    );
                });
            }
            !store.cancel_requested(&id)
        })
    }

    /// Partial output must never reach the delivery gateway.
    async fn cleanup_staging(&self, task_id: &str) {
        let staging = self.store.get(task_id).ok().and_then(|t| t.staging_dir);
        if let Some(dir) = staging {
            if let Err(e) = fs::remove_dir_all(&dir).await {
                if dir.exists() {
                    log::warn!("Failed to clean staging dir {:?}: {}", dir, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MediaInfo;
    use crate::engine::formats::RawFormat;
    use crate::tasks::{NewTask, TaskStatus};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    struct FakeEngine {
        formats: Vec<RawFormat>,
        probe_error: Option<DownloadError>,
        fetch_error: Option<DownloadError>,
        output_bytes: usize,
        hang_fetch: bool,
        on_fetch_start: Option<Box<dyn Fn() + Send + Sync>>,
        seen_request: Mutex<Option<FetchRequest>>,
    }

    impl FakeEngine {
        fn new(formats: Vec<RawFormat>) -> Self {
            Self {
                formats,
                probe_error: None,
                fetch_error: None,
                output_bytes: 1024,
                hang_fetch: false,
                on_fetch_start: None,
                seen_request: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl MediaEngine for FakeEngine {
        async fn probe(&self, _url: &str) -> Result<MediaInfo, DownloadError> {
            if let Some(err) = &self.probe_error {
                return Err(err.clone());
            }
            Ok(MediaInfo {
                id: "abc".to_string(),
                title: "Fake Clip".to_string(),
                duration_secs: 60,
                uploader: "tester".to_string(),
                thumbnail: None,
                description: String::new(),
                view_count: 1,
                upload_date: "20250101".to_string(),
                formats: self.formats.clone(),
            })
        }

        async fn fetch(
            &self,
            request: &FetchRequest,
            mut on_progress: ProgressFn,
        ) -> Result<PathBuf, DownloadError> {
            *self.seen_request.lock() = Some(request.clone());
            if let Some(err) = &self.fetch_error {
                return Err(err.clone());
            }
            if self.hang_fetch {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }

            // Leave a partial file behind before asking whether to
            // continue, so cancellation has something to clean up.
            let path = request.output_dir.join(format!("{}.mp4", request.file_stem));
            std::fs::write(&path, vec![0u8; self.output_bytes]).unwrap();

            if let Some(hook) = &self.on_fetch_start {
                hook();
            }
            if !on_progress(FetchProgress {
                percent: 50.0,
                total_bytes: self.output_bytes as u64,
            }) {
                return Err(DownloadError::Cancelled);
            }
            Ok(path)
        }
    }

    fn video_format(id: &str) -> RawFormat {
        RawFormat {
            format_id: id.to_string(),
            ext: Some("mp4".to_string()),
            vcodec: Some("avc1".to_string()),
            acodec: Some("none".to_string()),
            height: Some(1080),
            width: None,
            fps: Some(30.0),
            tbr: Some(4000.0),
            abr: None,
            filesize: Some(50_000_000),
            filesize_approx: None,
            language: None,
            quality: None,
            format_note: None,
        }
    }

    fn audio_format(id: &str) -> RawFormat {
        RawFormat {
            format_id: id.to_string(),
            ext: Some("m4a".to_string()),
            vcodec: Some("none".to_string()),
            acodec: Some("mp4a.40.2".to_string()),
            height: None,
            width: None,
            fps: None,
            tbr: None,
            abr: Some(128.0),
            filesize: Some(5_000_000),
            filesize_approx: None,
            language: Some("en".to_string()),
            quality: None,
            format_note: None,
        }
    }

    struct Fixture {
        store: Arc<TaskStore>,
        governor: Arc<RateGovernor>,
        downloads: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: Arc::new(TaskStore::new()),
                governor: Arc::new(RateGovernor::new(100, Duration::from_secs(300))),
                downloads: TempDir::new().unwrap(),
            }
        }

        fn worker(&self, engine: Arc<FakeEngine>) -> DownloadWorker {
            DownloadWorker::new(
                Arc::clone(&self.store),
                engine,
                Arc::clone(&self.governor),
                self.downloads.path().to_path_buf(),
                Duration::from_secs(30),
            )
        }
    }

    #[tokio::test]
    async fn test_staged_download_completes() {
        let fx = Fixture::new();
        let task = fx.store.create(NewTask {
            url: "https://example.com/v".to_string(),
            ..NewTask::default()
        });
        let engine = Arc::new(FakeEngine::new(vec![video_format("V1"), audio_format("A1")]));
        fx.worker(engine).run(&task.id).await;

        let done = fx.store.get(&task.id).unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.downloaded_files.len(), 1);
        assert!(done.started_at.is_some());
        assert!(done.message.contains("Fake Clip"));

        let staged = fx.downloads.path().join(&done.downloaded_files[0]);
        assert!(staged.is_file());
        assert!(!fx.downloads.path().join(".staging").join(&task.id).exists());
    }

    #[tokio::test]
    async fn test_explicit_pair_requests_mux() {
        let fx = Fixture::new();
        let task = fx.store.create(NewTask {
            url: "u".to_string(),
            video_format_id: Some("V1".to_string()),
            audio_format_id: Some("A1".to_string()),
            ..NewTask::default()
        });
        let engine = Arc::new(FakeEngine::new(vec![video_format("V1"), audio_format("A1")]));
        fx.worker(Arc::clone(&engine)).run(&task.id).await;

        let done = fx.store.get(&task.id).unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        // Exactly one merged container, not two stream files.
        assert_eq!(done.downloaded_files.len(), 1);
        assert_eq!(done.file_extension.as_deref(), Some("mp4"));

        let seen = engine.seen_request.lock().clone().expect("engine saw a fetch");
        assert_eq!(seen.format_spec, "V1+A1");
        assert!(seen.remux_mp4);
    }

    #[tokio::test]
    async fn test_single_variant_fetches_without_mux() {
        let fx = Fixture::new();
        let task = fx.store.create(NewTask {
            url: "u".to_string(),
            audio_format_id: Some("A1".to_string()),
            ..NewTask::default()
        });
        let engine = Arc::new(FakeEngine::new(vec![video_format("V1"), audio_format("A1")]));
        fx.worker(Arc::clone(&engine)).run(&task.id).await;

        let seen = engine.seen_request.lock().clone().unwrap();
        assert_eq!(seen.format_spec, "A1");
        assert!(!seen.remux_mp4);
    }

    #[tokio::test]
    async fn test_cancel_mid_transfer_leaves_no_partial() {
        let fx = Fixture::new();
        let task = fx.store.create(NewTask {
            url: "u".to_string(),
            ..NewTask::default()
        });
        let mut engine = FakeEngine::new(vec![video_format("V1"), audio_format("A1")]);
        let store = Arc::clone(&fx.store);
        let id = task.id.clone();
        engine.on_fetch_start = Some(Box::new(move || {
            store.request_cancel(&id).unwrap();
        }));
        fx.worker(Arc::new(engine)).run(&task.id).await;

        let done = fx.store.get(&task.id).unwrap();
        assert_eq!(done.status, TaskStatus::Error);
        assert_eq!(done.error.as_ref().unwrap().kind, "cancelled");

        // Neither the staged area nor the downloads dir holds leftovers.
        assert!(!fx.downloads.path().join(".staging").join(&task.id).exists());
        let survivors: Vec<_> = std::fs::read_dir(fx.downloads.path())
            .unwrap()
            .flatten()
            .filter(|e| e.path().is_file())
            .collect();
        assert!(survivors.is_empty());
    }

    #[tokio::test]
    async fn test_throttled_probe_fails_task_and_arms_cooldown() {
        let fx = Fixture::new();
        let task = fx.store.create(NewTask {
            url: "u".to_string(),
            ..NewTask::default()
        });
        let mut engine = FakeEngine::new(vec![]);
        engine.probe_error = Some(DownloadError::UpstreamThrottled { retry_after: 42 });
        fx.worker(Arc::new(engine)).run(&task.id).await;

        let done = fx.store.get(&task.id).unwrap();
        assert_eq!(done.status, TaskStatus::Error);
        let detail = done.error.unwrap();
        assert_eq!(detail.kind, "upstream_throttled");
        assert_eq!(detail.retry_after, Some(42));

        let snap = fx.governor.snapshot();
        assert!(snap.cooldown_remaining_secs.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_transfer_hits_watchdog() {
        let fx = Fixture::new();
        let task = fx.store.create(NewTask {
            url: "u".to_string(),
            ..NewTask::default()
        });
        let mut engine = FakeEngine::new(vec![video_format("V1"), audio_format("A1")]);
        engine.hang_fetch = true;
        fx.worker(Arc::new(engine)).run(&task.id).await;

        let done = fx.store.get(&task.id).unwrap();
        assert_eq!(done.status, TaskStatus::Error);
        assert_eq!(done.error.as_ref().unwrap().kind, "internal_error");
        assert!(done.message.contains("timed out"));
    }
}
