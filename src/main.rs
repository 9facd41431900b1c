use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Error;

use crate::api::AppState;
use crate::engine::{MediaEngine, YtDlpEngine, ensure_binaries, is_executable_present};
use crate::rate_limit::RateGovernor;
use crate::tasks::TaskStore;
use crate::tasks::worker::DownloadWorker;
use crate::workers::WorkerPool;

mod api;
mod config;
mod cookies;
mod engine;
mod errors;
mod rate_limit;
mod tasks;
mod utils;
mod workers;

/// Default retry hint when the upstream throttle response carries none.
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

#[tokio::main]
async fn main() -> Result<(), Error> {
    // Console logging plus an error-level tee into a file.
    use log::LevelFilter;
    use std::fs::OpenOptions;
    use std::sync::Mutex;

    let error_log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open("server_errors.log")?;
    let error_log_file = Arc::new(Mutex::new(error_log_file));

    let mut builder = pretty_env_logger::formatted_builder();
    builder
        .format(move |buf, record| {
            use std::io::Write;
            let output = format!(
                "{} [{}] {}: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            );

            if record.level() == log::Level::Error {
                if let Ok(mut file) = error_log_file.try_lock() {
                    let _ = writeln!(file, "{}", &output);
                }
            }

            writeln!(buf, "{}", &output)
        })
        .filter(None, LevelFilter::Info)
        .init();

    log::info!("Starting ytdl-server...");
    let start_time = std::time::Instant::now();

    if let Err(e) = config::load_environment() {
        log::error!("Failed to load environment: {}", e);
        return Err(e);
    }
    let cfg = config::Config::from_env()?;

    if let Err(e) = ensure_binaries(&cfg.libraries_dir, &cfg.downloads_dir).await {
        log::error!("Failed to ensure binaries: {}", e);
        return Err(e);
    }

    let yt_dlp_path = cfg.yt_dlp_path();
    if !is_executable_present(&yt_dlp_path) {
        log::error!("yt-dlp not found at {:?} after attempted download", yt_dlp_path);
        return Err(anyhow::Error::msg("yt-dlp not available"));
    }
    log::info!("yt-dlp found at {:?}", yt_dlp_path);

    let ffmpeg_path = cfg.ffmpeg_path();
    if !is_executable_present(&ffmpeg_path) {
        log::error!("ffmpeg not found at {:?} after attempted download", ffmpeg_path);
        return Err(anyhow::Error::msg("ffmpeg not available"));
    }
    log::info!("ffmpeg found at {:?}", ffmpeg_path);

    let store = Arc::new(TaskStore::new());
    let governor = Arc::new(RateGovernor::new(
        cfg.rate_limit_admissions,
        cfg.rate_limit_window,
    ));
    let media_engine: Arc<dyn MediaEngine> = Arc::new(YtDlpEngine::new(
        yt_dlp_path,
        cfg.ffmpeg_dir(),
        cfg.cookies_file.clone(),
        DEFAULT_RETRY_AFTER_SECS,
    ));
    let worker = Arc::new(DownloadWorker::new(
        Arc::clone(&store),
        Arc::clone(&media_engine),
        Arc::clone(&governor),
        cfg.downloads_dir.clone(),
        cfg.download_timeout,
    ));

    spawn_sweeper(Arc::clone(&store), cfg.clone());

    let state = Arc::new(AppState {
        store,
        governor,
        engine: media_engine,
        worker,
        pool: tokio::sync::Mutex::new(WorkerPool::new(cfg.max_concurrent_downloads)),
        config: cfg.clone(),
    });

    let addr = format!("0.0.0.0:{}", cfg.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!(
        "Server initialization completed in {:.2?}, listening on {}",
        start_time.elapsed(),
        addr
    );

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            log::info!("Shutdown signal received");
        })
        .await?;

    Ok(())
}

/// Periodic eviction of finished task records, their leftover staging
/// areas, and (when retention is configured) stale staged files.
fn spawn_sweeper(store: Arc<TaskStore>, cfg: config::Config) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;

            for task in store.evict(cfg.task_ttl, cfg.task_capacity) {
                if let Some(dir) = task.staging_dir {
                    if dir.exists() {
                        log::debug!("Removing staging dir of evicted task {}", task.id);
                        let _ = tokio::fs::remove_dir_all(&dir).await;
                    }
                }
            }

            if let Some(retention) = cfg.file_retention {
                sweep_stale_files(&cfg.downloads_dir, retention).await;
            }
        }
    });
}

async fn sweep_stale_files(dir: &Path, retention: Duration) {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return;
    };
    let now = SystemTime::now();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let hidden = path
            .file_name()
            .and_then(|n| n.to_str())
            .map_or(true, |n| n.starts_with('.'));
        if hidden || !path.is_file() {
            continue;
        }
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        let Ok(modified) = meta.modified() else {
            continue;
        };
        if now.duration_since(modified).map_or(false, |age| age > retention) {
            log::info!("Retention sweep removing {:?}", path);
            if let Err(e) = tokio::fs::remove_file(&path).await {
                log::warn!("Retention sweep failed for {:?}: {}", path, e);
            }
        }
    }
}
