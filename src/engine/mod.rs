pub mod bootstrap;
pub mod ensure;
pub mod formats;
pub mod urls;
pub mod utils;
pub mod ytdlp;

pub use ensure::ensure_binaries;
pub use utils::is_executable_present;
pub use ytdlp::YtDlpEngine;

use std::path::PathBuf;

use async_trait::async_trait;

use crate::errors::DownloadError;
use formats::RawFormat;

/// Probe result: source metadata plus the raw format list, exactly as
/// the engine reported it. `formats::build_catalog` turns this into the
/// typed catalog.
#[derive(Debug, Clone)]
pub struct MediaInfo {
    pub id: String,
    pub title: String,
    pub duration_secs: u64,
    pub uploader: String,
    pub thumbnail: Option<String>,
    pub description: String,
    pub view_count: u64,
    pub upload_date: String,
    pub formats: Vec<RawFormat>,
}

/// One byte-transfer request handed to the engine.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    /// Engine-native format spec ("137+140", "140", "best").
    pub format_spec: String,
    pub output_dir: PathBuf,
    pub file_stem: String,
    /// Merge separately-fetched streams into one mp4 container.
    pub remux_mp4: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct FetchProgress {
    pub percent: f64,
    pub total_bytes: u64,
}

/// Invoked on every progress report. Returning false asks the engine to
/// stop the transfer; the caller then sees `DownloadError::Cancelled`.
pub type ProgressFn = Box<dyn FnMut(FetchProgress) -> bool + Send>;

/// The extraction/fetch engine boundary. Production uses the yt-dlp
/// binary; tests substitute a scripted fake.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Resolve a URL into metadata and available formats. One upstream
    /// round trip, no bytes fetched.
    async fn probe(&self, url: &str) -> Result<MediaInfo, DownloadError>;

    /// Transfer the selected streams into `output_dir` and return the
    /// produced file.
    async fn fetch(
        &self,
        request: &FetchRequest,
        on_progress: ProgressFn,
    ) -> Result<PathBuf, DownloadError>;
}
