use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use super::formats::RawFormat;
use super::{FetchProgress, FetchRequest, MediaEngine, MediaInfo, ProgressFn};
use crate::errors::{DownloadError, classify_engine_output};

const PROBED_EXTENSIONS: [&str; 9] = [
    ".mp4", ".mov", ".webm", ".mkv", ".flv", ".m4a", ".mp3", ".ogg", ".aac",
];

/// Wrapper around the yt-dlp binary. Each call spawns one child
/// process; progress is scraped off the `--newline` output.
#[derive(Clone)]
pub struct YtDlpEngine {
    yt_dlp_path: PathBuf,
    ffmpeg_dir: PathBuf,
    cookies_file: PathBuf,
    default_retry_after: u64,
}

#[derive(Deserialize)]
struct RawInfo {
    #[serde(default)]
    id: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    uploader: Option<String>,
    #[serde(default)]
    thumbnail: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    view_count: Option<u64>,
    #[serde(default)]
    upload_date: Option<String>,
    #[serde(default)]
    formats: Vec<RawFormat>,
}

impl YtDlpEngine {
    pub fn new(
        yt_dlp_path: PathBuf,
        ffmpeg_dir: PathBuf,
        cookies_file: PathBuf,
        default_retry_after: u64,
    ) -> Self {
        Self {
            yt_dlp_path,
            ffmpeg_dir,
            cookies_file,
            default_retry_after,
        }
    }

    fn base_command(&self) -> Command {
        let mut cmd = Command::new(&self.yt_dlp_path);
        cmd.arg("--no-playlist");
        if self.cookies_file.exists() {
            cmd.arg("--cookies").arg(&self.cookies_file);
        }
        cmd
    }

    fn classify(&self, stderr: &str) -> DownloadError {
        classify_engine_output(stderr, self.default_retry_after)
    }
}

#[async_trait]
impl MediaEngine for YtDlpEngine {
    async fn probe(&self, url: &str) -> Result<MediaInfo, DownloadError> {
        let mut cmd = self.base_command();
        cmd.arg("--dump-json")
            .arg("--skip-download")
            .arg(url)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        log::debug!("Probing formats for {}", url);
        let output = cmd
            .output()
            .await
            .map_err(|e| DownloadError::Internal(format!("failed to spawn yt-dlp: {}", e)))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            log::warn!("yt-dlp probe failed for {}: {}", url, stderr.trim());
            return Err(self.classify(&stderr));
        }

        // --dump-json emits one JSON document per line; --no-playlist
        // keeps it to a single entry.
        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout
            .lines()
            .find(|l| l.trim_start().starts_with('{'))
            .ok_or_else(|| {
                DownloadError::ExtractionFailure("engine produced no manifest".to_string())
            })?;
        let raw: RawInfo = serde_json::from_str(line).map_err(|e| {
            DownloadError::ExtractionFailure(format!("unparseable engine manifest: {}", e))
        })?;

        Ok(MediaInfo {
            id: raw.id,
            title: raw.title.unwrap_or_else(|| "Unknown".to_string()),
            duration_secs: raw.duration.unwrap_or(0.0) as u64,
            uploader: raw.uploader.unwrap_or_else(|| "N/A".to_string()),
            thumbnail: raw.thumbnail,
            description: raw.description.unwrap_or_default(),
            view_count: raw.view_count.unwrap_or(0),
            upload_date: raw.upload_date.unwrap_or_default(),
            formats: raw.formats,
        })
    }

    async fn fetch(
        &self,
        request: &FetchRequest,
        mut on_progress: ProgressFn,
    ) -> Result<PathBuf, DownloadError> {
        let output_template = request
            .output_dir
            .join(format!("{}.%(ext)s", request.file_stem));

        let mut cmd = self.base_command();
        cmd.arg("--format")
            .arg(&request.format_spec)
            .arg("--output")
            .arg(&output_template)
            .arg("--no-part")
            .arg("--no-mtime")
            .arg("--ffmpeg-location")
            .arg(&self.ffmpeg_dir)
            .arg("--progress")
            .arg("--newline")
            .arg(&request.url)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if request.remux_mp4 {
            cmd.arg("--merge-output-format").arg("mp4");
        }
        // The caller may drop this future on its watchdog timeout; take
        // the child down with it.
        cmd.kill_on_drop(true);

        log::info!(
            "Fetching {} with format {} into {:?}",
            request.url,
            request.format_spec,
            request.output_dir
        );

        let mut child = cmd
            .spawn()
            .map_err(|e| DownloadError::Internal(format!("failed to spawn yt-dlp: {}", e)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DownloadError::Internal("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| DownloadError::Internal("stderr not captured".to_string()))?;

        let mut stdout_reader = BufReader::new(stdout).lines();
        let mut stderr_reader = BufReader::new(stderr).lines();

        let mut last_percentage = 0.0f64;
        let mut stderr_tail = String::new();
        let mut cancelled = false;

        loop {
            tokio::select! {
                line = stdout_reader.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            log::trace!("yt-dlp stdout: {}", line);
                            if let Some((percentage, total_size)) = parse_progress_line(&line) {
                                if percentage > last_percentage {
                                    last_percentage = percentage;
                                    let keep_going = on_progress(FetchProgress {
                                        percent: percentage,
                                        total_bytes: total_size,
                                    });
                                    if !keep_going {
                                        cancelled = true;
                                        break;
                                    }
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(_) => break,
                    }
                },
                line = stderr_reader.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            log::trace!("yt-dlp stderr: {}", line);
                            stderr_tail.push_str(&line);
                            stderr_tail.push('\n');
                        }
                        Ok(None) => {}
                        Err(_) => {}
                    }
                }
            }
        }

        if cancelled {
            log::info!("Cancelling transfer of {}", request.url);
            let _ = child.kill().await;
            return Err(DownloadError::Cancelled);
        }

        let status = child
            .wait()
            .await
            .map_err(|e| DownloadError::Internal(format!("yt-dlp did not exit: {}", e)))?;

        if !status.success() {
            log::warn!("yt-dlp fetch failed: {}", stderr_tail.trim());
            return Err(self.classify(&stderr_tail));
        }

        locate_output(&request.output_dir, &request.file_stem).ok_or_else(|| {
            DownloadError::Internal("downloaded file not found after transfer".to_string())
        })
    }
}

/// The engine decides the final extension, so probe the known ones and
/// fall back to a stem-prefix scan.
fn locate_output(dir: &Path, stem: &str) -> Option<PathBuf> {
    for ext in PROBED_EXTENSIONS {
        let candidate = dir.join(format!("{}{}", stem, ext));
        if candidate.exists() {
            return Some(candidate);
        }
    }
    std::fs::read_dir(dir).ok()?.flatten().find_map(|entry| {
        let path = entry.path();
        let matches = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(stem));
        (matches && path.is_file()).then_some(path)
    })
}

fn parse_progress_line(line: &str) -> Option<(f64, u64)> {
    let clean_line = remove_ansi_codes(line);
    let patterns = [
        r"\[download\]\s+(\d+\.?\d*)%\s+of\s+(\d+\.?\d*[KMGT]?i?B)",
        r"\[download\]\s+(\d+\.?\d*)%\s+of\s+~(\d+\.?\d*[KMGT]?i?B)",
        r"(\d+\.?\d*)%",
    ];

    for pattern in patterns {
        if let Ok(re) = Regex::new(pattern) {
            if let Some(caps) = re.captures(&clean_line) {
                if let Ok(percentage) = caps[1].parse::<f64>() {
                    let total_size = if caps.len() > 2 {
                        parse_size_string(&caps[2])
                    } else {
                        10_485_760
                    };
                    return Some((percentage, total_size));
                }
            }
        }
    }
    None
}

fn remove_ansi_codes(text: &str) -> String {
    let re = Regex::new(r"\x1B\[[0-?]*[ -/]*[@-~]").unwrap();
    re.replace_all(text, "").to_string()
}

fn parse_size_string(s: &str) -> u64 {
    let s_clean = s.trim().to_lowercase();
    let (number_str, multiplier) = if s_clean.ends_with("kib") || s_clean.ends_with("kb") {
        (s_clean.trim_end_matches("kib").trim_end_matches("kb"), 1_024)
    } else if s_clean.ends_with("mib") || s_clean.ends_with("mb") {
        (s_clean.trim_end_matches("mib").trim_end_matches("mb"), 1_024 * 1_024)
    } else if s_clean.ends_with("gib") || s_clean.ends_with("gb") {
        (s_clean.trim_end_matches("gib").trim_end_matches("gb"), 1_024 * 1_024 * 1_024)
    } else {
        (s_clean.trim_end_matches("b").trim_end_matches("i"), 1)
    };
    (number_str.trim().parse::<f64>().unwrap_or(0.0) * multiplier as f64) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::TempDir;

    #[test]
    fn test_parse_progress_line() {
        let line = "[download]  42.3% of 50.00MiB at 2.50MiB/s ETA 00:12";
        let (pct, total) = parse_progress_line(line).unwrap();
        assert!((pct - 42.3).abs() < 0.001);
        assert_eq!(total, 50 * 1024 * 1024);
    }

    #[test]
    fn test_parse_progress_line_estimated_size() {
        let line = "[download]  10.0% of ~120.00MiB at 1.00MiB/s";
        let (pct, total) = parse_progress_line(line).unwrap();
        assert!((pct - 10.0).abs() < 0.001);
        assert_eq!(total, 120 * 1024 * 1024);
    }

    #[test]
    fn test_parse_progress_line_rejects_noise() {
        assert!(parse_progress_line("[youtube] abc: Downloading webpage").is_none());
    }

    #[test]
    fn test_parse_size_string() {
        assert_eq!(parse_size_string("5.00MiB"), 5 * 1024 * 1024);
        assert_eq!(parse_size_string("1.5GiB"), 1_610_612_736);
        assert_eq!(parse_size_string("800KiB"), 800 * 1024);
    }

    #[test]
    fn test_remove_ansi_codes() {
        assert_eq!(remove_ansi_codes("\x1B[0;32m50%\x1B[0m"), "50%");
    }

    #[test]
    fn test_locate_output_probes_extensions() {
        let dir = TempDir::new().unwrap();
        File::create(dir.path().join("clip-abc.webm")).unwrap();
        let found = locate_output(dir.path(), "clip-abc").unwrap();
        assert_eq!(found, dir.path().join("clip-abc.webm"));
    }

    #[test]
    fn test_locate_output_falls_back_to_prefix_scan() {
        let dir = TempDir::new().unwrap();
        File::create(dir.path().join("clip-abc.opus")).unwrap();
        let found = locate_output(dir.path(), "clip-abc").unwrap();
        assert_eq!(found, dir.path().join("clip-abc.opus"));
    }

    #[test]
    fn test_locate_output_missing() {
        let dir = TempDir::new().unwrap();
        assert!(locate_output(dir.path(), "nothing").is_none());
    }

    #[test]
    fn test_probe_info_parsing() {
        let json = r#"{"id":"abc","title":"A Clip","duration":93.4,"uploader":"someone",
            "view_count":12,"upload_date":"20250102",
            "formats":[{"format_id":"137","ext":"mp4","vcodec":"avc1","acodec":"none","height":1080,"tbr":4000.0}]}"#;
        let raw: RawInfo = serde_json::from_str(json).unwrap();
        assert_eq!(raw.title.as_deref(), Some("A Clip"));
        assert_eq!(raw.formats.len(), 1);
        assert_eq!(raw.formats[0].format_id, "137");
    }
}
