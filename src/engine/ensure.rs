use std::path::Path;

use anyhow::Result;
use tokio::fs;

use super::bootstrap::{download_file, extract_ffmpeg_archive, find_binary_in_dir};
use super::urls::{latest_ffmpeg_url, latest_yt_dlp_url};
use super::utils::is_executable_present;
use crate::utils::retry::retry_with_backoff;

/// Download yt-dlp and ffmpeg into the libraries directory when they
/// are missing, and make sure the output directory exists. Runs once
/// before the server starts accepting requests.
pub async fn ensure_binaries(libraries_dir: &Path, downloads_dir: &Path) -> Result<()> {
    fs::create_dir_all(libraries_dir).await?;
    fs::create_dir_all(downloads_dir).await?;

    let yt_dlp_path = libraries_dir.join(if cfg!(target_os = "windows") {
        "yt-dlp.exe"
    } else {
        "yt-dlp"
    });
    let ffmpeg_dir = libraries_dir.join("ffmpeg");
    let ffmpeg_path = ffmpeg_dir.join(if cfg!(target_os = "windows") {
        "ffmpeg.exe"
    } else {
        "ffmpeg"
    });

    if !is_executable_present(&yt_dlp_path) {
        log::info!("yt-dlp not found, downloading latest release...");
        let url = latest_yt_dlp_url();
        retry_with_backoff(3, || download_file(&url, &yt_dlp_path)).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&yt_dlp_path).await?.permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&yt_dlp_path, perms).await?;
        }
    } else {
        log::info!("yt-dlp already exists at {:?}", yt_dlp_path);
    }

    if !is_executable_present(&ffmpeg_path) {
        log::info!("ffmpeg not found, downloading latest release...");
        fs::create_dir_all(&ffmpeg_dir).await?;

        let archive_ext = if cfg!(target_os = "windows") {
            "zip"
        } else if cfg!(target_os = "macos") {
            "7z"
        } else {
            "tar.xz"
        };
        let archive_path = libraries_dir.join(format!("ffmpeg-release.{}", archive_ext));
        let url = latest_ffmpeg_url();
        retry_with_backoff(3, || download_file(&url, &archive_path)).await?;

        extract_ffmpeg_archive(&archive_path, &ffmpeg_dir).await?;
        let _ = fs::remove_file(&archive_path).await;

        // Some builds nest the binaries one directory down; fix up the
        // expected location if extraction left them there.
        if !is_executable_present(&ffmpeg_path) {
            let binary_name = if cfg!(target_os = "windows") {
                "ffmpeg.exe"
            } else {
                "ffmpeg"
            };
            if let Some(found) = find_binary_in_dir(&ffmpeg_dir, binary_name).await {
                log::info!("Found ffmpeg at {:?}, copying to expected location", found);
                fs::copy(&found, &ffmpeg_path).await?;
            }
        }

        if !is_executable_present(&ffmpeg_path) {
            return Err(anyhow::anyhow!(
                "ffmpeg was not available at {:?} after extraction",
                ffmpeg_path
            ));
        }
    } else {
        log::info!("ffmpeg already exists at {:?}", ffmpeg_path);
    }

    Ok(())
}
