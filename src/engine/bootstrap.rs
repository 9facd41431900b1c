use std::path::{Path, PathBuf};

use anyhow::Result;
use tokio::fs;
use tokio::io;

#[cfg(target_os = "windows")]
use std::io::Read;
#[cfg(target_os = "windows")]
use zip::ZipArchive;

#[cfg(target_os = "macos")]
use sevenz_rust::decompress_file as decompress_7z;

#[cfg(all(unix, not(target_os = "macos")))]
use tar::Archive;
#[cfg(all(unix, not(target_os = "macos")))]
use xz2::read::XzDecoder;

/// Stream a release asset to disk in chunks.
pub async fn download_file(url: &str, path: &Path) -> Result<()> {
    log::info!("Downloading from {} to {:?}", url, path);

    let client = reqwest::Client::new();
    let mut response = client.get(url).send().await.map_err(|e| {
        log::error!("Failed to send GET request to {}: {:?}", url, e);
        anyhow::anyhow!("Failed to send GET request to {}: {:?}", url, e)
    })?;

    if !response.status().is_success() {
        log::error!("Download failed for {}: HTTP status {}", url, response.status());
        return Err(anyhow::anyhow!(
            "Download failed for {}: HTTP status {}",
            url,
            response.status()
        ));
    }

    let mut file = fs::File::create(path).await.map_err(|e| {
        log::error!("Failed to create file {:?}: {:?}", path, e);
        anyhow::anyhow!("Failed to create file {:?}: {:?}", path, e)
    })?;

    while let Some(chunk) = response.chunk().await.map_err(|e| {
        log::error!("Failed to read chunk from response for {}: {:?}", url, e);
        anyhow::anyhow!("Failed to read chunk from response for {}: {:?}", url, e)
    })? {
        io::copy(&mut chunk.as_ref(), &mut file).await.map_err(|e| {
            log::error!("Failed to write chunk to file {:?}: {:?}", path, e);
            anyhow::anyhow!("Failed to write chunk to file {:?}: {:?}", path, e)
        })?;
    }

    log::info!("Download completed successfully to {:?}", path);
    Ok(())
}

#[cfg(target_os = "windows")]
pub async fn extract_ffmpeg_archive(archive_path: &Path, extract_to: &Path) -> Result<()> {
    let file = std::fs::File::open(archive_path)?;
    let mut archive = ZipArchive::new(file)?;

    let mut ffmpeg_extracted = false;
    let mut ffprobe_extracted = false;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let entry_name = PathBuf::from(entry.name());

        for (binary, flag) in [
            ("ffmpeg.exe", &mut ffmpeg_extracted),
            ("ffprobe.exe", &mut ffprobe_extracted),
        ] {
            if entry_name.ends_with(binary) {
                let outpath = extract_to.join(binary);
                let mut outfile = fs::File::create(&outpath).await?;
                let mut buffer = Vec::new();
                entry.read_to_end(&mut buffer)?;
                io::copy(&mut buffer.as_slice(), &mut outfile).await?;
                log::info!("Extracted {} to {:?}", binary, outpath);
                *flag = true;
                break;
            }
        }

        if ffmpeg_extracted && ffprobe_extracted {
            break;
        }
    }

    if !ffmpeg_extracted {
        return Err(anyhow::anyhow!("ffmpeg.exe not found in archive"));
    }
    Ok(())
}

#[cfg(target_os = "macos")]
pub async fn extract_ffmpeg_archive(archive_path: &Path, extract_to: &Path) -> Result<()> {
    fs::create_dir_all(extract_to).await?;

    decompress_7z(archive_path, extract_to)
        .map_err(|e| anyhow::anyhow!("Failed to extract 7z archive: {:?}", e))?;

    // The archive layout varies; search for the binaries and move them
    // to the expected names.
    let ffmpeg_output = extract_to.join("ffmpeg");
    let mut found = false;
    let mut stack = vec![extract_to.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else { continue };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path
                .file_name()
                .is_some_and(|n| n.to_string_lossy().contains("ffmpeg"))
            {
                if path != ffmpeg_output {
                    std::fs::copy(&path, &ffmpeg_output)?;
                }
                use std::os::unix::fs::PermissionsExt;
                let mut perms = std::fs::metadata(&ffmpeg_output)?.permissions();
                perms.set_mode(0o755);
                std::fs::set_permissions(&ffmpeg_output, perms)?;
                log::info!("Extracted ffmpeg to {:?}", ffmpeg_output);
                found = true;
            }
        }
    }

    if !found {
        return Err(anyhow::anyhow!("ffmpeg binary not found in 7z archive"));
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "macos")))]
pub async fn extract_ffmpeg_archive(archive_path: &Path, extract_to: &Path) -> Result<()> {
    use std::fs::File;

    fs::create_dir_all(extract_to).await?;

    let file = File::open(archive_path)?;
    let decompressed = XzDecoder::new(file);
    let mut archive = Archive::new(decompressed);

    let mut ffmpeg_extracted = false;
    let mut ffprobe_extracted = false;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let entry_path = entry.path()?.into_owned();
        let Some(name) = entry_path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };

        if name == "ffmpeg" || name == "ffprobe" {
            let output_path = extract_to.join(name);
            let mut outfile = File::create(&output_path)?;
            std::io::copy(&mut entry, &mut outfile)?;

            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&output_path)?.permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&output_path, perms)?;

            log::info!("Extracted {} to {:?}", name, output_path);
            if name == "ffmpeg" {
                ffmpeg_extracted = true;
            } else {
                ffprobe_extracted = true;
            }
        }

        if ffmpeg_extracted && ffprobe_extracted {
            break;
        }
    }

    if !ffmpeg_extracted {
        return Err(anyhow::anyhow!("ffmpeg binary not found in archive"));
    }
    Ok(())
}

/// Depth-first search for a binary inside an extracted archive tree.
pub async fn find_binary_in_dir(base_dir: &Path, binary_name: &str) -> Option<PathBuf> {
    let mut stack = vec![base_dir.to_path_buf()];

    while let Some(current_dir) = stack.pop() {
        if let Ok(mut entries) = tokio::fs::read_dir(&current_dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if path.is_file()
                    && path.file_name().map_or(false, |name| name == binary_name)
                {
                    return Some(path);
                } else if path.is_dir() {
                    stack.push(path);
                }
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_find_binary_in_nested_dir() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::File::create(nested.join("ffmpeg")).unwrap();

        let found = find_binary_in_dir(dir.path(), "ffmpeg").await;
        assert_eq!(found, Some(nested.join("ffmpeg")));
    }

    #[tokio::test]
    async fn test_find_binary_missing() {
        let dir = TempDir::new().unwrap();
        assert!(find_binary_in_dir(dir.path(), "ffmpeg").await.is_none());
    }
}
