pub fn latest_yt_dlp_url() -> String {
    let asset = if cfg!(target_os = "windows") {
        "yt-dlp.exe"
    } else if cfg!(target_os = "linux") {
        "yt-dlp_linux"
    } else if cfg!(target_os = "macos") {
        "yt-dlp_macos"
    } else {
        "yt-dlp"
    };
    format!(
        "https://github.com/yt-dlp/yt-dlp/releases/latest/download/{}",
        asset
    )
}

pub fn latest_ffmpeg_url() -> String {
    if cfg!(target_os = "windows") {
        "https://github.com/BtbN/FFmpeg-Builds/releases/latest/download/ffmpeg-master-latest-win64-gpl.zip"
            .to_string()
    } else if cfg!(target_os = "linux") {
        "https://johnvansickle.com/ffmpeg/builds/ffmpeg-git-amd64-static.tar.xz".to_string()
    } else {
        "https://evermeet.cx/ffmpeg/get/ffmpeg/7z".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yt_dlp_url_points_at_latest_release() {
        let url = latest_yt_dlp_url();
        assert!(url.starts_with("https://github.com/yt-dlp/yt-dlp/releases/latest/download/"));
    }
}
