use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;

pub fn find_dotenv() -> Result<Option<PathBuf>> {
    // 1. Check directory where the executable is located
    if let Ok(current_exe) = std::env::current_exe() {
        if let Some(exe_dir) = current_exe.parent() {
            let exe_dir_dotenv = exe_dir.join(".env");
            if exe_dir_dotenv.exists() {
                return Ok(Some(exe_dir_dotenv));
            }
        }
    }

    // 2. Check current working directory (for cargo run compatibility)
    let current_dir = std::env::current_dir()?;
    let current_dotenv = current_dir.join(".env");
    if current_dotenv.exists() {
        return Ok(Some(current_dotenv));
    }

    Ok(None)
}

pub fn load_environment() -> Result<()> {
    match find_dotenv()? {
        Some(path) => {
            dotenv::from_path(&path)?;
            log::info!("Loaded environment variables from {:?}", path);
        }
        None => {
            log::warn!("No .env file found. Using system environment variables.");
        }
    }
    Ok(())
}

/// Runtime configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen port.
    pub port: u16,
    /// Where yt-dlp and ffmpeg live (downloaded on first start).
    pub libraries_dir: PathBuf,
    /// Durable staging area for completed downloads.
    pub downloads_dir: PathBuf,
    /// Netscape cookie jar passed to the engine when present.
    pub cookies_file: PathBuf,
    /// Watchdog for a single fetch; a worker stuck past this is failed.
    pub download_timeout: Duration,
    /// Upstream admissions allowed per rolling window.
    pub rate_limit_admissions: usize,
    /// Length of the admission window.
    pub rate_limit_window: Duration,
    /// Terminal tasks older than this are evicted.
    pub task_ttl: Duration,
    /// Hard cap on retained task records.
    pub task_capacity: usize,
    /// Staged files older than this are removed. None keeps them forever.
    pub file_retention: Option<Duration>,
    /// Max concurrently running download workers.
    pub max_concurrent_downloads: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let cwd = std::env::current_dir()?;
        Ok(Self {
            port: env_parse("PORT", 5000)?,
            libraries_dir: env_path("LIBRARIES_DIR", cwd.join("lib")),
            downloads_dir: env_path("DOWNLOADS_DIR", cwd.join("downloads")),
            cookies_file: env_path("COOKIES_FILE", cwd.join("cookies.txt")),
            download_timeout: Duration::from_secs(env_parse("DOWNLOAD_TIMEOUT_SECS", 300u64)?),
            rate_limit_admissions: env_parse("RATE_LIMIT_ADMISSIONS", 30usize)?,
            rate_limit_window: Duration::from_secs(env_parse("RATE_LIMIT_WINDOW_SECS", 300u64)?),
            task_ttl: Duration::from_secs(env_parse("TASK_TTL_SECS", 3600u64)?),
            task_capacity: env_parse("TASK_CAPACITY", 256usize)?,
            file_retention: match std::env::var("FILE_RETENTION_DAYS") {
                Ok(days) => Some(Duration::from_secs(days.parse::<u64>()? * 24 * 3600)),
                Err(_) => None,
            },
            max_concurrent_downloads: env_parse("MAX_CONCURRENT_DOWNLOADS", 4usize)?,
        })
    }

    pub fn yt_dlp_path(&self) -> PathBuf {
        self.libraries_dir
            .join(if cfg!(target_os = "windows") { "yt-dlp.exe" } else { "yt-dlp" })
    }

    pub fn ffmpeg_dir(&self) -> PathBuf {
        self.libraries_dir.join("ffmpeg")
    }

    pub fn ffmpeg_path(&self) -> PathBuf {
        self.ffmpeg_dir()
            .join(if cfg!(target_os = "windows") { "ffmpeg.exe" } else { "ffmpeg" })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => Ok(raw.parse()?),
        Err(_) => Ok(default),
    }
}

fn env_path(key: &str, default: PathBuf) -> PathBuf {
    std::env::var(key).map(PathBuf::from).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_config_defaults() {
        for key in [
            "PORT",
            "DOWNLOAD_TIMEOUT_SECS",
            "RATE_LIMIT_ADMISSIONS",
            "FILE_RETENTION_DAYS",
        ] {
            unsafe { std::env::remove_var(key) };
        }
        let config = Config::from_env().unwrap();
        assert_eq!(config.port, 5000);
        assert_eq!(config.download_timeout, Duration::from_secs(300));
        assert_eq!(config.rate_limit_admissions, 30);
        assert!(config.file_retention.is_none());
    }

    #[test]
    #[serial]
    fn test_config_overrides() {
        unsafe {
            std::env::set_var("PORT", "8080");
            std::env::set_var("FILE_RETENTION_DAYS", "7");
        }
        let config = Config::from_env().unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(
            config.file_retention,
            Some(Duration::from_secs(7 * 24 * 3600))
        );
        unsafe {
            std::env::remove_var("PORT");
            std::env::remove_var("FILE_RETENTION_DAYS");
        }
    }
}
