use std::fmt;

use regex::Regex;

/// Failure taxonomy shared by every component. Lower-level errors are
/// classified into exactly one of these kinds before they cross a
/// component boundary; raw process/transport errors never leak past the
/// engine wrapper.
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadError {
    /// Engine could not produce a usable manifest for the URL.
    ExtractionFailure(String),

    /// Target is private, deleted or region-blocked.
    VideoUnavailable(String),

    /// Age gate blocks anonymous access.
    AgeRestricted,

    /// Upstream rate limiting / bot detection. Carries a retry hint in
    /// seconds.
    UpstreamThrottled { retry_after: u64 },

    /// Unknown task id or staged file name.
    NotFound(String),

    /// Action not valid for the task's current state.
    Conflict(String),

    /// Client asked the task to stop.
    Cancelled,

    /// Anything unexpected.
    Internal(String),
}

impl DownloadError {
    /// Machine-readable kind, stable across releases.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ExtractionFailure(_) => "extraction_failure",
            Self::VideoUnavailable(_) => "video_unavailable",
            Self::AgeRestricted => "age_restricted",
            Self::UpstreamThrottled { .. } => "upstream_throttled",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Cancelled => "cancelled",
            Self::Internal(_) => "internal_error",
        }
    }

    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Self::UpstreamThrottled { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    /// Actionable hints surfaced next to the message in API responses.
    pub fn suggestions(&self) -> Vec<String> {
        match self {
            Self::UpstreamThrottled { retry_after } => vec![
                format!("Retry after {} seconds", retry_after),
                "Provide a cookies.txt from a logged-in browser session".to_string(),
            ],
            Self::VideoUnavailable(_) => vec![
                "Check that the video is public and the URL is correct".to_string(),
                "Try a different video".to_string(),
            ],
            Self::AgeRestricted => vec![
                "Provide a cookies.txt from a browser logged into an 18+ account".to_string(),
            ],
            Self::ExtractionFailure(_) => vec![
                "Verify the URL points to a supported site".to_string(),
                "The extractor may be outdated; restart the server to refresh yt-dlp".to_string(),
            ],
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for DownloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExtractionFailure(msg) => write!(f, "Failed to extract video info: {}", msg),
            Self::VideoUnavailable(msg) => write!(f, "Video unavailable: {}", msg),
            Self::AgeRestricted => write!(f, "Video is age-restricted and needs authentication"),
            Self::UpstreamThrottled { retry_after } => write!(
                f,
                "Upstream is rate-limiting requests, retry after {}s",
                retry_after
            ),
            Self::NotFound(what) => write!(f, "Not found: {}", what),
            Self::Conflict(msg) => write!(f, "Conflict: {}", msg),
            Self::Cancelled => write!(f, "Download cancelled"),
            Self::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for DownloadError {}

/// Map the engine's stderr output onto the taxonomy. yt-dlp reports
/// everything as text, so detection is substring-based, most specific
/// patterns first.
pub fn classify_engine_output(stderr: &str, default_retry_after: u64) -> DownloadError {
    let lower = stderr.to_lowercase();

    if lower.contains("429")
        || lower.contains("too many requests")
        || lower.contains("confirm you're not a bot")
        || lower.contains("sign in to confirm you")
    {
        let retry_after = extract_retry_after(stderr).unwrap_or(default_retry_after);
        return DownloadError::UpstreamThrottled { retry_after };
    }

    if lower.contains("sign in to confirm your age")
        || lower.contains("age-restricted")
        || lower.contains("inappropriate for some users")
    {
        return DownloadError::AgeRestricted;
    }

    if lower.contains("private video")
        || lower.contains("video unavailable")
        || lower.contains("has been removed")
        || lower.contains("not available in your country")
        || lower.contains("account associated with this video has been terminated")
    {
        return DownloadError::VideoUnavailable(first_error_line(stderr));
    }

    if lower.contains("unsupported url")
        || lower.contains("unable to extract")
        || lower.contains("unable to download webpage")
        || lower.contains("is not a valid url")
    {
        return DownloadError::ExtractionFailure(first_error_line(stderr));
    }

    DownloadError::Internal(first_error_line(stderr))
}

/// Pull a retry hint out of engine text, e.g. "Retry in 120 seconds" or
/// "retry after 60".
pub fn extract_retry_after(text: &str) -> Option<u64> {
    let re = Regex::new(r"(?i)retry(?:\s+in|\s+after|-after[:\s]*)\s*(\d+)").ok()?;
    re.captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// The engine prefixes real failures with "ERROR:"; prefer that line
/// over warnings when building a message.
fn first_error_line(stderr: &str) -> String {
    stderr
        .lines()
        .find(|l| l.trim_start().starts_with("ERROR"))
        .or_else(|| stderr.lines().rev().find(|l| !l.trim().is_empty()))
        .unwrap_or("unknown engine failure")
        .trim()
        .to_string()
}
