use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Cookie names that indicate a real YouTube session export.
const YOUTUBE_INDICATORS: [&str; 7] = [
    "youtube.com",
    "YSC",
    "VISITOR_INFO",
    "LOGIN_INFO",
    "SAPISID",
    "APISID",
    "SIDCC",
];

/// Jars older than this are usually expired upstream.
const STALE_AFTER_DAYS: i64 = 30;

/// Inspection result for the operator diagnostics endpoint. The jar
/// itself is provisioned out-of-band; the server only reads it.
#[derive(Debug, Clone, Serialize)]
pub struct CookieStatus {
    pub present: bool,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub age_days: Option<i64>,
    pub stale: bool,
    pub valid: bool,
    pub indicators_found: Vec<String>,
    pub cookie_lines: usize,
    pub message: String,
}

pub fn inspect_cookie_jar(path: &Path) -> CookieStatus {
    let path_display = path.display().to_string();

    if !path.exists() {
        return CookieStatus {
            present: false,
            path: path_display,
            modified: None,
            age_days: None,
            stale: false,
            valid: false,
            indicators_found: Vec::new(),
            cookie_lines: 0,
            message: "No cookie file found; age-restricted and throttled requests may fail"
                .to_string(),
        };
    }

    let modified: Option<DateTime<Utc>> = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .map(DateTime::from);
    let age_days = modified.map(|m| (Utc::now() - m).num_days());
    let stale = age_days.is_some_and(|d| d > STALE_AFTER_DAYS);

    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            log::error!("Failed to read cookie file {:?}: {}", path, e);
            return CookieStatus {
                present: true,
                path: path_display,
                modified,
                age_days,
                stale,
                valid: false,
                indicators_found: Vec::new(),
                cookie_lines: 0,
                message: format!("Error reading cookie file: {}", e),
            };
        }
    };

    let indicators_found: Vec<String> = YOUTUBE_INDICATORS
        .iter()
        .filter(|i| content.contains(*i))
        .map(|i| i.to_string())
        .collect();
    let cookie_lines = content
        .lines()
        .filter(|l| l.to_lowercase().contains("youtube.com"))
        .count();
    let valid = !indicators_found.is_empty();

    let message = if !valid {
        "No YouTube cookies found in the jar".to_string()
    } else if stale {
        format!(
            "Found {} YouTube indicators, {} cookie lines; jar is older than {} days and may be expired",
            indicators_found.len(),
            cookie_lines,
            STALE_AFTER_DAYS
        )
    } else {
        format!(
            "Found {} YouTube indicators, {} cookie lines",
            indicators_found.len(),
            cookie_lines
        )
    };

    CookieStatus {
        present: true,
        path: path_display,
        modified,
        age_days,
        stale,
        valid,
        indicators_found,
        cookie_lines,
        message,
    }
}
