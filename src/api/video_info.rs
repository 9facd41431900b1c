use axum::{Json, extract::State};
use serde::Deserialize;

use super::{ApiError, SharedState};
use crate::engine::formats::{FormatCatalog, build_catalog};
use crate::errors::DownloadError;

#[derive(Debug, Deserialize)]
pub struct VideoInfoRequest {
    #[serde(default)]
    pub url: String,
}

/// POST /api/video-info — resolve a URL into the variant catalog.
/// One engine round trip per request; catalogs are never cached, they
/// go stale faster than the latency saved.
pub async fn video_info(
    State(state): State<SharedState>,
    Json(request): Json<VideoInfoRequest>,
) -> Result<Json<FormatCatalog>, ApiError> {
    let url = request.url.trim();
    if url.is_empty() {
        return Err(DownloadError::ExtractionFailure("URL is required".to_string()).into());
    }

    let _permit = state.governor.admit()?;
    match state.engine.probe(url).await {
        Ok(info) => {
            state.governor.record_success();
            Ok(Json(build_catalog(&info)))
        }
        Err(err) => {
            if let DownloadError::UpstreamThrottled { retry_after } = err {
                state
                    .governor
                    .record_throttled(Some(std::time::Duration::from_secs(retry_after)));
            }
            Err(err.into())
        }
    }
}
