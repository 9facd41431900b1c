use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::MediaInfo;

/// One entry of the engine's raw `formats` array. Only the fields the
/// resolver needs; everything else in the engine JSON is ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct RawFormat {
    pub format_id: String,
    #[serde(default)]
    pub ext: Option<String>,
    #[serde(default)]
    pub vcodec: Option<String>,
    #[serde(default)]
    pub acodec: Option<String>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub fps: Option<f64>,
    #[serde(default)]
    pub tbr: Option<f64>,
    #[serde(default)]
    pub abr: Option<f64>,
    #[serde(default)]
    pub filesize: Option<u64>,
    #[serde(default)]
    pub filesize_approx: Option<f64>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub quality: Option<f64>,
    #[serde(default)]
    pub format_note: Option<String>,
}

impl RawFormat {
    fn has_video(&self) -> bool {
        self.vcodec.as_deref().is_some_and(|v| v != "none" && !v.is_empty())
    }

    fn has_audio(&self) -> bool {
        self.acodec.as_deref().is_some_and(|a| a != "none" && !a.is_empty())
    }

    fn approx_size(&self) -> Option<u64> {
        self.filesize
            .or_else(|| self.filesize_approx.map(|s| s as u64))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Video,
    Audio,
}

/// One fetchable encoding, immutable once resolved.
#[derive(Debug, Clone, Serialize)]
pub struct StreamVariant {
    pub kind: StreamKind,
    pub id: String,
    pub ext: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fps: Option<u32>,
    pub codec: String,
    /// kbps; tbr for video, abr for audio.
    pub bitrate: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filesize: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<f64>,
    pub quality_label: String,
}

/// Video variants sharing one height+fps label, best bitrate first.
#[derive(Debug, Clone, Serialize)]
pub struct VideoGroup {
    pub label: String,
    pub recommended: String,
    pub variants: Vec<StreamVariant>,
}

/// Audio variants sharing one language, best bitrate first.
#[derive(Debug, Clone, Serialize)]
pub struct AudioGroup {
    pub language: String,
    pub recommended: String,
    pub variants: Vec<StreamVariant>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QualityPreset {
    pub video: Option<String>,
    pub audio: Option<String>,
}

/// The classified variant set for one URL, produced per request and
/// never cached (catalogs go stale quickly).
#[derive(Debug, Clone, Serialize)]
pub struct FormatCatalog {
    pub title: String,
    pub duration: u64,
    pub uploader: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    pub description: String,
    pub view_count: u64,
    pub upload_date: String,
    pub video_variants: Vec<StreamVariant>,
    pub audio_variants: Vec<StreamVariant>,
    pub video_groups: Vec<VideoGroup>,
    pub audio_groups: Vec<AudioGroup>,
    pub recommended_video: Option<String>,
    pub recommended_audio: Option<String>,
    pub quality_presets: BTreeMap<String, QualityPreset>,
}

const MAX_VIDEO_VARIANTS: usize = 10;
const MAX_AUDIO_VARIANTS: usize = 8;

/// Classify the probe result into the typed catalog. Video-only streams
/// sort by (height, fps, bitrate) descending, audio-only by bitrate
/// descending; mixed a/v formats and variants without a usable codec
/// are dropped.
pub fn build_catalog(info: &MediaInfo) -> FormatCatalog {
    let (mut video, mut audio) = split_variants(&info.formats);
    sort_video(&mut video);
    sort_audio(&mut audio);

    let recommended_video = recommend_video(&video);
    let recommended_audio = audio.first().map(|v| v.id.clone());

    let mut quality_presets = BTreeMap::new();
    quality_presets.insert(
        "auto".to_string(),
        QualityPreset {
            video: recommended_video.clone(),
            audio: recommended_audio.clone(),
        },
    );
    for height in [1080u32, 720, 480] {
        quality_presets.insert(
            format!("{}p", height),
            QualityPreset {
                video: video_at_or_below(&video, height),
                audio: recommended_audio.clone(),
            },
        );
    }

    FormatCatalog {
        title: info.title.clone(),
        duration: info.duration_secs,
        uploader: info.uploader.clone(),
        thumbnail: info.thumbnail.clone(),
        description: info.description.clone(),
        view_count: info.view_count,
        upload_date: info.upload_date.clone(),
        video_groups: group_video(&video),
        audio_groups: group_audio(&audio),
        video_variants: video.into_iter().take(MAX_VIDEO_VARIANTS).collect(),
        audio_variants: audio.into_iter().take(MAX_AUDIO_VARIANTS).collect(),
        recommended_video,
        recommended_audio,
        quality_presets,
    }
}

fn split_variants(formats: &[RawFormat]) -> (Vec<StreamVariant>, Vec<StreamVariant>) {
    let mut video = Vec::new();
    let mut audio = Vec::new();

    for fmt in formats {
        if fmt.has_video() && !fmt.has_audio() {
            // A video stream without known dimensions is unusable for
            // quality grouping.
            let Some(height) = fmt.height else { continue };
            let fps = fmt.fps.map(|f| f.round() as u32);
            let label = match fps {
                Some(fps) if fps > 30 => format!("{}p{}", height, fps),
                _ => format!("{}p", height),
            };
            video.push(StreamVariant {
                kind: StreamKind::Video,
                id: fmt.format_id.clone(),
                ext: fmt.ext.clone().unwrap_or_else(|| "mp4".to_string()),
                height: Some(height),
                fps,
                codec: fmt.vcodec.clone().unwrap_or_default(),
                bitrate: fmt.tbr.unwrap_or(0.0),
                filesize: fmt.approx_size(),
                language: None,
                quality: fmt.quality,
                quality_label: label,
            });
        } else if fmt.has_audio() && !fmt.has_video() {
            let bitrate = fmt.abr.or(fmt.tbr).unwrap_or(0.0);
            audio.push(StreamVariant {
                kind: StreamKind::Audio,
                id: fmt.format_id.clone(),
                ext: fmt.ext.clone().unwrap_or_else(|| "m4a".to_string()),
                height: None,
                fps: None,
                codec: fmt.acodec.clone().unwrap_or_default(),
                bitrate,
                filesize: fmt.approx_size(),
                language: fmt.language.clone(),
                quality: fmt.quality,
                quality_label: format!("{:.0}kbps", bitrate),
            });
        }
    }

    (video, audio)
}

fn sort_video(variants: &mut [StreamVariant]) {
    variants.sort_by(|a, b| {
        (b.height, b.fps)
            .cmp(&(a.height, a.fps))
            .then(b.bitrate.total_cmp(&a.bitrate))
    });
}

fn sort_audio(variants: &mut [StreamVariant]) {
    variants.sort_by(|a, b| b.bitrate.total_cmp(&a.bitrate));
}

/// Prefer the first 1080p-or-higher variant, falling back to the
/// highest available.
fn recommend_video(sorted: &[StreamVariant]) -> Option<String> {
    sorted
        .iter()
        .find(|v| v.height.unwrap_or(0) >= 1080)
        .or_else(|| sorted.first())
        .map(|v| v.id.clone())
}

fn video_at_or_below(sorted: &[StreamVariant], target_height: u32) -> Option<String> {
    sorted
        .iter()
        .find(|v| v.height.unwrap_or(0) <= target_height)
        .or_else(|| sorted.last())
        .map(|v| v.id.clone())
}

fn group_video(sorted: &[StreamVariant]) -> Vec<VideoGroup> {
    let mut groups: Vec<VideoGroup> = Vec::new();
    for variant in sorted {
        match groups.iter_mut().find(|g| g.label == variant.quality_label) {
            Some(group) => group.variants.push(variant.clone()),
            None => groups.push(VideoGroup {
                label: variant.quality_label.clone(),
                recommended: variant.id.clone(),
                variants: vec![variant.clone()],
            }),
        }
    }
    groups
}

fn group_audio(sorted: &[StreamVariant]) -> Vec<AudioGroup> {
    let mut groups: Vec<AudioGroup> = Vec::new();
    for variant in sorted {
        let language = variant
            .language
            .clone()
            .unwrap_or_else(|| "und".to_string());
        match groups.iter_mut().find(|g| g.language == language) {
            Some(group) => group.variants.push(variant.clone()),
            None => groups.push(AudioGroup {
                language,
                recommended: variant.id.clone(),
                variants: vec![variant.clone()],
            }),
        }
    }
    groups
}

/// The variant pair a download will fetch, resolved from either
/// explicit ids or a quality preset string.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Selection {
    pub video_id: Option<String>,
    pub audio_id: Option<String>,
}

impl Selection {
    /// Explicit variant ids win; otherwise fall back to the quality
    /// preset ("auto" when none given).
    pub fn resolve(
        catalog: &FormatCatalog,
        video_id: Option<String>,
        audio_id: Option<String>,
        quality: Option<&str>,
    ) -> Self {
        if video_id.is_some() || audio_id.is_some() {
            return Self { video_id, audio_id };
        }
        Self::from_quality(catalog, quality.unwrap_or("auto"))
    }

    /// Resolve a quality preset ("auto", "bestaudio", "720p",
    /// "best[height<=720]") against the catalog.
    pub fn from_quality(catalog: &FormatCatalog, quality: &str) -> Self {
        if quality == "bestaudio" {
            return Self {
                video_id: None,
                audio_id: catalog.recommended_audio.clone(),
            };
        }
        if let Some(height) = parse_target_height(quality) {
            return Self {
                video_id: video_at_or_below(&catalog.video_variants, height),
                audio_id: catalog.recommended_audio.clone(),
            };
        }
        Self {
            video_id: catalog.recommended_video.clone(),
            audio_id: catalog.recommended_audio.clone(),
        }
    }

    /// The engine format spec plus whether the result needs remuxing
    /// into one container. Exactly one selected stream is fetched
    /// as-is; none at all defers to the engine's combined "best".
    pub fn format_spec(&self) -> (String, bool) {
        match (&self.video_id, &self.audio_id) {
            (Some(v), Some(a)) => (format!("{}+{}", v, a), true),
            (Some(v), None) => (v.clone(), false),
            (None, Some(a)) => (a.clone(), false),
            (None, None) => ("best".to_string(), false),
        }
    }

    /// Container extension of the output file.
    pub fn file_extension(&self, catalog: &FormatCatalog) -> String {
        match (&self.video_id, &self.audio_id) {
            (Some(_), Some(_)) | (None, None) => "mp4".to_string(),
            (Some(v), None) => catalog
                .video_variants
                .iter()
                .find(|x| &x.id == v)
                .map(|x| x.ext.clone())
                .unwrap_or_else(|| "mp4".to_string()),
            (None, Some(a)) => catalog
                .audio_variants
                .iter()
                .find(|x| &x.id == a)
                .map(|x| x.ext.clone())
                .unwrap_or_else(|| "m4a".to_string()),
        }
    }

    /// Short human label for status messages ("1080p", "Audio Only").
    pub fn describe(&self, catalog: &FormatCatalog) -> String {
        match (&self.video_id, &self.audio_id) {
            (Some(v), _) => catalog
                .video_variants
                .iter()
                .find(|x| &x.id == v)
                .map(|x| x.quality_label.clone())
                .unwrap_or_else(|| "Best Quality".to_string()),
            (None, Some(_)) => "Audio Only".to_string(),
            (None, None) => "Best Quality".to_string(),
        }
    }
}

/// "best[height<=720]" -> 720, "720p" -> 720.
fn parse_target_height(quality: &str) -> Option<u32> {
    if let Some(rest) = quality.split("height<=").nth(1) {
        return rest
            .split(']')
            .next()
            .and_then(|n| n.parse().ok())
            .or(Some(1080));
    }
    quality.strip_suffix('p').and_then(|n| n.parse().ok())
}

/// Keep only characters safe for a filename, as the original backend
/// did. Empty results fall back to "video".
pub fn safe_title(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == ' ' || *c == '-' || *c == '_')
        .collect();
    let cleaned = cleaned.trim_end().to_string();
    if cleaned.is_empty() {
        "video".to_string()
    } else {
        cleaned
    }
}
