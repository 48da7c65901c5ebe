#![forbid(unsafe_code)]

//! Turns the raw `yt-dlp -J` payload into the short list of download options
//! the frontend shows.
//!
//! Only two containers survive: progressive `mp4` video at one of the
//! standard resolutions in [`STANDARD_RESOLUTIONS`], and a single `mp3` audio
//! track. Everything else yt-dlp reports (webm, storyboards, HLS variants
//! without a size, ...) is dropped.
//!
//! Deduplication is keyed on the exact pixel dimensions only. When yt-dlp
//! lists several mp4 variants at the same resolution the first one in source
//! order wins, even if a later one has a higher bitrate or better codec. This
//! is a known limitation kept for compatibility with existing clients.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Placeholder used whenever a value cannot be computed.
pub const NOT_APPLICABLE: &str = "N/A";
/// Title reported when the extractor did not provide one.
pub const UNTITLED: &str = "Untitled";

/// Container accepted for video options.
pub const VIDEO_CONTAINER: &str = "mp4";
/// Container accepted for the audio-only option.
pub const AUDIO_CONTAINER: &str = "mp3";
const AUDIO_LABEL: &str = "Audio (MP3)";
const AUDIO_RESOLUTION: &str = "audio";

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Resolutions offered to clients, keyed by `"{width}x{height}"`.
pub const STANDARD_RESOLUTIONS: [(&str, &str); 8] = [
    ("3840x2160", "2160p (4K)"),
    ("2560x1440", "1440p (2K)"),
    ("1920x1080", "1080p (HD)"),
    ("1280x720", "720p (HD)"),
    ("854x480", "480p (SD)"),
    ("640x360", "360p (SD)"),
    ("426x240", "240p (SD)"),
    ("256x144", "144p (SD)"),
];

/// Subset of the `yt-dlp -J` payload the gateway reads. Everything is
/// optional because extractors differ wildly in what they fill in.
#[derive(Debug, Default, Deserialize)]
pub struct RawVideoInfo {
    pub title: Option<String>,
    pub thumbnail: Option<String>,
    pub thumbnails: Option<Vec<RawThumbnail>>,
    pub duration_string: Option<String>,
    pub formats: Option<Vec<FormatEntry>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RawThumbnail {
    pub url: Option<String>,
}

/// One entry of the `formats` array.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FormatEntry {
    pub format_id: Option<String>,
    pub ext: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub filesize: Option<f64>,
    pub filesize_approx: Option<f64>,
}

impl FormatEntry {
    /// `"{width}x{height}"`, or `None` when a dimension is unknown.
    pub fn resolution_key(&self) -> Option<String> {
        Some(format!("{}x{}", self.width?, self.height?))
    }

    fn exact_size(&self) -> Option<f64> {
        self.filesize.filter(|size| *size > 0.0)
    }

    fn approx_size(&self) -> Option<f64> {
        self.filesize_approx.filter(|size| *size > 0.0)
    }

    fn has_size(&self) -> bool {
        self.exact_size().is_some() || self.approx_size().is_some()
    }

    fn container_is(&self, container: &str) -> bool {
        self.ext.as_deref() == Some(container)
    }

    fn id(&self) -> String {
        self.format_id.clone().unwrap_or_default()
    }
}

/// A single entry of the options list returned by `/video-info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedOption {
    pub itag: String,
    pub quality_label: String,
    pub resolution: String,
    pub aspect_ratio: String,
    pub container: String,
    pub size: String,
}

/// Response body of `/video-info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoSummary {
    pub title: String,
    pub thumbnail: String,
    pub duration: String,
    pub formats: Vec<NormalizedOption>,
}

/// Looks up the display label of a standard resolution key.
pub fn quality_label(resolution_key: &str) -> Option<&'static str> {
    STANDARD_RESOLUTIONS
        .iter()
        .find(|(key, _)| *key == resolution_key)
        .map(|(_, label)| *label)
}

/// Parses raw extractor output and normalizes it in one go.
pub fn summarize_json(raw: &[u8]) -> Result<VideoSummary> {
    let info: RawVideoInfo = serde_json::from_slice(raw)?;
    Ok(summarize(info))
}

/// Builds the client-facing summary from already parsed metadata.
pub fn summarize(info: RawVideoInfo) -> VideoSummary {
    let formats = normalize_formats(info.formats.as_deref().unwrap_or_default());
    let thumbnail = non_empty(info.thumbnail)
        .or_else(|| {
            info.thumbnails
                .as_deref()
                .and_then(<[RawThumbnail]>::last)
                .and_then(|thumb| thumb.url.clone())
        })
        .unwrap_or_default();

    VideoSummary {
        title: non_empty(info.title).unwrap_or_else(|| UNTITLED.to_string()),
        thumbnail,
        duration: info.duration_string.unwrap_or_default(),
        formats,
    }
}

/// Filters and relabels the format list. Source order is preserved.
pub fn normalize_formats(entries: &[FormatEntry]) -> Vec<NormalizedOption> {
    let mut seen = HashSet::new();
    let mut audio_added = false;
    let mut options = Vec::new();

    for entry in entries {
        if !entry.has_size() {
            continue;
        }

        if entry.container_is(VIDEO_CONTAINER)
            && let Some(key) = entry.resolution_key()
            && let Some(label) = quality_label(&key)
            && !seen.contains(&key)
        {
            options.push(NormalizedOption {
                itag: entry.id(),
                quality_label: label.to_string(),
                aspect_ratio: aspect_ratio(entry.width, entry.height),
                container: VIDEO_CONTAINER.to_string(),
                size: format_size(entry.filesize, entry.filesize_approx),
                resolution: key.clone(),
            });
            seen.insert(key);
        }

        if !audio_added && entry.container_is(AUDIO_CONTAINER) {
            options.push(NormalizedOption {
                itag: entry.id(),
                quality_label: AUDIO_LABEL.to_string(),
                resolution: AUDIO_RESOLUTION.to_string(),
                aspect_ratio: NOT_APPLICABLE.to_string(),
                container: AUDIO_CONTAINER.to_string(),
                size: format_size(entry.filesize, entry.filesize_approx),
            });
            audio_added = true;
        }
    }

    options
}

/// Reduces `width:height` by their greatest common divisor.
pub fn aspect_ratio(width: Option<u32>, height: Option<u32>) -> String {
    match (width, height) {
        (Some(width), Some(height)) if width > 0 && height > 0 => {
            let divisor = gcd(width, height);
            format!("{}:{}", width / divisor, height / divisor)
        }
        _ => NOT_APPLICABLE.to_string(),
    }
}

/// Euclid's algorithm.
pub fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Renders a byte count as megabytes; approximate sizes get a `~` prefix.
pub fn format_size(exact: Option<f64>, approximate: Option<f64>) -> String {
    let exact = exact.filter(|size| *size > 0.0);
    let approximate = approximate.filter(|size| *size > 0.0);
    match (exact, approximate) {
        (Some(bytes), _) => format!("{:.2} MB", megabytes(bytes)),
        (None, Some(bytes)) => format!("~{:.2} MB", megabytes(bytes)),
        (None, None) => NOT_APPLICABLE.to_string(),
    }
}

/// Megabytes rounded to two decimals, half away from zero. `{:.2}` alone
/// rounds exact ties (odd multiples of 128 KiB) to even.
fn megabytes(bytes: f64) -> f64 {
    (bytes / BYTES_PER_MB * 100.0).round() / 100.0
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.is_empty())
}
