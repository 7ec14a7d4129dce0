//! Track catalog from the downloader's JSON metadata mode.

use crate::process::{self, RunOptions};
use crate::{ytdlp, EngineError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::Path;
use tracing::{debug, info};

const NO_CODEC: &str = "none";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackDescriptor {
    pub format_id: String,
    pub ext: Option<String>,
    pub height: Option<u32>,
    pub resolution: Option<String>,
    pub fps: Option<f64>,
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
    pub size_bytes: Option<u64>,
    pub note: Option<String>,
}

impl TrackDescriptor {
    /// One-line human summary, e.g. `137  mp4  1920x1080 30fps avc1  (1080p)`.
    pub fn summary(&self) -> String {
        let mut parts = vec![self.format_id.clone()];
        if let Some(ext) = &self.ext {
            parts.push(ext.clone());
        }
        if let Some(res) = &self.resolution {
            parts.push(res.clone());
        }
        if let Some(fps) = self.fps {
            parts.push(format!("{fps}fps"));
        }
        for codec in [&self.vcodec, &self.acodec].into_iter().flatten() {
            if codec != NO_CODEC {
                parts.push(codec.clone());
            }
        }
        if let Some(size) = self.size_bytes {
            parts.push(format!("{:.1}MiB", size as f64 / (1024.0 * 1024.0)));
        }
        if let Some(note) = &self.note {
            parts.push(format!("({note})"));
        }
        parts.join("  ")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrackCatalog {
    /// Highest resolution first, then highest frame rate.
    pub video: Vec<TrackDescriptor>,
    /// Largest first.
    pub audio: Vec<TrackDescriptor>,
}

impl TrackCatalog {
    pub fn is_empty(&self) -> bool {
        self.video.is_empty() && self.audio.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct ProbeDocument {
    #[serde(default)]
    formats: Option<Vec<RawFormat>>,
}

#[derive(Debug, Deserialize)]
struct RawFormat {
    format_id: String,
    #[serde(default)]
    ext: Option<String>,
    #[serde(default)]
    height: Option<f64>,
    #[serde(default)]
    width: Option<f64>,
    #[serde(default)]
    resolution: Option<String>,
    #[serde(default)]
    fps: Option<f64>,
    #[serde(default)]
    vcodec: Option<String>,
    #[serde(default)]
    acodec: Option<String>,
    #[serde(default)]
    filesize: Option<f64>,
    #[serde(default)]
    filesize_approx: Option<f64>,
    #[serde(default)]
    format_note: Option<String>,
}

impl RawFormat {
    fn into_descriptor(self) -> TrackDescriptor {
        let height = positive(self.height).map(|h| h as u32);
        let resolution = self.resolution.filter(|r| !r.trim().is_empty()).or_else(|| {
            match (positive(self.width), height) {
                (Some(w), Some(h)) => Some(format!("{}x{h}", w as u32)),
                (None, Some(h)) => Some(format!("{h}p")),
                _ => None,
            }
        });
        TrackDescriptor {
            format_id: self.format_id,
            ext: self.ext,
            height,
            resolution,
            fps: positive(self.fps),
            vcodec: self.vcodec,
            acodec: self.acodec,
            size_bytes: positive(self.filesize)
                .or(positive(self.filesize_approx))
                .map(|s| s as u64),
            note: self.format_note.filter(|n| !n.trim().is_empty()),
        }
    }
}

fn positive(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite() && *v > 0.0)
}

fn is_none_codec(codec: Option<&str>) -> bool {
    codec.is_some_and(|c| c.eq_ignore_ascii_case(NO_CODEC))
}

fn is_video(track: &TrackDescriptor) -> bool {
    !is_none_codec(track.vcodec.as_deref()) && track.height.is_some()
}

fn is_audio(track: &TrackDescriptor) -> bool {
    track.acodec.is_some()
        && !is_none_codec(track.acodec.as_deref())
        && is_none_codec(track.vcodec.as_deref())
}

fn video_order(a: &TrackDescriptor, b: &TrackDescriptor) -> Ordering {
    b.height
        .cmp(&a.height)
        .then_with(|| b.fps.unwrap_or(0.0).total_cmp(&a.fps.unwrap_or(0.0)))
}

fn audio_order(a: &TrackDescriptor, b: &TrackDescriptor) -> Ordering {
    b.size_bytes
        .cmp(&a.size_bytes)
        .then_with(|| b.format_id.cmp(&a.format_id))
}

/// Parses a `--dump-single-json` document and partitions its formats.
///
/// Formats that are neither video-with-height nor audio-only (muxed streams
/// without a height, storyboards) are left out.
pub fn classify_formats(json: &[u8]) -> Result<TrackCatalog> {
    let doc: ProbeDocument = serde_json::from_slice(json)
        .map_err(|e| EngineError::ProbeParseFailed(e.to_string()))?;
    let formats = doc
        .formats
        .ok_or_else(|| EngineError::ProbeParseFailed("document has no formats".to_string()))?;

    let mut catalog = TrackCatalog::default();
    for raw in formats {
        let track = raw.into_descriptor();
        if is_video(&track) {
            catalog.video.push(track);
        } else if is_audio(&track) {
            catalog.audio.push(track);
        } else {
            debug!(format_id = %track.format_id, "skipping format");
        }
    }
    catalog.video.sort_by(video_order);
    catalog.audio.sort_by(audio_order);
    Ok(catalog)
}

/// Runs the downloader in metadata mode for `target_url`.
pub fn probe(tool: &Path, target_url: &str, options: RunOptions) -> Result<TrackCatalog> {
    let target_url = ytdlp::normalize_target_url(target_url)?;
    info!(url = %target_url, "probing tracks");

    let mut handle = process::run(tool, &ytdlp::probe_args(&target_url), options)?;
    let mut document: Option<String> = None;
    for line in handle.by_ref() {
        if line.text.trim_start().starts_with('{') {
            document = Some(line.text);
        }
    }
    handle.wait()?.check()?;

    let document = document
        .ok_or_else(|| EngineError::ProbeParseFailed("no JSON document in output".to_string()))?;
    let catalog = classify_formats(document.as_bytes())?;
    info!(
        video = catalog.video.len(),
        audio = catalog.audio.len(),
        "probe finished"
    );
    Ok(catalog)
}
