//! Download requests and the yt-dlp command lines built from them.

use crate::progress::OUTPUT_PATH_MARKER;
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use url::Url;
use uuid::Uuid;

pub const TOOL_NAME: &str = "yt-dlp";
pub const VERSION_ARG: &str = "--version";
pub const OUTPUT_TEMPLATE: &str = "%(title)s.%(ext)s";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum OutputFormat {
    /// Whatever container yt-dlp picks.
    Default,
    /// Force the merged output container, e.g. `mp4`.
    Container(String),
    /// Keep only the audio, transcoded to the given codec, e.g. `mp3`.
    ExtractAudio(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptionOptions {
    pub language: Option<String>,
    pub embed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskDescriptor {
    pub id: Uuid,
    pub target_url: String,
    pub output_dir: PathBuf,
    pub output_format: OutputFormat,
    pub video_format_ids: BTreeSet<String>,
    pub audio_format_ids: BTreeSet<String>,
    pub captions: CaptionOptions,
}

impl TaskDescriptor {
    pub fn new(
        target_url: &str,
        output_dir: PathBuf,
        output_format: OutputFormat,
        captions: CaptionOptions,
    ) -> Result<Self> {
        Ok(Self {
            id: Uuid::new_v4(),
            target_url: normalize_target_url(target_url)?,
            output_dir,
            output_format,
            video_format_ids: BTreeSet::new(),
            audio_format_ids: BTreeSet::new(),
            captions,
        })
    }

    pub fn with_video_format(mut self, format_id: impl Into<String>) -> Self {
        self.video_format_ids.insert(format_id.into());
        self
    }

    pub fn with_audio_format(mut self, format_id: impl Into<String>) -> Self {
        self.audio_format_ids.insert(format_id.into());
        self
    }

    /// True when yt-dlp will have to merge, remux, transcode or embed, all of
    /// which call out to ffmpeg.
    pub fn needs_transcoder(&self) -> bool {
        let merges = !self.video_format_ids.is_empty() && !self.audio_format_ids.is_empty();
        let multistream = self.video_format_ids.len() > 1 || self.audio_format_ids.len() > 1;
        let converts = !matches!(self.output_format, OutputFormat::Default);
        merges || multistream || converts || self.captions.embed
    }

    /// `-f` expression: selected video ids then audio ids, all joined by `+`.
    pub fn format_selector(&self) -> Option<String> {
        let ids: Vec<&str> = self
            .video_format_ids
            .iter()
            .chain(self.audio_format_ids.iter())
            .map(String::as_str)
            .collect();
        if ids.is_empty() {
            return None;
        }
        Some(ids.join("+"))
    }
}

pub fn normalize_target_url(value: &str) -> Result<String> {
    let trimmed = value.trim();
    let parsed = Url::parse(trimmed).map_err(|e| EngineError::InvalidUrl {
        url: trimmed.to_string(),
        reason: e.to_string(),
    })?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed.to_string()),
        other => Err(EngineError::InvalidUrl {
            url: trimmed.to_string(),
            reason: format!("unsupported scheme {other}"),
        }),
    }
}

pub fn download_args(task: &TaskDescriptor, ffmpeg: Option<&Path>) -> Vec<String> {
    let mut args = vec![
        "--newline".to_string(),
        "--progress".to_string(),
        "--no-playlist".to_string(),
        "--print".to_string(),
        format!("after_move:{OUTPUT_PATH_MARKER}%(filepath)s"),
        "-P".to_string(),
        task.output_dir.to_string_lossy().to_string(),
        "-o".to_string(),
        OUTPUT_TEMPLATE.to_string(),
    ];

    if let Some(selector) = task.format_selector() {
        if task.video_format_ids.len() > 1 {
            args.push("--video-multistreams".to_string());
        }
        if task.audio_format_ids.len() > 1 {
            args.push("--audio-multistreams".to_string());
        }
        args.push("-f".to_string());
        args.push(selector);
    }

    match &task.output_format {
        OutputFormat::Default => {}
        OutputFormat::Container(ext) => {
            args.push("--merge-output-format".to_string());
            args.push(ext.clone());
        }
        OutputFormat::ExtractAudio(codec) => {
            args.push("-x".to_string());
            args.push("--audio-format".to_string());
            args.push(codec.clone());
        }
    }

    if let Some(lang) = task.captions.language.as_deref() {
        args.push("--write-subs".to_string());
        args.push("--sub-langs".to_string());
        args.push(lang.to_string());
    }
    if task.captions.embed {
        args.push("--embed-subs".to_string());
    }

    if let Some(path) = ffmpeg {
        args.push("--ffmpeg-location".to_string());
        args.push(path.to_string_lossy().to_string());
    }

    args.push("--".to_string());
    args.push(task.target_url.clone());
    args
}

pub fn probe_args(target_url: &str) -> Vec<String> {
    vec![
        "--dump-single-json".to_string(),
        "--no-playlist".to_string(),
        "--no-warnings".to_string(),
        "--".to_string(),
        target_url.to_string(),
    ]
}
