use crate::paths::AppPaths;
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[cfg(target_os = "macos")]
pub const DEFAULT_YTDLP_URL: &str =
    "https://github.com/yt-dlp/yt-dlp/releases/latest/download/yt-dlp_macos";
#[cfg(windows)]
pub const DEFAULT_YTDLP_URL: &str =
    "https://github.com/yt-dlp/yt-dlp/releases/latest/download/yt-dlp.exe";
#[cfg(not(any(target_os = "macos", windows)))]
pub const DEFAULT_YTDLP_URL: &str =
    "https://github.com/yt-dlp/yt-dlp/releases/latest/download/yt-dlp_linux";

// ffmpeg is fetched as a zip holding one executable entry. Platforms without
// a zip build get an empty URL: ffmpeg is then taken from PATH by yt-dlp and
// `install --tool ffmpeg` needs `ffmpeg_url` set explicitly.
#[cfg(target_os = "macos")]
pub const DEFAULT_FFMPEG_URL: &str = "https://evermeet.cx/ffmpeg/ffmpeg-7.1.1.zip";
#[cfg(target_os = "macos")]
pub const DEFAULT_FFMPEG_ARCHIVE_ENTRY: &str = "ffmpeg";
#[cfg(windows)]
pub const DEFAULT_FFMPEG_URL: &str =
    "https://github.com/GyanD/codexffmpeg/releases/download/7.1.1/ffmpeg-7.1.1-essentials_build.zip";
#[cfg(windows)]
pub const DEFAULT_FFMPEG_ARCHIVE_ENTRY: &str = "ffmpeg-7.1.1-essentials_build/bin/ffmpeg.exe";
#[cfg(not(any(target_os = "macos", windows)))]
pub const DEFAULT_FFMPEG_URL: &str = "";
#[cfg(not(any(target_os = "macos", windows)))]
pub const DEFAULT_FFMPEG_ARCHIVE_ENTRY: &str = "ffmpeg";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Where downloads land; `None` means the platform Downloads folder.
    pub download_dir: Option<PathBuf>,
    pub ytdlp_url: String,
    pub ffmpeg_url: String,
    /// Name of the entry pulled out of the ffmpeg archive.
    pub ffmpeg_archive_entry: String,
    /// Hex sha256 of the ffmpeg archive, checked when set.
    pub ffmpeg_sha256: Option<String>,
    /// Kill a running tool after this many seconds; 0 disables the limit.
    pub process_timeout_secs: u64,
    pub default_caption_language: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            download_dir: None,
            ytdlp_url: DEFAULT_YTDLP_URL.to_string(),
            ffmpeg_url: DEFAULT_FFMPEG_URL.to_string(),
            ffmpeg_archive_entry: DEFAULT_FFMPEG_ARCHIVE_ENTRY.to_string(),
            ffmpeg_sha256: None,
            process_timeout_secs: 0,
            default_caption_language: None,
        }
    }
}

impl Settings {
    pub fn effective_download_dir(&self, paths: &AppPaths) -> PathBuf {
        self.download_dir
            .clone()
            .unwrap_or_else(|| paths.default_download_dir())
    }
}

pub fn load_settings(paths: &AppPaths) -> Result<Settings> {
    let path = paths.settings_path();
    if !path.exists() {
        return Ok(Settings::default());
    }
    let bytes = std::fs::read(&path)?;
    let parsed: Settings = serde_json::from_slice(&bytes).map_err(|e| {
        EngineError::Config(format!(
            "failed to parse settings at {}: {e}",
            path.to_string_lossy()
        ))
    })?;
    Ok(parsed)
}

pub fn save_settings(paths: &AppPaths, settings: &Settings) -> Result<()> {
    let path = paths.settings_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings)?;
    std::fs::write(&path, format!("{json}\n"))?;
    Ok(())
}
