use std::path::{Path, PathBuf};

pub const APP_DIR_NAME: &str = "ytdlp-topbar";
pub const BASE_DIR_ENV: &str = "YTDLP_TOPBAR_BASE_DIR";

#[derive(Debug, Clone)]
pub struct AppPaths {
    pub base_dir: PathBuf,
}

impl AppPaths {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// `$YTDLP_TOPBAR_BASE_DIR`, else the platform data dir
    /// (`~/Library/Application Support/ytdlp-topbar` on macOS).
    pub fn default_base_dir() -> Option<PathBuf> {
        if let Ok(v) = std::env::var(BASE_DIR_ENV) {
            let t = v.trim();
            if !t.is_empty() {
                return Some(PathBuf::from(t));
            }
        }
        dirs::data_dir().map(|d| d.join(APP_DIR_NAME))
    }

    pub fn config_dir(&self) -> PathBuf {
        self.base_dir.join("config")
    }

    pub fn settings_path(&self) -> PathBuf {
        self.config_dir().join("settings.json")
    }

    pub fn tools_dir(&self) -> PathBuf {
        self.base_dir.join("tools")
    }

    pub fn ytdlp_dir(&self) -> PathBuf {
        self.tools_dir().join("yt-dlp")
    }

    pub fn ytdlp_bin_path(&self) -> PathBuf {
        exe_path(self.ytdlp_dir().join("yt-dlp"))
    }

    pub fn ffmpeg_dir(&self) -> PathBuf {
        self.tools_dir().join("ffmpeg")
    }

    pub fn ffmpeg_bin_path(&self) -> PathBuf {
        exe_path(self.ffmpeg_dir().join("ffmpeg"))
    }

    pub fn fallback_download_dir(&self) -> PathBuf {
        self.base_dir.join("downloads")
    }

    /// The user's Downloads folder when the platform has one.
    pub fn default_download_dir(&self) -> PathBuf {
        dirs::download_dir().unwrap_or_else(|| self.fallback_download_dir())
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.config_dir())?;
        std::fs::create_dir_all(self.ytdlp_dir())?;
        std::fs::create_dir_all(self.ffmpeg_dir())?;
        Ok(())
    }
}

/// Sibling path used while a file is being written, e.g. `yt-dlp.download`.
pub fn staging_path(final_path: &Path, suffix: &str) -> PathBuf {
    let mut name = final_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(suffix);
    final_path.with_file_name(name)
}

fn exe_path(mut path: PathBuf) -> PathBuf {
    if cfg!(windows) {
        path.set_extension("exe");
    }
    path
}
