//! Provisioning of the external tools (yt-dlp and ffmpeg).
//!
//! An asset is either present at its local path or absent; it is never left
//! half-written. Downloads stream into `<tool>.download` next to the final
//! path, archive entries are extracted into `<tool>.extract`, and only a fully
//! verified file is renamed into place.

use crate::config::Settings;
use crate::paths::{self, AppPaths};
use crate::status::{ActiveSlot, StatusModel};
use crate::{cmd, ytdlp, EngineError, Result};
use serde::Serialize;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const PROGRESS_REPORT_INTERVAL_MS: u64 = 100;
const DOWNLOAD_CHUNK_BYTES: usize = 64 * 1024;
const YTDLP_MIN_SIZE_BYTES: u64 = 512 * 1024;
const FFMPEG_VERSION_ARG: &str = "-version";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ProvisionProgress {
    /// Completed share of the transfer, `0.0..=1.0`.
    Fraction(f64),
    /// The server did not announce a size.
    Indeterminate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetSource {
    /// The download is the executable itself.
    Binary,
    /// The download is a zip archive holding the executable as `entry`.
    ArchiveEntry { entry: String },
}

#[derive(Debug, Clone)]
pub struct ToolAsset {
    pub name: String,
    pub local_path: PathBuf,
    pub remote_url: String,
    pub executable: bool,
    pub source: AssetSource,
    /// Hex sha256 of the downloaded file (archive, for archive assets).
    pub sha256: Option<String>,
    pub min_size_bytes: u64,
    pub version_arg: &'static str,
}

impl ToolAsset {
    pub fn ytdlp(paths: &AppPaths, settings: &Settings) -> Self {
        Self {
            name: ytdlp::TOOL_NAME.to_string(),
            local_path: paths.ytdlp_bin_path(),
            remote_url: settings.ytdlp_url.clone(),
            executable: true,
            source: AssetSource::Binary,
            sha256: None,
            min_size_bytes: YTDLP_MIN_SIZE_BYTES,
            version_arg: ytdlp::VERSION_ARG,
        }
    }

    pub fn ffmpeg(paths: &AppPaths, settings: &Settings) -> Self {
        Self {
            name: "ffmpeg".to_string(),
            local_path: paths.ffmpeg_bin_path(),
            remote_url: settings.ffmpeg_url.clone(),
            executable: true,
            source: AssetSource::ArchiveEntry {
                entry: settings.ffmpeg_archive_entry.clone(),
            },
            sha256: settings.ffmpeg_sha256.clone(),
            min_size_bytes: 0,
            version_arg: FFMPEG_VERSION_ARG,
        }
    }

    pub fn is_present(&self) -> bool {
        self.local_path.is_file()
    }

    /// False when no download URL is configured for this platform.
    pub fn is_provisionable(&self) -> bool {
        !self.remote_url.trim().is_empty()
    }

    fn download_path(&self) -> PathBuf {
        paths::staging_path(&self.local_path, "download")
    }

    fn extract_path(&self) -> PathBuf {
        paths::staging_path(&self.local_path, "extract")
    }
}

pub struct FetchResponse {
    pub content_length: Option<u64>,
    pub body: Box<dyn Read>,
}

/// Network seam for provisioning.
pub trait AssetFetcher: Send + Sync {
    fn fetch(&self, url: &str) -> Result<FetchResponse>;
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    agent: ureq::Agent,
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpFetcher {
    pub fn new() -> Self {
        let mut config = ureq::Agent::config_builder();
        config = config
            .http_status_as_error(false)
            .timeout_connect(Some(Duration::from_secs(30)))
            .user_agent(concat!("ytdlp-topbar/", env!("CARGO_PKG_VERSION")));
        Self {
            agent: config.build().into(),
        }
    }
}

impl AssetFetcher for HttpFetcher {
    fn fetch(&self, url: &str) -> Result<FetchResponse> {
        let resp = self.agent.get(url).call().map_err(|e| EngineError::DownloadFailed {
            tool: url.to_string(),
            reason: e.to_string(),
        })?;
        let status = resp.status();
        if status.as_u16() >= 400 {
            return Err(EngineError::DownloadFailed {
                tool: url.to_string(),
                reason: format!("status={status}"),
            });
        }
        let content_length = resp
            .headers()
            .get("content-length")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        Ok(FetchResponse {
            content_length,
            body: Box::new(resp.into_body().into_reader()),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionOutcome {
    AlreadyPresent,
    Installed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolStatus {
    pub name: String,
    pub path: String,
    pub installed: bool,
    pub version: Option<String>,
}

pub fn tool_status(asset: &ToolAsset) -> ToolStatus {
    let installed = asset.is_present();
    let version = if installed {
        cmd::version_first_line(&asset.local_path, asset.version_arg)
    } else {
        None
    };
    ToolStatus {
        name: asset.name.clone(),
        path: asset.local_path.to_string_lossy().to_string(),
        installed,
        version,
    }
}

/// Installs `asset` unless it is already present. A present asset is not
/// touched and no network request is made.
pub fn ensure_present(
    asset: &ToolAsset,
    fetcher: &dyn AssetFetcher,
    status: &StatusModel,
    on_progress: &mut dyn FnMut(&ProvisionProgress),
) -> Result<ProvisionOutcome> {
    if asset.is_present() {
        debug!(tool = %asset.name, path = %asset.local_path.display(), "already present");
        return Ok(ProvisionOutcome::AlreadyPresent);
    }
    provision(asset, fetcher, status, on_progress, false)
}

/// Deletes the local copy and installs it again from scratch.
pub fn reinstall(
    asset: &ToolAsset,
    fetcher: &dyn AssetFetcher,
    status: &StatusModel,
    on_progress: &mut dyn FnMut(&ProvisionProgress),
) -> Result<ProvisionOutcome> {
    provision(asset, fetcher, status, on_progress, true)
}

fn provision(
    asset: &ToolAsset,
    fetcher: &dyn AssetFetcher,
    status: &StatusModel,
    on_progress: &mut dyn FnMut(&ProvisionProgress),
    replace_existing: bool,
) -> Result<ProvisionOutcome> {
    if !asset.is_provisionable() {
        return Err(EngineError::Config(format!(
            "no download URL configured for {}",
            asset.name
        )));
    }
    let slot = status.begin_provisioning(&asset.name)?;
    // Another caller may have finished installing while we waited for the slot.
    if !replace_existing && asset.is_present() {
        debug!(tool = %asset.name, "installed by a concurrent caller");
        slot.finish(&Ok(()));
        return Ok(ProvisionOutcome::AlreadyPresent);
    }
    info!(tool = %asset.name, url = %asset.remote_url, "installing");

    let result = install(asset, fetcher, &slot, on_progress, replace_existing);
    if let Err(err) = &result {
        warn!(tool = %asset.name, code = err.code(), "install failed: {err}");
    }
    remove_staging_files(asset);
    slot.finish(&result);
    result.map(|()| ProvisionOutcome::Installed)
}

fn install(
    asset: &ToolAsset,
    fetcher: &dyn AssetFetcher,
    slot: &ActiveSlot<'_>,
    on_progress: &mut dyn FnMut(&ProvisionProgress),
    replace_existing: bool,
) -> Result<()> {
    if replace_existing && asset.local_path.exists() {
        std::fs::remove_file(&asset.local_path)?;
    }
    if let Some(parent) = asset.local_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut report = |p: ProvisionProgress| {
        on_progress(&p);
        slot.report_provision_progress(p);
    };

    let download_path = asset.download_path();
    let response = fetcher.fetch(&asset.remote_url)?;
    let received = {
        let mut file = File::create(&download_path)?;
        let received = stream_to_file(asset, response, &mut file, &mut report)?;
        file.flush()?;
        file.sync_all()?;
        received
    };
    verify_download(asset, &download_path, received)?;

    let staged = match &asset.source {
        AssetSource::Binary => download_path,
        AssetSource::ArchiveEntry { entry } => {
            let extract_path = asset.extract_path();
            extract_archive_entry(&download_path, entry, &extract_path)?;
            extract_path
        }
    };

    install_into_place(&staged, &asset.local_path, asset.executable)?;
    info!(tool = %asset.name, path = %asset.local_path.display(), bytes = received, "installed");
    Ok(())
}

fn stream_to_file(
    asset: &ToolAsset,
    response: FetchResponse,
    file: &mut File,
    report: &mut dyn FnMut(ProvisionProgress),
) -> Result<u64> {
    let FetchResponse {
        content_length,
        mut body,
    } = response;
    let interval = Duration::from_millis(PROGRESS_REPORT_INTERVAL_MS);
    let mut buf = vec![0_u8; DOWNLOAD_CHUNK_BYTES];
    let mut received = 0_u64;
    let mut last_report: Option<Instant> = None;

    report(progress_for(received, content_length));
    loop {
        let n = match body.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(EngineError::DownloadFailed {
                    tool: asset.name.clone(),
                    reason: e.to_string(),
                })
            }
        };
        file.write_all(&buf[..n])?;
        received += n as u64;
        if last_report.map_or(true, |t| t.elapsed() >= interval) {
            report(progress_for(received, content_length));
            last_report = Some(Instant::now());
        }
    }
    report(progress_for(received, content_length));

    if let Some(expected) = content_length {
        if received != expected {
            return Err(EngineError::DownloadFailed {
                tool: asset.name.clone(),
                reason: format!("transfer ended after {received} of {expected} bytes"),
            });
        }
    }
    Ok(received)
}

fn progress_for(received: u64, total: Option<u64>) -> ProvisionProgress {
    match total {
        Some(total) if total > 0 => {
            ProvisionProgress::Fraction((received as f64 / total as f64).min(1.0))
        }
        _ => ProvisionProgress::Indeterminate,
    }
}

fn verify_download(asset: &ToolAsset, path: &Path, received: u64) -> Result<()> {
    if received < asset.min_size_bytes {
        return Err(EngineError::SizeMismatch {
            path: path.to_path_buf(),
            expected: asset.min_size_bytes,
            actual: received,
        });
    }
    if let Some(expected) = asset.sha256.as_deref() {
        let actual = hex::encode(sha256_file(path)?);
        if !actual.eq_ignore_ascii_case(expected.trim()) {
            return Err(EngineError::HashMismatch {
                path: path.to_path_buf(),
                expected: expected.trim().to_ascii_lowercase(),
                actual,
            });
        }
    }
    Ok(())
}

fn sha256_file(path: &Path) -> Result<Vec<u8>> {
    use sha2::Digest;
    let mut file = File::open(path)?;
    let mut hasher = sha2::Sha256::new();
    let mut buf = vec![0_u8; 1024 * 1024];
    loop {
        let n = file.read(buf.as_mut_slice())?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_vec())
}

fn extract_archive_entry(archive_path: &Path, entry: &str, out_path: &Path) -> Result<()> {
    use zip::result::ZipError;

    let extract_err = |reason: String| EngineError::ArchiveExtractFailed {
        archive: archive_path.to_path_buf(),
        entry: entry.to_string(),
        reason,
    };

    let file = File::open(archive_path)?;
    let mut archive =
        zip::ZipArchive::new(file).map_err(|e| extract_err(format!("unreadable archive: {e}")))?;
    let mut found = archive.by_name(entry).map_err(|e| match e {
        ZipError::FileNotFound => extract_err("entry not found".to_string()),
        other => extract_err(other.to_string()),
    })?;
    if found.is_dir() {
        return Err(extract_err("entry is a directory".to_string()));
    }

    let mut out_file = File::create(out_path)?;
    std::io::copy(&mut found, &mut out_file)
        .map_err(|e| extract_err(format!("decompression failed: {e}")))?;
    out_file.flush()?;
    out_file.sync_all()?;
    Ok(())
}

fn install_into_place(staged: &Path, destination: &Path, executable: bool) -> Result<()> {
    if executable {
        set_executable(staged).map_err(|e| {
            EngineError::InstallFailed(format!(
                "failed to mark {} executable: {e}",
                staged.to_string_lossy()
            ))
        })?;
    }
    if destination.exists() {
        std::fs::remove_file(destination)?;
    }
    std::fs::rename(staged, destination).map_err(|e| {
        EngineError::InstallFailed(format!(
            "failed to move {} into place: {e}",
            destination.to_string_lossy()
        ))
    })
}

#[cfg(unix)]
fn set_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

fn remove_staging_files(asset: &ToolAsset) {
    for path in [asset.download_path(), asset.extract_path()] {
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "removed staging file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), "could not remove staging file: {e}"),
        }
    }
}
