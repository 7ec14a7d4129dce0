//! Top-level controller. Owns the paths, settings, tool assets and the one
//! [`StatusModel`]; every user-facing operation goes through [`Engine`].

use crate::config::{self, Settings};
use crate::paths::AppPaths;
use crate::process::{self, RunOptions};
use crate::progress::{self, ProgressSample};
use crate::status::{ActiveSlot, Status, StatusModel};
use crate::tools::{
    self, AssetFetcher, HttpFetcher, ProvisionOutcome, ProvisionProgress, ToolAsset, ToolStatus,
};
use crate::tracks::{self, TrackCatalog};
use crate::ytdlp::{self, CaptionOptions, OutputFormat, TaskDescriptor};
use crate::{EngineError, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    Ytdlp,
    Ffmpeg,
}

/// What [`Engine::download`] and [`Engine::probe_tracks`] report while they work.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EngineProgress<'a> {
    /// A missing tool is being installed before the run.
    Provisioning(ToolKind, &'a ProvisionProgress),
    Transfer(&'a ProgressSample),
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadReport {
    pub task_id: Uuid,
    /// Final file as reported by the downloader, when it printed one.
    pub output_path: Option<PathBuf>,
    pub last_sample: Option<ProgressSample>,
}

pub struct Engine {
    paths: AppPaths,
    settings: Settings,
    status: Arc<StatusModel>,
    fetcher: Arc<dyn AssetFetcher>,
    ytdlp: ToolAsset,
    ffmpeg: ToolAsset,
    active_cancel: Mutex<Option<Arc<AtomicBool>>>,
}

impl Engine {
    /// Creates the directory layout, loads settings and uses the HTTP fetcher.
    pub fn open(paths: AppPaths) -> Result<Self> {
        paths.ensure_dirs()?;
        let settings = config::load_settings(&paths)?;
        Ok(Self::with_fetcher(
            paths,
            settings,
            Arc::new(HttpFetcher::new()),
        ))
    }

    pub fn with_fetcher(
        paths: AppPaths,
        settings: Settings,
        fetcher: Arc<dyn AssetFetcher>,
    ) -> Self {
        let ytdlp = ToolAsset::ytdlp(&paths, &settings);
        let ffmpeg = ToolAsset::ffmpeg(&paths, &settings);
        Self {
            paths,
            settings,
            status: Arc::new(StatusModel::new()),
            fetcher,
            ytdlp,
            ffmpeg,
            active_cancel: Mutex::new(None),
        }
    }

    pub fn paths(&self) -> &AppPaths {
        &self.paths
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn status(&self) -> Status {
        self.status.snapshot()
    }

    pub fn status_model(&self) -> Arc<StatusModel> {
        self.status.clone()
    }

    pub fn asset(&self, tool: ToolKind) -> &ToolAsset {
        match tool {
            ToolKind::Ytdlp => &self.ytdlp,
            ToolKind::Ffmpeg => &self.ffmpeg,
        }
    }

    pub fn tool_statuses(&self) -> Vec<ToolStatus> {
        vec![tools::tool_status(&self.ytdlp), tools::tool_status(&self.ffmpeg)]
    }

    /// Ensures (or with `force`, reinstalls) one tool.
    pub fn install(
        &self,
        tool: ToolKind,
        force: bool,
        on_progress: &mut dyn FnMut(&ProvisionProgress),
    ) -> Result<ProvisionOutcome> {
        self.status.acknowledge_failure();
        let asset = self.asset(tool);
        if force {
            tools::reinstall(asset, self.fetcher.as_ref(), &self.status, on_progress)
        } else {
            tools::ensure_present(asset, self.fetcher.as_ref(), &self.status, on_progress)
        }
    }

    /// Ensures both tools, downloader first. A missing tool with no download
    /// URL for this platform is skipped and left to `PATH`.
    pub fn ensure_tools(
        &self,
        on_progress: &mut dyn FnMut(ToolKind, &ProvisionProgress),
    ) -> Result<Vec<(ToolKind, ProvisionOutcome)>> {
        let mut outcomes = Vec::with_capacity(2);
        for tool in [ToolKind::Ytdlp, ToolKind::Ffmpeg] {
            let asset = self.asset(tool);
            if !asset.is_present() && !asset.is_provisionable() {
                info!(tool = %asset.name, "no download URL configured, skipping");
                continue;
            }
            let outcome = self.install(tool, false, &mut |p| on_progress(tool, p))?;
            outcomes.push((tool, outcome));
        }
        Ok(outcomes)
    }

    /// Builds a task with the configured output directory and caption language.
    pub fn new_task(&self, target_url: &str) -> Result<TaskDescriptor> {
        TaskDescriptor::new(
            target_url,
            self.settings.effective_download_dir(&self.paths),
            OutputFormat::Default,
            CaptionOptions {
                language: self.settings.default_caption_language.clone(),
                embed: false,
            },
        )
    }

    /// Lists the tracks for `target_url`, installing yt-dlp first if needed.
    /// Only provisioning events reach `on_progress`.
    pub fn probe_tracks(
        &self,
        target_url: &str,
        on_progress: &mut dyn FnMut(EngineProgress<'_>),
    ) -> Result<TrackCatalog> {
        self.status.acknowledge_failure();
        self.ensure_for_run(ToolKind::Ytdlp, on_progress)?;
        tracks::probe(
            &self.ytdlp.local_path,
            target_url,
            RunOptions {
                timeout_secs: self.settings.process_timeout_secs,
                cancel: None,
            },
        )
    }

    /// Runs one download to completion. Rejected with `Busy` while any other
    /// operation holds the status model.
    ///
    /// yt-dlp is installed first when missing, and so is ffmpeg when the task
    /// merges, converts or embeds. Both installs report through `on_progress`
    /// before the transfer samples start.
    pub fn download(
        &self,
        task: TaskDescriptor,
        on_progress: &mut dyn FnMut(EngineProgress<'_>),
    ) -> Result<DownloadReport> {
        self.status.acknowledge_failure();
        let current = self.status.snapshot();
        if !current.is_idle() {
            return Err(EngineError::Busy {
                state: current.name().to_string(),
            });
        }
        self.ensure_for_run(ToolKind::Ytdlp, on_progress)?;
        if task.needs_transcoder() {
            if self.ffmpeg.is_present() || self.ffmpeg.is_provisionable() {
                self.ensure_for_run(ToolKind::Ffmpeg, on_progress)?;
            } else {
                debug!(task = %task.id, "no ffmpeg download configured, relying on PATH");
            }
        }

        let ffmpeg = self
            .ffmpeg
            .is_present()
            .then(|| self.ffmpeg.local_path.clone());
        let args = ytdlp::download_args(&task, ffmpeg.as_deref());
        let task_id = task.id;
        let output_dir = task.output_dir.clone();
        info!(task = %task_id, url = %task.target_url, "starting download");

        let slot = self.status.begin_run(task)?;
        let cancel = Arc::new(AtomicBool::new(false));
        self.set_active_cancel(Some(cancel.clone()));

        let result = std::fs::create_dir_all(&output_dir)
            .map_err(EngineError::from)
            .and_then(|()| self.run_download(&args, &slot, cancel, on_progress))
            .map(|(output_path, last_sample)| DownloadReport {
                task_id,
                output_path,
                last_sample,
            });

        self.set_active_cancel(None);
        slot.finish(&result);
        match &result {
            Ok(report) => info!(task = %task_id, output = ?report.output_path, "download finished"),
            Err(err) => info!(task = %task_id, code = err.code(), "download failed: {err}"),
        }
        result
    }

    /// Asks the active download to stop. Returns false when nothing is running.
    pub fn cancel(&self) -> bool {
        let active = self
            .active_cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        match active.as_ref() {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                info!("cancel requested");
                true
            }
            None => false,
        }
    }

    fn ensure_for_run(
        &self,
        tool: ToolKind,
        on_progress: &mut dyn FnMut(EngineProgress<'_>),
    ) -> Result<ProvisionOutcome> {
        tools::ensure_present(
            self.asset(tool),
            self.fetcher.as_ref(),
            &self.status,
            &mut |p| on_progress(EngineProgress::Provisioning(tool, p)),
        )
    }

    fn set_active_cancel(&self, flag: Option<Arc<AtomicBool>>) {
        *self
            .active_cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = flag;
    }

    fn run_download(
        &self,
        args: &[String],
        slot: &ActiveSlot<'_>,
        cancel: Arc<AtomicBool>,
        on_progress: &mut dyn FnMut(EngineProgress<'_>),
    ) -> Result<(Option<PathBuf>, Option<ProgressSample>)> {
        let mut handle = process::run(
            &self.ytdlp.local_path,
            args,
            RunOptions {
                timeout_secs: self.settings.process_timeout_secs,
                cancel: Some(cancel),
            },
        )?;

        let mut output_path = None;
        let mut last_sample = None;
        for line in handle.by_ref() {
            if let Some(sample) = line.progress {
                slot.report_run_progress(sample.clone());
                on_progress(EngineProgress::Transfer(&sample));
                last_sample = Some(sample);
            } else if let Some(path) = progress::parse_output_path(&line.text) {
                output_path = Some(PathBuf::from(path));
            }
        }
        handle.wait()?.check()?;
        Ok((output_path, last_sample))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::FetchResponse;

    struct NoNetwork;

    impl AssetFetcher for NoNetwork {
        fn fetch(&self, url: &str) -> Result<FetchResponse> {
            Err(EngineError::DownloadFailed {
                tool: url.to_string(),
                reason: "offline".to_string(),
            })
        }
    }

    const YTDLP_URL: &str = "https://example.invalid/yt-dlp";
    const FFMPEG_URL: &str = "https://example.invalid/ffmpeg.zip";

    fn test_settings() -> Settings {
        Settings {
            ytdlp_url: YTDLP_URL.to_string(),
            ffmpeg_url: FFMPEG_URL.to_string(),
            ffmpeg_archive_entry: "bin/ffmpeg".to_string(),
            ..Settings::default()
        }
    }

    fn engine(dir: &std::path::Path) -> Engine {
        Engine::with_fetcher(
            AppPaths::new(dir.to_path_buf()),
            test_settings(),
            Arc::new(NoNetwork),
        )
    }

    /// Serves a padded yt-dlp binary and an ffmpeg zip from memory.
    #[derive(Default)]
    struct MemoryMirror {
        requested: std::sync::Mutex<Vec<String>>,
    }

    impl AssetFetcher for MemoryMirror {
        fn fetch(&self, url: &str) -> Result<FetchResponse> {
            self.requested
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(url.to_string());
            let body = match url {
                YTDLP_URL => vec![b'y'; 600 * 1024],
                FFMPEG_URL => {
                    use std::io::Write;
                    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
                    writer
                        .start_file("bin/ffmpeg", zip::write::FileOptions::default())
                        .expect("start");
                    writer.write_all(b"ffmpeg-binary").expect("write");
                    writer.finish().expect("finish").into_inner()
                }
                other => {
                    return Err(EngineError::DownloadFailed {
                        tool: other.to_string(),
                        reason: "not mirrored".to_string(),
                    })
                }
            };
            Ok(FetchResponse {
                content_length: Some(body.len() as u64),
                body: Box::new(std::io::Cursor::new(body)),
            })
        }
    }

    #[test]
    fn ensure_tools_installs_both_assets_then_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mirror = Arc::new(MemoryMirror::default());
        let engine = Engine::with_fetcher(
            AppPaths::new(dir.path().to_path_buf()),
            test_settings(),
            mirror.clone(),
        );

        let mut tools_seen = Vec::new();
        let outcomes = engine
            .ensure_tools(&mut |tool, _| {
                if tools_seen.last() != Some(&tool) {
                    tools_seen.push(tool);
                }
            })
            .expect("ensure");
        assert_eq!(
            outcomes,
            vec![
                (ToolKind::Ytdlp, ProvisionOutcome::Installed),
                (ToolKind::Ffmpeg, ProvisionOutcome::Installed),
            ]
        );
        assert_eq!(tools_seen, vec![ToolKind::Ytdlp, ToolKind::Ffmpeg]);
        assert!(engine.asset(ToolKind::Ytdlp).is_present());
        assert_eq!(
            std::fs::read(&engine.asset(ToolKind::Ffmpeg).local_path).expect("read"),
            b"ffmpeg-binary"
        );
        assert!(engine.status().is_idle());

        let outcomes = engine.ensure_tools(&mut |_, _| {}).expect("again");
        assert!(outcomes
            .iter()
            .all(|(_, o)| *o == ProvisionOutcome::AlreadyPresent));
        assert_eq!(
            *mirror.requested.lock().expect("lock"),
            vec![YTDLP_URL.to_string(), FFMPEG_URL.to_string()]
        );
    }

    #[test]
    fn ensure_tools_skips_assets_without_a_download_url() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = Settings {
            ffmpeg_url: String::new(),
            ..test_settings()
        };
        let engine = Engine::with_fetcher(
            AppPaths::new(dir.path().to_path_buf()),
            settings,
            Arc::new(MemoryMirror::default()),
        );

        let outcomes = engine.ensure_tools(&mut |_, _| {}).expect("ensure");
        assert_eq!(outcomes, vec![(ToolKind::Ytdlp, ProvisionOutcome::Installed)]);
        assert!(!engine.asset(ToolKind::Ffmpeg).is_present());
    }

    #[test]
    fn cancel_without_active_download_is_a_no_op() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(!engine(dir.path()).cancel());
    }

    #[test]
    fn new_task_uses_configured_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut engine = engine(dir.path());
        engine.settings.download_dir = Some(dir.path().join("out"));
        engine.settings.default_caption_language = Some("de".to_string());

        let task = engine.new_task("https://vimeo.com/1234").expect("task");
        assert_eq!(task.output_dir, dir.path().join("out"));
        assert_eq!(task.captions.language.as_deref(), Some("de"));
    }

    #[test]
    fn failed_provisioning_is_acknowledged_by_the_next_action() {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = engine(dir.path());

        let err = engine
            .install(ToolKind::Ytdlp, false, &mut |_| {})
            .expect_err("offline");
        assert_eq!(err.code(), "download_failed");
        assert_eq!(engine.status().name(), "failed");

        let err = engine
            .install(ToolKind::Ffmpeg, true, &mut |_| {})
            .expect_err("offline");
        assert_eq!(err.code(), "download_failed");
        assert_eq!(engine.tool_statuses().iter().filter(|s| s.installed).count(), 0);
    }
}
