#![cfg(unix)]

use std::io::{Cursor, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use ytdlp_topbar_engine::config::Settings;
use ytdlp_topbar_engine::engine::{Engine, EngineProgress, ToolKind};
use ytdlp_topbar_engine::paths::AppPaths;
use ytdlp_topbar_engine::status::Status;
use ytdlp_topbar_engine::tools::{AssetFetcher, FetchResponse, ProvisionOutcome, ProvisionProgress};
use ytdlp_topbar_engine::{EngineError, Result};

const URL: &str = "https://www.youtube.com/watch?v=dQw4w9WgXcQ";

// Writing an executable while another thread forks can make exec fail with
// ETXTBSY, so tests that write and run scripts take turns.
static EXEC_LOCK: Mutex<()> = Mutex::new(());

fn exec_guard() -> MutexGuard<'static, ()> {
    EXEC_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

const SCRIPT_HEAD: &str = r#"#!/bin/sh
if [ "$1" = "--version" ]; then
  echo "2025.01.15"
  exit 0
fi
for a in "$@"; do
  if [ "$a" = "--dump-single-json" ]; then
    echo '{"id":"dQw4w9WgXcQ","formats":[{"format_id":"136","ext":"mp4","height":720,"fps":30,"vcodec":"avc1","acodec":"none"},{"format_id":"140","ext":"m4a","vcodec":"none","acodec":"mp4a","filesize":3400000},{"format_id":"137","ext":"mp4","height":1080,"fps":30,"vcodec":"avc1","acodec":"none"}]}'
    exit 0
  fi
done
printf '%s\n' "$@" > "$0.args"
dir=""
prev=""
for a in "$@"; do
  if [ "$prev" = "-P" ]; then dir="$a"; fi
  prev="$a"
done
echo '[youtube] dQw4w9WgXcQ: Downloading webpage'
echo '[download]  12.5% of ~10MiB at 1.00MiB/s ETA 00:07'
"#;

const SCRIPT_SUCCESS: &str = r#"echo '[download]  50.0% of ~10MiB at 2.00MiB/s ETA 00:03'
echo 'WARNING: [youtube] falling back' 1>&2
echo '[download] 100.0% of 10.00MiB at 2.50MiB/s ETA 00:00'
echo "OUTPUT|$dir/clip.mp4"
exit 0
"#;

const SCRIPT_FAILURE: &str = r#"echo 'ERROR: [youtube] dQw4w9WgXcQ: Video unavailable' 1>&2
exit 1
"#;

const SCRIPT_HANG: &str = "exec sleep 30\n";

/// Counts fetches and serves `body`, or fails when there is none.
#[derive(Default)]
struct CountingFetcher {
    calls: AtomicUsize,
    body: Option<Vec<u8>>,
}

impl AssetFetcher for CountingFetcher {
    fn fetch(&self, url: &str) -> Result<FetchResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.body {
            Some(body) => Ok(FetchResponse {
                content_length: Some(body.len() as u64),
                body: Box::new(Cursor::new(body.clone())),
            }),
            None => Err(EngineError::DownloadFailed {
                tool: url.to_string(),
                reason: "network disabled in tests".to_string(),
            }),
        }
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    engine: Engine,
    fetcher: Arc<CountingFetcher>,
    downloads: PathBuf,
}

impl Fixture {
    fn new(fetcher: CountingFetcher) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().join("base"));
        paths.ensure_dirs().expect("dirs");
        let downloads = dir.path().join("downloads");
        let settings = Settings {
            download_dir: Some(downloads.clone()),
            process_timeout_secs: 60,
            ..Settings::default()
        };
        let fetcher = Arc::new(fetcher);
        let engine = Engine::with_fetcher(paths, settings, fetcher.clone());
        Self {
            _dir: dir,
            engine,
            fetcher,
            downloads,
        }
    }

    fn ytdlp_path(&self) -> PathBuf {
        self.engine.paths().ytdlp_bin_path()
    }

    fn args_path(&self) -> PathBuf {
        let mut name = self.ytdlp_path().into_os_string();
        name.push(".args");
        PathBuf::from(name)
    }

    fn install_script(&self, tail: &str) {
        write_script(&self.ytdlp_path(), &format!("{SCRIPT_HEAD}{tail}"));
    }

    fn fetch_calls(&self) -> usize {
        self.fetcher.calls.load(Ordering::SeqCst)
    }
}

fn write_script(path: &Path, body: &str) {
    std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
    std::fs::write(path, body).expect("write script");
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).expect("chmod");
}

#[test]
fn download_streams_progress_and_returns_to_idle() {
    let _guard = exec_guard();
    let fx = Fixture::new(CountingFetcher::default());
    fx.install_script(SCRIPT_SUCCESS);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    fx.engine
        .status_model()
        .subscribe(move |status| sink.lock().expect("lock").push(status.name()));

    let task = fx.engine.new_task(URL).expect("task");
    let mut percents = Vec::new();
    let report = fx
        .engine
        .download(task, &mut |event| {
            if let EngineProgress::Transfer(sample) = event {
                percents.push(sample.percent);
            }
        })
        .expect("download");

    assert_eq!(percents, vec![12.5, 50.0, 100.0]);
    let last = report.last_sample.expect("sample");
    assert_eq!(last.transfer_rate, "2.50MiB/s");
    assert_eq!(last.eta, "00:00");
    assert_eq!(report.output_path, Some(fx.downloads.join("clip.mp4")));
    assert_eq!(fx.engine.status(), Status::Idle);
    assert_eq!(fx.fetch_calls(), 0);

    let names = seen.lock().expect("lock").clone();
    assert_eq!(names.first(), Some(&"running"));
    assert_eq!(names.last(), Some(&"idle"));
    assert_eq!(names.iter().filter(|n| **n == "running").count(), 4);

    let args = std::fs::read_to_string(fx.args_path()).expect("args");
    let args: Vec<&str> = args.lines().collect();
    assert!(args.contains(&"--newline"));
    assert_eq!(args.last(), Some(&URL));
    assert!(!args.contains(&"--ffmpeg-location"));
}

#[test]
fn non_zero_exit_leaves_failed_status_until_next_action() {
    let _guard = exec_guard();
    let fx = Fixture::new(CountingFetcher::default());
    fx.install_script(SCRIPT_FAILURE);

    let task = fx.engine.new_task(URL).expect("task");
    let err = fx
        .engine
        .download(task, &mut |_| {})
        .expect_err("tool exits 1");
    assert_eq!(err.code(), "process_exited_non_zero");
    assert!(err.to_string().contains("Video unavailable"));

    match fx.engine.status() {
        Status::Failed { reason, code } => {
            assert_eq!(code, "process_exited_non_zero");
            assert!(reason.contains("Video unavailable"));
        }
        other => panic!("unexpected status {other:?}"),
    }

    let outcome = fx
        .engine
        .install(ToolKind::Ytdlp, false, &mut |_| {})
        .expect("install");
    assert_eq!(outcome, ProvisionOutcome::AlreadyPresent);
    assert_eq!(fx.engine.status(), Status::Idle);
}

#[test]
fn second_run_is_rejected_while_busy_without_spawning() {
    let _guard = exec_guard();
    let fx = Fixture::new(CountingFetcher::default());
    fx.install_script(SCRIPT_SUCCESS);

    let model = fx.engine.status_model();
    let held = model
        .begin_run(fx.engine.new_task(URL).expect("task"))
        .expect("claim");

    let err = fx
        .engine
        .download(fx.engine.new_task(URL).expect("task"), &mut |_| {})
        .expect_err("busy");
    assert!(matches!(err, EngineError::Busy { ref state } if state == "running"));
    assert!(!fx.args_path().exists());

    held.finish(&Ok(()));
    assert!(fx.engine.status().is_idle());
}

#[test]
fn cancel_stops_the_running_download() {
    let _guard = exec_guard();
    let fx = Fixture::new(CountingFetcher::default());
    fx.install_script(SCRIPT_HANG);

    let engine = &fx.engine;
    let task = engine.new_task(URL).expect("task");
    let started = std::time::Instant::now();
    let err = engine
        .download(task, &mut |event| {
            if let EngineProgress::Transfer(_) = event {
                assert!(engine.cancel());
            }
        })
        .expect_err("canceled");

    assert!(matches!(err, EngineError::Canceled));
    assert!(started.elapsed() < std::time::Duration::from_secs(20));
    match engine.status() {
        Status::Failed { code, .. } => assert_eq!(code, "canceled"),
        other => panic!("unexpected status {other:?}"),
    }
    assert!(!engine.cancel());
}

#[test]
fn probe_partitions_tracks_from_tool_json() {
    let _guard = exec_guard();
    let fx = Fixture::new(CountingFetcher::default());
    fx.install_script(SCRIPT_SUCCESS);

    let catalog = fx.engine.probe_tracks(URL, &mut |_| {}).expect("probe");
    let video: Vec<&str> = catalog.video.iter().map(|t| t.format_id.as_str()).collect();
    let audio: Vec<&str> = catalog.audio.iter().map(|t| t.format_id.as_str()).collect();
    assert_eq!(video, vec!["137", "136"]);
    assert_eq!(audio, vec!["140"]);
    assert!(fx.engine.status().is_idle());
}

#[test]
fn missing_tool_is_provisioned_before_the_first_run() {
    let _guard = exec_guard();
    // Padding keeps the served script above the downloader's minimum size.
    let mut body = format!("{SCRIPT_HEAD}{SCRIPT_SUCCESS}");
    body.push('#');
    body.push_str(&"x".repeat(600 * 1024));
    body.push('\n');
    let fx = Fixture::new(CountingFetcher {
        calls: AtomicUsize::new(0),
        body: Some(body.into_bytes()),
    });
    assert!(!fx.ytdlp_path().exists());

    let statuses = fx.engine.tool_statuses();
    assert!(statuses.iter().all(|s| !s.installed));

    let mut installing = Vec::new();
    let mut transfers = 0;
    let report = fx
        .engine
        .download(fx.engine.new_task(URL).expect("task"), &mut |event| match event {
            EngineProgress::Provisioning(tool, progress) => installing.push((tool, progress.clone())),
            EngineProgress::Transfer(_) => {
                assert!(!installing.is_empty());
                transfers += 1;
            }
        })
        .expect("download");
    assert_eq!(fx.fetch_calls(), 1);
    assert_eq!(transfers, 3);
    assert!(installing.iter().all(|(tool, _)| *tool == ToolKind::Ytdlp));
    assert_eq!(
        installing.last().map(|(_, p)| p.clone()),
        Some(ProvisionProgress::Fraction(1.0))
    );
    assert_eq!(report.output_path, Some(fx.downloads.join("clip.mp4")));

    let ytdlp = &fx.engine.tool_statuses()[0];
    assert!(ytdlp.installed);
    assert_eq!(ytdlp.version.as_deref(), Some("2025.01.15"));
}

fn ffmpeg_zip() -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    writer
        .start_file("ffmpeg", zip::write::FileOptions::default())
        .expect("start");
    writer.write_all(b"#!/bin/sh\necho ffmpeg version 7.1.1\n").expect("write");
    writer.finish().expect("finish").into_inner()
}

fn fixture_with_ffmpeg_mirror() -> Fixture {
    let mut fx = Fixture::new(CountingFetcher {
        calls: AtomicUsize::new(0),
        body: Some(ffmpeg_zip()),
    });
    let paths = fx.engine.paths().clone();
    let settings = Settings {
        ffmpeg_url: "https://example.invalid/ffmpeg.zip".to_string(),
        ffmpeg_archive_entry: "ffmpeg".to_string(),
        ..fx.engine.settings().clone()
    };
    fx.engine = Engine::with_fetcher(paths, settings, fx.fetcher.clone());
    fx
}

#[test]
fn merging_tracks_installs_ffmpeg_and_passes_its_location() {
    let _guard = exec_guard();
    let fx = fixture_with_ffmpeg_mirror();
    fx.install_script(SCRIPT_SUCCESS);
    let ffmpeg_path = fx.engine.asset(ToolKind::Ffmpeg).local_path.clone();
    assert!(!ffmpeg_path.exists());

    let task = fx
        .engine
        .new_task(URL)
        .expect("task")
        .with_video_format("137")
        .with_audio_format("140");
    let mut installed = Vec::new();
    fx.engine
        .download(task, &mut |event| {
            if let EngineProgress::Provisioning(tool, _) = event {
                installed.push(tool);
            }
        })
        .expect("download");

    assert_eq!(fx.fetch_calls(), 1);
    assert!(ffmpeg_path.exists());
    assert!(installed.iter().all(|tool| *tool == ToolKind::Ffmpeg));
    assert!(!installed.is_empty());

    let args = std::fs::read_to_string(fx.args_path()).expect("args");
    let args: Vec<&str> = args.lines().collect();
    let at = args
        .iter()
        .position(|a| *a == "--ffmpeg-location")
        .expect("ffmpeg location flag");
    assert_eq!(args.get(at + 1).copied(), ffmpeg_path.to_str());
    let at = args.iter().position(|a| *a == "-f").expect("format flag");
    assert_eq!(args.get(at + 1).copied(), Some("137+140"));
}

#[test]
fn single_stream_download_does_not_fetch_ffmpeg() {
    let _guard = exec_guard();
    let fx = fixture_with_ffmpeg_mirror();
    fx.install_script(SCRIPT_SUCCESS);

    let task = fx.engine.new_task(URL).expect("task").with_video_format("18");
    fx.engine.download(task, &mut |_| {}).expect("download");

    assert_eq!(fx.fetch_calls(), 0);
    assert!(!fx.engine.asset(ToolKind::Ffmpeg).is_present());
    let args = std::fs::read_to_string(fx.args_path()).expect("args");
    assert!(!args.lines().any(|a| a == "--ffmpeg-location"));
}
