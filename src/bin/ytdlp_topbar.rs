use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{error, Level};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use ytdlp_topbar_engine::engine::{Engine, EngineProgress, ToolKind};
use ytdlp_topbar_engine::paths::AppPaths;
use ytdlp_topbar_engine::tools::{ProvisionOutcome, ProvisionProgress};
use ytdlp_topbar_engine::tracks::TrackDescriptor;
use ytdlp_topbar_engine::ytdlp::OutputFormat;
use ytdlp_topbar_engine::{EngineError, Result};

const BAR_LENGTH: u64 = 1000;

#[derive(Debug, Parser)]
#[command(name = "ytdlp-topbar", version, about = "Manage yt-dlp and ffmpeg and run downloads")]
struct Cli {
    /// Data directory holding tools and settings
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Errors only, no progress bars
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show installed tools and the current status
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Download missing tools, or reinstall them with --force
    Install {
        #[arg(long, value_enum, default_value_t = ToolArg::All)]
        tool: ToolArg,
        #[arg(long)]
        force: bool,
    },
    /// List the video and audio tracks offered for a URL
    Probe {
        url: String,
        #[arg(long)]
        json: bool,
    },
    /// Download a URL
    Download {
        url: String,
        /// Output directory (defaults to the configured download folder)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Video format id; repeatable
        #[arg(long = "video")]
        video: Vec<String>,
        /// Audio format id; repeatable
        #[arg(long = "audio")]
        audio: Vec<String>,
        /// Merge into this container, e.g. mp4
        #[arg(long, conflicts_with = "extract_audio")]
        container: Option<String>,
        /// Keep only audio, converted to this codec, e.g. mp3
        #[arg(long)]
        extract_audio: Option<String>,
        /// Fetch captions in this language
        #[arg(long)]
        subs: Option<String>,
        #[arg(long)]
        embed_subs: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ToolArg {
    Ytdlp,
    Ffmpeg,
    All,
}

impl ToolArg {
    fn kinds(self) -> Vec<ToolKind> {
        match self {
            ToolArg::Ytdlp => vec![ToolKind::Ytdlp],
            ToolArg::Ffmpeg => vec![ToolKind::Ffmpeg],
            ToolArg::All => vec![ToolKind::Ytdlp, ToolKind::Ffmpeg],
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(code = err.code(), "{err}");
            eprintln!("Error [{}]: {err}", err.code());
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .try_init();
}

fn run(cli: Cli) -> Result<()> {
    let base_dir = cli
        .base_dir
        .or_else(AppPaths::default_base_dir)
        .ok_or_else(|| {
            EngineError::Config("could not determine base dir; pass --base-dir".to_string())
        })?;
    let engine = Engine::open(AppPaths::new(base_dir))?;
    let show_progress = !cli.quiet;

    match cli.command {
        Command::Status { json } => print_status(&engine, json),
        Command::Install {
            tool: ToolArg::All,
            force: false,
        } => install_missing(&engine, show_progress),
        Command::Install { tool, force } => {
            for kind in tool.kinds() {
                install_one(&engine, kind, force, show_progress)?;
            }
            Ok(())
        }
        Command::Probe { url, json } => {
            let spinner = spinner(show_progress, "Probing tracks...");
            let catalog = engine.probe_tracks(&url, &mut |event| {
                if let EngineProgress::Provisioning(kind, progress) = event {
                    show_provisioning(&spinner, &engine, kind, progress);
                }
            });
            spinner.finish_and_clear();
            let catalog = catalog?;
            if json {
                println!("{}", serde_json::to_string_pretty(&catalog)?);
            } else {
                print_tracks("Video tracks", &catalog.video);
                print_tracks("Audio tracks", &catalog.audio);
            }
            Ok(())
        }
        Command::Download {
            url,
            output,
            video,
            audio,
            container,
            extract_audio,
            subs,
            embed_subs,
        } => {
            let mut task = engine.new_task(&url)?;
            if let Some(dir) = output {
                task.output_dir = dir;
            }
            task.output_format = match (container, extract_audio) {
                (_, Some(codec)) => OutputFormat::ExtractAudio(codec),
                (Some(ext), None) => OutputFormat::Container(ext),
                (None, None) => OutputFormat::Default,
            };
            if subs.is_some() {
                task.captions.language = subs;
            }
            task.captions.embed = embed_subs;
            task.video_format_ids.extend(video);
            task.audio_format_ids.extend(audio);

            let bar = bar(show_progress, "{spinner:.blue} [{bar:30.cyan/blue}] {percent:>3}% {msg}");
            bar.enable_steady_tick(Duration::from_millis(120));
            let report = engine.download(task, &mut |event| match event {
                EngineProgress::Provisioning(kind, progress) => {
                    show_provisioning(&bar, &engine, kind, progress);
                }
                EngineProgress::Transfer(sample) => {
                    bar.set_position((sample.fraction() * BAR_LENGTH as f64) as u64);
                    bar.set_message(format!("{} ETA {}", sample.transfer_rate, sample.eta));
                }
            });
            bar.finish_and_clear();
            let report = report?;
            match report.output_path {
                Some(path) => println!("Saved: {}", path.to_string_lossy()),
                None => println!("Download finished"),
            }
            Ok(())
        }
    }
}

fn install_one(engine: &Engine, kind: ToolKind, force: bool, show_progress: bool) -> Result<()> {
    let name = engine.asset(kind).name.clone();
    let bar = bar(show_progress, "{spinner:.blue} {msg} [{bar:30.cyan/blue}] {percent:>3}%");
    bar.set_message(format!("Installing {name}"));
    bar.enable_steady_tick(Duration::from_millis(120));

    let outcome = engine.install(kind, force, &mut |progress| match progress {
        ProvisionProgress::Fraction(f) => bar.set_position((f * BAR_LENGTH as f64) as u64),
        ProvisionProgress::Indeterminate => bar.tick(),
    });
    bar.finish_and_clear();

    match outcome? {
        ProvisionOutcome::AlreadyPresent => println!("{name}: already installed"),
        ProvisionOutcome::Installed => println!(
            "{name}: installed at {}",
            engine.asset(kind).local_path.to_string_lossy()
        ),
    }
    Ok(())
}

fn install_missing(engine: &Engine, show_progress: bool) -> Result<()> {
    let bar = bar(show_progress, "{spinner:.blue} {msg} [{bar:30.cyan/blue}] {percent:>3}%");
    bar.enable_steady_tick(Duration::from_millis(120));
    let outcomes = engine.ensure_tools(&mut |kind, progress| {
        show_provisioning(&bar, engine, kind, progress);
    });
    bar.finish_and_clear();

    for (kind, outcome) in outcomes? {
        let asset = engine.asset(kind);
        match outcome {
            ProvisionOutcome::AlreadyPresent => println!("{}: already installed", asset.name),
            ProvisionOutcome::Installed => println!(
                "{}: installed at {}",
                asset.name,
                asset.local_path.to_string_lossy()
            ),
        }
    }
    Ok(())
}

fn show_provisioning(bar: &ProgressBar, engine: &Engine, kind: ToolKind, progress: &ProvisionProgress) {
    bar.set_message(format!("Installing {}", engine.asset(kind).name));
    match progress {
        ProvisionProgress::Fraction(f) => bar.set_position((f * BAR_LENGTH as f64) as u64),
        ProvisionProgress::Indeterminate => bar.tick(),
    }
}

fn print_status(engine: &Engine, json: bool) -> Result<()> {
    let tools = engine.tool_statuses();
    if json {
        let doc = serde_json::json!({
            "base_dir": engine.paths().base_dir,
            "tools": tools,
            "status": engine.status(),
        });
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    println!("Base dir: {}", engine.paths().base_dir.to_string_lossy());
    for tool in &tools {
        if tool.installed {
            println!(
                "{}: installed ({}) at {}",
                tool.name,
                tool.version.as_deref().unwrap_or("unknown version"),
                tool.path
            );
        } else {
            println!("{}: missing", tool.name);
        }
    }
    println!("Status: {}", engine.status().name());
    Ok(())
}

fn print_tracks(title: &str, tracks: &[TrackDescriptor]) {
    println!("{title}:");
    if tracks.is_empty() {
        println!("  (none)");
    }
    for track in tracks {
        println!("  {}", track.summary());
    }
}

fn bar(visible: bool, template: &str) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(BAR_LENGTH);
    let style = ProgressStyle::with_template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");
    pb.set_style(style);
    pb
}

fn spinner(visible: bool, message: &str) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new_spinner();
    pb.enable_steady_tick(Duration::from_millis(120));
    pb.set_style(
        ProgressStyle::with_template("{spinner:.blue} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message.to_string());
    pb
}
