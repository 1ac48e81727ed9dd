use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use loopcast_core::{
    load_loopcast_config, AspectMode, ClipCatalog, FetchError, Fetcher, GdownFetcher, LogLine,
    LoopcastConfig, RunSummary, SessionError, StartRequest, StreamController,
};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;
use tracing_subscriber::EnvFilter;

pub type Result<T> = std::result::Result<T, AppError>;

const DEFAULT_CONFIG: &str = "configs/loopcast.toml";

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] loopcast_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("{0}")]
    Session(#[from] SessionError),
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("catalog error: {0}")]
    Catalog(#[from] loopcast_core::CatalogError),
    #[error("required resource missing: {0}")]
    MissingResource(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Loop a folder of videos into a live RTMP stream", long_about = None)]
pub struct Cli {
    /// Path to loopcast.toml (defaults are used when the default path is absent)
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Override paths.video_dir
    #[arg(long)]
    pub video_dir: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    /// Emit debug diagnostics on stderr
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Stream the playlist until interrupted with Ctrl-C
    Stream(StreamArgs),
    /// Show the clips of the next pass in playback order
    Playlist,
    /// Download clips or the bumper from the configured remote source
    #[command(subcommand)]
    Fetch(FetchCommands),
    /// Check that everything needed for a stream is in place
    Health,
}

#[derive(Args, Debug)]
pub struct StreamArgs {
    /// Stream key appended to the RTMP base url
    #[arg(long, env = "LOOPCAST_STREAM_KEY", hide_env_values = true, default_value = "")]
    pub key: String,
    /// Scale output to 9:16 for vertical (shorts) streams
    #[arg(long, default_value_t = false)]
    pub vertical: bool,
}

#[derive(Subcommand, Debug)]
pub enum FetchCommands {
    /// Download the shared folder into the video directory
    Videos(FetchVideosArgs),
    /// Download the bumper clip into the video directory
    Bumper(FetchBumperArgs),
}

#[derive(Args, Debug)]
pub struct FetchVideosArgs {
    /// Folder url overriding fetch.folder_url
    #[arg(long)]
    pub url: Option<String>,
}

#[derive(Args, Debug)]
pub struct FetchBumperArgs {
    /// File id overriding fetch.bumper_file_id
    #[arg(long)]
    pub id: Option<String>,
}

pub fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

pub fn run(cli: Cli) -> Result<()> {
    let context = AppContext::new(&cli)?;

    match &cli.command {
        Commands::Stream(args) => {
            let outcome = context.stream(args)?;
            render(&outcome, cli.format)?;
        }
        Commands::Playlist => {
            let playlist = context.playlist()?;
            render(&playlist, cli.format)?;
        }
        Commands::Fetch(FetchCommands::Videos(args)) => {
            let result = context.fetch_videos(args)?;
            render(&result, cli.format)?;
        }
        Commands::Fetch(FetchCommands::Bumper(args)) => {
            let result = context.fetch_bumper(args)?;
            render(&result, cli.format)?;
        }
        Commands::Health => {
            let report = context.health_check();
            render(&report, cli.format)?;
            if report
                .iter()
                .any(|entry| matches!(entry.status, CheckStatus::Error))
            {
                return Err(AppError::MissingResource(
                    "one or more checks failed".to_string(),
                ));
            }
        }
    }

    Ok(())
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => {
            println!("{}", value.display());
            Ok(())
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{}", json);
            Ok(())
        }
    }
}

trait DisplayFallback {
    fn display(&self) -> String;
}

fn runtime() -> Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?)
}

#[derive(Debug)]
struct AppContext {
    config: LoopcastConfig,
    config_path: Option<PathBuf>,
}

impl AppContext {
    fn new(cli: &Cli) -> Result<Self> {
        let config_path = match &cli.config {
            Some(path) => Some(path.clone()),
            None => Some(PathBuf::from(DEFAULT_CONFIG)).filter(|path| path.exists()),
        };
        let mut config = match &config_path {
            Some(path) => load_loopcast_config(path)?,
            None => LoopcastConfig::default(),
        };
        if let Some(dir) = &cli.video_dir {
            config.paths.video_dir = dir.clone();
        }
        debug!(
            config = ?config_path,
            video_dir = %config.video_dir().display(),
            "configuration resolved"
        );
        Ok(Self {
            config,
            config_path,
        })
    }

    fn catalog(&self) -> ClipCatalog {
        ClipCatalog::new(
            self.config.video_dir(),
            self.config.paths.bumper_file.clone(),
            &self.config.transcoder.extensions,
        )
    }

    fn stream(&self, args: &StreamArgs) -> Result<StreamOutcome> {
        let mode = if args.vertical {
            AspectMode::Vertical
        } else {
            AspectMode::Standard
        };
        let request = StartRequest {
            stream_key: args.key.clone(),
            mode,
        };

        runtime()?.block_on(async {
            let mut controller = StreamController::new(self.config.clone(), None);
            let run_id = controller.start(request)?;

            let shutdown = tokio::signal::ctrl_c();
            tokio::pin!(shutdown);
            loop {
                tokio::select! {
                    signal = &mut shutdown => {
                        signal?;
                        break;
                    }
                    lines = controller.next_logs() => print_lines(&lines),
                }
            }

            let report = controller.stop().await;
            print_lines(&report.lines);
            Ok::<_, AppError>(StreamOutcome {
                run_id: run_id.to_string(),
                stopped_at: Utc::now(),
                summary: report.summary,
                forced: report.forced,
            })
        })
    }

    fn playlist(&self) -> Result<PlaylistView> {
        let catalog = self.catalog();
        let clips = catalog.list()?;
        Ok(PlaylistView {
            directory: catalog.directory().display().to_string(),
            clips: clips.iter().map(|clip| clip.file_name()).collect(),
            bumper: self.config.paths.bumper_file.clone(),
            bumper_present: catalog.bumper().is_some(),
        })
    }

    fn fetch_videos(&self, args: &FetchVideosArgs) -> Result<FetchResult> {
        let url = args
            .url
            .clone()
            .or_else(|| self.config.fetch.folder_url.clone())
            .ok_or(FetchError::NotConfigured("fetch.folder_url"))?;
        let target = self.config.video_dir().to_path_buf();
        let fetcher = GdownFetcher::from_config(&self.config.fetch);
        runtime()?.block_on(fetcher.fetch_directory(&url, &target))?;
        Ok(FetchResult {
            status: "ok".to_string(),
            source: url,
            target: target.display().to_string(),
        })
    }

    fn fetch_bumper(&self, args: &FetchBumperArgs) -> Result<FetchResult> {
        let id = args
            .id
            .clone()
            .or_else(|| self.config.fetch.bumper_file_id.clone())
            .ok_or(FetchError::NotConfigured("fetch.bumper_file_id"))?;
        let target = self.config.bumper_path();
        let fetcher = GdownFetcher::from_config(&self.config.fetch);
        runtime()?.block_on(fetcher.fetch_single_file(&id, &target))?;
        Ok(FetchResult {
            status: "ok".to_string(),
            source: id,
            target: target.display().to_string(),
        })
    }

    fn health_check(&self) -> Vec<HealthEntry> {
        let mut results = Vec::new();
        results.push(match &self.config_path {
            Some(path) => HealthEntry::ok("config", path.display().to_string()),
            None => HealthEntry::warn("config", "no config file, using defaults"),
        });
        results.push(self.check_directory("video_dir", self.config.video_dir()));

        let bumper = self.config.bumper_path();
        results.push(if bumper.is_file() {
            HealthEntry::ok("bumper", bumper.display().to_string())
        } else {
            HealthEntry::error(
                "bumper",
                format!("{} missing, run `fetch bumper`", bumper.display()),
            )
        });

        results.push(match self.catalog().list() {
            Ok(clips) if clips.is_empty() => HealthEntry::warn("clips", "no videos yet"),
            Ok(clips) => HealthEntry::ok("clips", format!("{} videos", clips.len())),
            Err(err) => HealthEntry::error("clips", err.to_string()),
        });

        results.push(self.check_program("transcoder", &self.config.transcoder.program, true));
        results.push(self.check_program("fetcher", &self.config.fetch.program, false));
        results
    }

    fn check_directory(&self, name: &str, path: &Path) -> HealthEntry {
        match fs::metadata(path) {
            Ok(meta) if meta.is_dir() => HealthEntry::ok(name, path.display().to_string()),
            Ok(_) => HealthEntry::error(name, format!("{} is not a directory", path.display())),
            Err(_) => HealthEntry::warn(name, format!("{} not found", path.display())),
        }
    }

    fn check_program(&self, name: &str, program: &Path, required: bool) -> HealthEntry {
        match locate_program(program) {
            Some(found) => HealthEntry::ok(name, found.display().to_string()),
            None if required => {
                HealthEntry::error(name, format!("{} not found on PATH", program.display()))
            }
            None => HealthEntry::warn(name, format!("{} not found on PATH", program.display())),
        }
    }
}

fn print_lines(lines: &[LogLine]) {
    for line in lines {
        println!("{}", line.text);
    }
}

fn locate_program(program: &Path) -> Option<PathBuf> {
    if program.components().count() > 1 {
        return program.is_file().then(|| program.to_path_buf());
    }
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

#[derive(Debug, Serialize)]
pub struct StreamOutcome {
    pub run_id: String,
    pub stopped_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<RunSummary>,
    pub forced: bool,
}

impl DisplayFallback for StreamOutcome {
    fn display(&self) -> String {
        let mut lines = vec![format!(
            "Run {} stopped at {}",
            self.run_id,
            self.stopped_at.to_rfc3339()
        )];
        if let Some(summary) = &self.summary {
            lines.push(format!(
                "  passes={} clips={} bumpers={} failures={}",
                summary.passes, summary.clips_played, summary.bumpers_played, summary.failures
            ));
        }
        if self.forced {
            lines.push("  run ignored stop and was aborted".to_string());
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct PlaylistView {
    pub directory: String,
    pub clips: Vec<String>,
    pub bumper: String,
    pub bumper_present: bool,
}

impl DisplayFallback for PlaylistView {
    fn display(&self) -> String {
        let mut lines = Vec::new();
        if self.clips.is_empty() {
            lines.push(format!("No videos in {} yet", self.directory));
        } else {
            lines.push("Videos:".to_string());
            for clip in &self.clips {
                lines.push(format!("  - {clip}"));
            }
        }
        if self.bumper_present {
            lines.push(format!("Bumper: {}", self.bumper));
        } else {
            lines.push(format!("Bumper: {} (not downloaded)", self.bumper));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct FetchResult {
    pub status: String,
    pub source: String,
    pub target: String,
}

impl DisplayFallback for FetchResult {
    fn display(&self) -> String {
        format!("Downloaded {} into {}", self.source, self.target)
    }
}

impl DisplayFallback for Vec<HealthEntry> {
    fn display(&self) -> String {
        let mut lines = Vec::new();
        for entry in self {
            lines.push(format!(
                "[{status}] {name}: {detail}",
                status = entry.status,
                name = entry.name,
                detail = entry.detail
            ));
        }
        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct HealthEntry {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

#[derive(Debug, Serialize)]
pub enum CheckStatus {
    #[serde(rename = "ok")]
    Ok,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "error")]
    Error,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CheckStatus::Ok => "OK",
            CheckStatus::Warn => "WARN",
            CheckStatus::Error => "ERROR",
        };
        write!(f, "{}", label)
    }
}

impl HealthEntry {
    fn ok(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Ok,
            detail: detail.into(),
        }
    }

    fn warn(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Warn,
            detail: detail.into(),
        }
    }

    fn error(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: CheckStatus::Error,
            detail: detail.into(),
        }
    }
}
