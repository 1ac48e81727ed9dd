pub mod cancel;
pub mod catalog;
pub mod config;
pub mod error;
pub mod fetch;
pub mod log_sink;
pub mod scheduler;
pub mod session;
pub mod transcoder;

pub use cancel::CancellationToken;
pub use catalog::{CatalogError, Clip, ClipCatalog, ClipKind};
pub use config::{
    load_loopcast_config, FetchSection, LoopcastConfig, PathsSection, PlaylistSection,
    StreamSection, TranscoderSection,
};
pub use error::{ConfigError, Result};
pub use fetch::{CommandExecutor, FetchError, Fetcher, GdownFetcher, SystemCommandExecutor};
pub use log_sink::{LogLine, LogSink, LogTail};
pub use scheduler::{
    PlaylistScheduler, ProgressHandle, RunProgress, RunSummary, SchedulerSettings, SchedulerState,
};
pub use session::{SessionError, SessionStatus, StartRequest, StopReport, StreamController};
pub use transcoder::{
    AspectMode, ClipOutcome, ClipPlayer, ClipRunner, CommandFactory, EncodingParams, Invocation,
    RunnerError, StreamTarget, SystemCommandFactory, TargetError,
};
