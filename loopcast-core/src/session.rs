use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cancel::CancellationToken;
use crate::catalog::ClipCatalog;
use crate::config::LoopcastConfig;
use crate::log_sink::{LogLine, LogSink, LogTail};
use crate::scheduler::{
    PlaylistScheduler, ProgressHandle, RunSummary, SchedulerSettings, SchedulerState,
};
use crate::transcoder::{AspectMode, ClipPlayer, ClipRunner, StreamTarget, TargetError};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("stream key is required")]
    MissingStreamKey,
    #[error("bumper clip not found at {0}, fetch it before starting")]
    MissingBumper(PathBuf),
    #[error("stream run {0} is already active")]
    AlreadyRunning(Uuid),
    #[error("invalid stream target: {0}")]
    InvalidTarget(TargetError),
    #[error("start must be called from within a tokio runtime")]
    NoRuntime,
}

impl From<TargetError> for SessionError {
    fn from(error: TargetError) -> Self {
        match error {
            TargetError::EmptyKey => SessionError::MissingStreamKey,
            other => SessionError::InvalidTarget(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StartRequest {
    pub stream_key: String,
    pub mode: AspectMode,
}

#[derive(Debug, Clone, Serialize)]
pub struct StopReport {
    pub run_id: Option<Uuid>,
    pub summary: Option<RunSummary>,
    /// The run ignored cancellation past the grace period and was aborted.
    pub forced: bool,
    /// Every line the run produced that had not been drained before stop.
    #[serde(skip)]
    pub lines: Vec<LogLine>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub running: bool,
    pub run_id: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub mode: Option<AspectMode>,
    pub state: SchedulerState,
    pub current_clip: Option<String>,
    pub summary: Option<RunSummary>,
}

/// Everything owned by one Start-to-Stop lifecycle.
struct RunHandle {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    mode: AspectMode,
    sink: LogSink,
    progress: ProgressHandle,
    task: JoinHandle<RunSummary>,
}

/// Starts and stops playlist runs. At most one run is live at a time.
pub struct StreamController {
    config: LoopcastConfig,
    player: Arc<dyn ClipPlayer>,
    cancel: CancellationToken,
    active: Option<RunHandle>,
    tail: LogTail,
}

impl fmt::Debug for StreamController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamController")
            .field("config", &self.config)
            .field("active", &self.active.as_ref().map(|run| run.run_id))
            .finish()
    }
}

impl StreamController {
    pub fn new(config: LoopcastConfig, player: Option<Arc<dyn ClipPlayer>>) -> Self {
        let player = player
            .unwrap_or_else(|| Arc::new(ClipRunner::from_config(&config.transcoder)));
        let tail = LogTail::new(config.stream.log_tail_lines);
        Self {
            config,
            player,
            cancel: CancellationToken::new(),
            active: None,
            tail,
        }
    }

    pub fn config(&self) -> &LoopcastConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.active
            .as_ref()
            .map(|run| !run.task.is_finished())
            .unwrap_or(false)
    }

    pub fn stop_requested(&self) -> bool {
        self.cancel.is_set()
    }

    /// Validates the request and spawns the scheduler on a background task
    /// of the current tokio runtime.
    ///
    /// Nothing is mutated when validation fails or no runtime is running.
    pub fn start(&mut self, request: StartRequest) -> Result<Uuid, SessionError> {
        if let Some(run) = &self.active {
            if !run.task.is_finished() {
                return Err(SessionError::AlreadyRunning(run.run_id));
            }
        }
        if request.stream_key.trim().is_empty() {
            return Err(SessionError::MissingStreamKey);
        }
        let bumper = self.config.bumper_path();
        if !bumper.is_file() {
            return Err(SessionError::MissingBumper(bumper));
        }
        let target = StreamTarget::from_key(
            &self.config.stream.rtmp_base_url,
            &request.stream_key,
            request.mode,
        )?;
        let runtime = Handle::try_current().map_err(|_| SessionError::NoRuntime)?;

        if let Some(finished) = self.active.take() {
            self.tail.extend(finished.sink.drain_all());
        }

        self.cancel.clear();
        let sink = LogSink::new();
        let catalog = ClipCatalog::new(
            self.config.video_dir(),
            self.config.paths.bumper_file.clone(),
            &self.config.transcoder.extensions,
        );
        let scheduler = PlaylistScheduler::new(
            catalog,
            Arc::clone(&self.player),
            target,
            SchedulerSettings::from_config(&self.config.playlist),
            self.cancel.clone(),
            sink.clone(),
        );
        let progress = scheduler.progress();
        let task = runtime.spawn(async move { scheduler.run().await });

        let run_id = Uuid::new_v4();
        info!(%run_id, mode = %request.mode, "stream run started");
        self.active = Some(RunHandle {
            run_id,
            started_at: Utc::now(),
            mode: request.mode,
            sink,
            progress,
            task,
        });
        Ok(run_id)
    }

    /// Requests cancellation and waits for the run to acknowledge it.
    ///
    /// Safe to call with no active run. A run still alive after the grace
    /// period is aborted; its transcoder child is killed when dropped.
    pub async fn stop(&mut self) -> StopReport {
        self.cancel.set();
        let Some(run) = self.active.take() else {
            return StopReport {
                run_id: None,
                summary: None,
                forced: false,
                lines: Vec::new(),
            };
        };

        let mut task = run.task;
        let grace = self.config.playlist.stop_grace();
        let (summary, forced) = match tokio::time::timeout(grace, &mut task).await {
            Ok(Ok(summary)) => (Some(summary), false),
            Ok(Err(error)) => {
                warn!(run_id = %run.run_id, %error, "stream run task failed");
                (None, false)
            }
            Err(_) => {
                warn!(run_id = %run.run_id, grace_secs = grace.as_secs(), "stream run ignored stop, aborting");
                task.abort();
                let _ = task.await;
                (None, true)
            }
        };
        let lines = run.sink.drain_all();
        self.tail.extend(lines.iter().cloned());
        info!(run_id = %run.run_id, forced, "stream run stopped");

        StopReport {
            run_id: Some(run.run_id),
            summary,
            forced,
            lines,
        }
    }

    /// Moves lines produced since the last call into the bounded view and
    /// returns them.
    pub fn refresh_logs(&mut self) -> Vec<LogLine> {
        let Some(run) = &self.active else {
            return Vec::new();
        };
        let fresh = run.sink.drain_all();
        self.tail.extend(fresh.iter().cloned());
        fresh
    }

    /// Waits for the active run to produce output, then behaves like
    /// [`refresh_logs`](Self::refresh_logs). Returns at once when idle or
    /// after a stop request.
    pub async fn next_logs(&mut self) -> Vec<LogLine> {
        if let Some(run) = &self.active {
            tokio::select! {
                _ = run.sink.wait_for_lines() => {}
                _ = self.cancel.cancelled() => {}
            }
        }
        self.refresh_logs()
    }

    pub fn log_view(&self) -> Vec<LogLine> {
        self.tail.lines()
    }

    pub fn render_logs(&self) -> String {
        self.tail.render()
    }

    pub fn status(&self) -> SessionStatus {
        match &self.active {
            Some(run) => {
                let progress = run.progress.snapshot();
                SessionStatus {
                    running: !run.task.is_finished(),
                    run_id: Some(run.run_id),
                    started_at: Some(run.started_at),
                    mode: Some(run.mode),
                    state: progress.state,
                    current_clip: progress.current.map(|clip| clip.file_name()),
                    summary: Some(progress.summary),
                }
            }
            None => SessionStatus {
                running: false,
                run_id: None,
                started_at: None,
                mode: None,
                state: SchedulerState::Idle,
                current_clip: None,
                summary: None,
            },
        }
    }
}

impl Drop for StreamController {
    fn drop(&mut self) {
        if let Some(run) = &self.active {
            self.cancel.set();
            run.task.abort();
        }
    }
}
