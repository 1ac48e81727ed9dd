use std::fmt;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::cancel::CancellationToken;
use crate::catalog::{Clip, ClipCatalog};
use crate::config::PlaylistSection;
use crate::log_sink::LogSink;
use crate::transcoder::{ClipOutcome, ClipPlayer, StreamTarget};

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub empty_backoff: Duration,
    pub clip_pause: Duration,
    pub reminder: String,
}

impl SchedulerSettings {
    pub fn from_config(section: &PlaylistSection) -> Self {
        Self {
            empty_backoff: section.empty_backoff(),
            clip_pause: section.clip_pause(),
            reminder: section.reminder.clone(),
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from_config(&PlaylistSection::default())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    #[default]
    Idle,
    Running,
    Cancelled,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SchedulerState::Idle => "idle",
            SchedulerState::Running => "running",
            SchedulerState::Cancelled => "cancelled",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub passes: u64,
    pub clips_played: u64,
    pub bumpers_played: u64,
    pub failures: u64,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunProgress {
    pub state: SchedulerState,
    pub current: Option<Clip>,
    pub summary: RunSummary,
}

/// Shared view of a scheduler's progress, readable while the run is live.
#[derive(Debug, Clone, Default)]
pub struct ProgressHandle {
    inner: Arc<Mutex<RunProgress>>,
}

impl ProgressHandle {
    pub fn snapshot(&self) -> RunProgress {
        self.lock().clone()
    }

    fn update(&self, apply: impl FnOnce(&mut RunProgress)) {
        apply(&mut self.lock());
    }

    fn lock(&self) -> MutexGuard<'_, RunProgress> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Loops over the catalog forever, bumper before every main clip, until the
/// cancellation token is set.
pub struct PlaylistScheduler {
    catalog: ClipCatalog,
    player: Arc<dyn ClipPlayer>,
    target: StreamTarget,
    settings: SchedulerSettings,
    cancel: CancellationToken,
    sink: LogSink,
    progress: ProgressHandle,
}

impl fmt::Debug for PlaylistScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaylistScheduler")
            .field("catalog", &self.catalog)
            .field("target", &self.target)
            .field("settings", &self.settings)
            .finish()
    }
}

impl PlaylistScheduler {
    pub fn new(
        catalog: ClipCatalog,
        player: Arc<dyn ClipPlayer>,
        target: StreamTarget,
        settings: SchedulerSettings,
        cancel: CancellationToken,
        sink: LogSink,
    ) -> Self {
        Self {
            catalog,
            player,
            target,
            settings,
            cancel,
            sink,
            progress: ProgressHandle::default(),
        }
    }

    pub fn progress(&self) -> ProgressHandle {
        self.progress.clone()
    }

    pub async fn run(&self) -> RunSummary {
        self.progress.update(|progress| progress.state = SchedulerState::Running);
        info!(
            directory = %self.catalog.directory().display(),
            mode = %self.target.mode(),
            "playlist run started"
        );

        while !self.cancel.is_set() {
            let clips = match self.catalog.list() {
                Ok(clips) => clips,
                Err(error) => {
                    warn!(%error, "clip catalog unavailable");
                    self.notice(format!("failed to read clip directory: {error}"));
                    Vec::new()
                }
            };

            if clips.is_empty() {
                self.notice(format!(
                    "no videos found in {}",
                    self.catalog.directory().display()
                ));
                self.pause(self.settings.empty_backoff).await;
                continue;
            }

            self.progress.update(|progress| progress.summary.passes += 1);
            if self.play_pass(&clips).await.is_continue() {
                self.notice("playlist complete, restarting from the top");
            }
        }

        self.progress.update(|progress| {
            progress.state = SchedulerState::Cancelled;
            progress.current = None;
            progress.summary.cancelled = true;
        });
        self.notice("stream stopped");
        let summary = self.progress.snapshot().summary;
        info!(
            passes = summary.passes,
            clips = summary.clips_played,
            failures = summary.failures,
            "playlist run finished"
        );
        summary
    }

    async fn play_pass(&self, clips: &[Clip]) -> ControlFlow<()> {
        for clip in clips {
            if self.cancel.is_set() {
                return ControlFlow::Break(());
            }
            self.play_bumper().await?;
            if self.cancel.is_set() {
                return ControlFlow::Break(());
            }

            let name = clip.file_name();
            self.notice(format!("now playing: {name}"));
            self.play_clip(clip).await?;
            self.progress.update(|progress| progress.summary.clips_played += 1);
            self.notice(format!("finished: {name}"));

            self.notice(self.settings.reminder.clone());
            self.pause(self.settings.clip_pause).await;
        }
        if self.cancel.is_set() {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    }

    async fn play_bumper(&self) -> ControlFlow<()> {
        let Some(bumper) = self.catalog.bumper() else {
            self.notice("bumper not found, skipping");
            return ControlFlow::Continue(());
        };
        self.notice("playing bumper");
        self.play_clip(&bumper).await?;
        self.progress.update(|progress| progress.summary.bumpers_played += 1);
        self.notice("bumper finished");
        ControlFlow::Continue(())
    }

    /// Breaks only when the clip was interrupted by cancellation. Failed
    /// clips are recorded and the pass moves on.
    async fn play_clip(&self, clip: &Clip) -> ControlFlow<()> {
        self.progress
            .update(|progress| progress.current = Some(clip.clone()));
        let result = self
            .player
            .play(clip, &self.target, &self.cancel, &self.sink)
            .await;
        self.progress.update(|progress| progress.current = None);

        match result {
            Ok(ClipOutcome::Cancelled) => ControlFlow::Break(()),
            Ok(ClipOutcome::Exited { success: true, .. }) => ControlFlow::Continue(()),
            Ok(ClipOutcome::Exited { code, .. }) => {
                self.record_failure();
                let status = code.map_or_else(|| "signal".to_string(), |code| code.to_string());
                self.sink
                    .push(format!("transcoder exited with status {status}"));
                ControlFlow::Continue(())
            }
            Err(error) => {
                warn!(clip = %clip.path.display(), %error, "transcoder launch failed");
                self.record_failure();
                self.sink
                    .push(format!("failed to play {}: {error}", clip.file_name()));
                ControlFlow::Continue(())
            }
        }
    }

    fn record_failure(&self) {
        self.progress.update(|progress| progress.summary.failures += 1);
    }

    async fn pause(&self, duration: Duration) {
        tokio::select! {
            _ = sleep(duration) => {}
            _ = self.cancel.cancelled() => {}
        }
    }

    fn notice(&self, text: impl Into<String>) {
        let text = text.into();
        info!(target: "playlist", "{text}");
        self.sink.push(text);
    }
}
