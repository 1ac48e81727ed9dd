use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio_stream::{Stream, StreamExt};
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, FramedRead};
use tracing::{debug, info, warn};
use url::Url;

#[cfg(unix)]
use std::fs::File;
#[cfg(unix)]
use std::os::fd::OwnedFd;
#[cfg(unix)]
use tokio::net::unix::pipe;

use crate::cancel::CancellationToken;
use crate::catalog::{Clip, ClipKind};
use crate::config::TranscoderSection;
use crate::log_sink::LogSink;

const MAX_LINE_BYTES: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: PathBuf,
        source: std::io::Error,
    },
    #[error("transcoder {0} pipe was not captured")]
    MissingPipe(&'static str),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum TargetError {
    #[error("stream key is empty")]
    EmptyKey,
    #[error("invalid stream url {url}: {source}")]
    InvalidUrl {
        url: String,
        source: url::ParseError,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AspectMode {
    #[default]
    Standard,
    Vertical,
}

impl fmt::Display for AspectMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AspectMode::Standard => write!(f, "standard"),
            AspectMode::Vertical => write!(f, "vertical"),
        }
    }
}

/// Where a run sends its output. Fixed for the lifetime of the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamTarget {
    url: String,
    mode: AspectMode,
}

impl StreamTarget {
    pub fn from_key(base_url: &str, stream_key: &str, mode: AspectMode) -> Result<Self, TargetError> {
        let key = stream_key.trim();
        if key.is_empty() {
            return Err(TargetError::EmptyKey);
        }
        let url = format!("{}/{}", base_url.trim_end_matches('/'), key);
        Url::parse(&url).map_err(|source| TargetError::InvalidUrl {
            url: url.clone(),
            source,
        })?;
        Ok(Self { url, mode })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn mode(&self) -> AspectMode {
        self.mode
    }
}

/// Fixed encoder settings handed to the transcoder for every clip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodingParams {
    pub video_codec: String,
    pub preset: String,
    pub video_bitrate: String,
    pub maxrate: String,
    pub bufsize: String,
    pub gop: u32,
    pub keyint_min: u32,
    pub audio_codec: String,
    pub audio_bitrate: String,
    pub format: String,
    pub vertical_scale: String,
}

impl EncodingParams {
    pub fn from_config(section: &TranscoderSection) -> Self {
        Self {
            video_codec: section.video_codec.clone(),
            preset: section.preset.clone(),
            video_bitrate: section.video_bitrate.clone(),
            maxrate: section.maxrate.clone(),
            bufsize: section.bufsize.clone(),
            gop: section.gop,
            keyint_min: section.keyint_min,
            audio_codec: section.audio_codec.clone(),
            audio_bitrate: section.audio_bitrate.clone(),
            format: section.format.clone(),
            vertical_scale: section.vertical_scale.clone(),
        }
    }
}

impl Default for EncodingParams {
    fn default() -> Self {
        Self::from_config(&TranscoderSection::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl Invocation {
    pub fn build(
        program: &Path,
        input: &Path,
        target: &StreamTarget,
        params: &EncodingParams,
    ) -> Self {
        let mut args: Vec<OsString> = vec![
            "-re".into(),
            "-i".into(),
            input.as_os_str().to_os_string(),
            "-c:v".into(),
            params.video_codec.clone().into(),
            "-preset".into(),
            params.preset.clone().into(),
            "-b:v".into(),
            params.video_bitrate.clone().into(),
            "-maxrate".into(),
            params.maxrate.clone().into(),
            "-bufsize".into(),
            params.bufsize.clone().into(),
            "-g".into(),
            params.gop.to_string().into(),
            "-keyint_min".into(),
            params.keyint_min.to_string().into(),
            "-c:a".into(),
            params.audio_codec.clone().into(),
            "-b:a".into(),
            params.audio_bitrate.clone().into(),
            "-f".into(),
            params.format.clone().into(),
        ];
        if target.mode() == AspectMode::Vertical {
            args.push("-vf".into());
            args.push(format!("scale={}", params.vertical_scale).into());
        }
        args.push(target.url().into());
        Self {
            program: program.to_path_buf(),
            args,
        }
    }

    pub fn command_line(&self) -> String {
        let mut parts = vec![self.program.display().to_string()];
        parts.extend(self.args.iter().map(|arg| arg.to_string_lossy().into_owned()));
        parts.join(" ")
    }
}

pub trait CommandFactory: Send + Sync {
    fn command(&self, invocation: &Invocation) -> Command;
}

#[derive(Debug, Default)]
pub struct SystemCommandFactory;

impl CommandFactory for SystemCommandFactory {
    fn command(&self, invocation: &Invocation) -> Command {
        let mut command = Command::new(&invocation.program);
        command.args(&invocation.args);
        command
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum ClipOutcome {
    Exited { code: Option<i32>, success: bool },
    Cancelled,
}

impl ClipOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, ClipOutcome::Exited { success: false, .. })
    }
}

/// Plays one clip to the stream target. The scheduler only sees this seam.
#[async_trait]
pub trait ClipPlayer: Send + Sync {
    async fn play(
        &self,
        clip: &Clip,
        target: &StreamTarget,
        cancel: &CancellationToken,
        sink: &LogSink,
    ) -> Result<ClipOutcome, RunnerError>;
}

pub struct ClipRunner {
    program: PathBuf,
    params: EncodingParams,
    factory: Arc<dyn CommandFactory>,
}

impl fmt::Debug for ClipRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClipRunner")
            .field("program", &self.program)
            .field("params", &self.params)
            .finish()
    }
}

impl ClipRunner {
    pub fn new(
        program: impl Into<PathBuf>,
        params: EncodingParams,
        factory: Option<Arc<dyn CommandFactory>>,
    ) -> Self {
        let factory = factory.unwrap_or_else(|| Arc::new(SystemCommandFactory));
        Self {
            program: program.into(),
            params,
            factory,
        }
    }

    pub fn from_config(section: &TranscoderSection) -> Self {
        Self::new(&section.program, EncodingParams::from_config(section), None)
    }

    pub fn invocation(&self, input: &Path, target: &StreamTarget) -> Invocation {
        Invocation::build(&self.program, input, target, &self.params)
    }

    /// Streams one clip and reaps the transcoder on every path.
    ///
    /// Output lines are forwarded to `sink` as they arrive, split on both
    /// `\n` and `\r` so progress updates show up. On Unix stdout and stderr
    /// share one pipe, so lines keep the order the transcoder wrote them in.
    /// Once `cancel` is set the process is killed and nothing more is
    /// forwarded.
    pub async fn run(
        &self,
        clip: &Clip,
        target: &StreamTarget,
        cancel: &CancellationToken,
        sink: &LogSink,
    ) -> Result<ClipOutcome, RunnerError> {
        let invocation = self.invocation(&clip.path, target);
        let label = match clip.kind {
            ClipKind::Bumper => "CMD Bumper",
            ClipKind::Main => "CMD",
        };
        sink.push(format!("{label}: {}", invocation.command_line()));

        let mut command = self.factory.command(&invocation);
        command.stdin(Stdio::null()).kill_on_drop(true);

        #[cfg(unix)]
        {
            let reader = combined_output(&mut command)?;
            let child = spawn(command, &invocation, clip)?;
            let output = FramedRead::new(reader, line_codec());
            return forward_output(output, child, clip, cancel, sink).await;
        }

        #[cfg(not(unix))]
        {
            command.stdout(Stdio::piped()).stderr(Stdio::piped());
            let mut child = spawn(command, &invocation, clip)?;
            let stdout = child.stdout.take().ok_or(RunnerError::MissingPipe("stdout"))?;
            let stderr = child.stderr.take().ok_or(RunnerError::MissingPipe("stderr"))?;
            let output =
                FramedRead::new(stdout, line_codec()).merge(FramedRead::new(stderr, line_codec()));
            return forward_output(output, child, clip, cancel, sink).await;
        }
    }
}

#[async_trait]
impl ClipPlayer for ClipRunner {
    async fn play(
        &self,
        clip: &Clip,
        target: &StreamTarget,
        cancel: &CancellationToken,
        sink: &LogSink,
    ) -> Result<ClipOutcome, RunnerError> {
        self.run(clip, target, cancel, sink).await
    }
}

/// Points stdout and stderr at the write end of a single pipe.
#[cfg(unix)]
fn combined_output(command: &mut Command) -> std::io::Result<pipe::Receiver> {
    let (reader, writer) = std::io::pipe()?;
    command.stdout(writer.try_clone()?).stderr(writer);
    pipe::Receiver::from_file(File::from(OwnedFd::from(reader)))
}

/// Spawns the child and drops `command`, closing the parent's copies of the
/// output pipe so the reader sees end-of-file once the child exits.
fn spawn(mut command: Command, invocation: &Invocation, clip: &Clip) -> Result<Child, RunnerError> {
    let child = command.spawn().map_err(|source| RunnerError::Spawn {
        program: invocation.program.clone(),
        source,
    })?;
    info!(clip = %clip.path.display(), pid = child.id(), "transcoder started");
    Ok(child)
}

async fn forward_output<S, B>(
    mut output: S,
    mut child: Child,
    clip: &Clip,
    cancel: &CancellationToken,
    sink: &LogSink,
) -> Result<ClipOutcome, RunnerError>
where
    S: Stream<Item = Result<B, AnyDelimiterCodecError>> + Unpin,
    B: AsRef<[u8]>,
{
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(kill_child(&mut child, clip).await),
            next = output.next() => match next {
                Some(Ok(chunk)) => {
                    let text = String::from_utf8_lossy(chunk.as_ref());
                    let line = text.trim();
                    if line.is_empty() {
                        continue;
                    }
                    debug!(target: "transcoder", "{line}");
                    sink.push(line);
                }
                Some(Err(AnyDelimiterCodecError::MaxChunkLengthExceeded)) => {
                    warn!(clip = %clip.path.display(), "transcoder output line too long, dropped");
                }
                Some(Err(AnyDelimiterCodecError::Io(error))) => {
                    warn!(clip = %clip.path.display(), %error, "failed to read transcoder output");
                    break;
                }
                None => break,
            }
        }
    }

    // Pipes can close before the process exits.
    let status = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        status = child.wait() => Some(status?),
    };
    let Some(status) = status else {
        return Ok(kill_child(&mut child, clip).await);
    };
    if status.success() {
        info!(clip = %clip.path.display(), "transcoder exited");
    } else {
        warn!(clip = %clip.path.display(), status = status.code(), "transcoder exited with failure");
    }
    Ok(ClipOutcome::Exited {
        code: status.code(),
        success: status.success(),
    })
}

/// Kills the child and waits for it, so no zombie is left behind.
async fn kill_child(child: &mut Child, clip: &Clip) -> ClipOutcome {
    match child.kill().await {
        Ok(()) => info!(clip = %clip.path.display(), "transcoder killed on cancellation"),
        Err(error) => warn!(clip = %clip.path.display(), %error, "failed to kill transcoder"),
    }
    ClipOutcome::Cancelled
}

fn line_codec() -> AnyDelimiterCodec {
    AnyDelimiterCodec::new_with_max_length(b"\r\n".to_vec(), Vec::new(), MAX_LINE_BYTES)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct ScriptFactory {
        script: String,
    }

    impl CommandFactory for ScriptFactory {
        fn command(&self, _invocation: &Invocation) -> Command {
            let mut command = Command::new("sh");
            command.arg("-c").arg(&self.script);
            command
        }
    }

    fn target(mode: AspectMode) -> StreamTarget {
        StreamTarget::from_key("rtmp://a.rtmp.youtube.com/live2", "K", mode).unwrap()
    }

    #[test]
    fn outcomes_serialize_with_tag() {
        let exited = serde_json::to_value(ClipOutcome::Exited {
            code: Some(1),
            success: false,
        })
        .unwrap();
        assert_eq!(exited["outcome"], "exited");
        assert_eq!(exited["code"], 1);
        assert!(ClipOutcome::Exited {
            code: Some(1),
            success: false
        }
        .is_failure());

        let cancelled = serde_json::to_value(ClipOutcome::Cancelled).unwrap();
        assert_eq!(cancelled["outcome"], "cancelled");
        assert!(!ClipOutcome::Cancelled.is_failure());
    }

    fn runner(script: &str) -> ClipRunner {
        ClipRunner::new(
            "ffmpeg",
            EncodingParams::default(),
            Some(Arc::new(ScriptFactory {
                script: script.to_string(),
            })),
        )
    }

    fn texts(sink: &LogSink) -> Vec<String> {
        sink.drain_all().into_iter().map(|line| line.text).collect()
    }

    #[test]
    fn target_url_interpolates_key() {
        let target = StreamTarget::from_key("rtmp://example.test/live2/", " abc ", AspectMode::Standard)
            .unwrap();
        assert_eq!(target.url(), "rtmp://example.test/live2/abc");
        assert!(matches!(
            StreamTarget::from_key("rtmp://example.test/live2", "  ", AspectMode::Standard),
            Err(TargetError::EmptyKey)
        ));
        assert!(matches!(
            StreamTarget::from_key("not a url", "abc", AspectMode::Standard),
            Err(TargetError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn invocation_matches_streaming_contract() {
        let invocation = Invocation::build(
            Path::new("ffmpeg"),
            Path::new("videos/a.mp4"),
            &target(AspectMode::Standard),
            &EncodingParams::default(),
        );
        assert_eq!(
            invocation.command_line(),
            "ffmpeg -re -i videos/a.mp4 -c:v libx264 -preset veryfast -b:v 2500k \
             -maxrate 2500k -bufsize 5000k -g 60 -keyint_min 60 -c:a aac -b:a 128k \
             -f flv rtmp://a.rtmp.youtube.com/live2/K"
        );
    }

    #[test]
    fn vertical_mode_adds_scale_filter_before_destination() {
        let invocation = Invocation::build(
            Path::new("ffmpeg"),
            Path::new("a.mp4"),
            &target(AspectMode::Vertical),
            &EncodingParams::default(),
        );
        let tail: Vec<String> = invocation
            .args
            .iter()
            .rev()
            .take(3)
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        assert_eq!(tail, vec!["rtmp://a.rtmp.youtube.com/live2/K", "scale=720:1280", "-vf"]);
    }

    #[tokio::test]
    async fn forwards_combined_output_and_reports_exit_code() {
        let sink = LogSink::new();
        let outcome = runner("echo out-line; echo err-line >&2; exit 3")
            .run(
                &Clip::main("a.mp4"),
                &target(AspectMode::Standard),
                &CancellationToken::new(),
                &sink,
            )
            .await
            .unwrap();

        assert_eq!(
            outcome,
            ClipOutcome::Exited {
                code: Some(3),
                success: false
            }
        );
        let lines = texts(&sink);
        assert!(lines[0].starts_with("CMD: ffmpeg -re -i a.mp4"));
        assert_eq!(&lines[1..], &["out-line", "err-line"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn interleaved_stdout_and_stderr_keep_write_order() {
        let sink = LogSink::new();
        let script = "i=0; while [ $i -lt 300 ]; do echo o$i; echo e$i >&2; i=$((i+1)); done";
        runner(script)
            .run(
                &Clip::main("a.mp4"),
                &target(AspectMode::Standard),
                &CancellationToken::new(),
                &sink,
            )
            .await
            .unwrap();

        let expected: Vec<String> = (0..300)
            .flat_map(|i| [format!("o{i}"), format!("e{i}")])
            .collect();
        assert_eq!(&texts(&sink)[1..], expected.as_slice());
    }

    #[cfg(unix)]
    #[test]
    fn invocation_keeps_non_utf8_input_path() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let input = Path::new(OsStr::from_bytes(b"videos/caf\xe9.mp4"));
        let invocation = Invocation::build(
            Path::new("ffmpeg"),
            input,
            &target(AspectMode::Standard),
            &EncodingParams::default(),
        );
        assert_eq!(invocation.args[2], input.as_os_str());
    }

    #[tokio::test]
    async fn killed_child_is_reaped() {
        let mut child = Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap();

        let outcome = kill_child(&mut child, &Clip::main("a.mp4")).await;

        assert_eq!(outcome, ClipOutcome::Cancelled);
        assert!(child.try_wait().unwrap().is_some());
    }

    #[tokio::test]
    async fn carriage_returns_split_progress_updates() {
        let sink = LogSink::new();
        runner("printf 'frame=1\\rframe=2\\r\\nDone\\n' >&2")
            .run(
                &Clip::bumper("bumper.mp4"),
                &target(AspectMode::Standard),
                &CancellationToken::new(),
                &sink,
            )
            .await
            .unwrap();
        let lines = texts(&sink);
        assert!(lines[0].starts_with("CMD Bumper: "));
        assert_eq!(&lines[1..], &["frame=1", "frame=2", "Done"]);
    }

    #[tokio::test]
    async fn cancellation_kills_chatty_transcoder() {
        let sink = LogSink::new();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.set();
        });

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            runner("while true; do echo tick; sleep 0.02; done").run(
                &Clip::main("a.mp4"),
                &target(AspectMode::Standard),
                &cancel,
                &sink,
            ),
        )
        .await
        .expect("runner should return promptly")
        .unwrap();

        assert_eq!(outcome, ClipOutcome::Cancelled);
        let forwarded = sink.len();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sink.len(), forwarded);
    }

    #[tokio::test]
    async fn cancellation_kills_silent_transcoder() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.set();
        });

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            runner("sleep 30").run(
                &Clip::main("a.mp4"),
                &target(AspectMode::Standard),
                &cancel,
                &LogSink::new(),
            ),
        )
        .await
        .expect("hung transcoder must not block cancellation")
        .unwrap();
        assert_eq!(outcome, ClipOutcome::Cancelled);
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let runner = ClipRunner::new(
            "/nonexistent/loopcast-transcoder",
            EncodingParams::default(),
            None,
        );
        let sink = LogSink::new();
        let result = runner
            .run(
                &Clip::main("a.mp4"),
                &target(AspectMode::Standard),
                &CancellationToken::new(),
                &sink,
            )
            .await;
        assert!(matches!(result, Err(RunnerError::Spawn { .. })));
        assert_eq!(sink.len(), 1);
    }
}
