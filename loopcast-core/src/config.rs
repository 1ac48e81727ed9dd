use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoopcastConfig {
    #[serde(default)]
    pub paths: PathsSection,
    #[serde(default)]
    pub stream: StreamSection,
    #[serde(default)]
    pub transcoder: TranscoderSection,
    #[serde(default)]
    pub playlist: PlaylistSection,
    #[serde(default)]
    pub fetch: FetchSection,
}

impl LoopcastConfig {
    pub fn video_dir(&self) -> &Path {
        &self.paths.video_dir
    }

    /// Full path of the bumper clip; it always lives inside the video directory.
    pub fn bumper_path(&self) -> PathBuf {
        self.paths.video_dir.join(&self.paths.bumper_file)
    }

    /// Rejects values that deserialize fine but cannot drive a stream.
    pub fn validate(&self) -> std::result::Result<(), &'static str> {
        let bumper = Path::new(&self.paths.bumper_file);
        if self.paths.bumper_file.is_empty() || bumper.components().count() != 1 {
            return Err("paths.bumper_file must be a plain file name");
        }
        if self.transcoder.extensions.is_empty() {
            return Err("transcoder.extensions must list at least one extension");
        }
        if self.stream.log_tail_lines == 0 {
            return Err("stream.log_tail_lines must be at least 1");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsSection {
    pub video_dir: PathBuf,
    pub bumper_file: String,
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            video_dir: PathBuf::from("videos"),
            bumper_file: "bumper.mp4".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamSection {
    pub rtmp_base_url: String,
    pub log_tail_lines: usize,
}

impl Default for StreamSection {
    fn default() -> Self {
        Self {
            rtmp_base_url: "rtmp://a.rtmp.youtube.com/live2".to_string(),
            log_tail_lines: 20,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TranscoderSection {
    pub program: PathBuf,
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
    pub extensions: Vec<String>,
}

impl Default for TranscoderSection {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ffmpeg"),
            video_codec: "libx264".to_string(),
            preset: "veryfast".to_string(),
            video_bitrate: "2500k".to_string(),
            maxrate: "2500k".to_string(),
            bufsize: "5000k".to_string(),
            gop: 60,
            keyint_min: 60,
            audio_codec: "aac".to_string(),
            audio_bitrate: "128k".to_string(),
            format: "flv".to_string(),
            vertical_scale: "720:1280".to_string(),
            extensions: vec!["mp4".to_string(), "flv".to_string()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlaylistSection {
    pub empty_backoff_secs: u64,
    pub clip_pause_secs: u64,
    pub reminder: String,
    pub stop_grace_secs: u64,
}

impl PlaylistSection {
    pub fn empty_backoff(&self) -> Duration {
        Duration::from_secs(self.empty_backoff_secs)
    }

    pub fn clip_pause(&self) -> Duration {
        Duration::from_secs(self.clip_pause_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

impl Default for PlaylistSection {
    fn default() -> Self {
        Self {
            empty_backoff_secs: 5,
            clip_pause_secs: 5,
            reminder: "Don't forget to subscribe!".to_string(),
            stop_grace_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchSection {
    pub program: PathBuf,
    pub folder_url: Option<String>,
    pub bumper_file_id: Option<String>,
}

impl Default for FetchSection {
    fn default() -> Self {
        Self {
            program: PathBuf::from("gdown"),
            folder_url: None,
            bumper_file_id: None,
        }
    }
}

pub fn load_loopcast_config<P: AsRef<Path>>(path: P) -> Result<LoopcastConfig> {
    let path = path.as_ref();
    let config: LoopcastConfig = load_toml(path)?;
    config.validate().map_err(|reason| ConfigError::Invalid {
        reason,
        path: path.to_path_buf(),
    })?;
    Ok(config)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
