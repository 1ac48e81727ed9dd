use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failures while loading `loopcast.toml`. Every variant names the file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read loopcast config at {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("loopcast config {path} is not valid TOML: {source}")]
    Parse {
        source: toml::de::Error,
        path: PathBuf,
    },
    #[error("loopcast config {path} rejected: {reason}")]
    Invalid { reason: &'static str, path: PathBuf },
}

pub type Result<T> = std::result::Result<T, ConfigError>;
