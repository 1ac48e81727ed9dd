use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs as async_fs;
use tokio::process::Command;
use tracing::info;

use crate::config::FetchSection;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("command failed ({command}): {stderr}")]
    CommandFailure {
        command: String,
        status: Option<i32>,
        stderr: String,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("download finished but {0} is missing")]
    MissingOutput(PathBuf),
    #[error("fetch source not configured: {0}")]
    NotConfigured(&'static str),
}

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(&self, command: &mut Command) -> std::io::Result<std::process::Output>;
}

#[derive(Debug, Default)]
pub struct SystemCommandExecutor;

#[async_trait]
impl CommandExecutor for SystemCommandExecutor {
    async fn run(&self, command: &mut Command) -> std::io::Result<std::process::Output> {
        command.output().await
    }
}

/// Populates the local video directory from a remote source.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch_directory(&self, remote_ref: &str, local_dir: &Path) -> Result<(), FetchError>;

    async fn fetch_single_file(&self, remote_id: &str, local_path: &Path)
        -> Result<(), FetchError>;
}

/// Downloads shared Google Drive folders and files through the `gdown` CLI.
pub struct GdownFetcher {
    program: PathBuf,
    executor: Arc<dyn CommandExecutor>,
}

impl fmt::Debug for GdownFetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GdownFetcher")
            .field("program", &self.program)
            .finish()
    }
}

impl GdownFetcher {
    pub fn new(program: impl Into<PathBuf>, executor: Option<Arc<dyn CommandExecutor>>) -> Self {
        let executor = executor.unwrap_or_else(|| Arc::new(SystemCommandExecutor));
        Self {
            program: program.into(),
            executor,
        }
    }

    pub fn from_config(section: &FetchSection) -> Self {
        Self::new(&section.program, None)
    }

    async fn run_gdown(&self, args: &[String]) -> Result<(), FetchError> {
        let mut command = Command::new(&self.program);
        command.args(args);
        let output = self
            .executor
            .run(&mut command)
            .await
            .map_err(FetchError::Io)?;
        if !output.status.success() {
            return Err(FetchError::CommandFailure {
                command: format!("{} {}", self.program.display(), args.join(" ")),
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Fetcher for GdownFetcher {
    async fn fetch_directory(&self, remote_ref: &str, local_dir: &Path) -> Result<(), FetchError> {
        async_fs::create_dir_all(local_dir).await?;
        let args = vec![
            "--folder".to_string(),
            remote_ref.to_string(),
            "-O".to_string(),
            local_dir.to_string_lossy().to_string(),
            "--no-cookies".to_string(),
        ];
        self.run_gdown(&args).await?;
        info!(source = remote_ref, target = %local_dir.display(), "folder download completed");
        Ok(())
    }

    async fn fetch_single_file(
        &self,
        remote_id: &str,
        local_path: &Path,
    ) -> Result<(), FetchError> {
        if let Some(parent) = local_path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            async_fs::create_dir_all(parent).await?;
        }
        let args = vec![
            remote_id.to_string(),
            "-O".to_string(),
            local_path.to_string_lossy().to_string(),
        ];
        self.run_gdown(&args).await?;
        if !async_fs::try_exists(local_path).await? {
            return Err(FetchError::MissingOutput(local_path.to_path_buf()));
        }
        info!(id = remote_id, target = %local_path.display(), "file download completed");
        Ok(())
    }
}
