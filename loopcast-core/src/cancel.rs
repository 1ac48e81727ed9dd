use tokio_util::sync::CancellationToken as Inner;

/// Stop flag shared between the control surface and a running playlist.
///
/// Clones observe the same flag. Once set it stays set for the lifetime of the
/// run; a new run starts from a cleared token.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Inner,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.inner.cancel();
    }

    pub fn is_set(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Resets the flag ahead of a new run.
    ///
    /// Clones handed out earlier keep watching the old flag, so a finished run
    /// cannot be revived through a stale handle.
    pub fn clear(&mut self) {
        if self.inner.is_cancelled() {
            self.inner = Inner::new();
        }
    }

    /// Resolves once the flag is set.
    pub async fn cancelled(&self) {
        self.inner.cancelled().await
    }
}
