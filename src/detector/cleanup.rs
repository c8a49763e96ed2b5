use std::path::{Path, PathBuf};

/// Removes an intermediate file when dropped. Removal failures are logged, never raised.
#[derive(Debug)]
pub struct ArtifactGuard {
    path: Option<PathBuf>,
}

impl ArtifactGuard {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Keep the file and hand ownership of its path back to the caller.
    pub fn disarm(mut self) -> Option<PathBuf> {
        self.path.take()
    }

    fn remove(&mut self) {
        let Some(path) = self.path.take() else {
            return;
        };
        match std::fs::remove_file(&path) {
            Ok(()) => tracing::debug!(path = %path.display(), "removed intermediate artifact"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to remove intermediate artifact"
            ),
        }
    }
}

impl Drop for ArtifactGuard {
    fn drop(&mut self) {
        self.remove();
    }
}
