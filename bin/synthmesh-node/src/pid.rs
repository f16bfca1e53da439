use std::path::{Path, PathBuf};

use synthmesh_core::error::{ErrorContext as _, GenericError};
use tracing::warn;

/// A PID file, removed when dropped.
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Writes the PID of the current process to `<dir>/<name>-ms.pid`.
    ///
    /// # Errors
    ///
    /// If the file cannot be written, an error is returned.
    pub fn create<P>(dir: P, name: &str) -> Result<Self, GenericError>
    where
        P: AsRef<Path>,
    {
        let path = dir.as_ref().join(format!("{}-ms.pid", name));
        std::fs::write(&path, std::process::id().to_string())
            .with_error_context(|| format!("Failed to write PID file '{}'.", path.display()))?;

        Ok(Self { path })
    }

    /// Returns the path of the PID file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Failed to remove PID file.");
        }
    }
}
