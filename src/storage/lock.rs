use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    /// Another cycle holds the state lock
    #[error("Another relay cycle appears to be running (lock file {path} held: {holder}); use --break-lock if it is stale")]
    Held { path: PathBuf, holder: String },

    #[error("Failed to create lock file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Exclusive lock over a state file, held for the duration of one cycle.
///
/// The lock is a sibling file created with `create_new`, which fails
/// atomically when it already exists. Dropping the guard removes it.
#[derive(Debug)]
pub struct StateLock {
    path: PathBuf,
}

impl StateLock {
    pub fn lock_path(state_path: &Path) -> PathBuf {
        let mut name = state_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "state".into());
        name.push(".lock");
        state_path.with_file_name(name)
    }

    pub fn acquire(state_path: &Path) -> Result<Self, LockError> {
        let path = Self::lock_path(state_path);
        let mut file = match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = std::fs::read_to_string(&path)
                    .map(|s| s.trim().to_string())
                    .unwrap_or_else(|_| "unknown".to_string());
                return Err(LockError::Held { path, holder });
            }
            Err(source) => return Err(LockError::Io { path, source }),
        };

        let stamp = format!(
            "pid {} since {}\n",
            std::process::id(),
            chrono::Utc::now().to_rfc3339()
        );
        if let Err(e) = file.write_all(stamp.as_bytes()) {
            tracing::debug!(error = %e, "Failed to write lock holder info");
        }

        tracing::debug!(path = %path.display(), "Acquired state lock");
        Ok(Self { path })
    }

    /// Removes a lock left behind by a process that did not exit cleanly.
    /// Returns whether a lock file was present.
    pub fn break_stale(state_path: &Path) -> std::io::Result<bool> {
        let path = Self::lock_path(state_path);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::warn!(path = %path.display(), "Removed existing state lock");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to release state lock");
        }
    }
}
