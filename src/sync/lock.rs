use anyhow::Context;
use fs2::FileExt;
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::errors::SyncError;

/// Exclusive advisory lock on `<lock_dir>/<target>.lock`, held for the
/// lifetime of one rsync run. Shared by the CLI and the server so the same
/// target is never pulled twice at once.
#[derive(Debug)]
pub struct TargetLock {
    file: File,
    path: PathBuf,
}

impl TargetLock {
    pub fn acquire(lock_dir: &Path, target: &str) -> Result<Self, SyncError> {
        std::fs::create_dir_all(lock_dir)
            .with_context(|| format!("Failed to create lock directory {}", lock_dir.display()))?;
        let path = lock_path(lock_dir, target);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to open lock file {}", path.display()))?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Self { file, path }),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                Err(SyncError::TargetBusy {
                    target: target.to_string(),
                })
            }
            Err(e) => Err(anyhow::Error::new(e)
                .context(format!("Failed to lock {}", path.display()))
                .into()),
        }
    }

    /// Whether another run currently holds the lock for `target`.
    ///
    /// Takes the lock for an instant when it is free; a concurrent acquirer
    /// in another process has to retry.
    pub fn is_held(lock_dir: &Path, target: &str) -> bool {
        matches!(
            Self::acquire(lock_dir, target),
            Err(SyncError::TargetBusy { .. })
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TargetLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release target lock");
        }
    }
}

/// `<sanitized>-<hash>.lock`. The hash of the raw name keeps targets that
/// sanitize to the same string apart.
fn lock_path(lock_dir: &Path, target: &str) -> PathBuf {
    let safe: String = target
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let digest = format!("{:x}", Sha256::digest(target.as_bytes()));
    lock_dir.join(format!("{}-{}.lock", safe, &digest[..8]))
}
