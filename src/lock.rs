/// Exclusive advisory lock on a mount path.
///
/// The mount path is a system-wide resource, so at most one supervisor may
/// hold it at a time. The lock lives in a hidden sibling file
/// (`<parent>/.<name>.lock`) rather than inside the mountpoint, which the
/// mounted filesystem would shadow. Released when the guard drops.
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct MountLock {
    file: File,
    path: PathBuf,
}

impl MountLock {
    /// Take the lock for `mountpoint` without blocking.
    pub fn acquire(mountpoint: &Path) -> Result<MountLock, LockError> {
        let path = lock_path(mountpoint);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| LockError::Open {
                path: path.clone(),
                source: e,
            })?;

        if let Err(e) = file.try_lock_exclusive() {
            if e.kind() == fs2::lock_contended_error().kind() {
                return Err(LockError::Held { path });
            }
            return Err(LockError::Open { path, source: e });
        }

        tracing::debug!(lock = %path.display(), "mount path locked");
        Ok(MountLock { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for MountLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(error = %e, lock = %self.path.display(), "failed to release mount lock");
        }
    }
}

fn lock_path(mountpoint: &Path) -> PathBuf {
    let name = mountpoint
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "mount".to_string());
    let parent = mountpoint
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    parent.join(format!(".{name}.lock"))
}

#[derive(Debug)]
pub enum LockError {
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Another supervisor holds this mount path.
    Held { path: PathBuf },
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockError::Open { path, source } => {
                write!(f, "failed to lock {}: {source}", path.display())
            }
            LockError::Held { path } => {
                write!(f, "mount path is held by another supervisor ({})", path.display())
            }
        }
    }
}

impl std::error::Error for LockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LockError::Open { source, .. } => Some(source),
            LockError::Held { .. } => None,
        }
    }
}
