use crate::error::StewardError;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Exclusive advisory lock on a service's runtime tree; released when dropped.
///
/// The lock is per open file, so two guards on the same path block each other
/// even inside one process. Callers must not nest acquisitions.
#[derive(Debug)]
pub struct RuntimeLock {
    file: File,
    path: PathBuf,
}

impl RuntimeLock {
    pub fn acquire(path: &Path) -> Result<Self, StewardError> {
        let file = open_lock_file(path)?;
        file.lock_exclusive().map_err(|source| StewardError::Lock {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::held(file, path))
    }

    /// Returns `None` when another holder has the lock.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>, StewardError> {
        let file = open_lock_file(path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self::held(file, path))),
            Err(err) if err.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(source) => Err(StewardError::Lock {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    fn held(mut file: File, path: &Path) -> Self {
        // The pid is only a debugging aid.
        let _ = file.set_len(0);
        let _ = writeln!(file, "{}", std::process::id());
        debug!(lock = %path.display(), "acquired runtime lock");
        Self {
            file,
            path: path.to_path_buf(),
        }
    }
}

impl Drop for RuntimeLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        debug!(lock = %self.path.display(), "released runtime lock");
    }
}

fn open_lock_file(path: &Path) -> Result<File, StewardError> {
    let lock_err = |source| StewardError::Lock {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(lock_err)?;
    }
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(lock_err)
}
