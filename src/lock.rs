use crate::ElogError;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const LOCK_FILE_NAME: &str = ".elogfetch.lock";

/// Advisory exclusive lock over a snapshot directory. Held until dropped.
#[derive(Debug)]
pub struct DirLock {
    file: File,
    path: PathBuf,
}

impl DirLock {
    /// Fails immediately with `ElogError::Lock` if another holder exists.
    pub fn acquire(dir: &Path) -> Result<Self, ElogError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(LOCK_FILE_NAME);
        let file = OpenOptions::new().create(true).write(true).truncate(false).open(&path)?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {
                debug!(lock = %path.display(), "acquired directory lock");
                Ok(Self { file, path })
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                Err(ElogError::Lock(format!(
                    "Another instance is already running (lock: {})",
                    path.display()
                )))
            }
            Err(e) => Err(ElogError::Io(e)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        debug!(lock = %self.path.display(), "released directory lock");
    }
}
