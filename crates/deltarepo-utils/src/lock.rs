//! Advisory locks serialising writers of the same output directory.
//!
//! Replacing a repository's metadata is not safe against concurrent writers, so every
//! operation that swaps `repodata/` in place takes an exclusive `flock` on a
//! `.deltarepo.lock` file inside the directory first.

use std::{
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
};

use crate::error::{LockError, LockResult};

pub const LOCK_FILE_NAME: &str = ".deltarepo.lock";

/// An exclusive lock on a directory, released on drop.
pub struct DirLock {
    _file: nix::fcntl::Flock<File>,
    path: PathBuf,
}

impl DirLock {
    fn open(dir: &Path) -> LockResult<(File, PathBuf)> {
        let lock_path = dir.join(LOCK_FILE_NAME);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;
        Ok((file, lock_path))
    }

    /// Blocks until the lock on `dir` is acquired.
    pub fn acquire<P: AsRef<Path>>(dir: P) -> LockResult<Self> {
        let (file, lock_path) = Self::open(dir.as_ref())?;

        let file = nix::fcntl::Flock::lock(file, nix::fcntl::FlockArg::LockExclusive).map_err(
            |(_, err)| LockError::AcquireFailed(format!("{}: {}", lock_path.display(), err)),
        )?;

        Ok(DirLock {
            _file: file,
            path: lock_path,
        })
    }

    /// Returns `None` instead of blocking when another process holds the lock.
    pub fn try_acquire<P: AsRef<Path>>(dir: P) -> LockResult<Option<Self>> {
        let (file, lock_path) = Self::open(dir.as_ref())?;

        match nix::fcntl::Flock::lock(file, nix::fcntl::FlockArg::LockExclusiveNonblock) {
            Ok(file) => {
                Ok(Some(DirLock {
                    _file: file,
                    path: lock_path,
                }))
            }
            Err((_, nix::errno::Errno::EWOULDBLOCK)) => Ok(None),
            Err((_, err)) => {
                Err(LockError::AcquireFailed(format!(
                    "{}: {}",
                    lock_path.display(),
                    err
                )))
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
