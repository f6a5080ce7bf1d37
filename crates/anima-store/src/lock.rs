//! Advisory per-project file lock.
//!
//! An exclusive flock on `.anima/anima.lock` serializes multi-file state
//! updates within one project. The holder's PID is written into the file
//! for diagnostics. Dropping the guard releases the lock.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use fs2::FileExt;

use anima_types::AnimaError;

/// Guard holding the exclusive project lock. Released on drop.
pub struct ProjectLock {
    file: std::fs::File,
}

impl ProjectLock {
    /// Acquire the lock, blocking until it is available.
    ///
    /// Open without truncating so we never wipe a holder's PID before we
    /// actually own the lock.
    pub fn acquire(path: &Path) -> Result<Self, AnimaError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AnimaError::StoreError(format!("mkdir {}: {e}", parent.display())))?;
        }

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| AnimaError::StoreError(format!("open {}: {e}", path.display())))?;

        file.lock_exclusive()
            .map_err(|e| AnimaError::StoreError(format!("lock {}: {e}", path.display())))?;

        let mut file = file;
        let _ = file.set_len(0);
        let _ = writeln!(file, "{}", std::process::id());

        Ok(Self { file })
    }

    /// Try to acquire the lock without blocking.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>, AnimaError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AnimaError::StoreError(format!("mkdir {}: {e}", parent.display())))?;
        }

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| AnimaError::StoreError(format!("open {}: {e}", path.display())))?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                let mut file = file;
                let _ = file.set_len(0);
                let _ = writeln!(file, "{}", std::process::id());
                Ok(Some(Self { file }))
            }
            Err(_) => Ok(None),
        }
    }
}

impl Drop for ProjectLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_writes_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("anima.lock");

        let guard = ProjectLock::acquire(&path).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());
        drop(guard);
    }

    #[test]
    fn second_try_acquire_fails_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("anima.lock");

        let guard = ProjectLock::acquire(&path).unwrap();
        // flock is per-fd, so a second open in the same process still
        // contends on the same lock.
        let second = ProjectLock::try_acquire(&path).unwrap();
        assert!(second.is_none());
        drop(guard);

        let third = ProjectLock::try_acquire(&path).unwrap();
        assert!(third.is_some());
    }

    #[test]
    fn lock_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("anima.lock");

        {
            let _guard = ProjectLock::acquire(&path).unwrap();
        }
        let again = ProjectLock::try_acquire(&path).unwrap();
        assert!(again.is_some());
    }
}
