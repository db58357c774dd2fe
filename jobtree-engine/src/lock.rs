// Run Lock
// Marker file refusing a second concurrent run of the same job file

use crate::error::{EngineError, EngineResult};

use fs2::FileExt;
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Lock directory used when none is configured
pub fn default_lock_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("jobtree")
        .join("locks")
}

/// Marker file name for a job file: SHA-256 of its absolute path
pub fn lock_file_name(job_file: &Path) -> String {
    let canonical = job_file.to_string_lossy();
    format!("{:x}.lock", Sha256::digest(canonical.as_bytes()))
}

/// Held lock; the marker is removed when dropped
///
/// A process that dies while holding the lock leaves the marker behind.
/// It has to be deleted by hand before the job file can run again.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    job_file: PathBuf,
    file: Option<File>,
}

impl RunLock {
    /// Acquire the lock for `job_file` in `lock_dir`
    pub fn acquire(lock_dir: &Path, job_file: &Path) -> EngineResult<Self> {
        let job_file = absolute(job_file)?;
        fs::create_dir_all(lock_dir)?;
        let path = lock_dir.join(lock_file_name(&job_file));

        let contention = || EngineError::LockContention {
            job_file: job_file.clone(),
            lock_file: path.clone(),
        };

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Err(contention()),
            Err(e) => return Err(e.into()),
        };

        // Marker exists now; hold an OS lock too while we own it
        if file.try_lock_exclusive().is_err() {
            return Err(contention());
        }
        writeln!(file, "{}", std::process::id())?;
        writeln!(file, "{}", job_file.display())?;

        debug!(lock = %path.display(), job_file = %job_file.display(), "run lock acquired");
        Ok(Self {
            path,
            job_file,
            file: Some(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn job_file(&self) -> &Path {
        &self.job_file
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = FileExt::unlock(&file);
        }
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(lock = %self.path.display(), "run lock released"),
            Err(e) => warn!(lock = %self.path.display(), "failed to remove run lock: {}", e),
        }
    }
}

fn absolute(path: &Path) -> io::Result<PathBuf> {
    match fs::canonicalize(path) {
        Ok(canonical) => Ok(canonical),
        Err(_) if path.is_absolute() => Ok(path.to_path_buf()),
        Err(_) => Ok(std::env::current_dir()?.join(path)),
    }
}
