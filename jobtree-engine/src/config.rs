// Engine Configuration
// Execution path, pool sizing and lock location with environment overrides

use crate::error::{EngineError, EngineResult};
use crate::execution::pool::DEFAULT_POOL_SIZE;
use crate::lock::default_lock_dir;

use std::path::PathBuf;

/// Environment variable overriding the worker count
pub const POOL_SIZE_ENV: &str = "JOBTREE_POOL_SIZE";

/// Environment variable overriding the lock directory
pub const LOCK_DIR_ENV: &str = "JOBTREE_LOCK_DIR";

/// Configuration for an [`Engine`](crate::Engine)
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root under which addon directories hold job files (default: current dir)
    pub execution_path: PathBuf,

    /// Worker threads in the task pool
    pub pool_size: usize,

    /// Directory for run lock markers (default: <data_local_dir>/jobtree/locks)
    pub lock_dir: PathBuf,

    /// Create `<addon>/runs/<run_id>` for every run
    pub create_run_dirs: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            execution_path: PathBuf::from("."),
            pool_size: DEFAULT_POOL_SIZE,
            lock_dir: default_lock_dir(),
            create_run_dirs: true,
        }
    }
}

impl EngineConfig {
    /// Defaults, then `JOBTREE_POOL_SIZE` and `JOBTREE_LOCK_DIR`
    pub fn from_env() -> EngineResult<Self> {
        Self::default().apply_env(|name| std::env::var(name).ok())
    }

    fn apply_env<F>(mut self, lookup: F) -> EngineResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(POOL_SIZE_ENV) {
            let size: usize = raw.trim().parse().map_err(|_| {
                EngineError::configuration(format!(
                    "{} must be a positive integer, got '{}'",
                    POOL_SIZE_ENV, raw
                ))
            })?;
            self = self.with_pool_size(size)?;
        }
        if let Some(dir) = lookup(LOCK_DIR_ENV).filter(|d| !d.trim().is_empty()) {
            self.lock_dir = PathBuf::from(dir);
        }
        Ok(self)
    }

    pub fn with_execution_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.execution_path = path.into();
        self
    }

    pub fn with_pool_size(mut self, size: usize) -> EngineResult<Self> {
        if size == 0 {
            return Err(EngineError::configuration("pool size must be at least 1"));
        }
        self.pool_size = size;
        Ok(self)
    }

    pub fn with_lock_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.lock_dir = dir.into();
        self
    }

    pub fn with_run_dirs(mut self, enabled: bool) -> Self {
        self.create_run_dirs = enabled;
        self
    }
}
