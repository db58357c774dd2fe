// Task Pool
// Fixed-size worker pool with uniform handles for inline and pooled jobs

use parking_lot::RwLock;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::task::TaskTracker;
use tracing::debug;

/// Worker count used when nothing else is configured
pub const DEFAULT_POOL_SIZE: usize = 8;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("task pool has not been initialized")]
    NotInitialized,

    #[error("task pool is already initialized")]
    AlreadyInitialized,

    #[error("task pool is closed")]
    Closed,

    #[error("failed to start task pool workers: {0}")]
    Startup(#[source] std::io::Error),

    #[error("pooled task failed: {0}")]
    Join(#[from] JoinError),
}

enum PoolState {
    Uninitialized,
    Running {
        runtime: Runtime,
        handle: Handle,
        tracker: TaskTracker,
    },
    Closed,
}

/// Handle to a submitted job, already resolved for inline submissions
#[derive(Debug)]
pub enum TaskHandle<T> {
    Ready(T),
    Pending(JoinHandle<T>),
}

impl<T> TaskHandle<T> {
    pub fn is_ready(&self) -> bool {
        match self {
            TaskHandle::Ready(_) => true,
            TaskHandle::Pending(handle) => handle.is_finished(),
        }
    }

    /// Wait for the job's output
    pub async fn join(self) -> Result<T, PoolError> {
        match self {
            TaskHandle::Ready(value) => Ok(value),
            TaskHandle::Pending(handle) => Ok(handle.await?),
        }
    }
}

/// Pool executing asynchronous jobs on a fixed number of worker threads
pub struct TaskPool {
    state: RwLock<PoolState>,
    size: RwLock<usize>,
}

impl TaskPool {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(PoolState::Uninitialized),
            size: RwLock::new(0),
        }
    }

    /// Start the workers; allowed exactly once per pool
    pub fn initialize(&self, size: usize) -> Result<(), PoolError> {
        let mut state = self.state.write();
        if !matches!(*state, PoolState::Uninitialized) {
            return Err(PoolError::AlreadyInitialized);
        }

        let size = size.max(1);
        let runtime = Builder::new_multi_thread()
            .worker_threads(size)
            .thread_name("jobtree-worker")
            .enable_all()
            .build()
            .map_err(PoolError::Startup)?;
        let handle = runtime.handle().clone();

        debug!(size, "task pool started");
        *self.size.write() = size;
        *state = PoolState::Running {
            runtime,
            handle,
            tracker: TaskTracker::new(),
        };
        Ok(())
    }

    pub fn size(&self) -> usize {
        *self.size.read()
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.state.read(), PoolState::Running { .. })
    }

    fn running(&self) -> Result<(Handle, TaskTracker), PoolError> {
        match &*self.state.read() {
            PoolState::Running {
                handle, tracker, ..
            } => {
                if tracker.is_closed() {
                    Err(PoolError::Closed)
                } else {
                    Ok((handle.clone(), tracker.clone()))
                }
            }
            PoolState::Uninitialized => Err(PoolError::NotInitialized),
            PoolState::Closed => Err(PoolError::Closed),
        }
    }

    /// Submit a job: inline jobs run on the caller, asynchronous ones on the pool
    pub async fn submit<F>(&self, job: F, asynchronous: bool) -> Result<TaskHandle<F::Output>, PoolError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let (handle, tracker) = self.running()?;
        if asynchronous {
            Ok(TaskHandle::Pending(tracker.spawn_on(job, &handle)))
        } else {
            Ok(TaskHandle::Ready(job.await))
        }
    }

    /// Drive a future to completion on the pool's runtime from a plain thread
    pub fn block_on<F: Future>(&self, future: F) -> Result<F::Output, PoolError> {
        let (handle, _) = self.running()?;
        Ok(handle.block_on(future))
    }

    /// Stop accepting work, drain what is in flight, then tear the workers down
    pub fn close(&self) -> Result<(), PoolError> {
        let tracker = match &*self.state.read() {
            PoolState::Running { tracker, .. } => tracker.clone(),
            PoolState::Uninitialized => return Err(PoolError::NotInitialized),
            PoolState::Closed => return Ok(()),
        };
        tracker.close();

        let previous = std::mem::replace(&mut *self.state.write(), PoolState::Closed);
        if let PoolState::Running { runtime, handle, .. } = previous {
            handle.block_on(tracker.wait());
            runtime.shutdown_background();
            debug!("task pool closed");
        }
        Ok(())
    }
}

impl Default for TaskPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared pool reference
pub type SharedPool = Arc<TaskPool>;
