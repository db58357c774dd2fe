// Execution Module
// Run context, task pool, activity tracking and the job runner

pub mod activity;
pub mod context;
pub mod events;
pub mod iterator;
pub mod pool;
pub mod runner;

// Re-export key types
pub use activity::{
    ActivityError, ActivityRecord, ActivityRegistry, ActivitySnapshot, ActivityStatus, Severity,
};
pub use context::{RunContext, VariableTable};
pub use events::{progress_channel, EventSender, ExecutionEvent, ProgressReceiver, ProgressSender};
pub use iterator::IteratorSpec;
pub use pool::{PoolError, TaskHandle, TaskPool};
pub use runner::{JobFuture, JobRunner};
