// Execution Events
// Progress reporting and event types for job tree execution

use crate::execution::activity::Severity;

use std::time::Duration;
use tokio::sync::mpsc;

/// Sender for execution progress events
pub type ProgressSender = mpsc::UnboundedSender<ExecutionEvent>;

/// Receiver for execution progress events
pub type ProgressReceiver = mpsc::UnboundedReceiver<ExecutionEvent>;

/// Create a new progress channel
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// Events emitted while a job tree executes
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    /// A run started for the given top-level jobs
    RunStarted {
        run_id: String,
        document: String,
        jobs: Vec<String>,
    },

    /// Every top-level job of a run resolved
    RunCompleted {
        run_id: String,
        severity: Severity,
        duration: Duration,
    },

    /// A job node entered its strategy
    JobStarted {
        run_id: String,
        activity_id: String,
        job_name: String,
        strategy: &'static str,
        depth: usize,
    },

    /// A job node completed, whatever its outcome
    JobCompleted {
        run_id: String,
        activity_id: String,
        job_name: String,
        severity: Severity,
        duration: Duration,
    },

    /// One page of a paged source was handed to the pool
    PageDispatched {
        run_id: String,
        job_name: String,
        source: String,
        page: usize,
        entries: usize,
    },

    /// A fan-out stopped early because its failure threshold was reached
    FanOutHalted {
        run_id: String,
        job_name: String,
        threshold: Severity,
        submitted: usize,
    },

    /// Log message (info, warning, error)
    Log {
        level: LogLevel,
        message: String,
        job_name: Option<String>,
    },
}

/// Log level for log events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl ExecutionEvent {
    /// Create a job started event
    pub fn job_started(
        run_id: impl Into<String>,
        activity_id: impl Into<String>,
        job_name: impl Into<String>,
        strategy: &'static str,
        depth: usize,
    ) -> Self {
        Self::JobStarted {
            run_id: run_id.into(),
            activity_id: activity_id.into(),
            job_name: job_name.into(),
            strategy,
            depth,
        }
    }

    /// Create a job completed event
    pub fn job_completed(
        run_id: impl Into<String>,
        activity_id: impl Into<String>,
        job_name: impl Into<String>,
        severity: Severity,
        duration: Duration,
    ) -> Self {
        Self::JobCompleted {
            run_id: run_id.into(),
            activity_id: activity_id.into(),
            job_name: job_name.into(),
            severity,
            duration,
        }
    }

    /// Create a warning log event
    pub fn warning(message: impl Into<String>, job_name: Option<String>) -> Self {
        Self::Log {
            level: LogLevel::Warning,
            message: message.into(),
            job_name,
        }
    }

    /// Create an info log event
    pub fn info(message: impl Into<String>, job_name: Option<String>) -> Self {
        Self::Log {
            level: LogLevel::Info,
            message: message.into(),
            job_name,
        }
    }

    /// Run identifier carried by the event, if any
    pub fn run_id(&self) -> Option<&str> {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::RunCompleted { run_id, .. }
            | Self::JobStarted { run_id, .. }
            | Self::JobCompleted { run_id, .. }
            | Self::PageDispatched { run_id, .. }
            | Self::FanOutHalted { run_id, .. } => Some(run_id),
            Self::Log { .. } => None,
        }
    }
}

/// Helper trait for sending events, ignoring errors (fire-and-forget)
pub trait EventSender {
    fn send_event(&self, event: ExecutionEvent);
}

impl EventSender for ProgressSender {
    fn send_event(&self, event: ExecutionEvent) {
        let _ = self.send(event);
    }
}

impl EventSender for Option<ProgressSender> {
    fn send_event(&self, event: ExecutionEvent) {
        if let Some(sender) = self {
            let _ = sender.send(event);
        }
    }
}
