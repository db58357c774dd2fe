// Job Tree Engine Library
// Embeddable engine running trees of ETL jobs described in YAML

pub mod config;
pub mod engine;
pub mod error;
pub mod execution;
pub mod lock;
pub mod parser;
pub mod plugin;
pub mod report;
pub mod run_id;

// Re-export commonly used types
pub use config::EngineConfig;
pub use engine::{Engine, RunHandle, RunRequest};
pub use error::{EngineError, EngineResult};
pub use report::{ReportFormat, RunReport};

// Re-export parser types
pub use parser::{
    JobDocument, JobNode, JobParser, JobValidator, ParseError, ParseErrorKind, ParseResult,
    ValidationError,
};

// Re-export execution types
pub use execution::{
    progress_channel, ActivityRecord, ActivitySnapshot, ActivityStatus, ExecutionEvent,
    ProgressReceiver, ProgressSender, RunContext, Severity,
};

// Re-export plugin types
pub use plugin::{
    Destination, DestinationFactory, Entry, PluginError, PluginRegistry, PluginResult, Source,
    SourceFactory,
};
