// Engine Error Types
// Error taxonomy shared by the parser, the runner and the entry surface

use crate::execution::pool::PoolError;
use crate::parser::error::ParseError;
use crate::plugin::PluginError;

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the engine
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors raised while loading or executing a job tree
#[derive(Debug, Error)]
pub enum EngineError {
    /// Missing or inconsistent job-definition fields
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A `%NAME%` placeholder transitively resolves to itself
    #[error("variable resolution cycle: {}", .chain.join(" -> "))]
    ResolutionCycle { chain: Vec<String> },

    #[error("template '{0}' not found in job document")]
    TemplateNotFound(String),

    #[error("job '{0}' not found in job document")]
    JobNotFound(String),

    #[error("unsupported iterator '{expression}': {reason}")]
    UnsupportedIteratorForm { expression: String, reason: String },

    #[error("source '{name}' failed: {source}")]
    Source {
        name: String,
        #[source]
        source: PluginError,
    },

    #[error("destination '{kind}' failed: {source}")]
    Destination {
        kind: String,
        #[source]
        source: PluginError,
    },

    /// Another run already holds the lock for this job file
    #[error("job file {job_file} is already running (lock {lock_file})")]
    LockContention { job_file: PathBuf, lock_file: PathBuf },

    #[error("{0}")]
    Parse(#[from] ParseError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("task pool error: {0}")]
    Pool(#[from] PoolError),
}

impl EngineError {
    pub fn configuration(message: impl Into<String>) -> Self {
        EngineError::Configuration(message.into())
    }

    pub fn unsupported_iterator(expression: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::UnsupportedIteratorForm {
            expression: expression.into(),
            reason: reason.into(),
        }
    }

    pub fn source(name: impl Into<String>, source: PluginError) -> Self {
        EngineError::Source {
            name: name.into(),
            source,
        }
    }

    pub fn destination(kind: impl Into<String>, source: PluginError) -> Self {
        EngineError::Destination {
            kind: kind.into(),
            source,
        }
    }

    /// Stable category name, used in activity reports
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Configuration(_) => "ConfigurationError",
            EngineError::ResolutionCycle { .. } => "ResolutionCycle",
            EngineError::TemplateNotFound(_) => "TemplateNotFound",
            EngineError::JobNotFound(_) => "JobNotFound",
            EngineError::UnsupportedIteratorForm { .. } => "UnsupportedIteratorForm",
            EngineError::Source { .. } => "SourceError",
            EngineError::Destination { .. } => "DestinationError",
            EngineError::LockContention { .. } => "LockContention",
            EngineError::Parse(_) => "ConfigurationError",
            EngineError::Io(_) => "IoError",
            EngineError::Pool(_) => "PoolError",
        }
    }
}
