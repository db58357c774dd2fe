// Parser module for job documents
// Provides YAML parsing, structural checks, and reference validation

pub mod document;
pub mod error;
pub mod models;

pub use document::{JobParser, JobValidator};
pub use error::{ParseError, ParseErrorKind, ParseResult, ValidationError};
pub use models::*;
