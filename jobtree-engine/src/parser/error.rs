// Job Document Parse Errors
// Location-aware errors with source context and hints for common mistakes

use std::fmt;

/// Parse error with location and context
#[derive(Debug, Clone)]
pub struct ParseError {
    /// Error message
    pub message: String,
    /// Line number (1-indexed, 0 when unknown)
    pub line: usize,
    /// Column number (1-indexed, 0 when unknown)
    pub column: usize,
    /// Lines surrounding the error
    pub context: String,
    /// Optional hint for fixing the error
    pub suggestion: Option<String>,
    pub kind: ParseErrorKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// YAML syntax error
    YamlSyntax,
    /// Wrong types or missing fields
    InvalidSchema,
    /// A field has an unacceptable value
    InvalidValue,
    /// A job node mixes or lacks child kinds
    InvalidStructure,
    /// Job file could not be read
    IoError,
}

impl ParseError {
    pub fn new(message: impl Into<String>, line: usize, column: usize) -> Self {
        Self {
            message: message.into(),
            line,
            column,
            context: String::new(),
            suggestion: None,
            kind: ParseErrorKind::InvalidSchema,
        }
    }

    /// Error about a specific job, without a source location
    pub fn structure(job: &str, message: impl Into<String>) -> Self {
        Self::new(format!("job '{}': {}", job, message.into()), 0, 0)
            .with_kind(ParseErrorKind::InvalidStructure)
    }

    pub fn invalid_value(message: impl Into<String>) -> Self {
        Self::new(message, 0, 0).with_kind(ParseErrorKind::InvalidValue)
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn with_kind(mut self, kind: ParseErrorKind) -> Self {
        self.kind = kind;
        self
    }

    /// Attach the lines around the error location
    pub fn with_source_context(mut self, source: &str, context_lines: usize) -> Self {
        if self.line == 0 {
            return self;
        }
        let lines: Vec<&str> = source.lines().collect();
        let start = self.line.saturating_sub(context_lines + 1);
        let end = (self.line + context_lines).min(lines.len());

        let mut context = String::new();
        for (i, line) in lines.iter().enumerate().take(end).skip(start) {
            let line_num = i + 1;
            let marker = if line_num == self.line { ">" } else { " " };
            context.push_str(&format!("{} {:4} | {}\n", marker, line_num, line));

            if line_num == self.line && self.column > 0 {
                let indicator = " ".repeat(self.column.saturating_sub(1)) + "^";
                context.push_str(&format!("       | {}\n", indicator));
            }
        }

        self.context = context;
        self
    }

    /// Build from a serde_yaml error, keeping its location
    pub fn from_yaml_error(err: &serde_yaml::Error, source: &str) -> Self {
        let (line, column) = err
            .location()
            .map(|loc| (loc.line(), loc.column()))
            .unwrap_or((0, 0));

        let msg = err.to_string();
        let kind = if msg.contains("missing field")
            || msg.contains("unknown field")
            || msg.contains("invalid type")
            || msg.contains("unknown variant")
        {
            ParseErrorKind::InvalidSchema
        } else {
            ParseErrorKind::YamlSyntax
        };

        let mut error = ParseError::new(format_yaml_message(&msg), line, column)
            .with_kind(kind)
            .with_source_context(source, 2);
        error.suggestion = suggest_fix(&msg);
        error
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if self.line > 0 {
            write!(f, " (line {}:{})", self.line, self.column)?;
        }
        if !self.context.is_empty() {
            write!(f, "\n{}", self.context.trim_end())?;
        }
        if let Some(suggestion) = &self.suggestion {
            write!(f, "\nhelp: {}", suggestion)?;
        }
        Ok(())
    }
}

impl std::error::Error for ParseError {}

/// Strip serde_yaml's trailing location, we render our own
fn format_yaml_message(msg: &str) -> String {
    let trimmed = match msg.find(" at line ") {
        Some(idx) => &msg[..idx],
        None => msg,
    };

    if let Some(field) = between(trimmed, "missing field `", "`") {
        return format!("missing required field '{}'", field);
    }
    if let Some(field) = between(trimmed, "unknown field `", "`") {
        return format!("unknown field '{}'", field);
    }
    trimmed.to_string()
}

fn between<'a>(msg: &'a str, prefix: &str, suffix: &str) -> Option<&'a str> {
    let start = msg.find(prefix)? + prefix.len();
    let end = msg[start..].find(suffix)? + start;
    Some(&msg[start..end])
}

/// Hints for the misspellings we see most
fn suggest_fix(msg: &str) -> Option<String> {
    if msg.contains("missing field `name`") {
        return Some("every job, template and definition needs a 'name:'".to_string());
    }

    let field = between(msg, "unknown field `", "`")?;
    let known = [
        "asynch",
        "asynchChildJobs",
        "failureThreshold",
        "executeJob",
        "executeTemplate",
        "childJobs",
        "resources",
        "destination",
        "iterator",
        "parameters",
        "variables",
    ];
    let lower = field.to_lowercase().replace(['-', '_'], "");
    known
        .iter()
        .find(|candidate| candidate.to_lowercase() == lower)
        .map(|candidate| format!("did you mean '{}'?", candidate))
}

/// Result type for parser operations
pub type ParseResult<T> = Result<T, ParseError>;

/// Semantic problem found by the validator
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub message: String,
    pub path: String,
    pub suggestion: Option<String>,
}

impl ValidationError {
    pub fn new(message: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            path: path.into(),
            suggestion: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "validation error at '{}': {}", self.path, self.message)?;
        if let Some(suggestion) = &self.suggestion {
            write!(f, " ({})", suggestion)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}
