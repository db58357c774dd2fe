// Run Report
// Pull-based summary of a finished run in terminal and JSON formats

use crate::execution::activity::{ActivitySnapshot, ActivityStatus, Severity};

use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Output format for run reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    /// Human-readable tree
    Terminal,
    /// Pretty-printed JSON
    Json,
}

impl fmt::Display for ReportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportFormat::Terminal => write!(f, "terminal"),
            ReportFormat::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for ReportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "terminal" | "text" | "console" => Ok(ReportFormat::Terminal),
            "json" => Ok(ReportFormat::Json),
            _ => Err(format!(
                "Unknown report format '{}'. Valid formats: terminal, json",
                s
            )),
        }
    }
}

/// Outcome of one run: a snapshot tree per top-level job
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub document: String,
    pub read_only: bool,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    pub jobs: Vec<ActivitySnapshot>,
}

impl RunReport {
    /// Highest severity across every job
    pub fn severity(&self) -> Severity {
        self.jobs
            .iter()
            .map(|job| job.severity)
            .max()
            .unwrap_or_default()
    }

    /// A run fails only when something reached Red
    pub fn is_success(&self) -> bool {
        self.severity() < Severity::Red
    }

    pub fn error_count(&self) -> usize {
        self.jobs.iter().map(|job| job.all_errors().len()).sum()
    }

    pub fn job(&self, name: &str) -> Option<&ActivitySnapshot> {
        self.jobs.iter().find(|job| job.name == name)
    }

    pub fn render(&self, format: ReportFormat) -> String {
        match format {
            ReportFormat::Terminal => self.to_terminal(),
            ReportFormat::Json => self.to_json(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|e| format!("{{\"error\": \"{}\"}}", e))
    }

    /// Indented tree with a traffic light per job
    pub fn to_terminal(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "\x1b[1mRun {}\x1b[0m ({}{})\n\n",
            self.run_id,
            self.document,
            if self.read_only { ", read-only" } else { "" }
        ));

        for job in &self.jobs {
            render_node(&mut out, job, 1);
        }

        let severity = self.severity();
        out.push('\n');
        out.push_str(&format!(
            "{}{}\x1b[0m: {} job(s), {} error(s) in {:.2}s\n",
            color(severity),
            severity.to_string().to_uppercase(),
            self.jobs.len(),
            self.error_count(),
            self.duration.as_secs_f64()
        ));
        out
    }
}

fn color(severity: Severity) -> &'static str {
    match severity {
        Severity::Green => "\x1b[1;32m",
        Severity::Orange => "\x1b[1;33m",
        Severity::Red => "\x1b[1;31m",
    }
}

fn render_node(out: &mut String, node: &ActivitySnapshot, depth: usize) {
    let indent = "  ".repeat(depth);
    let marker = match node.status {
        ActivityStatus::Completed => "\u{25cf}",
        ActivityStatus::Running => "\u{25d0}",
        ActivityStatus::Waiting => "\u{25cb}",
    };
    let duration = node
        .duration_ms
        .map(|ms| format!(" ({}ms)", ms))
        .unwrap_or_default();
    let result = node
        .result
        .as_ref()
        .map(|r| format!(" -> {}", r))
        .unwrap_or_default();

    out.push_str(&format!(
        "{}{}{}\x1b[0m {}{}{}\n",
        indent,
        color(node.severity),
        marker,
        node.name,
        duration,
        result
    ));
    for error in &node.errors {
        out.push_str(&format!(
            "{}    \x1b[31m{}: {}\x1b[0m\n",
            indent, error.kind, error.message
        ));
    }
    for child in &node.children {
        render_node(out, child, depth + 1);
    }
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }
}
