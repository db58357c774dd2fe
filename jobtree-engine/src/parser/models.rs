// Job Document Data Models
// Serde types for job files and the validated job tree built from them

use crate::execution::activity::Severity;
use crate::parser::error::{ParseError, ParseResult};

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

/// Version assumed when a job file does not declare one
pub const DEFAULT_DOCUMENT_VERSION: f32 = 1.0;

// =============================================================================
// Raw file format
// =============================================================================

/// Root of a job file as written on disk
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct JobFile {
    pub name: Option<String>,

    /// Declared document version
    pub version: Option<f32>,

    /// Document-level variables, loaded into the shared table before a run
    #[serde(default, deserialize_with = "deserialize_string_map")]
    pub variables: BTreeMap<String, String>,

    /// Top-level jobs, run when no explicit task list is given
    #[serde(default)]
    pub jobs: Vec<JobDefinition>,

    /// Jobs reachable only through `executeJob`
    #[serde(default)]
    pub child_jobs: Vec<JobDefinition>,

    /// Job templates expanded by `executeTemplate`
    #[serde(default)]
    pub templates: Vec<JobDefinition>,
}

/// One job as written on disk, before structural validation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct JobDefinition {
    pub name: String,

    #[serde(default)]
    pub asynch: bool,

    #[serde(default)]
    pub asynch_child_jobs: bool,

    pub failure_threshold: Option<Severity>,

    /// Job-local variable declarations
    #[serde(default, deserialize_with = "deserialize_string_map")]
    pub variables: BTreeMap<String, String>,

    #[serde(default)]
    pub execute_template: Vec<ExecuteTemplate>,

    #[serde(default)]
    pub execute_job: Vec<ExecuteJob>,

    #[serde(default)]
    pub resources: Vec<SourceDefinition>,

    pub source: Option<SourceDefinition>,

    pub destination: Option<DestinationDefinition>,
}

/// Directive expanding a named template, optionally once per iterator token
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ExecuteTemplate {
    pub name: String,
    /// Space-separated positional parameters bound as p1, p2, ...
    pub parameters: Option<String>,
    pub iterator: Option<String>,
}

impl ExecuteTemplate {
    pub fn parameter_list(&self) -> Vec<&str> {
        self.parameters
            .as_deref()
            .map(|p| p.split_whitespace().collect())
            .unwrap_or_default()
    }
}

/// Reference to a child job, possibly defined in another job file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ExecuteJob {
    pub name: String,
    pub file: Option<String>,
    /// Job-to-job parameters bound in the child's scope
    #[serde(default, deserialize_with = "deserialize_string_map")]
    pub parameters: BTreeMap<String, String>,
}

/// Definition of a source or a named resource
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceDefinition {
    pub name: String,
    /// Plugin type used to look up the source factory
    #[serde(rename = "type")]
    pub kind: String,
    /// Page size; its presence turns the owning job into a paged fan-out
    pub page: Option<usize>,
    /// Plugin-specific settings
    #[serde(flatten)]
    pub settings: BTreeMap<String, serde_yaml::Value>,
}

impl SourceDefinition {
    pub fn is_paged(&self) -> bool {
        self.page.is_some()
    }

    pub fn setting_str(&self, key: &str) -> Option<&str> {
        self.settings.get(key).and_then(|v| v.as_str())
    }
}

/// Definition of a destination
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DestinationDefinition {
    pub name: Option<String>,
    /// Plugin type; a destination without one has no method to run
    #[serde(rename = "type")]
    pub kind: Option<String>,
    #[serde(flatten)]
    pub settings: BTreeMap<String, serde_yaml::Value>,
}

impl DestinationDefinition {
    pub fn kind(&self) -> &str {
        self.kind.as_deref().unwrap_or("")
    }

    pub fn setting_str(&self, key: &str) -> Option<&str> {
        self.settings.get(key).and_then(|v| v.as_str())
    }
}

// =============================================================================
// Validated job tree
// =============================================================================

/// Which declared definition drives a paged fan-out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagedBy {
    Source,
    Resource(usize),
}

/// Source, resources and destination of a leaf pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct LeafDefinition {
    pub resources: Vec<SourceDefinition>,
    pub source: Option<SourceDefinition>,
    pub destination: DestinationDefinition,
}

impl LeafDefinition {
    /// The definition a paged fan-out draws pages from
    pub fn paged_definition(&self, by: PagedBy) -> Option<&SourceDefinition> {
        match by {
            PagedBy::Source => self.source.as_ref(),
            PagedBy::Resource(index) => self.resources.get(index),
        }
    }

    fn paged_by(&self) -> Option<PagedBy> {
        if self.source.as_ref().is_some_and(SourceDefinition::is_paged) {
            return Some(PagedBy::Source);
        }
        self.resources
            .iter()
            .position(SourceDefinition::is_paged)
            .map(PagedBy::Resource)
    }
}

/// Execution strategy of a job, fixed at parse time
#[derive(Debug, Clone, PartialEq)]
pub enum JobKind {
    TemplateGroup(Vec<ExecuteTemplate>),
    ChildJobGroup(Vec<ExecuteJob>),
    PagedLeaf { leaf: LeafDefinition, paged: PagedBy },
    Leaf(LeafDefinition),
}

impl JobKind {
    pub fn label(&self) -> &'static str {
        match self {
            JobKind::TemplateGroup(_) => "template",
            JobKind::ChildJobGroup(_) => "child-jobs",
            JobKind::PagedLeaf { .. } => "paged",
            JobKind::Leaf(_) => "leaf",
        }
    }
}

/// A validated, immutable job node
#[derive(Debug, Clone, PartialEq)]
pub struct JobNode {
    pub name: String,
    pub asynch: bool,
    pub asynch_child_jobs: bool,
    pub failure_threshold: Option<Severity>,
    pub variables: BTreeMap<String, String>,
    pub kind: JobKind,
}

impl JobNode {
    /// Clone this node under another name (template instantiation)
    pub fn renamed(&self, name: impl Into<String>) -> JobNode {
        JobNode {
            name: name.into(),
            ..self.clone()
        }
    }

    /// Leaf definition for leaf and paged jobs
    pub fn leaf(&self) -> Option<&LeafDefinition> {
        match &self.kind {
            JobKind::Leaf(leaf) | JobKind::PagedLeaf { leaf, .. } => Some(leaf),
            _ => None,
        }
    }
}

impl TryFrom<JobDefinition> for JobNode {
    type Error = ParseError;

    fn try_from(def: JobDefinition) -> ParseResult<Self> {
        if def.name.trim().is_empty() {
            return Err(ParseError::invalid_value("job name must not be empty"));
        }

        let has_templates = !def.execute_template.is_empty();
        let has_jobs = !def.execute_job.is_empty();
        let has_leaf =
            def.source.is_some() || def.destination.is_some() || !def.resources.is_empty();

        let shapes = [has_templates, has_jobs, has_leaf]
            .iter()
            .filter(|present| **present)
            .count();
        if shapes > 1 {
            return Err(ParseError::structure(
                &def.name,
                "executeTemplate, executeJob and source/destination are mutually exclusive",
            )
            .with_suggestion("split the job into a grouping job and separate leaf jobs"));
        }

        let kind = if has_templates {
            JobKind::TemplateGroup(def.execute_template)
        } else if has_jobs {
            JobKind::ChildJobGroup(def.execute_job)
        } else if has_leaf {
            let Some(destination) = def.destination else {
                return Err(ParseError::structure(&def.name, "leaf job has no destination")
                    .with_suggestion("add 'destination:' with a 'type:'"));
            };
            if destination.kind.as_deref().map_or(true, |k| k.trim().is_empty()) {
                return Err(ParseError::structure(
                    &def.name,
                    "destination has no method ('type' is missing)",
                ));
            }

            let mut seen = HashSet::new();
            for resource in def.resources.iter().chain(def.source.iter()) {
                if !seen.insert(resource.name.as_str()) {
                    return Err(ParseError::structure(
                        &def.name,
                        format!("source/resource name '{}' is declared twice", resource.name),
                    ));
                }
            }

            let leaf = LeafDefinition {
                resources: def.resources,
                source: def.source,
                destination,
            };
            match leaf.paged_by() {
                Some(paged) => JobKind::PagedLeaf { leaf, paged },
                None => JobKind::Leaf(leaf),
            }
        } else {
            return Err(ParseError::structure(&def.name, "job has nothing to execute")
                .with_suggestion("add executeJob, executeTemplate or a source/destination pair"));
        };

        Ok(JobNode {
            name: def.name,
            asynch: def.asynch,
            asynch_child_jobs: def.asynch_child_jobs,
            failure_threshold: def.failure_threshold,
            variables: def.variables,
            kind,
        })
    }
}

/// A parsed job document
#[derive(Debug, Clone)]
pub struct JobDocument {
    pub name: Option<String>,
    pub version: f32,
    pub variables: BTreeMap<String, String>,
    pub jobs: Vec<Arc<JobNode>>,
    pub child_jobs: Vec<Arc<JobNode>>,
    pub templates: Vec<Arc<JobNode>>,
    /// File the document was read from, if any
    pub path: Option<PathBuf>,
}

impl JobDocument {
    pub fn from_job_file(file: JobFile, path: Option<PathBuf>) -> ParseResult<Self> {
        let convert = |defs: Vec<JobDefinition>| -> ParseResult<Vec<Arc<JobNode>>> {
            defs.into_iter()
                .map(|def| JobNode::try_from(def).map(Arc::new))
                .collect()
        };

        Ok(Self {
            name: file.name,
            version: file.version.unwrap_or(DEFAULT_DOCUMENT_VERSION),
            variables: file.variables,
            jobs: convert(file.jobs)?,
            child_jobs: convert(file.child_jobs)?,
            templates: convert(file.templates)?,
            path,
        })
    }

    /// Job reachable through `executeJob`: child jobs first, then top-level jobs
    pub fn job(&self, name: &str) -> Option<&Arc<JobNode>> {
        self.child_jobs
            .iter()
            .chain(self.jobs.iter())
            .find(|job| job.name == name)
    }

    pub fn top_level_job(&self, name: &str) -> Option<&Arc<JobNode>> {
        self.jobs.iter().find(|job| job.name == name)
    }

    pub fn template(&self, name: &str) -> Option<&Arc<JobNode>> {
        self.templates.iter().find(|job| job.name == name)
    }

    /// Display name: declared name, else the file stem
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .or_else(|| {
                self.path
                    .as_ref()
                    .and_then(|p| p.file_stem())
                    .map(|s| s.to_string_lossy().to_string())
            })
            .unwrap_or_else(|| "jobs".to_string())
    }
}

/// Accept scalar YAML values and keep them as strings
pub(crate) fn deserialize_string_map<'de, D>(
    deserializer: D,
) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<BTreeMap<String, serde_yaml::Value>> = Option::deserialize(deserializer)?;
    let mut out = BTreeMap::new();
    for (key, value) in raw.unwrap_or_default() {
        let text = scalar_to_string(&value).ok_or_else(|| {
            serde::de::Error::custom(format!("value of '{}' must be a scalar", key))
        })?;
        out.insert(key, text);
    }
    Ok(out)
}

pub(crate) fn scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::Null => Some(String::new()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::String(s) => Some(s.clone()),
        _ => None,
    }
}
