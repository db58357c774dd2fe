// Job Document Parser
// Parses YAML job files into validated job trees and checks their references

use crate::execution::iterator::IteratorSpec;
use crate::parser::error::{ParseError, ParseErrorKind, ParseResult, ValidationError};
use crate::parser::models::*;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;

/// Job document parser
pub struct JobParser;

impl JobParser {
    /// Parse a job document from a YAML string
    pub fn parse(content: &str) -> ParseResult<JobDocument> {
        let file: JobFile =
            serde_yaml::from_str(content).map_err(|e| ParseError::from_yaml_error(&e, content))?;
        JobDocument::from_job_file(file, None)
    }

    /// Parse a job document from a file, remembering its path
    pub fn parse_file<P: AsRef<Path>>(path: P) -> ParseResult<JobDocument> {
        let path = path.as_ref();
        let content = read(path)?;
        let file: JobFile = serde_yaml::from_str(&content)
            .map_err(|e| ParseError::from_yaml_error(&e, &content))?;
        JobDocument::from_job_file(file, Some(path.to_path_buf()))
    }

    /// Parse a static variables document (a flat YAML map)
    pub fn parse_variables(content: &str) -> ParseResult<BTreeMap<String, String>> {
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        let raw: BTreeMap<String, serde_yaml::Value> =
            serde_yaml::from_str(content).map_err(|e| ParseError::from_yaml_error(&e, content))?;

        raw.into_iter()
            .map(|(key, value)| match scalar_to_string(&value) {
                Some(text) => Ok((key, text)),
                None => Err(ParseError::invalid_value(format!(
                    "variable '{}' must be a scalar",
                    key
                ))),
            })
            .collect()
    }

    pub fn parse_variables_file<P: AsRef<Path>>(path: P) -> ParseResult<BTreeMap<String, String>> {
        Self::parse_variables(&read(path.as_ref())?)
    }
}

fn read(path: &Path) -> ParseResult<String> {
    fs::read_to_string(path).map_err(|e| {
        ParseError::new(format!("failed to read {}: {}", path.display(), e), 0, 0)
            .with_kind(ParseErrorKind::IoError)
    })
}

/// Semantic checks that need the whole document
pub struct JobValidator;

impl JobValidator {
    pub fn validate(document: &JobDocument) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if document.jobs.is_empty() {
            errors.push(
                ValidationError::new("document declares no top-level jobs", "jobs")
                    .with_suggestion("add at least one entry under 'jobs:'"),
            );
        }

        Self::check_duplicates(&document.jobs, "jobs", &mut errors);
        Self::check_duplicates(&document.child_jobs, "childJobs", &mut errors);
        Self::check_duplicates(&document.templates, "templates", &mut errors);

        let sections = [
            ("jobs", &document.jobs),
            ("childJobs", &document.child_jobs),
            ("templates", &document.templates),
        ];
        for (section, jobs) in sections {
            for job in jobs.iter() {
                Self::check_references(document, job, &format!("{}.{}", section, job.name), &mut errors);
            }
        }

        Self::check_job_cycles(document, &mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn check_duplicates(jobs: &[std::sync::Arc<JobNode>], section: &str, errors: &mut Vec<ValidationError>) {
        let mut seen = HashSet::new();
        for job in jobs {
            if !seen.insert(job.name.as_str()) {
                errors.push(ValidationError::new(
                    format!("job name '{}' is declared more than once", job.name),
                    section,
                ));
            }
        }
    }

    fn check_references(
        document: &JobDocument,
        job: &JobNode,
        path: &str,
        errors: &mut Vec<ValidationError>,
    ) {
        match &job.kind {
            JobKind::ChildJobGroup(children) => {
                for child in children {
                    // References into other files are resolved at run time
                    if child.file.is_none() && document.job(&child.name).is_none() {
                        errors.push(
                            ValidationError::new(
                                format!("executeJob references unknown job '{}'", child.name),
                                format!("{}.executeJob", path),
                            )
                            .with_suggestion("declare it under 'childJobs:' or set 'file:'"),
                        );
                    }
                }
            }
            JobKind::TemplateGroup(directives) => {
                for (index, directive) in directives.iter().enumerate() {
                    let directive_path = format!("{}.executeTemplate[{}]", path, index);
                    if document.template(&directive.name).is_none() {
                        errors.push(ValidationError::new(
                            format!("executeTemplate references unknown template '{}'", directive.name),
                            directive_path.clone(),
                        ));
                    }
                    // Iterators holding placeholders can only be checked at run time
                    if let Some(iterator) = directive.iterator.as_deref().filter(|i| !i.contains('%')) {
                        if let Err(e) = IteratorSpec::parse(iterator) {
                            errors.push(ValidationError::new(e.to_string(), directive_path));
                        }
                    }
                }
            }
            JobKind::Leaf(_) | JobKind::PagedLeaf { .. } => {}
        }
    }

    /// Same-document executeJob references must not loop back
    fn check_job_cycles(document: &JobDocument, errors: &mut Vec<ValidationError>) {
        let mut edges: HashMap<&str, Vec<String>> = HashMap::new();
        for job in document.jobs.iter().chain(document.child_jobs.iter()) {
            if let JobKind::ChildJobGroup(children) = &job.kind {
                edges.entry(job.name.as_str()).or_default().extend(
                    children
                        .iter()
                        .filter(|c| c.file.is_none())
                        .map(|c| c.name.clone()),
                );
            }
        }

        let names: Vec<&str> = edges.keys().copied().collect();
        if let Err(cycle) = detect_cycles(&names, |name| edges.get(name).cloned().unwrap_or_default()) {
            errors.push(ValidationError::new(
                format!("circular executeJob reference: {}", cycle.join(" -> ")),
                "jobs",
            ));
        }
    }
}

/// Detect cycles in a dependency graph using DFS
fn detect_cycles<F>(nodes: &[&str], get_deps: F) -> Result<(), Vec<String>>
where
    F: Fn(&str) -> Vec<String>,
{
    #[derive(Clone, Copy, PartialEq)]
    enum NodeState {
        Unvisited,
        Visiting,
        Visited,
    }

    fn visit<F>(
        node: &str,
        states: &mut HashMap<String, NodeState>,
        path: &mut Vec<String>,
        get_deps: &F,
    ) -> Result<(), Vec<String>>
    where
        F: Fn(&str) -> Vec<String>,
    {
        match states.get(node) {
            Some(NodeState::Visiting) => {
                path.push(node.to_string());
                return Err(path.clone());
            }
            Some(NodeState::Visited) => return Ok(()),
            _ => {}
        }

        states.insert(node.to_string(), NodeState::Visiting);
        path.push(node.to_string());

        for dep in get_deps(node) {
            visit(&dep, states, path, get_deps)?;
        }

        path.pop();
        states.insert(node.to_string(), NodeState::Visited);
        Ok(())
    }

    let mut states: HashMap<String, NodeState> = nodes
        .iter()
        .map(|n| (n.to_string(), NodeState::Unvisited))
        .collect();
    let mut path = Vec::new();

    let mut sorted = nodes.to_vec();
    sorted.sort_unstable();
    for node in sorted {
        visit(node, &mut states, &mut path, &get_deps)?;
    }

    Ok(())
}
