use crate::output;

use std::collections::BTreeSet;
use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;

use jobtree_engine::{JobParser, JobValidator, PluginRegistry};

/// Check a job document without running it
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Path to the job document
    pub job_file: PathBuf,
}

pub fn execute(args: ValidateArgs) -> Result<()> {
    let job_path = &args.job_file;

    if !job_path.exists() {
        color_eyre::eyre::bail!("Job file not found: {}", job_path.display());
    }

    // Step 1: Parse YAML and build the job tree
    output::status("Validating", &format!("{}", job_path.display()));

    let document = match JobParser::parse_file(job_path) {
        Ok(document) => document,
        Err(e) => {
            output::error(&format!("Parse error: {}", e.message));
            if !e.context.is_empty() {
                output::dim(&e.context);
            }
            if let Some(suggestion) = &e.suggestion {
                output::info(&format!("  Suggestion: {}", suggestion));
            }
            std::process::exit(1);
        }
    };

    output::check("YAML syntax valid");
    output::check(&format!(
        "Structure: {} jobs, {} child jobs, {} templates",
        document.jobs.len(),
        document.child_jobs.len(),
        document.templates.len()
    ));

    // Step 2: References, iterators and cycles
    match JobValidator::validate(&document) {
        Ok(()) => output::check("Semantic validation passed"),
        Err(errors) => {
            output::error(&format!("{} validation error(s):", errors.len()));
            for error in &errors {
                output::error(&format!("  - [{}] {}", error.path, error.message));
                if let Some(suggestion) = &error.suggestion {
                    output::info(&format!("    Suggestion: {}", suggestion));
                }
            }
            std::process::exit(1);
        }
    }

    // Step 3: Plugin types unknown to the built-in registry
    let registry = PluginRegistry::with_builtins();
    let known_sources: BTreeSet<&str> = registry.source_kinds().into_iter().collect();
    let known_destinations: BTreeSet<&str> = registry.destination_kinds().into_iter().collect();

    let nodes = document
        .jobs
        .iter()
        .chain(&document.child_jobs)
        .chain(&document.templates);
    for node in nodes {
        let Some(leaf) = node.leaf() else { continue };
        for source in leaf.source.iter().chain(&leaf.resources) {
            if !known_sources.contains(source.kind.as_str()) {
                output::warning(&format!(
                    "Job '{}': source type '{}' is not built in; it must be registered by the host",
                    node.name, source.kind
                ));
            }
        }
        let kind = leaf.destination.kind();
        if !kind.is_empty() && !known_destinations.contains(kind) {
            output::warning(&format!(
                "Job '{}': destination type '{}' is not built in; it must be registered by the host",
                node.name, kind
            ));
        }
    }

    println!();
    output::success("Job document is valid");

    Ok(())
}
