// Run Context
// Variable table, scoped bindings and %NAME% placeholder resolution for a run

use crate::error::{EngineError, EngineResult};
use crate::parser::models::JobDocument;

use parking_lot::RwLock;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

/// Deepest chain of nested placeholders followed before giving up
pub const MAX_RESOLUTION_DEPTH: usize = 64;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"%([A-Za-z0-9_.\-]+)%").expect("constant regex pattern is valid"));

/// Run-wide variables shared by every context of a run; last write wins
#[derive(Debug, Default)]
pub struct VariableTable {
    values: RwLock<HashMap<String, String>>,
}

impl VariableTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, name: impl Into<String>, value: impl Into<String>) {
        self.values.write().insert(name.into(), value.into());
    }

    /// Bulk load, overwriting existing names
    pub fn extend<I, K, V>(&self, values: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut table = self.values.write();
        for (name, value) in values {
            table.insert(name.into(), value.into());
        }
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.values.read().get(name).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.values
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }
}

/// Everything a job node needs to know about the run it belongs to
#[derive(Debug, Clone)]
pub struct RunContext {
    variables: Arc<VariableTable>,
    /// Bindings local to this subtree, shadowing the shared table
    scope: Arc<BTreeMap<String, String>>,
    document: Arc<JobDocument>,
    base_path: PathBuf,
    version: f32,
    run_id: String,
    read_only: bool,
}

impl RunContext {
    pub fn new(
        document: Arc<JobDocument>,
        variables: Arc<VariableTable>,
        base_path: impl Into<PathBuf>,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            version: document.version,
            variables,
            scope: Arc::new(BTreeMap::new()),
            document,
            base_path: base_path.into(),
            run_id: run_id.into(),
            read_only: false,
        }
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Same run and variables, pointed at another job document
    pub fn with_document(&self, document: Arc<JobDocument>) -> Self {
        Self {
            version: document.version,
            document,
            ..self.clone()
        }
    }

    /// Child context with extra local bindings
    ///
    /// Values are resolved against this context before binding, so a
    /// binding may refer to the name it shadows.
    pub fn bind<I, K, V>(&self, bindings: I) -> EngineResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: AsRef<str>,
    {
        let mut scope = (*self.scope).clone();
        for (name, value) in bindings {
            let resolved = self.resolve_string(value.as_ref())?;
            scope.insert(name.into(), resolved);
        }
        Ok(Self {
            scope: Arc::new(scope),
            ..self.clone()
        })
    }

    pub fn variables(&self) -> &Arc<VariableTable> {
        &self.variables
    }

    pub fn document(&self) -> &Arc<JobDocument> {
        &self.document
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn version(&self) -> f32 {
        self.version
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Write to the shared table, visible to every context of the run
    pub fn put(&self, name: impl Into<String>, value: impl Into<String>) {
        self.variables.put(name, value);
    }

    /// Look a name up in the local scope, then the shared table
    pub fn lookup(&self, name: &str) -> Option<String> {
        self.scope
            .get(name)
            .cloned()
            .or_else(|| self.variables.get(name))
    }

    /// Substitute every known `%NAME%`, transitively
    ///
    /// Output is rescanned until it stops changing, so a placeholder formed
    /// by adjacent values is resolved too.
    pub fn resolve_string(&self, text: &str) -> EngineResult<String> {
        let mut chain = Vec::new();
        self.resolve_with_chain(text, &mut chain)
    }

    fn resolve_with_chain(&self, text: &str, chain: &mut Vec<String>) -> EngineResult<String> {
        let mut current = text.to_string();
        for _ in 0..MAX_RESOLUTION_DEPTH {
            if !current.contains('%') {
                return Ok(current);
            }
            let next = self.substitute_once(&current, chain)?;
            if next == current {
                return Ok(next);
            }
            current = next;
        }
        Err(EngineError::ResolutionCycle {
            chain: chain.iter().cloned().chain(placeholder_names(&current)).collect(),
        })
    }

    /// One left-to-right pass; each value is itself fully resolved
    fn substitute_once(&self, text: &str, chain: &mut Vec<String>) -> EngineResult<String> {
        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        for caps in PLACEHOLDER.captures_iter(text) {
            let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            out.push_str(&text[last..whole.start()]);
            last = whole.end();

            let name = name.as_str();
            let Some(value) = self.lookup(name) else {
                out.push_str(whole.as_str());
                continue;
            };

            if chain.iter().any(|seen| seen == name) || chain.len() >= MAX_RESOLUTION_DEPTH {
                let mut cycle = chain.clone();
                cycle.push(name.to_string());
                return Err(EngineError::ResolutionCycle { chain: cycle });
            }

            chain.push(name.to_string());
            let resolved = self.resolve_with_chain(&value, chain)?;
            chain.pop();
            out.push_str(&resolved);
        }
        out.push_str(&text[last..]);
        Ok(out)
    }

    pub fn resolve_path(&self, path: &str) -> EngineResult<PathBuf> {
        Ok(PathBuf::from(self.resolve_string(path)?))
    }

    /// Resolve a path and anchor it at the base path when relative
    pub fn resolve_relative(&self, path: &str) -> EngineResult<PathBuf> {
        let resolved = self.resolve_path(path)?;
        if resolved.is_absolute() {
            Ok(resolved)
        } else {
            Ok(self.base_path.join(resolved))
        }
    }
}

fn placeholder_names(text: &str) -> Vec<String> {
    PLACEHOLDER
        .captures_iter(text)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .collect()
}
