// Plugin Contracts
// Source and destination traits, their factories, and the registry keyed by type

pub mod builtin;

#[cfg(test)]
pub(crate) mod testing;

use crate::error::{EngineError, EngineResult};
use crate::execution::activity::ActivityRecord;
use crate::execution::context::RunContext;
use crate::parser::models::{DestinationDefinition, SourceDefinition};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub use builtin::{InlineSourceFactory, LogDestinationFactory, MemorySource, NoopDestinationFactory};

/// Error reported by a plugin implementation
#[derive(Debug, Error)]
#[error("{message}")]
pub struct PluginError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl PluginError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

pub type PluginResult<T> = Result<T, PluginError>;

/// One record: field name to its values
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Entry(BTreeMap<String, Vec<String>>);

impl Entry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`Entry::insert`]
    pub fn with(mut self, field: impl Into<String>, values: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.insert(field, values);
        self
    }

    pub fn insert(&mut self, field: impl Into<String>, values: impl IntoIterator<Item = impl Into<String>>) {
        self.0
            .insert(field.into(), values.into_iter().map(Into::into).collect());
    }

    pub fn get(&self, field: &str) -> Option<&[String]> {
        self.0.get(field).map(Vec::as_slice)
    }

    pub fn first(&self, field: &str) -> Option<&str> {
        self.get(field)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|(field, values)| format!("{}={}", field, values.join("|")))
            .collect();
        write!(f, "{{{}}}", parts.join(", "))
    }
}

/// Selection applied to a source's entries
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryQuery {
    pub distinct: bool,
    /// Sort by the first value of this field
    pub order_by: Option<String>,
    /// `field=value` equality filter against any of the field's values
    pub filter: Option<String>,
}

impl EntryQuery {
    pub fn apply(&self, entries: Vec<Entry>) -> Vec<Entry> {
        let mut entries: Vec<Entry> = match self.filter.as_deref().and_then(|f| f.split_once('=')) {
            Some((field, value)) => entries
                .into_iter()
                .filter(|e| e.get(field.trim()).is_some_and(|vs| vs.iter().any(|v| v == value.trim())))
                .collect(),
            None => entries,
        };

        if let Some(field) = &self.order_by {
            entries.sort_by(|a, b| a.first(field).cmp(&b.first(field)));
        }
        if self.distinct {
            let mut seen = std::collections::HashSet::new();
            entries.retain(|e| seen.insert(e.clone()));
        }
        entries
    }
}

/// Forward-only iterator over the pages of a source
#[async_trait]
pub trait PageIterator: Send {
    /// Next page, `None` once exhausted
    async fn next_page(&mut self) -> Option<PluginResult<Vec<Entry>>>;
}

/// Data source feeding a leaf pipeline
#[async_trait]
pub trait Source: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Declared page size, if the source is paged
    fn page(&self) -> Option<usize>;

    async fn entries(&self) -> PluginResult<Vec<Entry>>;

    async fn query(&self, query: &EntryQuery) -> PluginResult<Vec<Entry>> {
        Ok(query.apply(self.entries().await?))
    }

    /// A fresh page iterator, or `None` when the source does not page
    async fn page_iterator(&self) -> PluginResult<Option<Box<dyn PageIterator>>> {
        Ok(None)
    }

    /// Release the source; calling it again is harmless
    async fn close(&self) -> PluginResult<()>;
}

#[async_trait]
pub trait SourceFactory: Send + Sync {
    async fn open(
        &self,
        ctx: &RunContext,
        definition: &SourceDefinition,
    ) -> PluginResult<Arc<dyn Source>>;
}

/// Answer of the destination's no-op guard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnythingToDo {
    Yes,
    No,
}

/// Sink at the end of a leaf pipeline
#[async_trait]
pub trait Destination: Send {
    fn kind(&self) -> &str;

    fn set_resources(&mut self, resources: Vec<Arc<dyn Source>>);

    fn set_source(&mut self, source: Option<Arc<dyn Source>>);

    /// Page index when running one page of a paged fan-out
    fn set_page(&mut self, page: Option<usize>);

    async fn is_anything_to_do(&mut self) -> PluginResult<AnythingToDo>;

    async fn execute(&mut self) -> PluginResult<()>;

    /// Release the destination; calling it again is harmless
    async fn close(&mut self) -> PluginResult<()>;
}

#[async_trait]
pub trait DestinationFactory: Send + Sync {
    async fn open(
        &self,
        ctx: &RunContext,
        definition: &DestinationDefinition,
        activity: Arc<ActivityRecord>,
    ) -> PluginResult<Box<dyn Destination>>;
}

/// Factories looked up by the definition's `type`
#[derive(Clone)]
pub struct PluginRegistry {
    sources: HashMap<String, Arc<dyn SourceFactory>>,
    destinations: HashMap<String, Arc<dyn DestinationFactory>>,
}

impl PluginRegistry {
    /// Registry without any plugins
    pub fn empty() -> Self {
        Self {
            sources: HashMap::new(),
            destinations: HashMap::new(),
        }
    }

    /// Registry holding the built-in `inline`, `noop` and `log` plugins
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register_source("inline", Arc::new(InlineSourceFactory));
        registry.register_destination("noop", Arc::new(NoopDestinationFactory));
        registry.register_destination("log", Arc::new(LogDestinationFactory));
        registry
    }

    pub fn register_source(&mut self, kind: impl Into<String>, factory: Arc<dyn SourceFactory>) {
        self.sources.insert(kind.into(), factory);
    }

    pub fn register_destination(
        &mut self,
        kind: impl Into<String>,
        factory: Arc<dyn DestinationFactory>,
    ) {
        self.destinations.insert(kind.into(), factory);
    }

    pub fn source_factory(&self, kind: &str) -> EngineResult<Arc<dyn SourceFactory>> {
        self.sources.get(kind).cloned().ok_or_else(|| {
            EngineError::configuration(format!("no source plugin registered for type '{}'", kind))
        })
    }

    pub fn destination_factory(&self, kind: &str) -> EngineResult<Arc<dyn DestinationFactory>> {
        self.destinations.get(kind).cloned().ok_or_else(|| {
            EngineError::configuration(format!(
                "no destination plugin registered for type '{}'",
                kind
            ))
        })
    }

    pub fn source_kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.sources.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    pub fn destination_kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.destinations.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("sources", &self.source_kinds())
            .field("destinations", &self.destination_kinds())
            .finish()
    }
}
