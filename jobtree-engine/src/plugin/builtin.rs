// Built-in Plugins
// In-memory source, no-op destination and logging destination

use crate::execution::activity::ActivityRecord;
use crate::execution::context::RunContext;
use crate::parser::models::{scalar_to_string, DestinationDefinition, SourceDefinition};
use crate::plugin::{
    AnythingToDo, Destination, DestinationFactory, Entry, PageIterator, PluginError, PluginResult,
    Source, SourceFactory,
};

use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Source over entries held in memory
///
/// Backs the `inline` plugin and wraps the entries of a single page
/// during a paged fan-out.
#[derive(Debug)]
pub struct MemorySource {
    name: String,
    page: Option<usize>,
    entries: Vec<Entry>,
    closed: AtomicBool,
}

impl MemorySource {
    pub fn new(name: impl Into<String>, entries: Vec<Entry>) -> Self {
        Self {
            name: name.into(),
            page: None,
            entries,
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_page(mut self, page: Option<usize>) -> Self {
        self.page = page;
        self
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Source for MemorySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn page(&self) -> Option<usize> {
        self.page
    }

    async fn entries(&self) -> PluginResult<Vec<Entry>> {
        Ok(self.entries.clone())
    }

    async fn page_iterator(&self) -> PluginResult<Option<Box<dyn PageIterator>>> {
        Ok(self.page.map(|size| {
            Box::new(MemoryPages {
                entries: self.entries.clone(),
                size: size.max(1),
                position: 0,
            }) as Box<dyn PageIterator>
        }))
    }

    async fn close(&self) -> PluginResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryPages {
    entries: Vec<Entry>,
    size: usize,
    position: usize,
}

#[async_trait]
impl PageIterator for MemoryPages {
    async fn next_page(&mut self) -> Option<PluginResult<Vec<Entry>>> {
        if self.position >= self.entries.len() {
            return None;
        }
        let end = (self.position + self.size).min(self.entries.len());
        let page = self.entries[self.position..end].to_vec();
        self.position = end;
        Some(Ok(page))
    }
}

/// `inline` sources: entries declared in the job document
///
/// ```yaml
/// source:
///   name: people
///   type: inline
///   page: 2
///   entries:
///     - uid: alice
///       mail: [alice@%domain%, a@%domain%]
/// ```
pub struct InlineSourceFactory;

#[async_trait]
impl SourceFactory for InlineSourceFactory {
    async fn open(
        &self,
        ctx: &RunContext,
        definition: &SourceDefinition,
    ) -> PluginResult<Arc<dyn Source>> {
        let raw = match definition.settings.get("entries") {
            None | Some(serde_yaml::Value::Null) => Vec::new(),
            Some(serde_yaml::Value::Sequence(items)) => items.clone(),
            Some(_) => {
                return Err(PluginError::new(format!(
                    "source '{}': 'entries' must be a list",
                    definition.name
                )))
            }
        };

        let mut entries = Vec::with_capacity(raw.len());
        for item in raw {
            let serde_yaml::Value::Mapping(fields) = item else {
                return Err(PluginError::new(format!(
                    "source '{}': every entry must be a map",
                    definition.name
                )));
            };

            let mut entry = Entry::new();
            for (field, value) in fields {
                let field = scalar_to_string(&field).unwrap_or_default();
                let values = match value {
                    serde_yaml::Value::Sequence(values) => values,
                    single => vec![single],
                };
                let mut resolved = Vec::with_capacity(values.len());
                for value in values {
                    let text = scalar_to_string(&value).ok_or_else(|| {
                        PluginError::new(format!(
                            "source '{}': field '{}' must hold scalars",
                            definition.name, field
                        ))
                    })?;
                    resolved.push(
                        ctx.resolve_string(&text)
                            .map_err(|e| PluginError::with_source("cannot resolve entry value", e))?,
                    );
                }
                entry.insert(field, resolved);
            }
            entries.push(entry);
        }

        debug!(source = %definition.name, entries = entries.len(), "opened inline source");
        Ok(Arc::new(
            MemorySource::new(&definition.name, entries).with_page(definition.page),
        ))
    }
}

/// `noop` destinations never have anything to do
pub struct NoopDestinationFactory;

struct NoopDestination;

#[async_trait]
impl Destination for NoopDestination {
    fn kind(&self) -> &str {
        "noop"
    }

    fn set_resources(&mut self, _resources: Vec<Arc<dyn Source>>) {}

    fn set_source(&mut self, _source: Option<Arc<dyn Source>>) {}

    fn set_page(&mut self, _page: Option<usize>) {}

    async fn is_anything_to_do(&mut self) -> PluginResult<AnythingToDo> {
        Ok(AnythingToDo::No)
    }

    async fn execute(&mut self) -> PluginResult<()> {
        Ok(())
    }

    async fn close(&mut self) -> PluginResult<()> {
        Ok(())
    }
}

#[async_trait]
impl DestinationFactory for NoopDestinationFactory {
    async fn open(
        &self,
        _ctx: &RunContext,
        _definition: &DestinationDefinition,
        _activity: Arc<ActivityRecord>,
    ) -> PluginResult<Box<dyn Destination>> {
        Ok(Box::new(NoopDestination))
    }
}

/// `log` destinations log every source entry and report the count as result
pub struct LogDestinationFactory;

struct LogDestination {
    activity: Arc<ActivityRecord>,
    message: Option<String>,
    source: Option<Arc<dyn Source>>,
    resources: Vec<Arc<dyn Source>>,
    page: Option<usize>,
}

#[async_trait]
impl Destination for LogDestination {
    fn kind(&self) -> &str {
        "log"
    }

    fn set_resources(&mut self, resources: Vec<Arc<dyn Source>>) {
        self.resources = resources;
    }

    fn set_source(&mut self, source: Option<Arc<dyn Source>>) {
        self.source = source;
    }

    fn set_page(&mut self, page: Option<usize>) {
        self.page = page;
    }

    async fn is_anything_to_do(&mut self) -> PluginResult<AnythingToDo> {
        Ok(if self.source.is_some() {
            AnythingToDo::Yes
        } else {
            AnythingToDo::No
        })
    }

    async fn execute(&mut self) -> PluginResult<()> {
        let Some(source) = &self.source else {
            return Ok(());
        };
        let entries = source.entries().await?;
        let job = self.activity.name().to_string();

        if let Some(message) = &self.message {
            info!(job = %job, page = ?self.page, "{}", message);
        }
        let total = entries.len().max(1);
        for (index, entry) in entries.iter().enumerate() {
            info!(job = %job, source = %source.name(), page = ?self.page, "{}", entry);
            self.activity.set_progress(((index + 1) * 100 / total) as u8);
        }
        self.activity.set_result(json!(entries.len()));
        Ok(())
    }

    async fn close(&mut self) -> PluginResult<()> {
        self.source = None;
        self.resources.clear();
        Ok(())
    }
}

#[async_trait]
impl DestinationFactory for LogDestinationFactory {
    async fn open(
        &self,
        ctx: &RunContext,
        definition: &DestinationDefinition,
        activity: Arc<ActivityRecord>,
    ) -> PluginResult<Box<dyn Destination>> {
        let message = definition
            .setting_str("message")
            .map(|m| ctx.resolve_string(m))
            .transpose()
            .map_err(|e| PluginError::with_source("cannot resolve log message", e))?;

        Ok(Box::new(LogDestination {
            activity,
            message,
            source: None,
            resources: Vec::new(),
            page: None,
        }))
    }
}
