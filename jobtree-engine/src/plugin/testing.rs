// Test Plugins
// Recording destinations and instrumented sources for runner and engine tests

use crate::execution::activity::{ActivityRecord, Severity};
use crate::execution::context::RunContext;
use crate::parser::models::{DestinationDefinition, SourceDefinition};
use crate::plugin::builtin::{InlineSourceFactory, MemorySource};
use crate::plugin::{
    AnythingToDo, Destination, DestinationFactory, Entry, PageIterator, PluginError, PluginRegistry,
    PluginResult, Source, SourceFactory,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// What the recording plugins observed
#[derive(Debug, Default)]
pub(crate) struct Recorder {
    pub opened: AtomicUsize,
    pub executed: AtomicUsize,
    pub closed: AtomicUsize,
    pub sources_opened: AtomicUsize,
    pub sources_closed: AtomicUsize,
    /// (job name, page index, source entries) per execute call
    pub executions: Mutex<Vec<(String, Option<usize>, Vec<Entry>)>>,
    /// Job names in the order their destinations were opened
    pub order: Mutex<Vec<String>>,
}

impl Recorder {
    pub fn executed(&self) -> usize {
        self.executed.load(Ordering::SeqCst)
    }

    pub fn executions(&self) -> Vec<(String, Option<usize>, Vec<Entry>)> {
        self.executions.lock().clone()
    }

    pub fn order(&self) -> Vec<String> {
        self.order.lock().clone()
    }
}

/// Registry with the built-ins plus `recording`, `tracked` and `failing`
pub(crate) fn registry(recorder: &Arc<Recorder>) -> PluginRegistry {
    let mut registry = PluginRegistry::with_builtins();
    registry.register_destination(
        "recording",
        Arc::new(RecordingDestinationFactory {
            recorder: recorder.clone(),
        }),
    );
    registry.register_source(
        "tracked",
        Arc::new(TrackedSourceFactory {
            recorder: recorder.clone(),
        }),
    );
    registry.register_source("failing", Arc::new(FailingSourceFactory));
    registry.register_source("unpaged", Arc::new(UnpagedSourceFactory));
    registry
}

/// Destination settings:
/// - `todo: false` answers No to the no-op guard
/// - `raise: <severity>` raises the job's severity on execute
/// - `fail: true` fails execute
/// - `delayMs: <n>` sleeps before executing
/// - `failClose: true` fails close
/// - `panic: true` panics inside execute
struct RecordingDestinationFactory {
    recorder: Arc<Recorder>,
}

struct RecordingDestination {
    recorder: Arc<Recorder>,
    activity: Arc<ActivityRecord>,
    todo: bool,
    raise: Option<Severity>,
    fail: bool,
    delay: Option<Duration>,
    fail_close: bool,
    panic: bool,
    source: Option<Arc<dyn Source>>,
    page: Option<usize>,
    closed: bool,
}

#[async_trait]
impl DestinationFactory for RecordingDestinationFactory {
    async fn open(
        &self,
        _ctx: &RunContext,
        definition: &DestinationDefinition,
        activity: Arc<ActivityRecord>,
    ) -> PluginResult<Box<dyn Destination>> {
        self.recorder.opened.fetch_add(1, Ordering::SeqCst);
        self.recorder.order.lock().push(activity.name().to_string());

        let setting = |key: &str| {
            definition
                .settings
                .get(key)
                .and_then(crate::parser::models::scalar_to_string)
        };
        Ok(Box::new(RecordingDestination {
            recorder: self.recorder.clone(),
            activity,
            todo: setting("todo").map_or(true, |v| v != "false"),
            raise: setting("raise").and_then(|v| v.parse().ok()),
            fail: setting("fail").is_some_and(|v| v == "true"),
            delay: setting("delayMs")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis),
            fail_close: setting("failClose").is_some_and(|v| v == "true"),
            panic: setting("panic").is_some_and(|v| v == "true"),
            source: None,
            page: None,
            closed: false,
        }))
    }
}

#[async_trait]
impl Destination for RecordingDestination {
    fn kind(&self) -> &str {
        "recording"
    }

    fn set_resources(&mut self, _resources: Vec<Arc<dyn Source>>) {}

    fn set_source(&mut self, source: Option<Arc<dyn Source>>) {
        self.source = source;
    }

    fn set_page(&mut self, page: Option<usize>) {
        self.page = page;
    }

    async fn is_anything_to_do(&mut self) -> PluginResult<AnythingToDo> {
        Ok(if self.todo {
            AnythingToDo::Yes
        } else {
            AnythingToDo::No
        })
    }

    async fn execute(&mut self) -> PluginResult<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.recorder.executed.fetch_add(1, Ordering::SeqCst);
        if self.panic {
            panic!("recording destination told to panic");
        }

        let entries = match &self.source {
            Some(source) => source.entries().await?,
            None => Vec::new(),
        };
        self.recorder
            .executions
            .lock()
            .push((self.activity.name().to_string(), self.page, entries));

        if let Some(severity) = self.raise {
            self.activity.raise_severity(severity);
        }
        if self.fail {
            return Err(PluginError::new("recording destination told to fail"));
        }
        Ok(())
    }

    async fn close(&mut self) -> PluginResult<()> {
        if !self.closed {
            self.closed = true;
            self.recorder.closed.fetch_add(1, Ordering::SeqCst);
            if self.fail_close {
                return Err(PluginError::new("recording destination failed to close"));
            }
        }
        Ok(())
    }
}

/// Inline source that counts opens and closes
struct TrackedSourceFactory {
    recorder: Arc<Recorder>,
}

#[derive(Debug)]
struct TrackedSource {
    inner: Arc<dyn Source>,
    recorder: Arc<Recorder>,
}

#[async_trait]
impl SourceFactory for TrackedSourceFactory {
    async fn open(
        &self,
        ctx: &RunContext,
        definition: &SourceDefinition,
    ) -> PluginResult<Arc<dyn Source>> {
        let inner = InlineSourceFactory.open(ctx, definition).await?;
        self.recorder.sources_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(TrackedSource {
            inner,
            recorder: self.recorder.clone(),
        }))
    }
}

#[async_trait]
impl Source for TrackedSource {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn page(&self) -> Option<usize> {
        self.inner.page()
    }

    async fn entries(&self) -> PluginResult<Vec<Entry>> {
        self.inner.entries().await
    }

    async fn page_iterator(&self) -> PluginResult<Option<Box<dyn PageIterator>>> {
        self.inner.page_iterator().await
    }

    async fn close(&self) -> PluginResult<()> {
        self.recorder.sources_closed.fetch_add(1, Ordering::SeqCst);
        self.inner.close().await
    }
}

/// Source whose open always fails
struct FailingSourceFactory;

#[async_trait]
impl SourceFactory for FailingSourceFactory {
    async fn open(
        &self,
        _ctx: &RunContext,
        definition: &SourceDefinition,
    ) -> PluginResult<Arc<dyn Source>> {
        Err(PluginError::new(format!(
            "cannot connect source '{}'",
            definition.name
        )))
    }
}

/// Declares a page size but offers no page iterator
struct UnpagedSourceFactory;

#[async_trait]
impl SourceFactory for UnpagedSourceFactory {
    async fn open(
        &self,
        _ctx: &RunContext,
        definition: &SourceDefinition,
    ) -> PluginResult<Arc<dyn Source>> {
        Ok(Arc::new(UnpagedSource(MemorySource::new(
            &definition.name,
            vec![Entry::new().with("uid", ["solo"])],
        ))))
    }
}

#[derive(Debug)]
struct UnpagedSource(MemorySource);

#[async_trait]
impl Source for UnpagedSource {
    fn name(&self) -> &str {
        self.0.name()
    }

    fn page(&self) -> Option<usize> {
        Some(10)
    }

    async fn entries(&self) -> PluginResult<Vec<Entry>> {
        self.0.entries().await
    }

    async fn close(&self) -> PluginResult<()> {
        self.0.close().await
    }
}
