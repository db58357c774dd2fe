// Job Runner
// Recursively executes job nodes: template expansion, child-job and paged fan-out, leaf pipelines

use crate::error::{EngineError, EngineResult};
use crate::execution::activity::{ActivityRecord, ActivityRegistry, ActivityStatus, Severity};
use crate::execution::context::RunContext;
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::iterator::IteratorSpec;
use crate::execution::pool::{TaskHandle, TaskPool};
use crate::parser::document::JobParser;
use crate::parser::models::{
    ExecuteJob, ExecuteTemplate, JobDocument, JobKind, JobNode, LeafDefinition, PagedBy,
    SourceDefinition,
};
use crate::plugin::{AnythingToDo, Destination, Entry, MemorySource, PluginRegistry, Source};

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Future resolving to the record of a finished job node
pub type JobFuture = Pin<Box<dyn Future<Output = Arc<ActivityRecord>> + Send>>;

/// One page of a paged source, handed to a per-page job
#[derive(Debug, Clone)]
pub struct PageSlice {
    /// Name of the source or resource the page was drawn from
    pub source: String,
    pub index: usize,
    pub entries: Vec<Entry>,
}

/// Document and job name of every ancestor, root first
#[derive(Debug, Clone, Default)]
struct Lineage(Arc<Vec<(Option<PathBuf>, String)>>);

impl Lineage {
    fn depth(&self) -> usize {
        self.0.len()
    }

    fn child(&self, document: &JobDocument, job: &str) -> Self {
        let mut chain = (*self.0).clone();
        chain.push((document.path.clone(), job.to_string()));
        Lineage(Arc::new(chain))
    }

    fn contains(&self, document: &JobDocument, job: &str) -> bool {
        self.0
            .iter()
            .any(|(path, name)| *path == document.path && name == job)
    }

    fn describe(&self, next: &str) -> String {
        let mut names: Vec<&str> = self.0.iter().map(|(_, name)| name.as_str()).collect();
        names.push(next);
        names.join(" -> ")
    }
}

/// A job node ready to run, with its already-attached record
struct NodeRun {
    ctx: RunContext,
    job: Arc<JobNode>,
    record: Arc<ActivityRecord>,
    /// Set when this node or an ancestor declared `asynchChildJobs`
    force_asynch: bool,
    page: Option<PageSlice>,
    lineage: Lineage,
}

/// Record of a submitted child with the handle of its task
type ChildHandle = (Arc<ActivityRecord>, TaskHandle<Arc<ActivityRecord>>);

/// Sources and destination opened for one leaf pipeline
#[derive(Default)]
struct OpenedLeaf {
    resources: Vec<Arc<dyn Source>>,
    source: Option<Arc<dyn Source>>,
    destination: Option<Box<dyn Destination>>,
}

/// Recursive job executor
#[derive(Clone)]
pub struct JobRunner {
    pool: Arc<TaskPool>,
    activities: Arc<ActivityRegistry>,
    plugins: Arc<PluginRegistry>,
    event_tx: Option<ProgressSender>,
    /// Job documents referenced through `executeJob.file`
    documents: Arc<Mutex<HashMap<PathBuf, Arc<JobDocument>>>>,
}

impl JobRunner {
    pub fn new(
        pool: Arc<TaskPool>,
        activities: Arc<ActivityRegistry>,
        plugins: Arc<PluginRegistry>,
    ) -> Self {
        Self {
            pool,
            activities,
            plugins,
            event_tx: None,
            documents: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Set progress event sender
    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn activities(&self) -> &Arc<ActivityRegistry> {
        &self.activities
    }

    pub fn pool(&self) -> &Arc<TaskPool> {
        &self.pool
    }

    /// Prepare a top-level job: its record is created now, the work runs when the future is polled
    pub fn execute(
        &self,
        ctx: RunContext,
        job: Arc<JobNode>,
        parent: Option<&Arc<ActivityRecord>>,
        force_asynch: bool,
    ) -> (Arc<ActivityRecord>, JobFuture) {
        self.prepare(ctx, job, parent, force_asynch, None, Lineage::default())
    }

    fn prepare(
        &self,
        ctx: RunContext,
        job: Arc<JobNode>,
        parent: Option<&Arc<ActivityRecord>>,
        force_asynch: bool,
        page: Option<PageSlice>,
        lineage: Lineage,
    ) -> (Arc<ActivityRecord>, JobFuture) {
        let name = match &page {
            Some(slice) => format!("{}#page{}", job.name, slice.index),
            None => job.name.clone(),
        };
        let record = self.activities.create(ctx.run_id(), name);
        if let Some(parent) = parent {
            parent.add_child(record.clone());
        }

        let runner = self.clone();
        let run = NodeRun {
            ctx,
            job,
            record: record.clone(),
            force_asynch,
            page,
            lineage,
        };
        (record, Box::pin(async move { runner.run_node(run).await }))
    }

    /// Per-node wrapper: failures are contained in the node's record
    async fn run_node(self, run: NodeRun) -> Arc<ActivityRecord> {
        let record = run.record.clone();
        let run_id = run.ctx.run_id().to_string();
        let strategy = match (&run.job.kind, &run.page) {
            (JobKind::PagedLeaf { .. }, Some(_)) => "page",
            (kind, _) => kind.label(),
        };

        self.activities.register(record.clone());
        record.set_status(ActivityStatus::Running);
        record.set_description(format!("processing {} job", strategy));
        self.event_tx.send_event(ExecutionEvent::job_started(
            &run_id,
            record.id(),
            record.name(),
            strategy,
            run.lineage.depth(),
        ));
        debug!(job = %record.name(), strategy, depth = run.lineage.depth(), "executing job");

        if let Err(error) = self.dispatch(run).await {
            warn!(job = %record.name(), kind = error.kind(), "{}", error);
            record.fail(&error);
        }

        record.set_status(ActivityStatus::Completed);
        self.activities.release(record.id());
        self.event_tx.send_event(ExecutionEvent::job_completed(
            &run_id,
            record.id(),
            record.name(),
            record.severity(),
            record.duration().unwrap_or(Duration::ZERO),
        ));
        record
    }

    async fn dispatch(&self, run: NodeRun) -> EngineResult<()> {
        let NodeRun {
            ctx,
            job,
            record,
            force_asynch,
            page,
            lineage,
        } = run;
        let ctx = ctx.bind(job.variables.iter())?;
        let lineage = lineage.child(ctx.document(), &job.name);

        match &job.kind {
            JobKind::TemplateGroup(directives) => {
                self.run_templates(&ctx, &record, directives, force_asynch, &lineage)
                    .await
            }
            JobKind::ChildJobGroup(references) => {
                self.run_child_jobs(&ctx, &job, &record, references, force_asynch, &lineage)
                    .await
            }
            JobKind::PagedLeaf { leaf, .. } if page.is_some() => {
                self.run_leaf(&ctx, &record, leaf, page.as_ref()).await
            }
            JobKind::PagedLeaf { leaf, paged } => {
                self.run_paged(&ctx, &job, &record, leaf, *paged, force_asynch, &lineage)
                    .await
            }
            JobKind::Leaf(leaf) => self.run_leaf(&ctx, &record, leaf, None).await,
        }
    }

    // =========================================================================
    // Template expansion
    // =========================================================================

    async fn run_templates(
        &self,
        ctx: &RunContext,
        record: &Arc<ActivityRecord>,
        directives: &[ExecuteTemplate],
        force_asynch: bool,
        lineage: &Lineage,
    ) -> EngineResult<()> {
        for (index, directive) in directives.iter().enumerate() {
            let params = directive
                .parameter_list()
                .into_iter()
                .enumerate()
                .map(|(i, value)| (format!("p{}", i + 1), value));
            let ctx = ctx.bind(params)?;

            let template = ctx
                .document()
                .template(&directive.name)
                .cloned()
                .ok_or_else(|| EngineError::TemplateNotFound(directive.name.clone()))?;

            let Some(expression) = &directive.iterator else {
                record.set_inner_job_count(record.inner_job_count() + 1);
                let node = Arc::new(template.renamed(format!("{}-{}", template.name, index)));
                let (_, future) =
                    self.prepare(ctx.clone(), node, Some(record), force_asynch, None, lineage.clone());
                future.await;
                continue;
            };

            let tokens = IteratorSpec::parse(&ctx.resolve_string(expression)?)?.tokens();
            debug!(template = %template.name, tokens = tokens.len(), "expanding template");
            record.set_inner_job_count(record.inner_job_count() + tokens.len());

            // Iterations run one after another on this task
            for (position, token) in tokens.into_iter().enumerate() {
                let iteration = ctx.bind([("i", token.as_str())])?;
                let node = Arc::new(template.renamed(format!(
                    "{}-{}-{}",
                    template.name, index, position
                )));
                let (_, future) =
                    self.prepare(iteration, node, Some(record), force_asynch, None, lineage.clone());
                future.await;
            }
        }
        Ok(())
    }

    // =========================================================================
    // Child-job fan-out
    // =========================================================================

    async fn run_child_jobs(
        &self,
        ctx: &RunContext,
        job: &JobNode,
        record: &Arc<ActivityRecord>,
        references: &[ExecuteJob],
        force_asynch: bool,
        lineage: &Lineage,
    ) -> EngineResult<()> {
        record.set_inner_job_count(references.len());
        let asynch_children = force_asynch || job.asynch_child_jobs;

        let mut handles = Vec::with_capacity(references.len());
        let mut failure = None;
        for reference in references {
            if !self.below_threshold(ctx, job, record, handles.len()) {
                break;
            }

            let (child_ctx, child) = match self.resolve_child(ctx, reference, lineage) {
                Ok(resolved) => resolved,
                Err(error) => {
                    failure = Some(error);
                    break;
                }
            };
            let asynch = asynch_children || child.asynch;
            let (child_record, future) =
                self.prepare(child_ctx, child, Some(record), asynch_children, None, lineage.clone());
            match self.pool.submit(future, asynch).await {
                Ok(handle) => handles.push((child_record, handle)),
                Err(error) => {
                    failure = Some(error.into());
                    break;
                }
            }
        }

        self.join_all(record, handles).await;
        failure.map_or(Ok(()), Err)
    }

    /// Context and node for an `executeJob` reference; a job may not reach itself
    fn resolve_child(
        &self,
        ctx: &RunContext,
        reference: &ExecuteJob,
        lineage: &Lineage,
    ) -> EngineResult<(RunContext, Arc<JobNode>)> {
        let target = match &reference.file {
            Some(file) => {
                let path = ctx.resolve_relative(file)?;
                let document = self.load_document(&path)?;
                ctx.variables().extend(document.variables.clone());
                ctx.with_document(document)
            }
            None => ctx.clone(),
        };

        let child = target
            .document()
            .job(&reference.name)
            .cloned()
            .ok_or_else(|| EngineError::JobNotFound(reference.name.clone()))?;
        if lineage.contains(target.document(), &child.name) {
            return Err(EngineError::configuration(format!(
                "executeJob cycle: {}",
                lineage.describe(&child.name)
            )));
        }

        // Parameters are evaluated in the referencing job's scope
        let parameters = reference
            .parameters
            .iter()
            .map(|(name, value)| Ok((name.clone(), ctx.resolve_string(value)?)))
            .collect::<EngineResult<Vec<(String, String)>>>()?;
        Ok((target.bind(parameters)?, child))
    }

    fn load_document(&self, path: &Path) -> EngineResult<Arc<JobDocument>> {
        if let Some(document) = self.documents.lock().get(path) {
            return Ok(document.clone());
        }
        debug!(path = %path.display(), "loading job document");
        let document = Arc::new(JobParser::parse_file(path)?);
        self.documents
            .lock()
            .insert(path.to_path_buf(), document.clone());
        Ok(document)
    }

    // =========================================================================
    // Paged fan-out
    // =========================================================================

    #[allow(clippy::too_many_arguments)]
    async fn run_paged(
        &self,
        ctx: &RunContext,
        job: &Arc<JobNode>,
        record: &Arc<ActivityRecord>,
        leaf: &LeafDefinition,
        paged: PagedBy,
        force_asynch: bool,
        lineage: &Lineage,
    ) -> EngineResult<()> {
        let definition = leaf.paged_definition(paged).ok_or_else(|| {
            EngineError::configuration(format!("job '{}' has no paged source", job.name))
        })?;
        let source = self.open_source(ctx, definition).await?;

        let mut pages = match source.page_iterator().await {
            Ok(Some(pages)) => pages,
            Ok(None) => {
                debug!(job = %job.name, source = %definition.name, "source offers no pages, running as leaf");
                self.close_source(record, source.as_ref()).await;
                return self.run_leaf(ctx, record, leaf, None).await;
            }
            Err(error) => {
                self.close_source(record, source.as_ref()).await;
                return Err(EngineError::source(&definition.name, error));
            }
        };

        let mut handles = Vec::new();
        let mut failure = None;
        let mut index = 0;
        loop {
            if !self.below_threshold(ctx, job, record, handles.len()) {
                break;
            }
            let entries = match pages.next_page().await {
                None => break,
                Some(Ok(entries)) => entries,
                Some(Err(error)) => {
                    failure = Some(EngineError::source(&definition.name, error));
                    break;
                }
            };

            debug!(job = %job.name, page = index, entries = entries.len(), "dispatching page");
            self.event_tx.send_event(ExecutionEvent::PageDispatched {
                run_id: ctx.run_id().to_string(),
                job_name: job.name.clone(),
                source: definition.name.clone(),
                page: index,
                entries: entries.len(),
            });

            let slice = PageSlice {
                source: definition.name.clone(),
                index,
                entries,
            };
            let (page_record, future) = self.prepare(
                ctx.clone(),
                job.clone(),
                Some(record),
                force_asynch,
                Some(slice),
                lineage.clone(),
            );
            match self.pool.submit(future, true).await {
                Ok(handle) => handles.push((page_record, handle)),
                Err(error) => {
                    failure = Some(error.into());
                    break;
                }
            }
            index += 1;
            record.set_inner_job_count(index);
        }
        drop(pages);

        self.close_source(record, source.as_ref()).await;
        self.join_all(record, handles).await;
        failure.map_or(Ok(()), Err)
    }

    // =========================================================================
    // Leaf pipeline
    // =========================================================================

    async fn run_leaf(
        &self,
        ctx: &RunContext,
        record: &Arc<ActivityRecord>,
        leaf: &LeafDefinition,
        page: Option<&PageSlice>,
    ) -> EngineResult<()> {
        let mut opened = OpenedLeaf::default();
        let result = self.run_pipeline(ctx, record, leaf, page, &mut opened).await;
        self.close_leaf(record, opened).await;
        result
    }

    async fn run_pipeline(
        &self,
        ctx: &RunContext,
        record: &Arc<ActivityRecord>,
        leaf: &LeafDefinition,
        page: Option<&PageSlice>,
        opened: &mut OpenedLeaf,
    ) -> EngineResult<()> {
        for definition in &leaf.resources {
            let resource = self.open_or_page(ctx, definition, page).await?;
            opened.resources.push(resource);
        }
        if let Some(definition) = &leaf.source {
            opened.source = Some(self.open_or_page(ctx, definition, page).await?);
        }

        let kind = leaf.destination.kind();
        let factory = self.plugins.destination_factory(kind)?;
        let destination = opened.destination.insert(
            factory
                .open(ctx, &leaf.destination, record.clone())
                .await
                .map_err(|e| EngineError::destination(kind, e))?,
        );
        destination.set_resources(opened.resources.clone());
        destination.set_source(opened.source.clone());
        destination.set_page(page.map(|p| p.index));

        let todo = destination
            .is_anything_to_do()
            .await
            .map_err(|e| EngineError::destination(kind, e))?;
        match todo {
            AnythingToDo::No => debug!(job = %record.name(), "destination has nothing to do"),
            AnythingToDo::Yes => destination
                .execute()
                .await
                .map_err(|e| EngineError::destination(kind, e))?,
        }
        Ok(())
    }

    /// Open a definition, or wrap the current page when it names the paged source
    async fn open_or_page(
        &self,
        ctx: &RunContext,
        definition: &SourceDefinition,
        page: Option<&PageSlice>,
    ) -> EngineResult<Arc<dyn Source>> {
        match page {
            Some(slice) if slice.source == definition.name => Ok(Arc::new(MemorySource::new(
                &definition.name,
                slice.entries.clone(),
            ))),
            _ => self.open_source(ctx, definition).await,
        }
    }

    async fn open_source(
        &self,
        ctx: &RunContext,
        definition: &SourceDefinition,
    ) -> EngineResult<Arc<dyn Source>> {
        self.plugins
            .source_factory(&definition.kind)?
            .open(ctx, definition)
            .await
            .map_err(|e| EngineError::source(&definition.name, e))
    }

    /// Close everything a leaf opened, exactly once each
    async fn close_leaf(&self, record: &ActivityRecord, opened: OpenedLeaf) {
        if let Some(mut destination) = opened.destination {
            if let Err(error) = destination.close().await {
                let error = EngineError::destination(destination.kind(), error);
                self.record_close_failure(record, &error);
            }
        }
        if let Some(source) = opened.source {
            self.close_source(record, source.as_ref()).await;
        }
        for resource in opened.resources {
            self.close_source(record, resource.as_ref()).await;
        }
    }

    async fn close_source(&self, record: &ActivityRecord, source: &dyn Source) {
        if let Err(error) = source.close().await {
            let error = EngineError::source(source.name(), error);
            self.record_close_failure(record, &error);
        }
    }

    fn record_close_failure(&self, record: &ActivityRecord, error: &EngineError) {
        warn!(job = %record.name(), "close failed: {}", error);
        record.raise_severity(Severity::Orange);
        record.add_error(error.kind(), format!("close failed: {}", error));
    }

    // =========================================================================
    // Fan-out helpers
    // =========================================================================

    /// Failure-threshold guard, checked before each fan-out submission
    fn below_threshold(
        &self,
        ctx: &RunContext,
        job: &JobNode,
        record: &ActivityRecord,
        submitted: usize,
    ) -> bool {
        let Some(threshold) = job.failure_threshold else {
            return true;
        };
        let severity = record.severity();
        if severity < threshold {
            return true;
        }

        info!(
            job = %job.name,
            %severity,
            %threshold,
            submitted,
            "failure threshold reached, halting fan-out"
        );
        self.event_tx.send_event(ExecutionEvent::FanOutHalted {
            run_id: ctx.run_id().to_string(),
            job_name: job.name.clone(),
            threshold,
            submitted,
        });
        false
    }

    /// Fork/join barrier; a crashed task is reported on the parent
    async fn join_all(&self, record: &ActivityRecord, handles: Vec<ChildHandle>) {
        for (child, handle) in handles {
            if let Err(error) = handle.join().await {
                let error = EngineError::from(error);
                warn!(job = %record.name(), child = %child.name(), "child task failed: {}", error);
                record.fail(&error);
                self.abandon(&child);
            }
        }
    }

    /// Close out a record whose task died before its wrapper could
    pub(crate) fn abandon(&self, record: &ActivityRecord) {
        record.set_status(ActivityStatus::Completed);
        self.activities.release(record.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::context::VariableTable;
    use crate::plugin::testing::{self, Recorder};
    use std::sync::atomic::Ordering;

    struct Harness {
        pool: Arc<TaskPool>,
        runner: JobRunner,
        recorder: Arc<Recorder>,
        base: PathBuf,
    }

    impl Harness {
        fn new(base: &Path) -> Self {
            let recorder = Arc::new(Recorder::default());
            let pool = Arc::new(TaskPool::new());
            pool.initialize(4).unwrap();
            let runner = JobRunner::new(
                pool.clone(),
                Arc::new(ActivityRegistry::new()),
                Arc::new(testing::registry(&recorder)),
            );
            Self {
                pool,
                runner,
                recorder,
                base: base.to_path_buf(),
            }
        }

        fn run(&self, yaml: &str, job: &str) -> Arc<ActivityRecord> {
            let document = Arc::new(JobParser::parse(yaml).unwrap());
            let ctx = RunContext::new(
                document.clone(),
                Arc::new(VariableTable::new()),
                &self.base,
                "test-run",
            );
            ctx.variables().extend(document.variables.clone());
            let node = document.top_level_job(job).unwrap().clone();
            let (record, future) = self.runner.execute(ctx, node, None, false);
            let finished = self.pool.block_on(future).unwrap();
            assert!(Arc::ptr_eq(&record, &finished));
            record
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            let _ = self.pool.close();
        }
    }

    fn harness() -> Harness {
        Harness::new(Path::new("/tmp"))
    }

    fn names(record: &ActivityRecord) -> Vec<String> {
        record
            .children()
            .iter()
            .map(|c| c.name().to_string())
            .collect()
    }

    #[test]
    fn test_template_expansion_names_and_bindings() {
        let yaml = r#"
jobs:
  - name: expand
    executeTemplate:
      - name: per-letter
        parameters: ou=people dc=example
        iterator: "ay..bb"
      - name: per-letter
templates:
  - name: per-letter
    source:
      name: letter
      type: inline
      entries:
        - i: "%i%"
          base: "%p1%,%p2%"
    destination:
      type: recording
"#;
        let h = harness();
        let record = h.run(yaml, "expand");

        assert_eq!(
            names(&record),
            vec![
                "per-letter-0-0",
                "per-letter-0-1",
                "per-letter-0-2",
                "per-letter-0-3",
                "per-letter-1"
            ]
        );
        assert_eq!(record.severity(), Severity::Green);
        assert_eq!(record.inner_job_count(), 5);

        let executions = h.recorder.executions();
        assert_eq!(executions.len(), 5);
        assert_eq!(executions[0].2[0].first("i"), Some("ay"));
        assert_eq!(executions[0].2[0].first("base"), Some("ou=people,dc=example"));
        // Bindings do not leak into the next directive
        assert_eq!(executions[4].2[0].first("i"), Some("%i%"));
        assert_eq!(executions[4].2[0].first("base"), Some("%p1%,%p2%"));
    }

    #[test]
    fn test_missing_template_fails_node() {
        let yaml = r#"
jobs:
  - name: expand
    executeTemplate:
      - name: nowhere
"#;
        let record = harness().run(yaml, "expand");
        assert_eq!(record.status(), ActivityStatus::Completed);
        assert_eq!(record.severity(), Severity::Red);
        assert_eq!(record.errors()[0].kind, "TemplateNotFound");
    }

    #[test]
    fn test_numeric_iterator_is_unsupported() {
        let yaml = r#"
jobs:
  - name: expand
    executeTemplate:
      - name: t
        iterator: "1..3"
templates:
  - name: t
    destination:
      type: recording
"#;
        let h = harness();
        let record = h.run(yaml, "expand");
        assert_eq!(record.errors()[0].kind, "UnsupportedIteratorForm");
        assert!(record.errors()[0].message.contains("not implemented"));
        assert_eq!(h.recorder.executed(), 0);
    }

    #[test]
    fn test_threshold_stops_further_children() {
        let yaml = r#"
jobs:
  - name: main
    failureThreshold: orange
    executeJob:
      - name: c1
      - name: c2
      - name: c3
      - name: c4
      - name: c5
childJobs:
  - name: c1
    destination: { type: recording }
  - name: c2
    destination: { type: recording }
  - name: c3
    destination: { type: recording, raise: orange }
  - name: c4
    destination: { type: recording }
  - name: c5
    destination: { type: recording }
"#;
        let h = harness();
        let record = h.run(yaml, "main");

        assert_eq!(h.recorder.order(), vec!["c1", "c2", "c3"]);
        assert_eq!(names(&record), vec!["c1", "c2", "c3"]);
        assert!(record
            .children()
            .iter()
            .all(|c| c.status() == ActivityStatus::Completed));
        assert_eq!(record.status(), ActivityStatus::Completed);
        assert_eq!(record.severity(), Severity::Orange);
        assert_eq!(record.inner_job_count(), 5);
    }

    #[test]
    fn test_async_children_are_joined() {
        let yaml = r#"
jobs:
  - name: main
    asynchChildJobs: true
    executeJob:
      - name: slow
      - name: group
childJobs:
  - name: slow
    destination: { type: recording, delayMs: 30 }
  - name: group
    executeJob:
      - name: leaf
  - name: leaf
    destination: { type: recording, delayMs: 10 }
"#;
        let h = harness();
        let record = h.run(yaml, "main");

        assert_eq!(h.recorder.executed(), 2);
        assert_eq!(record.status(), ActivityStatus::Completed);
        let group = record.children()[1].clone();
        assert_eq!(group.children()[0].status(), ActivityStatus::Completed);
        assert!(h.runner.activities().is_empty());
    }

    #[test]
    fn test_panicked_child_is_closed_out() {
        let yaml = r#"
jobs:
  - name: main
    asynchChildJobs: true
    executeJob:
      - name: crash
      - name: fine
childJobs:
  - name: crash
    destination: { type: recording, panic: true }
  - name: fine
    destination: { type: recording }
"#;
        let h = harness();
        let record = h.run(yaml, "main");

        assert_eq!(record.severity(), Severity::Red);
        assert_eq!(record.errors()[0].kind, "PoolError");
        for child in record.children() {
            assert_eq!(child.status(), ActivityStatus::Completed, "{}", child.name());
        }
        assert!(h.runner.activities().is_empty());
    }

    #[test]
    fn test_paged_source_fans_out_disjoint_pages() {
        let yaml = r#"
jobs:
  - name: export
    source:
      name: people
      type: tracked
      page: 2
      entries:
        - uid: a
        - uid: b
        - uid: c
        - uid: d
        - uid: e
    destination:
      type: recording
"#;
        let h = harness();
        let record = h.run(yaml, "export");

        let mut executions = h.recorder.executions();
        executions.sort_by_key(|(_, page, _)| *page);
        let sizes: Vec<usize> = executions.iter().map(|(_, _, e)| e.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(
            executions.iter().map(|(_, page, _)| *page).collect::<Vec<_>>(),
            vec![Some(0), Some(1), Some(2)]
        );

        let mut seen = std::collections::HashSet::new();
        for (_, _, entries) in &executions {
            for entry in entries {
                assert!(seen.insert(entry.first("uid").unwrap().to_string()));
            }
        }
        assert_eq!(seen.len(), 5);

        assert_eq!(names(&record), vec!["export#page0", "export#page1", "export#page2"]);
        assert_eq!(h.recorder.sources_opened.load(Ordering::SeqCst), 1);
        assert_eq!(h.recorder.sources_closed.load(Ordering::SeqCst), 1);
        assert_eq!(record.severity(), Severity::Green);
    }

    #[test]
    fn test_paged_threshold_halts_pages() {
        let yaml = r#"
jobs:
  - name: export
    failureThreshold: red
    source:
      name: people
      type: inline
      page: 1
      entries:
        - uid: a
        - uid: b
        - uid: c
    destination:
      type: recording
      fail: true
      delayMs: 5
"#;
        let h = harness();
        let record = h.run(yaml, "export");
        assert_eq!(record.severity(), Severity::Red);
        // Pages already submitted still complete
        assert!(record
            .children()
            .iter()
            .all(|c| c.status() == ActivityStatus::Completed));
        assert!(h.recorder.executed() >= 1);
    }

    #[test]
    fn test_paged_source_without_iterator_runs_as_leaf() {
        let yaml = r#"
jobs:
  - name: export
    source:
      name: people
      type: unpaged
      page: 10
    destination:
      type: recording
"#;
        let h = harness();
        let record = h.run(yaml, "export");

        assert!(record.children().is_empty());
        let executions = h.recorder.executions();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].1, None);
        assert_eq!(executions[0].2[0].first("uid"), Some("solo"));
    }

    #[test]
    fn test_noop_guard_skips_execute() {
        let yaml = r#"
jobs:
  - name: load
    source: { name: people, type: tracked }
    destination: { type: recording, todo: false }
"#;
        let h = harness();
        let record = h.run(yaml, "load");
        assert_eq!(h.recorder.executed(), 0);
        assert_eq!(h.recorder.closed.load(Ordering::SeqCst), 1);
        assert_eq!(h.recorder.sources_closed.load(Ordering::SeqCst), 1);
        assert_eq!(record.severity(), Severity::Green);
    }

    #[test]
    fn test_failed_execute_still_closes_everything() {
        let yaml = r#"
jobs:
  - name: load
    resources:
      - { name: lookup, type: tracked }
    source: { name: people, type: tracked }
    destination: { type: recording, fail: true }
"#;
        let h = harness();
        let record = h.run(yaml, "load");

        assert_eq!(record.severity(), Severity::Red);
        assert_eq!(record.errors()[0].kind, "DestinationError");
        assert_eq!(h.recorder.opened.load(Ordering::SeqCst), 1);
        assert_eq!(h.recorder.closed.load(Ordering::SeqCst), 1);
        assert_eq!(h.recorder.sources_opened.load(Ordering::SeqCst), 2);
        assert_eq!(h.recorder.sources_closed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_failing_source_closes_opened_resources() {
        let yaml = r#"
jobs:
  - name: load
    resources:
      - { name: lookup, type: tracked }
    source: { name: people, type: failing }
    destination: { type: recording }
"#;
        let h = harness();
        let record = h.run(yaml, "load");

        assert_eq!(record.errors()[0].kind, "SourceError");
        assert_eq!(h.recorder.opened.load(Ordering::SeqCst), 0);
        assert_eq!(h.recorder.sources_closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_close_failure_is_orange() {
        let yaml = r#"
jobs:
  - name: load
    source: { name: people, type: inline }
    destination: { type: recording, failClose: true }
"#;
        let h = harness();
        let record = h.run(yaml, "load");
        assert_eq!(h.recorder.executed(), 1);
        assert_eq!(record.severity(), Severity::Orange);
        assert_eq!(record.error_count(), 1);
    }

    #[test]
    fn test_unknown_plugin_is_configuration_error() {
        let yaml = r#"
jobs:
  - name: load
    destination: { type: ldap }
"#;
        let record = harness().run(yaml, "load");
        assert_eq!(record.errors()[0].kind, "ConfigurationError");
    }

    #[test]
    fn test_child_job_in_other_file_with_parameters() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("groups.yaml"),
            r#"
variables:
  groupBase: ou=groups
jobs: []
childJobs:
  - name: groups
    variables:
      filter: "(cn=%prefix%*)"
    source:
      name: groups
      type: inline
      entries:
        - base: "%groupBase%"
          scope: "%scope%"
          filter: "%filter%"
    destination:
      type: recording
"#,
        )
        .unwrap();

        let yaml = r#"
variables:
  depth: sub
jobs:
  - name: main
    variables:
      prefix: adm
    executeJob:
      - name: groups
        file: groups.yaml
        parameters:
          scope: "%depth%tree"
"#;
        let h = Harness::new(dir.path());
        let record = h.run(yaml, "main");

        assert_eq!(record.severity(), Severity::Green, "{:?}", record.snapshot());
        let executions = h.recorder.executions();
        let entry = &executions[0].2[0];
        assert_eq!(entry.first("base"), Some("ou=groups"));
        assert_eq!(entry.first("scope"), Some("subtree"));
        assert_eq!(entry.first("filter"), Some("(cn=adm*)"));
    }

    #[test]
    fn test_missing_child_job_stops_submission() {
        let yaml = r#"
jobs:
  - name: main
    executeJob:
      - name: first
      - name: ghost
      - name: first
childJobs:
  - name: first
    destination: { type: recording }
"#;
        let h = harness();
        let record = h.run(yaml, "main");

        assert_eq!(h.recorder.executed(), 1);
        assert_eq!(record.severity(), Severity::Red);
        assert_eq!(record.errors()[0].kind, "JobNotFound");
    }

    #[test]
    fn test_child_job_cycle_is_contained() {
        let yaml = r#"
jobs:
  - name: main
    executeJob:
      - name: ping
childJobs:
  - name: ping
    executeJob:
      - name: pong
  - name: pong
    executeJob:
      - name: ping
"#;
        let h = harness();
        let record = h.run(yaml, "main");

        assert_eq!(record.severity(), Severity::Red);
        let ping = record.children()[0].clone();
        let pong = ping.children()[0].clone();
        assert!(pong.children().is_empty());
        let errors = pong.errors();
        assert_eq!(errors[0].kind, "ConfigurationError");
        assert!(errors[0].message.contains("main -> ping -> pong -> ping"));
        assert!(h.runner.activities().is_empty());
    }

    #[test]
    fn test_child_job_cycle_across_files_is_contained() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("a.yaml"),
            "jobs: []\nchildJobs:\n  - name: back\n    executeJob:\n      - name: hop\n        file: b.yaml\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("b.yaml"),
            "jobs: []\nchildJobs:\n  - name: hop\n    executeJob:\n      - name: back\n        file: a.yaml\n",
        )
        .unwrap();

        let yaml = r#"
jobs:
  - name: main
    executeJob:
      - name: hop
        file: b.yaml
"#;
        let h = Harness::new(dir.path());
        let record = h.run(yaml, "main");

        assert_eq!(record.severity(), Severity::Red);
        let hop = record.children()[0].clone();
        let back = hop.children()[0].clone();
        assert!(back.children().is_empty());
        assert_eq!(back.errors()[0].kind, "ConfigurationError");
        assert!(back.errors()[0].message.contains("main -> hop -> back -> hop"));
    }

    #[test]
    fn test_events_are_published() {
        let yaml = r#"
jobs:
  - name: load
    destination: { type: noop }
"#;
        let (tx, mut rx) = crate::execution::events::progress_channel();
        let mut h = harness();
        h.runner = h.runner.clone().with_progress(tx);
        h.run(yaml, "load");

        let first = rx.try_recv().unwrap();
        assert!(matches!(first, ExecutionEvent::JobStarted { strategy: "leaf", .. }));
        let second = rx.try_recv().unwrap();
        assert!(matches!(
            second,
            ExecutionEvent::JobCompleted {
                severity: Severity::Green,
                ..
            }
        ));
    }
}
