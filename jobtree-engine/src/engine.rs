// Engine Entry Surface
// Initializes the pool, runs job files under a run lock, and collects run reports

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::execution::activity::{ActivityRecord, ActivityRegistry, ActivityStatus};
use crate::execution::context::{RunContext, VariableTable};
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::pool::{TaskHandle, TaskPool};
use crate::execution::runner::JobRunner;
use crate::lock::RunLock;
use crate::parser::document::{JobParser, JobValidator};
use crate::parser::models::{JobDocument, JobNode};
use crate::plugin::PluginRegistry;
use crate::report::RunReport;
use crate::run_id::RunIdGenerator;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Static variables file looked up in every addon directory
pub const ADDON_VARIABLES_FILE: &str = "variables.yaml";

/// Parameters of one run
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// Addon directory under the execution path
    pub addon: String,
    /// Job file, relative to the addon directory unless absolute
    pub job_file: PathBuf,
    /// Skip the run lock; plugins can see the flag through the context
    pub read_only: bool,
    /// Top-level jobs to run; empty runs all of them
    pub tasks: Vec<String>,
    /// Run parameters, loaded last into the variable table
    pub parameters: BTreeMap<String, String>,
}

impl RunRequest {
    pub fn new(addon: impl Into<String>, job_file: impl Into<PathBuf>) -> Self {
        Self {
            addon: addon.into(),
            job_file: job_file.into(),
            ..Self::default()
        }
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn with_task(mut self, task: impl Into<String>) -> Self {
        self.tasks.push(task.into());
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }
}

/// The embeddable job engine
pub struct Engine {
    config: EngineConfig,
    pool: Arc<TaskPool>,
    runner: JobRunner,
    run_ids: RunIdGenerator,
    event_tx: Option<ProgressSender>,
}

impl Engine {
    /// Start an engine with the built-in plugins
    pub fn initialize(config: EngineConfig) -> EngineResult<Self> {
        Self::with_plugins(config, PluginRegistry::with_builtins())
    }

    pub fn with_plugins(config: EngineConfig, plugins: PluginRegistry) -> EngineResult<Self> {
        let pool = Arc::new(TaskPool::new());
        pool.initialize(config.pool_size)?;
        info!(
            pool_size = config.pool_size,
            execution_path = %config.execution_path.display(),
            "engine initialized"
        );

        let runner = JobRunner::new(
            pool.clone(),
            Arc::new(ActivityRegistry::new()),
            Arc::new(plugins),
        );
        Ok(Self {
            config,
            pool,
            runner,
            run_ids: RunIdGenerator::new(),
            event_tx: None,
        })
    }

    /// Set progress event sender
    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.runner = self.runner.with_progress(tx.clone());
        self.event_tx = Some(tx);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Records of jobs currently executing
    pub fn activities(&self) -> &Arc<ActivityRegistry> {
        self.runner.activities()
    }

    /// Absolute location of a request's job file
    pub fn job_path(&self, request: &RunRequest) -> PathBuf {
        if request.job_file.is_absolute() {
            request.job_file.clone()
        } else {
            self.addon_dir(&request.addon).join(&request.job_file)
        }
    }

    fn addon_dir(&self, addon: &str) -> PathBuf {
        self.config.execution_path.join(addon)
    }

    /// Start a run; synchronous top-level jobs finish before this returns
    pub fn run(&self, request: RunRequest) -> EngineResult<RunHandle> {
        let addon_dir = self.addon_dir(&request.addon);
        let job_path = self.job_path(&request);
        let document = Arc::new(JobParser::parse_file(&job_path)?);
        JobValidator::validate(&document).map_err(|errors| {
            EngineError::configuration(
                errors
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; "),
            )
        })?;
        let jobs = select_jobs(&document, &request.tasks)?;

        // Shared with every top-level task so the marker outlives an unwaited handle
        let lock = if request.read_only {
            debug!(job_file = %job_path.display(), "read-only run, skipping lock");
            None
        } else {
            Some(Arc::new(RunLock::acquire(&self.config.lock_dir, &job_path)?))
        };

        let run_id = self.run_ids.next();
        let variables = self.load_variables(&addon_dir, &document, &request, &run_id)?;
        let ctx = RunContext::new(document.clone(), variables, &addon_dir, &run_id)
            .with_read_only(request.read_only);

        let names: Vec<String> = jobs.iter().map(|job| job.name.clone()).collect();
        info!(run_id = %run_id, document = %document.display_name(), jobs = ?names, "run started");
        self.event_tx.send_event(ExecutionEvent::RunStarted {
            run_id: run_id.clone(),
            document: document.display_name(),
            jobs: names,
        });

        let started = Instant::now();
        let (records, handles) = self.pool.block_on(async {
            let mut records = Vec::with_capacity(jobs.len());
            let mut handles = Vec::with_capacity(jobs.len());
            for job in jobs {
                let asynch = job.asynch;
                let (record, future) = self.runner.execute(ctx.clone(), job, None, false);
                let guard = lock.clone();
                let future = async move {
                    let record = future.await;
                    drop(guard);
                    record
                };
                records.push(record);
                handles.push(self.pool.submit(future, asynch).await?);
            }
            Ok::<_, EngineError>((records, handles))
        })??;

        Ok(RunHandle {
            run_id,
            document: document.display_name(),
            read_only: request.read_only,
            started,
            records,
            handles,
            lock,
            pool: self.pool.clone(),
            activities: self.runner.activities().clone(),
            event_tx: self.event_tx.clone(),
        })
    }

    /// Static addon variables, then document variables, then run parameters
    fn load_variables(
        &self,
        addon_dir: &Path,
        document: &JobDocument,
        request: &RunRequest,
        run_id: &str,
    ) -> EngineResult<Arc<VariableTable>> {
        let variables = Arc::new(VariableTable::new());

        let static_file = addon_dir.join(ADDON_VARIABLES_FILE);
        if static_file.is_file() {
            variables.extend(JobParser::parse_variables_file(&static_file)?);
        }
        variables.extend(document.variables.clone());
        variables.extend(request.parameters.clone());

        variables.put("runId", run_id);
        variables.put("addon", request.addon.as_str());
        variables.put("addonDir", addon_dir.display().to_string());

        if self.config.create_run_dirs {
            let run_dir = addon_dir.join("runs").join(run_id);
            fs::create_dir_all(&run_dir)?;
            variables.put("runDir", run_dir.display().to_string());
        }
        Ok(variables)
    }

    /// Drain in-flight work and stop the pool
    pub fn close(&self) -> EngineResult<()> {
        self.pool.close()?;
        info!("engine closed");
        Ok(())
    }
}

/// Top-level jobs named by the request, or all of them
fn select_jobs(document: &JobDocument, tasks: &[String]) -> EngineResult<Vec<Arc<JobNode>>> {
    if tasks.is_empty() {
        if document.jobs.is_empty() {
            return Err(EngineError::configuration(format!(
                "job document '{}' declares no jobs",
                document.display_name()
            )));
        }
        return Ok(document.jobs.clone());
    }
    tasks
        .iter()
        .map(|task| {
            document
                .top_level_job(task)
                .cloned()
                .ok_or_else(|| EngineError::JobNotFound(task.clone()))
        })
        .collect()
}

/// A started run; the run lock is held until every top-level job has finished
/// and the handle is waited on or dropped
pub struct RunHandle {
    run_id: String,
    document: String,
    read_only: bool,
    started: Instant,
    records: Vec<Arc<ActivityRecord>>,
    handles: Vec<TaskHandle<Arc<ActivityRecord>>>,
    lock: Option<Arc<RunLock>>,
    pool: Arc<TaskPool>,
    activities: Arc<ActivityRegistry>,
    event_tx: Option<ProgressSender>,
}

impl RunHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Marker file held by this run, if it is locked
    pub fn lock_path(&self) -> Option<&Path> {
        self.lock.as_deref().map(RunLock::path)
    }

    /// Live records of the top-level jobs
    pub fn records(&self) -> &[Arc<ActivityRecord>] {
        &self.records
    }

    pub fn is_finished(&self) -> bool {
        self.handles.iter().all(TaskHandle::is_ready)
    }

    /// Block until every top-level job resolves, then release the lock
    pub fn wait(self) -> EngineResult<RunReport> {
        let RunHandle {
            run_id,
            document,
            read_only,
            started,
            records,
            handles,
            lock,
            pool,
            activities,
            event_tx,
        } = self;

        pool.block_on(async {
            for (record, handle) in records.iter().zip(handles) {
                if let Err(error) = handle.join().await {
                    let error = EngineError::from(error);
                    warn!(job = %record.name(), "top-level task failed: {}", error);
                    record.fail(&error);
                    record.set_status(ActivityStatus::Completed);
                    activities.release(record.id());
                }
            }
        })?;
        drop(lock);

        let report = RunReport {
            run_id,
            document,
            read_only,
            duration: started.elapsed(),
            jobs: records.iter().map(|record| record.snapshot()).collect(),
        };
        info!(
            run_id = %report.run_id,
            severity = %report.severity(),
            errors = report.error_count(),
            "run completed"
        );
        event_tx.send_event(ExecutionEvent::RunCompleted {
            run_id: report.run_id.clone(),
            severity: report.severity(),
            duration: report.duration,
        });
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::activity::Severity;
    use crate::execution::events::progress_channel;
    use crate::plugin::testing::{self, Recorder};
    use std::sync::atomic::Ordering;
    use std::sync::Barrier;
    use std::thread;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        engine: Engine,
        recorder: Arc<Recorder>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            fs::create_dir_all(dir.path().join("directory")).unwrap();
            let recorder = Arc::new(Recorder::default());
            let config = EngineConfig::default()
                .with_execution_path(dir.path())
                .with_lock_dir(dir.path().join("locks"))
                .with_pool_size(4)
                .unwrap();
            let engine = Engine::with_plugins(config, testing::registry(&recorder)).unwrap();
            Self {
                dir,
                engine,
                recorder,
            }
        }

        fn write(&self, name: &str, content: &str) {
            fs::write(self.dir.path().join("directory").join(name), content).unwrap();
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = self.engine.close();
        }
    }

    const SYNC_AND_ASYNC: &str = r#"
jobs:
  - name: main
    executeJob:
      - name: inline-child
      - name: pooled-child
childJobs:
  - name: inline-child
    source: { name: people, type: inline }
    destination: { type: recording, todo: false }
  - name: pooled-child
    asynch: true
    source: { name: people, type: inline }
    destination: { type: noop }
"#;

    #[test]
    fn test_noop_children_complete_green() {
        let fx = Fixture::new();
        fx.write("sync.yaml", SYNC_AND_ASYNC);

        let report = fx
            .engine
            .run(RunRequest::new("directory", "sync.yaml"))
            .unwrap()
            .wait()
            .unwrap();

        let main = report.job("main").unwrap();
        assert_eq!(main.status, ActivityStatus::Completed);
        assert_eq!(main.severity, Severity::Green);
        assert_eq!(main.children.len(), 2);
        assert_eq!(report.error_count(), 0);
        assert!(report.is_success());
        assert_eq!(fx.recorder.executed.load(Ordering::SeqCst), 0);
        assert!(fx.engine.activities().is_empty());
    }

    #[test]
    fn test_paged_run_reports_each_page() {
        let fx = Fixture::new();
        fx.write(
            "paged.yaml",
            r#"
jobs:
  - name: export
    source:
      name: people
      type: inline
      page: 2
      entries: [{uid: a}, {uid: b}, {uid: c}, {uid: d}, {uid: e}]
    destination: { type: recording }
"#,
        );

        let report = fx
            .engine
            .run(RunRequest::new("directory", "paged.yaml"))
            .unwrap()
            .wait()
            .unwrap();

        let export = report.job("export").unwrap();
        assert_eq!(export.children.len(), 3);
        let mut sizes: Vec<usize> = fx
            .recorder
            .executions()
            .iter()
            .map(|(_, _, entries)| entries.len())
            .collect();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![1, 2, 2]);
    }

    #[test]
    fn test_lock_refuses_overlapping_run() {
        let fx = Fixture::new();
        fx.write(
            "slow.yaml",
            "jobs:\n  - name: slow\n    asynch: true\n    destination: { type: recording, delayMs: 100 }\n",
        );

        let first = fx.engine.run(RunRequest::new("directory", "slow.yaml")).unwrap();
        let marker = first.lock_path().unwrap().to_path_buf();
        assert!(marker.exists());

        let second = fx.engine.run(RunRequest::new("directory", "slow.yaml"));
        assert!(matches!(second, Err(EngineError::LockContention { .. })));

        first.wait().unwrap();
        assert!(!marker.exists());
        fx.engine
            .run(RunRequest::new("directory", "slow.yaml"))
            .unwrap()
            .wait()
            .unwrap();
    }

    #[test]
    fn test_dropped_handle_keeps_lock_until_jobs_finish() {
        let fx = Fixture::new();
        fx.write(
            "slow.yaml",
            "jobs:\n  - name: slow\n    asynch: true\n    destination: { type: recording, delayMs: 300 }\n",
        );

        let first = fx.engine.run(RunRequest::new("directory", "slow.yaml")).unwrap();
        let marker = first.lock_path().unwrap().to_path_buf();
        drop(first);

        assert!(marker.exists());
        let second = fx.engine.run(RunRequest::new("directory", "slow.yaml"));
        assert!(matches!(second, Err(EngineError::LockContention { .. })));

        let deadline = Instant::now() + std::time::Duration::from_secs(5);
        while marker.exists() && Instant::now() < deadline {
            thread::sleep(std::time::Duration::from_millis(20));
        }
        assert!(!marker.exists());
        assert_eq!(fx.recorder.executed(), 1);
        fx.engine
            .run(RunRequest::new("directory", "slow.yaml"))
            .unwrap()
            .wait()
            .unwrap();
    }

    #[test]
    fn test_cyclic_document_rejected_before_lock() {
        let fx = Fixture::new();
        fx.write(
            "loop.yaml",
            "jobs:\n  - name: loop\n    executeJob:\n      - name: loop\n",
        );
        let err = fx
            .engine
            .run(RunRequest::new("directory", "loop.yaml"))
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::Configuration(ref message) if message.contains("circular")));
        assert!(!fx.dir.path().join("locks").exists());
    }

    #[test]
    fn test_concurrent_runs_exactly_one_proceeds() {
        let fx = Fixture::new();
        fx.write(
            "slow.yaml",
            "jobs:\n  - name: slow\n    asynch: true\n    destination: { type: recording, delayMs: 100 }\n",
        );

        let barrier = Barrier::new(2);

        let outcomes: Vec<Result<RunReport, EngineError>> = thread::scope(|scope| {
            let spawned: Vec<_> = (0..2)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        fx.engine
                            .run(RunRequest::new("directory", "slow.yaml"))
                            .and_then(RunHandle::wait)
                    })
                })
                .collect();
            spawned.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let succeeded = outcomes.iter().filter(|o| o.is_ok()).count();
        let contended = outcomes
            .iter()
            .filter(|o| matches!(o, Err(EngineError::LockContention { .. })))
            .count();
        assert_eq!((succeeded, contended), (1, 1));
    }

    #[test]
    fn test_read_only_runs_skip_lock() {
        let fx = Fixture::new();
        fx.write(
            "slow.yaml",
            "jobs:\n  - name: slow\n    asynch: true\n    destination: { type: recording, delayMs: 50 }\n",
        );

        let request = RunRequest::new("directory", "slow.yaml").with_read_only(true);
        let first = fx.engine.run(request.clone()).unwrap();
        let second = fx.engine.run(request).unwrap();
        assert!(first.lock_path().is_none());
        assert_ne!(first.run_id(), second.run_id());

        assert!(first.wait().unwrap().read_only);
        second.wait().unwrap();
    }

    #[test]
    fn test_variables_and_run_dir() {
        let fx = Fixture::new();
        fs::write(
            fx.dir.path().join("directory").join(ADDON_VARIABLES_FILE),
            "region: eu\ntier: gold\n",
        )
        .unwrap();
        fx.write(
            "vars.yaml",
            r#"
variables:
  tier: silver
jobs:
  - name: load
    source:
      name: info
      type: inline
      entries:
        - region: "%region%"
          tier: "%tier%"
          user: "%user%"
          run: "%runId%"
          dir: "%runDir%"
    destination: { type: recording }
"#,
        );

        let handle = fx
            .engine
            .run(RunRequest::new("directory", "vars.yaml").with_parameter("user", "ops"))
            .unwrap();
        let run_id = handle.run_id().to_string();
        handle.wait().unwrap();

        let executions = fx.recorder.executions();
        let entry = &executions[0].2[0];
        assert_eq!(entry.first("region"), Some("eu"));
        assert_eq!(entry.first("tier"), Some("silver"));
        assert_eq!(entry.first("user"), Some("ops"));
        assert_eq!(entry.first("run"), Some(run_id.as_str()));

        let run_dir = PathBuf::from(entry.first("dir").unwrap());
        assert!(run_dir.is_dir());
        assert!(run_dir.ends_with(Path::new("runs").join(&run_id)));
    }

    #[test]
    fn test_task_selection() {
        let fx = Fixture::new();
        fx.write(
            "two.yaml",
            r#"
jobs:
  - name: first
    destination: { type: recording }
  - name: second
    destination: { type: recording }
"#,
        );

        let report = fx
            .engine
            .run(RunRequest::new("directory", "two.yaml").with_task("second"))
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(report.jobs.len(), 1);
        assert_eq!(fx.recorder.order(), vec!["second"]);

        let missing = fx
            .engine
            .run(RunRequest::new("directory", "two.yaml").with_task("third"));
        assert!(matches!(missing, Err(EngineError::JobNotFound(name)) if name == "third"));
    }

    #[test]
    fn test_malformed_document_escapes_run() {
        let fx = Fixture::new();
        fx.write("bad.yaml", "jobs:\n  - name: a\n    asynch: [\n");
        let err = fx
            .engine
            .run(RunRequest::new("directory", "bad.yaml"))
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::Parse(_)));
        assert!(!fx.dir.path().join("locks").exists());
    }

    #[test]
    fn test_red_run_is_not_success() {
        let fx = Fixture::new();
        fx.write(
            "fail.yaml",
            "jobs:\n  - name: load\n    destination: { type: recording, fail: true }\n",
        );
        let report = fx
            .engine
            .run(RunRequest::new("directory", "fail.yaml"))
            .unwrap()
            .wait()
            .unwrap();
        assert_eq!(report.severity(), Severity::Red);
        assert!(!report.is_success());
        assert_eq!(report.error_count(), 1);
    }

    #[test]
    fn test_run_events() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("directory")).unwrap();
        fs::write(
            dir.path().join("directory").join("one.yaml"),
            "jobs:\n  - name: load\n    destination: { type: noop }\n",
        )
        .unwrap();
        let config = EngineConfig::default()
            .with_execution_path(dir.path())
            .with_lock_dir(dir.path().join("locks"));
        let (tx, mut rx) = progress_channel();
        let engine = Engine::initialize(config).unwrap().with_progress(tx);

        engine
            .run(RunRequest::new("directory", "one.yaml"))
            .unwrap()
            .wait()
            .unwrap();
        engine.close().unwrap();

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert!(matches!(events.first(), Some(ExecutionEvent::RunStarted { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, ExecutionEvent::JobCompleted { job_name, .. } if job_name == "load")));
        assert!(matches!(
            events.last(),
            Some(ExecutionEvent::RunCompleted {
                severity: Severity::Green,
                ..
            })
        ));
    }

    #[test]
    fn test_run_after_close_fails() {
        let fx = Fixture::new();
        fx.write("one.yaml", "jobs:\n  - name: load\n    destination: { type: noop }\n");
        fx.engine.close().unwrap();
        let err = fx
            .engine
            .run(RunRequest::new("directory", "one.yaml"))
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::Pool(_)));
    }
}
