use crate::output;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::thread;

use clap::Args;
use color_eyre::Result;

use jobtree_engine::execution::events::LogLevel;
use jobtree_engine::{
    progress_channel, Engine, EngineConfig, ExecutionEvent, ProgressReceiver, ReportFormat,
    RunRequest, Severity,
};

/// Run a job document
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Job document, relative to the addon directory
    pub job_file: PathBuf,

    /// Addon directory under the execution path
    #[arg(long, short = 'a', default_value = ".")]
    pub addon: String,

    /// Run only this top-level job (can be repeated)
    #[arg(long = "task", short = 't', value_name = "JOB")]
    pub tasks: Vec<String>,

    /// Set a run parameter (can be repeated, format: name=value)
    #[arg(long = "var", value_name = "NAME=VALUE")]
    pub variables: Vec<String>,

    /// Skip the run lock and flag the run as read-only
    #[arg(long)]
    pub read_only: bool,

    /// Worker threads in the task pool
    #[arg(long, value_name = "N")]
    pub pool_size: Option<usize>,

    /// Root holding addon directories (default: current directory)
    #[arg(long, short = 'x', value_name = "DIR")]
    pub execution_path: Option<PathBuf>,

    /// Directory for run lock markers
    #[arg(long, value_name = "DIR")]
    pub lock_dir: Option<PathBuf>,

    /// Do not create a per-run directory under the addon
    #[arg(long)]
    pub no_run_dirs: bool,

    /// Report format printed when the run ends
    #[arg(long, default_value = "terminal", value_name = "FORMAT")]
    pub format: ReportFormat,
}

pub fn execute(args: RunArgs) -> Result<()> {
    // Parse parameters from --var flags
    let mut parameters = BTreeMap::new();
    for var_str in &args.variables {
        if let Some((name, value)) = var_str.split_once('=') {
            parameters.insert(name.to_string(), value.to_string());
        } else {
            color_eyre::eyre::bail!("Invalid variable format '{}'. Expected name=value", var_str);
        }
    }

    let execution_path = match &args.execution_path {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()?,
    };

    let mut config = EngineConfig::from_env()?
        .with_execution_path(execution_path)
        .with_run_dirs(!args.no_run_dirs);
    if let Some(size) = args.pool_size {
        config = config.with_pool_size(size)?;
    }
    if let Some(dir) = &args.lock_dir {
        config = config.with_lock_dir(dir);
    }

    tracing::debug!(?config, "engine configuration");

    let request = RunRequest {
        addon: args.addon.clone(),
        job_file: args.job_file.clone(),
        read_only: args.read_only,
        tasks: args.tasks.clone(),
        parameters,
    };

    let (tx, rx) = progress_channel();
    let engine = Engine::initialize(config)?.with_progress(tx);
    output::status("Loading", &format!("{}", engine.job_path(&request).display()));

    // Events are printed from their own thread while the engine blocks this one
    let printer = thread::spawn(move || print_events(rx));

    let outcome = engine.run(request).and_then(|handle| handle.wait());
    engine.close()?;
    drop(engine);
    let _ = printer.join();

    let report = outcome?;
    println!("{}", report.render(args.format));

    if !report.is_success() {
        std::process::exit(1);
    }

    Ok(())
}

fn print_events(mut rx: ProgressReceiver) {
    while let Some(event) = rx.blocking_recv() {
        match &event {
            ExecutionEvent::RunStarted {
                run_id,
                document,
                jobs,
            } => {
                eprintln!();
                output::header(&format!(
                    "Run {} of '{}' ({} jobs)",
                    run_id,
                    document,
                    jobs.len()
                ));
            }

            ExecutionEvent::RunCompleted {
                severity, duration, ..
            } => {
                eprintln!();
                match severity {
                    Severity::Red => output::failure(&format!(
                        "Run failed after {:.2}s",
                        duration.as_secs_f64()
                    )),
                    Severity::Orange => output::warning(&format!(
                        "Run completed with warnings in {:.2}s",
                        duration.as_secs_f64()
                    )),
                    Severity::Green => output::success(&format!(
                        "Run completed successfully in {:.2}s",
                        duration.as_secs_f64()
                    )),
                }
            }

            ExecutionEvent::JobStarted {
                job_name,
                strategy,
                depth,
                ..
            } => {
                output::dim(&format!("{}{} [{}]", indent(*depth), job_name, strategy));
            }

            ExecutionEvent::JobCompleted {
                job_name,
                severity,
                duration,
                ..
            } => {
                let line = format!("  Job '{}' {} ({:.2}s)", job_name, severity, duration.as_secs_f64());
                match severity {
                    Severity::Green => output::dim_success(&line),
                    Severity::Orange => output::warning(&line),
                    Severity::Red => output::dim_failure(&line),
                }
            }

            ExecutionEvent::PageDispatched {
                job_name,
                source,
                page,
                entries,
                ..
            } => {
                output::dim(&format!(
                    "  Job '{}' page {} of '{}' ({} entries)",
                    job_name, page, source, entries
                ));
            }

            ExecutionEvent::FanOutHalted {
                job_name,
                threshold,
                submitted,
                ..
            } => {
                output::warning(&format!(
                    "Job '{}' stopped after {} children: failure threshold {} reached",
                    job_name, submitted, threshold
                ));
            }

            ExecutionEvent::Log { level, message, .. } => match level {
                LogLevel::Error => output::error(message),
                LogLevel::Warning => output::warning(message),
                LogLevel::Info => output::info(message),
                LogLevel::Debug => output::dim(message),
            },
        }
    }
}

fn indent(depth: usize) -> String {
    "  ".repeat(depth + 1)
}
