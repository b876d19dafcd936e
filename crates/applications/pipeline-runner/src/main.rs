//! pipeline-runner - preemption-aware genomics pipeline submission
//!
//! ## Usage
//!
//! ```bash
//! # Write a defaults file for the workflow
//! pipeline-runner defaults --workflow germline.yaml --output runner_default.json
//!
//! # Run a job, retrying on preemptible workers first
//! pipeline-runner run job.json --workflow germline.yaml --defaults runner_default.json
//!
//! # Show the request that would be submitted
//! pipeline-runner run job.json --workflow germline.yaml --dry-run
//! ```
//!
//! Exit codes: 0 success, 1 fatal failure, 2 bad configuration or missing
//! input, 3 retries exhausted, 130 cancelled.

use anyhow::Context;
use clap::{Parser, Subcommand};
use pipeline_runner::{
    client::DEFAULT_SUBMIT_ATTEMPTS,
    credentials,
    genomics::{DEFAULT_COMPUTE_ENDPOINT, DEFAULT_GENOMICS_ENDPOINT},
    inputs::{required_inputs, DEFAULT_STORAGE_ENDPOINT},
    report::{EXIT_CANCELLED, EXIT_FATAL, EXIT_SUCCESS, EXIT_USAGE},
    shutdown::run_or_cancel,
    install_shutdown_handler, GcsObjectStore, GenomicsBackend, InputExistenceChecker,
    JobRequestBuilder, JobVars, Orchestrator, OrchestratorConfig, PipelineError, RetryPolicy,
    RunnerConfig, WorkflowDescription,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Preemption-aware submission and retry for Google Genomics pipelines
#[derive(Parser)]
#[command(name = "pipeline-runner")]
#[command(about = "Run a genomics pipeline, retrying on worker preemption", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a job and supervise it to completion
    Run {
        /// JSON file with the job variables for this run
        config: PathBuf,

        /// Workflow description (YAML or JSON); repeat to merge several
        #[arg(long, required = true)]
        workflow: Vec<PathBuf>,

        /// Defaults file; derived from the workflow when omitted
        #[arg(long)]
        defaults: Option<PathBuf>,

        /// Do not check that the input files exist before running the pipeline
        #[arg(long)]
        no_check_inputs_exist: bool,

        /// Seconds between polls of the running operation (at least 1)
        #[arg(long, default_value = "30", value_parser = parse_interval)]
        polling_interval: Duration,

        /// Seconds to wait before trusting the fleet API's preemption records
        #[arg(long, default_value = "30", value_parser = parse_seconds)]
        settle_delay: Duration,

        /// Base interval of the submission backoff (seconds, at least 1)
        #[arg(long, default_value = "2", value_parser = parse_seconds)]
        submit_base_interval: Duration,

        /// Print the request body and exit without submitting
        #[arg(long)]
        dry_run: bool,

        /// Genomics API endpoint
        #[arg(long, default_value = DEFAULT_GENOMICS_ENDPOINT, hide = true)]
        genomics_endpoint: String,

        /// Compute Engine API endpoint
        #[arg(long, default_value = DEFAULT_COMPUTE_ENDPOINT, hide = true)]
        compute_endpoint: String,

        /// Cloud Storage API endpoint
        #[arg(long, default_value = DEFAULT_STORAGE_ENDPOINT, hide = true)]
        storage_endpoint: String,
    },

    /// Print the defaults file for a workflow
    Defaults {
        /// Workflow description (YAML or JSON); repeat to merge several
        #[arg(long, required = true)]
        workflow: Vec<PathBuf>,

        /// Write to this file instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn parse_seconds(s: &str) -> std::result::Result<Duration, String> {
    let secs: f64 = s
        .parse()
        .map_err(|_| format!("'{}' is not a number of seconds", s))?;
    Duration::try_from_secs_f64(secs).map_err(|e| format!("invalid duration '{}': {}", s, e))
}

/// Polling interval; anything under a second would hammer the status API
fn parse_interval(s: &str) -> std::result::Result<Duration, String> {
    let interval = parse_seconds(s)?;
    if interval < Duration::from_secs(1) {
        return Err(format!("interval must be at least 1 second, got '{}'", s));
    }
    Ok(interval)
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pipeline_runner=info,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            config,
            workflow,
            defaults,
            no_check_inputs_exist,
            polling_interval,
            settle_delay,
            submit_base_interval,
            dry_run,
            genomics_endpoint,
            compute_endpoint,
            storage_endpoint,
        } => {
            let args = RunArgs {
                config,
                workflow,
                defaults,
                check_inputs: !no_check_inputs_exist,
                polling_interval,
                settle_delay,
                submit_base_interval,
                dry_run,
                genomics_endpoint,
                compute_endpoint,
                storage_endpoint,
            };
            run(args).await
        }
        Commands::Defaults { workflow, output } => {
            write_defaults(&workflow, output.as_deref()).map(|_| EXIT_SUCCESS)
        }
    };

    match result {
        Ok(code) => exit_code(code),
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            exit_code(error_exit_code(&e))
        }
    }
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

/// Exit code for an error raised before or outside the retry loop
fn error_exit_code(e: &anyhow::Error) -> i32 {
    match e.downcast_ref::<PipelineError>() {
        Some(PipelineError::Config(_)) | Some(PipelineError::MissingInput(_)) => EXIT_USAGE,
        Some(PipelineError::Cancelled) => EXIT_CANCELLED,
        _ => EXIT_FATAL,
    }
}

struct RunArgs {
    config: PathBuf,
    workflow: Vec<PathBuf>,
    defaults: Option<PathBuf>,
    check_inputs: bool,
    polling_interval: Duration,
    settle_delay: Duration,
    submit_base_interval: Duration,
    dry_run: bool,
    genomics_endpoint: String,
    compute_endpoint: String,
    storage_endpoint: String,
}

async fn run(args: RunArgs) -> anyhow::Result<i32> {
    let workflow = WorkflowDescription::load_all(&args.workflow)?;

    let mut vars = JobVars::load_merged(args.defaults.as_deref(), &args.config)?;
    if args.defaults.is_none() {
        vars.merge_missing(&workflow.default_vars());
    }

    let config = RunnerConfig::from_vars(vars)?;
    let budget = config.retry_budget()?;
    let retry_policy = RetryPolicy::new(DEFAULT_SUBMIT_ATTEMPTS, args.submit_base_interval)?;
    let request = JobRequestBuilder::new(&config, &workflow).build()?;

    if args.dry_run {
        let mut preview = request.clone();
        preview.set_preemptible(budget.preemptible_remaining() > 0);
        println!(
            "{}",
            serde_json::to_string_pretty(&GenomicsBackend::run_body(&preview))?
        );
        return Ok(EXIT_SUCCESS);
    }

    let cancel = install_shutdown_handler();
    let credentials = credentials::from_env()?;

    if args.check_inputs {
        let required = required_inputs(&config)?;
        if !required.is_empty() {
            let store =
                GcsObjectStore::new(credentials.clone())?.with_endpoint(args.storage_endpoint);
            let checker = InputExistenceChecker::new(Arc::new(store));
            run_or_cancel(checker.check(&required), &cancel).await?;
        }
    } else {
        warn!("Skipping input existence checks");
    }

    let backend = GenomicsBackend::new(config.project_id.clone(), credentials)?
        .with_endpoints(args.genomics_endpoint, args.compute_endpoint);

    let orchestrator_config = OrchestratorConfig::default()
        .with_polling_interval(args.polling_interval)
        .with_settle_delay(args.settle_delay)
        .with_retry_policy(retry_policy);
    let orchestrator = Orchestrator::with_config(Arc::new(backend), orchestrator_config);

    info!(
        "🚀 Running {} pipeline in project {} ({} attempt(s) permitted)",
        config.pipeline.label(),
        config.project_id,
        budget.remaining()
    );

    let report = orchestrator.run(request, budget, cancel).await?;

    if let Some(operation) = report.last_operation() {
        println!("{}", serde_json::to_string_pretty(operation)?);
    }
    if report.outcome.is_success() {
        info!("✅ {}", report.status_line());
    } else {
        error!("❌ {}", report.status_line());
    }
    println!("{}", report.status_line());

    Ok(report.exit_code())
}

fn write_defaults(workflow: &[PathBuf], output: Option<&Path>) -> anyhow::Result<()> {
    let workflow = WorkflowDescription::load_all(workflow)?;
    let defaults = serde_json::to_string_pretty(workflow.default_vars().as_map())?;

    match output {
        Some(path) => {
            std::fs::write(path, defaults + "\n")
                .with_context(|| format!("cannot write {}", path.display()))?;
            info!("✅ Wrote defaults for {} to {}", workflow.name, path.display());
        }
        None => println!("{}", defaults),
    }
    Ok(())
}
