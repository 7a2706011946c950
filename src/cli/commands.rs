//! CLI command definitions for applyforge.
//!
//! Operator surface over the pipeline: submit a posting URL, watch a run's
//! progress, drive queued runs with a worker pool, retry a single failed
//! question, or cancel a run.

use std::sync::Arc;

use clap::Parser;
use tracing::info;
use uuid::Uuid;

use crate::extract::ExtractionAdapter;
use crate::fetch::{ContentFetcher, RenderedFetcher, StaticFetcher};
use crate::generate::{AnswerCache, AnswerGenerator, ContextBundle, StaticContextSource};
use crate::llm::OpenAiCompatClient;
use crate::pipeline::{JobOrchestrator, PipelineConfig};
use crate::scheduler::{RunQueue, WorkerPool, WorkerPoolConfig};
use crate::storage::{PostgresStateStore, StateStore};

/// Asynchronous drafting pipeline for job and scholarship postings.
#[derive(Parser)]
#[command(name = "applyforge")]
#[command(about = "Fetch a posting, extract its questions, draft answers")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Submit a posting URL and create a pipeline run.
    Submit(SubmitArgs),

    /// Show a run's progress and per-question outcome.
    Status(StatusArgs),

    /// Start a worker pool that drives queued and recovered runs.
    Worker(WorkerArgs),

    /// Retry a single failed question of a completed run.
    Retry(RetryArgs),

    /// Request cooperative cancellation of a run.
    Cancel(CancelArgs),
}

/// Arguments for `applyforge submit`.
#[derive(Parser, Debug)]
pub struct SubmitArgs {
    /// The posting URL to process.
    pub url: String,

    /// Opaque user reference whose document context should be used.
    #[arg(short, long, default_value = "default")]
    pub user: String,

    /// Drive the run to completion in this process instead of leaving it
    /// for a worker.
    #[arg(long)]
    pub wait: bool,
}

/// Arguments for `applyforge status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// The run to inspect.
    pub run_id: Uuid,

    /// Also print the stage attempt history.
    #[arg(long)]
    pub history: bool,
}

/// Arguments for `applyforge worker`.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Number of run-driving workers (overrides PIPELINE_NUM_WORKERS).
    #[arg(short = 'n', long)]
    pub workers: Option<usize>,
}

/// Arguments for `applyforge retry`.
#[derive(Parser, Debug)]
pub struct RetryArgs {
    /// The run owning the failed question.
    pub run_id: Uuid,

    /// Order index of the question to retry.
    pub question: u32,
}

/// Arguments for `applyforge cancel`.
#[derive(Parser, Debug)]
pub struct CancelArgs {
    /// The run to cancel.
    pub run_id: Uuid,
}

/// Parses CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Builds the context source from `CONTEXT_BUNDLE_PATH`, a JSON file of
/// document-derived facts. Falls back to an empty bundle when unset.
fn build_context_source() -> anyhow::Result<StaticContextSource> {
    match std::env::var("CONTEXT_BUNDLE_PATH") {
        Ok(path) => Ok(StaticContextSource::from_json_file(std::path::Path::new(
            &path,
        ))?),
        Err(_) => {
            info!("CONTEXT_BUNDLE_PATH not set; using an empty context bundle");
            Ok(StaticContextSource::new(ContextBundle::new()))
        }
    }
}

/// Builds the orchestrator from configuration and environment.
async fn build_orchestrator(
    config: &PipelineConfig,
) -> anyhow::Result<(Arc<JobOrchestrator>, Arc<dyn StateStore>)> {
    let store = PostgresStateStore::connect(&config.database_url).await?;
    store.run_migrations().await?;
    let store: Arc<dyn StateStore> = Arc::new(store);

    let static_fetcher = StaticFetcher::new(config.fetch_timeout)?;
    let rendered_fetcher = match RenderedFetcher::from_env(config.render_timeout) {
        Some(result) => Some(Box::new(result?) as Box<dyn crate::fetch::PageFetcher>),
        None => {
            info!("RENDER_API_BASE not set; rendered fallback disabled");
            None
        }
    };
    let fetcher = ContentFetcher::new(Box::new(static_fetcher), rendered_fetcher)
        .with_min_content_chars(config.min_content_chars);

    let client = Arc::new(OpenAiCompatClient::from_env()?);
    let extractor = ExtractionAdapter::new(client.clone(), config.extraction_model.clone());
    let generator = AnswerGenerator::new(
        client,
        Arc::new(AnswerCache::default()),
        config.max_concurrent_generations,
        config.generation_model.clone(),
    )
    .with_task_policy(config.task_policy());

    let orchestrator = JobOrchestrator::new(
        Arc::clone(&store),
        fetcher,
        extractor,
        generator,
        Arc::new(build_context_source()?),
        config.stage_policy(),
    );

    Ok((Arc::new(orchestrator), store))
}

/// Runs the CLI with parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = PipelineConfig::from_env()?;

    match cli.command {
        Commands::Submit(args) => {
            let (orchestrator, _) = build_orchestrator(&config).await?;
            let run = orchestrator.submit(&args.url, &args.user).await?;
            println!("{}", run.id);

            if args.wait {
                let finished = orchestrator.drive(run.id).await?;
                let status = orchestrator.run_status(run.id).await?;
                println!(
                    "stage: {} questions: {} answered: {} failed: {}",
                    finished.stage,
                    status.questions_extracted,
                    status.answers_generated,
                    status.answers_failed
                );
            }
            Ok(())
        }
        Commands::Status(args) => {
            let (orchestrator, store) = build_orchestrator(&config).await?;
            let status = orchestrator.run_status(args.run_id).await?;
            println!("stage: {}", status.stage);
            println!("questions extracted: {}", status.questions_extracted);
            println!("answers generated: {}", status.answers_generated);
            println!("answers failed: {}", status.answers_failed);

            let run = store.load_run(args.run_id).await?;
            if let Some(failure) = run.failure {
                println!(
                    "failure: [{}] {} at stage {}",
                    failure.class, failure.message, failure.stage
                );
            }

            if args.history {
                for record in orchestrator.attempt_history(args.run_id).await? {
                    println!(
                        "  {} attempt {} -> {:?} ({})",
                        record.stage, record.attempt, record.outcome, record.at
                    );
                }
            }
            Ok(())
        }
        Commands::Worker(args) => {
            let (orchestrator, _) = build_orchestrator(&config).await?;
            let queue = Arc::new(RunQueue::new());

            let pool_config = WorkerPoolConfig::new(args.workers.unwrap_or(config.num_workers))
                .with_stale_run_after(config.stale_run_after);
            let mut pool = WorkerPool::new(pool_config, queue, orchestrator);
            pool.start().await?;

            info!("Worker pool running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            pool.shutdown().await?;
            Ok(())
        }
        Commands::Retry(args) => {
            let (orchestrator, _) = build_orchestrator(&config).await?;
            match orchestrator.retry_question(args.run_id, args.question).await? {
                Some(status) => println!("question {}: {}", args.question, status),
                None => println!("question {} was not in a failed state", args.question),
            }
            Ok(())
        }
        Commands::Cancel(args) => {
            let (orchestrator, _) = build_orchestrator(&config).await?;
            orchestrator.cancel(args.run_id).await?;
            println!("cancellation requested for {}", args.run_id);
            Ok(())
        }
    }
}
