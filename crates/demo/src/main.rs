// Steadfast demo host
//
// Design Decision: Configuration comes from the environment (optionally a .env file)
// so the same binary runs against the in-memory store or PostgreSQL.
// Design Decision: Each subcommand starts one workflow and waits for it; rerunning
// with --workflow-id resumes or returns an earlier run instead of starting a new one.

mod workflows;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use steadfast_durable::prelude::*;
use steadfast_durable::StoreError;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use workflows::{ExtractInput, ExtractSerial, ParentParallel, ParentSerial, TASK_COUNT};

#[derive(Parser)]
#[command(name = "steadfast-demo")]
#[command(about = "Run the durable workflow demos")]
#[command(version)]
struct Cli {
    /// Directory the task workflows write their files into
    #[arg(long, env = "DEMO_OUTPUT_DIR", default_value = ".")]
    output_dir: PathBuf,

    /// Concurrency limit of the example queue (unbounded when omitted)
    #[arg(long, env = "DEMO_QUEUE_CONCURRENCY")]
    queue_concurrency: Option<u32>,

    /// Workflow id to start under, or to resume if it already exists
    #[arg(long)]
    workflow_id: Option<Uuid>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run ten tasks one after another as steps of a single workflow
    Serial,

    /// Enqueue ten task workflows and wait for all of them
    Parallel,

    /// Alternate durable sleeps with idempotent steps
    Extract {
        /// Number of sleep/step rounds
        #[arg(long, default_value_t = TASK_COUNT)]
        rounds: u32,

        /// Durable sleep before each step, in milliseconds
        #[arg(long, default_value_t = 1000)]
        pause_ms: u64,
    },

    /// List recent workflows
    List {
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
}

fn init_logging() {
    // RUST_LOG wins; LOG_LEVEL sets the level for both crates
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        EnvFilter::new(format!("steadfast_durable={level},steadfast_demo={level}"))
    });

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_logging();

    let cli = Cli::parse();
    let config = DurableConfig::from_env().context("Invalid durable configuration")?;
    tracing::info!(
        app_name = %config.app_name,
        executor_id = %config.executor_id,
        "steadfast-demo starting..."
    );

    let mut runtime = DurableRuntime::new(config);
    workflows::register_all(&mut runtime, cli.queue_concurrency)
        .context("Failed to register workflows")?;
    runtime
        .launch()
        .await
        .context("Failed to launch durable runtime")?;

    let result = tokio::select! {
        result = run_command(&runtime, &cli) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal, workflows resume on next launch");
            Ok(())
        }
    };

    runtime
        .shutdown()
        .await
        .context("Failed to shut down durable runtime")?;
    result
}

async fn run_command(runtime: &DurableRuntime, cli: &Cli) -> Result<()> {
    match &cli.command {
        Commands::Serial => {
            let summary: workflows::ParentSummary =
                run_or_resume(runtime, cli.workflow_id, ParentSerial::TYPE, &cli.output_dir).await?;
            print_json(&summary)
        }
        Commands::Parallel => {
            let summary: workflows::ParentSummary =
                run_or_resume(runtime, cli.workflow_id, ParentParallel::TYPE, &cli.output_dir).await?;
            print_json(&summary)
        }
        Commands::Extract { rounds, pause_ms } => {
            let input = ExtractInput {
                output_dir: cli.output_dir.clone(),
                rounds: *rounds,
                pause_ms: *pause_ms,
            };
            let results: Vec<u32> =
                run_or_resume(runtime, cli.workflow_id, ExtractSerial::TYPE, &input).await?;
            print_json(&results)
        }
        Commands::List { limit } => {
            let workflows = runtime
                .list_workflows(WorkflowFilter::default().with_limit(*limit))
                .await
                .context("Failed to list workflows")?;
            for info in workflows {
                println!(
                    "{}  {:<16} {:<10} {}",
                    info.id,
                    info.workflow_type,
                    info.status,
                    info.created_at.to_rfc3339()
                );
            }
            Ok(())
        }
    }
}

/// Start `workflow_type` (under `workflow_id` if given) and wait for its result
///
/// An id that already exists is attached to instead of started again.
async fn run_or_resume<O, I>(
    runtime: &DurableRuntime,
    workflow_id: Option<Uuid>,
    workflow_type: &str,
    input: &I,
) -> Result<O>
where
    O: serde::de::DeserializeOwned,
    I: Serialize + ?Sized,
{
    let handle: WorkflowHandle<O> = match workflow_id {
        Some(id) => {
            let options = StartOptions::new().with_workflow_id(id);
            match runtime.start_workflow_with(workflow_type, input, options).await {
                Ok(handle) => handle,
                Err(RuntimeError::Store(StoreError::DuplicateInstance(_))) => {
                    tracing::info!(workflow_id = %id, "Workflow exists, waiting for it");
                    runtime.retrieve_workflow(id).await?
                }
                Err(e) => return Err(e.into()),
            }
        }
        None => runtime.start_workflow(workflow_type, input).await?,
    };

    println!("workflow {}", handle.workflow_id());
    handle
        .get_result()
        .await
        .with_context(|| format!("Workflow {} did not complete", handle.workflow_id()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
