// Demo workflows
//
// - task-workflow: waits `index * 300ms`, then creates file-<index>.txt
//   (fails if the file already exists)
// - parent-serial: runs ten task bodies as durable steps, one after another
// - parent-parallel: enqueues ten task-workflow children on the example queue
// - extract-serial: ten rounds of durable sleep followed by an idempotent step

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use steadfast_durable::prelude::*;
use tracing::{info, warn};

pub const EXAMPLE_QUEUE: &str = "example-queue";
pub const TASK_COUNT: u32 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInput {
    pub index: u32,
    pub output_dir: PathBuf,
}

/// Outcome of a parent run; failed children are reported, not fatal
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ParentSummary {
    pub succeeded: u32,
    pub failed: Vec<String>,
}

fn task_file(dir: &Path, index: u32) -> PathBuf {
    dir.join(format!("file-{index}.txt"))
}

async fn run_task(input: &TaskInput) -> Result<(), StepError> {
    info!(index = input.index, "Task started");
    tokio::time::sleep(Duration::from_millis(u64::from(input.index) * 300)).await;

    let path = task_file(&input.output_dir, input.index);
    info!(index = input.index, path = %path.display(), "Task creating file");
    tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .await
        .map_err(|e| StepError::from(e).with_details(serde_json::json!({ "path": path })))?;

    info!(index = input.index, "Task completed");
    Ok(())
}

pub struct TaskWorkflow;

#[async_trait]
impl Workflow for TaskWorkflow {
    const TYPE: &'static str = "task-workflow";
    type Input = TaskInput;
    type Output = ();

    async fn run(&self, ctx: WorkflowContext, input: TaskInput) -> Result<(), WorkflowError> {
        ctx.run_step("create-file", || run_task(&input)).await?;
        Ok(())
    }
}

pub struct ParentSerial;

#[async_trait]
impl Workflow for ParentSerial {
    const TYPE: &'static str = "parent-serial";
    type Input = PathBuf;
    type Output = ParentSummary;

    async fn run(&self, ctx: WorkflowContext, output_dir: PathBuf) -> Result<ParentSummary, WorkflowError> {
        info!("parent-serial started");
        let mut summary = ParentSummary::default();

        for index in 0..TASK_COUNT {
            let input = TaskInput {
                index,
                output_dir: output_dir.clone(),
            };
            match ctx.run_step(format!("step {index}"), || run_task(&input)).await {
                Ok(()) => summary.succeeded += 1,
                Err(e) => {
                    warn!(index, error = %e, "Task step failed");
                    summary.failed.push(e.to_string());
                }
            }
        }

        info!(succeeded = summary.succeeded, "parent-serial completed");
        Ok(summary)
    }
}

pub struct ParentParallel;

#[async_trait]
impl Workflow for ParentParallel {
    const TYPE: &'static str = "parent-parallel";
    type Input = PathBuf;
    type Output = ParentSummary;

    async fn run(&self, ctx: WorkflowContext, output_dir: PathBuf) -> Result<ParentSummary, WorkflowError> {
        info!("parent-parallel started");
        let mut handles = Vec::with_capacity(TASK_COUNT as usize);
        for index in 0..TASK_COUNT {
            let input = TaskInput {
                index,
                output_dir: output_dir.clone(),
            };
            let handle: WorkflowHandle<()> = ctx
                .enqueue_workflow(EXAMPLE_QUEUE, TaskWorkflow::TYPE, &input)
                .await?;
            handles.push(handle);
        }
        info!("parent-parallel submitted all child tasks");

        let mut summary = ParentSummary::default();
        for handle in &handles {
            match handle.get_result().await {
                Ok(()) => summary.succeeded += 1,
                Err(HandleError::Failed(error)) => {
                    warn!(child = %handle.workflow_id(), %error, "Task failed");
                    summary.failed.push(error.to_string());
                }
                Err(e) => return Err(e.into()),
            }
        }

        info!(succeeded = summary.succeeded, "parent-parallel completed");
        Ok(summary)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractInput {
    pub output_dir: PathBuf,
    pub rounds: u32,
    pub pause_ms: u64,
}

/// Overwrites file-<index>.txt; safe to repeat
async fn extract_step(dir: &Path, index: u32, sleep: Duration) -> Result<u32, StepError> {
    info!(index, "Step started");
    tokio::time::sleep(sleep).await;

    let path = task_file(dir, index);
    info!(index, path = %path.display(), "Step creating file");
    tokio::fs::write(&path, b"").await?;

    info!(index, "Step completed");
    Ok(index)
}

pub struct ExtractSerial;

#[async_trait]
impl Workflow for ExtractSerial {
    const TYPE: &'static str = "extract-serial";
    type Input = ExtractInput;
    type Output = Vec<u32>;

    async fn run(&self, ctx: WorkflowContext, input: ExtractInput) -> Result<Vec<u32>, WorkflowError> {
        let mut results = Vec::with_capacity(input.rounds as usize);

        for index in 0..input.rounds {
            info!(index, "Persistent sleep started");
            ctx.sleep(Duration::from_millis(input.pause_ms)).await;
            info!(index, "Persistent sleep finished");

            let work = Duration::from_millis(200 * u64::from(index));
            let result = ctx
                .run_step(format!("step {index}"), || {
                    extract_step(&input.output_dir, index, work)
                })
                .await?;
            info!("Step succeeded {index}=={result}");
            results.push(result);
        }

        Ok(results)
    }
}

/// Register every demo workflow and the example queue
pub fn register_all(runtime: &mut DurableRuntime, queue_concurrency: Option<u32>) -> Result<(), RuntimeError> {
    runtime.register(TaskWorkflow)?;
    runtime.register(ParentSerial)?;
    runtime.register(ParentParallel)?;
    runtime.register(ExtractSerial)?;

    let queue = match queue_concurrency {
        Some(limit) => Queue::new(EXAMPLE_QUEUE).with_concurrency(limit),
        None => Queue::new(EXAMPLE_QUEUE),
    };
    runtime.register_queue(queue)
}
