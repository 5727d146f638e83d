//! # Durable Execution Engine
//!
//! A storage-mediated workflow engine: workflows are ordinary async functions
//! whose steps are recorded in a durable log, so an interrupted workflow is
//! resumed by replaying its body and short-circuiting every recorded step.
//!
//! ## Features
//!
//! - **Replayed workflows**: step outcomes are recorded once per (instance, index) and reused on resumption
//! - **Retries**: optional per-step retry policies with exponential backoff and jitter
//! - **Durable sleep**: long sleeps persist a wake time and release the attempt
//! - **Queues**: named queues with global concurrency limits for child workflow fan-out
//! - **Handles**: await or poll any instance by id, in process or across processes
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      DurableRuntime                          │
//! │  (registration, launch, start/retrieve/cancel, shutdown)    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌──────────────────────────────┐  ┌──────────────────────────┐
//! │       WorkflowExecutor       │  │       Dispatcher         │
//! │ (attempts, replay, children) │◄─┤ (queues, wake-ups)       │
//! └──────────────────────────────┘  └──────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   WorkflowEventStore                         │
//! │  (PostgreSQL: durable_workflow_instances, steps, queue)     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use steadfast_durable::prelude::*;
//!
//! struct SumWorkflow;
//!
//! #[async_trait]
//! impl Workflow for SumWorkflow {
//!     const TYPE: &'static str = "sum";
//!     type Input = u32;
//!     type Output = u32;
//!
//!     async fn run(&self, ctx: WorkflowContext, steps: u32) -> Result<u32, WorkflowError> {
//!         let mut total = 0;
//!         for i in 0..steps {
//!             total += ctx.run_step(format!("step-{i}"), || async move { Ok::<_, StepError>(i) }).await?;
//!         }
//!         Ok(total)
//!     }
//! }
//!
//! let mut runtime = DurableRuntime::new(DurableConfig::from_env()?);
//! runtime.register(SumWorkflow)?;
//! runtime.launch().await?;
//! let total: u32 = runtime.run_workflow("sum", &3).await?;
//! ```

pub mod engine;
pub mod handle;
pub mod persistence;
pub mod queue;
pub mod reliability;
pub mod runtime;
pub mod step;
pub mod workflow;

/// Prelude for common imports
pub mod prelude {
    pub use crate::engine::{ExecutorConfig, StartOptions, WorkflowRegistry};
    pub use crate::handle::{HandleError, HandleSet, WorkflowHandle};
    pub use crate::persistence::{WorkflowFilter, WorkflowInfo, WorkflowStatus};
    pub use crate::queue::{PollerConfig, Queue};
    pub use crate::reliability::RetryPolicy;
    pub use crate::runtime::{DurableConfig, DurableRuntime, RuntimeError, StoreConfig};
    pub use crate::step::{StepError, StepOptions};
    pub use crate::workflow::{Workflow, WorkflowContext, WorkflowError};
    pub use async_trait::async_trait;
}

// Re-export key types at crate root
pub use engine::{ExecutorConfig, ExecutorError, RegistryError, StartOptions, WorkflowExecutor, WorkflowRegistry};
pub use handle::{HandleError, HandleSet, WorkflowHandle};
pub use persistence::{
    InMemoryWorkflowEventStore, PostgresWorkflowEventStore, StepRecord, StoreError,
    WorkflowEventStore, WorkflowFilter, WorkflowInfo, WorkflowStatus,
};
pub use queue::{PollerConfig, Queue};
pub use reliability::RetryPolicy;
pub use runtime::{ConfigError, DurableConfig, DurableRuntime, RuntimeError, StoreConfig};
pub use step::{StepError, StepOptions};
pub use workflow::{child_workflow_id, Workflow, WorkflowContext, WorkflowError, NON_DETERMINISTIC};
