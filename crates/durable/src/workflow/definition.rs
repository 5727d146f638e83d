//! Workflow trait definition

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::WorkflowContext;
use crate::handle::HandleError;
use crate::step::StepError;

/// Error code of a workflow whose replay diverged from its recorded steps
pub const NON_DETERMINISTIC: &str = "NON_DETERMINISTIC";

/// Error type for workflow failures
///
/// Persisted as the terminal error of a FAILED instance and returned to
/// every handle that awaits it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkflowError {
    /// Error message
    pub message: String,

    /// Error code for programmatic handling
    pub code: Option<String>,

    /// Whether this error is retryable
    pub retryable: bool,
}

impl WorkflowError {
    /// Create a new workflow error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            retryable: false,
        }
    }

    /// Create a retryable error
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            retryable: true,
        }
    }

    /// Set the error code
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// True if the code matches
    pub fn has_code(&self, code: &str) -> bool {
        self.code.as_deref() == Some(code)
    }
}

impl std::fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for WorkflowError {}

impl From<StepError> for WorkflowError {
    fn from(err: StepError) -> Self {
        Self {
            message: err.message,
            code: err.error_type,
            retryable: err.retryable,
        }
    }
}

impl From<HandleError> for WorkflowError {
    fn from(err: HandleError) -> Self {
        match err {
            HandleError::Failed(error) => error,
            other => Self::new(other.to_string()).with_code(other.code()),
        }
    }
}

impl From<serde_json::Error> for WorkflowError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(err.to_string()).with_code("SERIALIZATION")
    }
}

impl From<anyhow::Error> for WorkflowError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(format!("{err:#}"))
    }
}

/// A workflow is an ordinary async function made durable by its context
///
/// Every side effect goes through the [`WorkflowContext`]: steps, durable
/// sleeps and child workflows are recorded in call order, and a resumed
/// instance re-runs `run` from the top while recorded calls return their
/// stored outcomes.
///
/// # Determinism
///
/// Given the same input, `run` must issue the same sequence of context calls.
/// Anything non-deterministic (clocks, randomness, I/O) belongs inside a step.
///
/// # Example
///
/// ```ignore
/// use steadfast_durable::prelude::*;
///
/// struct SumWorkflow;
///
/// #[async_trait]
/// impl Workflow for SumWorkflow {
///     const TYPE: &'static str = "sum";
///     type Input = u32;
///     type Output = u32;
///
///     async fn run(&self, ctx: WorkflowContext, count: u32) -> Result<u32, WorkflowError> {
///         let mut total = 0;
///         for i in 0..count {
///             total += ctx.run_step(format!("step {i}"), || async move { Ok::<_, StepError>(i) }).await?;
///         }
///         Ok(total)
///     }
/// }
/// ```
#[async_trait]
pub trait Workflow: Send + Sync + 'static {
    /// Unique type identifier for this workflow
    ///
    /// This is used to look up the workflow in the registry on resumption.
    const TYPE: &'static str;

    /// Input type for starting the workflow
    type Input: Serialize + DeserializeOwned + Send + 'static;

    /// Output type when workflow completes successfully
    type Output: Serialize + DeserializeOwned + Send + 'static;

    /// Run the workflow body
    async fn run(
        &self,
        ctx: WorkflowContext,
        input: Self::Input,
    ) -> Result<Self::Output, WorkflowError>;
}
