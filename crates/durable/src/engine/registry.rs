//! Workflow registry for type-erased workflow bodies
//!
//! The registry maps workflow type names to bodies that take and return
//! JSON, so the executor can resume any instance knowing only the type name
//! stored with it.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::workflow::{Workflow, WorkflowContext, WorkflowError};

/// Type-erased workflow interface
///
/// Input and output cross this boundary as JSON.
pub(crate) trait AnyWorkflow: Send + Sync {
    fn run(&self, ctx: WorkflowContext, input: Value) -> BoxFuture<'static, Result<Value, WorkflowError>>;
}

fn decode_input<I: DeserializeOwned>(input: Value) -> Result<I, WorkflowError> {
    serde_json::from_value(input).map_err(|e| {
        WorkflowError::new(format!("failed to deserialize workflow input: {e}"))
            .with_code("INVALID_INPUT")
    })
}

fn encode_output<O: Serialize>(output: O) -> Result<Value, WorkflowError> {
    serde_json::to_value(output).map_err(WorkflowError::from)
}

/// Wrapper to implement AnyWorkflow for any Workflow
struct WorkflowWrapper<W: Workflow> {
    inner: Arc<W>,
}

impl<W: Workflow> AnyWorkflow for WorkflowWrapper<W> {
    fn run(&self, ctx: WorkflowContext, input: Value) -> BoxFuture<'static, Result<Value, WorkflowError>> {
        let workflow = Arc::clone(&self.inner);
        Box::pin(async move {
            let input: W::Input = decode_input(input)?;
            let output = workflow.run(ctx, input).await?;
            encode_output(output)
        })
    }
}

/// Wrapper for workflows registered as closures
struct FnWorkflow<F, I, O> {
    body: Arc<F>,
    _types: PhantomData<fn(I) -> O>,
}

impl<F, Fut, I, O> AnyWorkflow for FnWorkflow<F, I, O>
where
    F: Fn(WorkflowContext, I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, WorkflowError>> + Send + 'static,
    I: DeserializeOwned + Send + 'static,
    O: Serialize + Send + 'static,
{
    fn run(&self, ctx: WorkflowContext, input: Value) -> BoxFuture<'static, Result<Value, WorkflowError>> {
        let body = Arc::clone(&self.body);
        Box::pin(async move {
            let input: I = decode_input(input)?;
            let output = body(ctx, input).await?;
            encode_output(output)
        })
    }
}

/// Registry of workflow bodies
///
/// Populated before the runtime launches and read-only afterwards.
#[derive(Default)]
pub struct WorkflowRegistry {
    workflows: HashMap<String, Arc<dyn AnyWorkflow>>,
}

impl WorkflowRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow type
    ///
    /// # Example
    ///
    /// ```ignore
    /// let mut registry = WorkflowRegistry::new();
    /// registry.register(SumWorkflow)?;
    /// ```
    pub fn register<W: Workflow>(&mut self, workflow: W) -> Result<(), RegistryError> {
        self.insert(
            W::TYPE,
            Arc::new(WorkflowWrapper {
                inner: Arc::new(workflow),
            }),
        )
    }

    /// Register an async closure as a workflow named `workflow_type`
    pub fn register_fn<F, Fut, I, O>(&mut self, workflow_type: &str, body: F) -> Result<(), RegistryError>
    where
        F: Fn(WorkflowContext, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, WorkflowError>> + Send + 'static,
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
    {
        self.insert(
            workflow_type,
            Arc::new(FnWorkflow {
                body: Arc::new(body),
                _types: PhantomData,
            }),
        )
    }

    fn insert(&mut self, workflow_type: &str, workflow: Arc<dyn AnyWorkflow>) -> Result<(), RegistryError> {
        if self.workflows.contains_key(workflow_type) {
            return Err(RegistryError::DuplicateWorkflowType(workflow_type.to_string()));
        }
        self.workflows.insert(workflow_type.to_string(), workflow);
        Ok(())
    }

    /// Check if a workflow type is registered
    pub fn contains(&self, workflow_type: &str) -> bool {
        self.workflows.contains_key(workflow_type)
    }

    pub(crate) fn get(&self, workflow_type: &str) -> Result<Arc<dyn AnyWorkflow>, RegistryError> {
        self.workflows
            .get(workflow_type)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownWorkflowType(workflow_type.to_string()))
    }

    /// Get the number of registered workflow types
    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }

    /// Get all registered workflow type names
    pub fn workflow_types(&self) -> impl Iterator<Item = &str> {
        self.workflows.keys().map(|s| s.as_str())
    }
}

impl fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowRegistry")
            .field("workflow_types", &self.workflows.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Errors from registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Workflow type not registered
    #[error("unknown workflow type: {0}")]
    UnknownWorkflowType(String),

    /// Workflow type registered twice
    #[error("workflow type already registered: {0}")]
    DuplicateWorkflowType(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct DoubleWorkflow;

    #[async_trait]
    impl Workflow for DoubleWorkflow {
        const TYPE: &'static str = "double";
        type Input = i32;
        type Output = i32;

        async fn run(&self, _ctx: WorkflowContext, input: i32) -> Result<i32, WorkflowError> {
            Ok(input * 2)
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = WorkflowRegistry::new();
        registry.register(DoubleWorkflow).unwrap();
        registry
            .register_fn("echo", |_ctx, input: String| async move {
                Ok::<_, WorkflowError>(input)
            })
            .unwrap();

        assert!(registry.contains("double"));
        assert!(registry.contains("echo"));
        assert!(!registry.contains("unknown"));
        assert_eq!(registry.len(), 2);

        let mut types: Vec<_> = registry.workflow_types().collect();
        types.sort();
        assert_eq!(types, vec!["double", "echo"]);
    }

    #[test]
    fn test_duplicate_registration() {
        let mut registry = WorkflowRegistry::new();
        registry.register(DoubleWorkflow).unwrap();

        let result = registry.register(DoubleWorkflow);
        assert!(matches!(result, Err(RegistryError::DuplicateWorkflowType(name)) if name == "double"));
    }

    #[test]
    fn test_unknown_workflow_type() {
        let registry = WorkflowRegistry::new();
        assert!(matches!(
            registry.get("unknown"),
            Err(RegistryError::UnknownWorkflowType(_))
        ));
    }

    #[test]
    fn test_registry_debug() {
        let mut registry = WorkflowRegistry::new();
        registry.register(DoubleWorkflow).unwrap();

        let debug_str = format!("{:?}", registry);
        assert!(debug_str.contains("double"));
    }
}
