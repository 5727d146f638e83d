//! Workflow execution engine
//!
//! The engine module provides the [`WorkflowExecutor`], which runs workflow
//! bodies against the step log, and the [`WorkflowRegistry`] of bodies it
//! can run.

mod executor;
mod registry;

pub(crate) use executor::EngineShared;
pub use executor::{ExecutorConfig, ExecutorError, StartOptions, WorkflowExecutor};
pub use registry::{RegistryError, WorkflowRegistry};
