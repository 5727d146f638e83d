//! Workflow abstractions and types
//!
//! This module contains the core workflow primitives:
//! - [`Workflow`] trait for defining workflow bodies
//! - [`WorkflowContext`] for durable steps, sleeps and child workflows
//! - [`WorkflowError`] the persisted failure of an instance

mod context;
mod definition;

pub use context::{child_workflow_id, WorkflowContext};
pub(crate) use context::{Interrupt, Interrupter};
pub use definition::{Workflow, WorkflowError, NON_DETERMINISTIC};
