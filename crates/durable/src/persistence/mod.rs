//! Persistence layer for durable execution
//!
//! This module provides:
//! - [`WorkflowEventStore`] trait for instance, step and queue persistence
//! - [`InMemoryWorkflowEventStore`] for tests and single-process use
//! - [`PostgresWorkflowEventStore`] for production

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryWorkflowEventStore;
pub use postgres::PostgresWorkflowEventStore;
pub use store::{
    NewWorkflow, QueueEntry, QueueEntryStatus, StepKind, StepRecord, StepStatus, StoreError,
    Transition, WorkflowEventStore, WorkflowFilter, WorkflowInfo, WorkflowStatus,
};
