//! Step primitives
//!
//! A step is the unit of work a workflow records exactly once per
//! (instance, index). This module holds:
//! - [`StepError`] the durable, serializable failure payload of a step
//! - [`StepOptions`] per-call options (retry policy)
//! - the attempt loop that applies a [`RetryPolicy`](crate::RetryPolicy)
//!   before a failure becomes terminal

mod definition;
mod executor;

pub use definition::{StepError, StepOptions};
pub(crate) use executor::execute_attempts;
