//! Reliability patterns for step execution
//!
//! - [`RetryPolicy`] - configurable retry with exponential backoff

mod retry;

pub use retry::RetryPolicy;
