//! Named queues and the dispatcher that drains them
//!
//! - [`Queue`] a named admission channel with an optional global concurrency limit
//! - [`PollerConfig`] dispatcher polling cadence
//! - `Dispatcher` the background loop that moves WAITING entries to DISPATCHED
//!   and resumes suspended instances when their wake time is due

mod dispatcher;
mod poller;

pub(crate) use dispatcher::Dispatcher;
pub use poller::PollerConfig;

use serde::{Deserialize, Serialize};

/// A named queue of workflows awaiting execution capacity
///
/// The concurrency limit is global: it counts DISPATCHED entries and RUNNING
/// instances of the queue across every executor sharing the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Queue {
    pub name: String,

    /// Maximum instances of this queue active at once (`None` = unbounded)
    pub concurrency: Option<u32>,
}

impl Queue {
    /// An unbounded queue
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            concurrency: None,
        }
    }

    /// Cap the number of simultaneously active instances
    pub fn with_concurrency(mut self, limit: u32) -> Self {
        self.concurrency = Some(limit.max(1));
        self
    }
}
