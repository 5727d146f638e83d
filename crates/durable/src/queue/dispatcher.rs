//! Dispatcher loop
//!
//! Each tick admits WAITING entries of every registered queue up to the
//! queue's concurrency limit, then resumes suspended instances whose wake
//! time has passed. Ticks run on an adaptive interval and are triggered
//! early by enqueues and terminal transitions.

use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::poller::{PollBackoff, PollerConfig};
use crate::engine::EngineShared;

pub(crate) struct Dispatcher {
    shared: Arc<EngineShared>,
    backoff: PollBackoff,
}

impl Dispatcher {
    pub(crate) fn new(shared: Arc<EngineShared>, config: PollerConfig) -> Self {
        Self {
            shared,
            backoff: PollBackoff::new(config),
        }
    }

    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let mut shutdown = self.shared.shutdown_signal();
        info!(
            executor_id = %self.shared.executor_id,
            queues = self.shared.queues.len(),
            "Dispatcher started"
        );

        loop {
            if self.shared.is_shutting_down() {
                break;
            }

            let found = self.tick().await;
            self.backoff.record(found);

            tokio::select! {
                biased;
                _ = shutdown.wait_for(|stopped| *stopped) => break,
                _ = self.shared.dispatch_wake().notified() => {}
                _ = tokio::time::sleep(self.backoff.interval()) => {}
            }
        }

        debug!("Dispatcher exited");
    }

    /// One pass over every queue and the wake-up scan
    ///
    /// Store errors are logged; the next tick retries.
    async fn tick(&self) -> usize {
        let shared = &self.shared;
        let batch_size = self.backoff.batch_size();
        let mut found = 0;

        for queue in shared.queues.values() {
            let dispatched = shared
                .store
                .dispatch_queued(
                    &queue.name,
                    queue.concurrency,
                    &shared.executor_id,
                    &shared.app_version,
                    batch_size,
                )
                .await;

            match dispatched {
                Ok(ids) => {
                    if !ids.is_empty() {
                        debug!(queue = %queue.name, count = ids.len(), "Dispatched queued workflows");
                    }
                    found += ids.len();
                    for workflow_id in ids {
                        shared.spawn_attempt(workflow_id);
                    }
                }
                Err(e) => error!(queue = %queue.name, error = %e, "Queue dispatch failed"),
            }
        }

        match shared
            .store
            .claim_due_workflows(&shared.executor_id, Utc::now(), batch_size)
            .await
        {
            Ok(ids) => {
                if !ids.is_empty() {
                    debug!(count = ids.len(), "Resuming workflows after durable sleep");
                }
                found += ids.len();
                for workflow_id in ids {
                    shared.spawn_attempt(workflow_id);
                }
            }
            Err(e) => error!(error = %e, "Wake-up scan failed"),
        }

        found
    }
}
