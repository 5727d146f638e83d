//! Shared helpers for runtime integration tests

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use steadfast_durable::prelude::*;
use steadfast_durable::{InMemoryWorkflowEventStore, WorkflowEventStore};

/// Fast polling so tests do not wait on idle backoff
pub fn test_config() -> DurableConfig {
    DurableConfig::new("integration-test")
        .with_dispatcher(
            PollerConfig::new()
                .with_min_interval(Duration::from_millis(5))
                .with_max_interval(Duration::from_millis(50)),
        )
        .with_executor(ExecutorConfig::default().with_handle_poll_interval(Duration::from_millis(20)))
        .with_shutdown_timeout(Duration::from_secs(2))
}

pub fn runtime_on(store: &Arc<InMemoryWorkflowEventStore>, config: DurableConfig) -> DurableRuntime {
    let store: Arc<dyn WorkflowEventStore> = store.clone();
    DurableRuntime::new(config).with_store(store)
}

/// Poll `check` until it returns true or `timeout` passes
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
