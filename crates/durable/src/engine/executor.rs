//! Workflow executor - runs workflow attempts against the step log
//!
//! An attempt loads the instance and its recorded steps, then runs the
//! registered body with a fresh [`WorkflowContext`]. The body either returns
//! (the instance becomes COMPLETED or FAILED) or is interrupted (suspended,
//! cancelled, non-deterministic, store failure, shutdown), in which case the
//! body future is dropped and the instance keeps whatever status the store
//! holds.
//!
//! Shutdown is two-phase. The shutdown signal stops the body at its next
//! context call, so a step already executing finishes and is recorded. The
//! halt signal, sent once the shutdown timeout has passed, drops the body
//! wherever it is.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::registry::{RegistryError, WorkflowRegistry};
use crate::handle::{HandleBackend, WorkflowHandle};
use crate::persistence::{NewWorkflow, StoreError, Transition, WorkflowEventStore, WorkflowStatus};
use crate::queue::{Dispatcher, PollerConfig, Queue};
use crate::reliability::RetryPolicy;
use crate::workflow::{Interrupt, WorkflowContext, WorkflowError, NON_DETERMINISTIC};

/// Executor configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutorConfig {
    /// Durable sleeps at least this long suspend the instance instead of
    /// waiting in place
    #[serde(with = "duration_millis")]
    pub suspend_threshold: Duration,

    /// Fallback poll interval of handles waiting on other processes
    #[serde(with = "duration_millis")]
    pub handle_poll_interval: Duration,

    /// Backoff for re-running an attempt aborted by a store failure
    pub store_retry: RetryPolicy,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            suspend_threshold: Duration::from_secs(5),
            handle_poll_interval: Duration::from_millis(500),
            store_retry: RetryPolicy::exponential()
                .with_max_attempts(u32::MAX)
                .with_initial_interval(Duration::from_millis(100))
                .with_max_interval(Duration::from_secs(5)),
        }
    }
}

impl ExecutorConfig {
    pub fn with_suspend_threshold(mut self, threshold: Duration) -> Self {
        self.suspend_threshold = threshold;
        self
    }

    pub fn with_handle_poll_interval(mut self, interval: Duration) -> Self {
        self.handle_poll_interval = interval;
        self
    }
}

/// Errors from executor operations
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Registry error
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("unknown queue: {0}")]
    UnknownQueue(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("executor is shutting down")]
    ShuttingDown,
}

/// How to start a top-level workflow
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Explicit instance id; an id that already exists is rejected
    pub workflow_id: Option<Uuid>,

    /// Queue to admit the instance through instead of starting it directly
    pub queue_name: Option<String>,
}

impl StartOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workflow_id(mut self, workflow_id: Uuid) -> Self {
        self.workflow_id = Some(workflow_id);
        self
    }

    pub fn on_queue(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = Some(queue_name.into());
        self
    }
}

/// State shared by the executor, the dispatcher and every workflow context
pub(crate) struct EngineShared {
    pub(crate) store: Arc<dyn WorkflowEventStore>,
    pub(crate) registry: WorkflowRegistry,
    pub(crate) queues: HashMap<String, Queue>,
    pub(crate) config: ExecutorConfig,
    pub(crate) executor_id: String,
    pub(crate) app_version: String,
    pub(crate) handles: Arc<HandleBackend>,
    dispatch_wake: Arc<Notify>,
    shutdown: watch::Receiver<bool>,
    halt: watch::Receiver<bool>,
    /// Instances with an attempt task in this process, and whether another
    /// run was requested while it was busy
    attempts: Mutex<HashMap<Uuid, bool>>,
}

enum AttemptOutcome {
    Finished(Result<Value, WorkflowError>),
    Interrupted(Interrupt),
    Halted,
}

impl EngineShared {
    pub(crate) fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.clone()
    }

    pub(crate) fn dispatch_wake(&self) -> &Notify {
        &self.dispatch_wake
    }

    pub(crate) fn wake_dispatcher(&self) {
        self.dispatch_wake.notify_one();
    }

    /// Run an attempt for `workflow_id` on a background task
    ///
    /// At most one attempt task per instance exists in this process; a
    /// request that arrives while one is in flight makes it run once more.
    pub(crate) fn spawn_attempt(self: &Arc<Self>, workflow_id: Uuid) {
        if self.is_shutting_down() {
            debug!(%workflow_id, "Not starting attempt during shutdown");
            return;
        }

        {
            let mut attempts = self.attempts.lock();
            if let Some(rerun) = attempts.get_mut(&workflow_id) {
                *rerun = true;
                return;
            }
            attempts.insert(workflow_id, false);
        }

        let shared = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                shared.drive(workflow_id).await;

                let again = {
                    let mut attempts = shared.attempts.lock();
                    match attempts.get_mut(&workflow_id) {
                        Some(rerun) if *rerun && !shared.is_shutting_down() => {
                            *rerun = false;
                            true
                        }
                        _ => {
                            attempts.remove(&workflow_id);
                            false
                        }
                    }
                };
                if !again {
                    break;
                }
            }
        });
    }

    /// Run attempts until one ends without a store failure
    async fn drive(self: &Arc<Self>, workflow_id: Uuid) {
        let mut shutdown = self.shutdown.clone();
        let mut failures = 0u32;

        loop {
            if self.is_shutting_down() {
                return;
            }

            let error = match self.run_attempt(workflow_id).await {
                Ok(()) => return,
                Err(e) => e,
            };

            failures = failures.saturating_add(1);
            let delay = self.config.store_retry.delay_for_attempt(failures.saturating_add(1));
            warn!(
                %workflow_id,
                failures,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Workflow attempt aborted by store error, retrying"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.wait_for(|stopped| *stopped) => return,
            }
        }
    }

    #[instrument(skip(self), fields(executor_id = %self.executor_id))]
    async fn run_attempt(self: &Arc<Self>, workflow_id: Uuid) -> Result<(), StoreError> {
        let info = self.store.get_workflow_info(workflow_id).await?;

        if info.status.is_terminal() {
            self.handles.publish(workflow_id);
            return Ok(());
        }
        if info.app_version != self.app_version {
            warn!(
                instance_version = %info.app_version,
                "Skipping workflow from another application version"
            );
            return Ok(());
        }

        if info.status == WorkflowStatus::Pending {
            let start = Transition::Start {
                executor_id: self.executor_id.clone(),
            };
            match self
                .store
                .transition_workflow(workflow_id, &[WorkflowStatus::Pending], start)
                .await
            {
                Ok(()) => {}
                Err(StoreError::InvalidTransition { from, .. }) => {
                    debug!(%from, "Workflow already left PENDING, skipping");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }

        let workflow = match self.registry.get(&info.workflow_type) {
            Ok(workflow) => workflow,
            Err(e) => {
                let error = WorkflowError::new(e.to_string()).with_code("UNKNOWN_WORKFLOW_TYPE");
                return self.finish(workflow_id, Transition::Fail(error)).await;
            }
        };

        let steps = self.store.load_steps(workflow_id).await?;
        info!(
            workflow_type = %info.workflow_type,
            recorded_steps = steps.len(),
            "Running workflow"
        );

        let (ctx, mut interrupts) =
            WorkflowContext::new(Arc::clone(self), workflow_id, info.workflow_type, steps);
        let body = workflow.run(ctx, info.input);
        let mut halt = self.halt.clone();

        let outcome = tokio::select! {
            biased;
            interrupt = interrupts.wait() => AttemptOutcome::Interrupted(interrupt),
            _ = halt.wait_for(|halted| *halted) => AttemptOutcome::Halted,
            result = body => AttemptOutcome::Finished(result),
        };

        match outcome {
            AttemptOutcome::Finished(Ok(output)) => {
                self.finish(workflow_id, Transition::Complete(output)).await
            }
            AttemptOutcome::Finished(Err(error)) => {
                self.finish(workflow_id, Transition::Fail(error)).await
            }
            AttemptOutcome::Interrupted(Interrupt::Suspended { resume_at }) => {
                info!(%resume_at, "Workflow suspended until wake time");
                self.schedule_wake(resume_at);
                Ok(())
            }
            AttemptOutcome::Interrupted(Interrupt::Cancelled) => {
                info!("Workflow cancelled, attempt stopped");
                self.handles.publish(workflow_id);
                self.wake_dispatcher();
                Ok(())
            }
            AttemptOutcome::Interrupted(Interrupt::NonDeterministic(message)) => {
                warn!(%message, "Workflow replay diverged from its step log");
                let error = WorkflowError::new(message).with_code(NON_DETERMINISTIC);
                self.finish(workflow_id, Transition::Fail(error)).await
            }
            AttemptOutcome::Interrupted(Interrupt::Store(message)) => {
                Err(StoreError::Database(message))
            }
            AttemptOutcome::Interrupted(Interrupt::Shutdown) => {
                info!("Attempt stopped by shutdown, workflow stays RUNNING");
                Ok(())
            }
            AttemptOutcome::Halted => {
                warn!("Attempt halted after shutdown timeout, workflow stays RUNNING");
                Ok(())
            }
        }
    }

    /// Write the terminal transition of a RUNNING instance
    async fn finish(&self, workflow_id: Uuid, transition: Transition) -> Result<(), StoreError> {
        let target = transition.target();

        match self
            .store
            .transition_workflow(workflow_id, &[WorkflowStatus::Running], transition)
            .await
        {
            Ok(()) => info!(%workflow_id, status = %target, "Workflow finished"),
            Err(StoreError::InvalidTransition { from, .. }) if from == WorkflowStatus::Cancelled => {
                info!(%workflow_id, "Workflow was cancelled, outcome discarded");
            }
            Err(StoreError::InvalidTransition { from, .. }) => {
                warn!(
                    %workflow_id,
                    %from,
                    attempted = %target,
                    "Workflow already terminal, outcome discarded"
                );
            }
            Err(e) => return Err(e),
        }

        self.handles.publish(workflow_id);
        self.wake_dispatcher();
        Ok(())
    }

    /// Nudge the dispatcher when a suspended instance becomes due
    fn schedule_wake(&self, resume_at: DateTime<Utc>) {
        let delay = (resume_at - Utc::now()).to_std().unwrap_or_default();
        let wake = Arc::clone(&self.dispatch_wake);
        let mut shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => wake.notify_one(),
                _ = shutdown.wait_for(|stopped| *stopped) => {}
            }
        });
    }
}

/// Runs workflows: starts, resumes, recovers and cancels instances
///
/// Built by [`DurableRuntime::launch`](crate::DurableRuntime::launch); cheap
/// to clone.
#[derive(Clone)]
pub struct WorkflowExecutor {
    shared: Arc<EngineShared>,
}

impl WorkflowExecutor {
    pub(crate) fn new(
        store: Arc<dyn WorkflowEventStore>,
        registry: WorkflowRegistry,
        queues: HashMap<String, Queue>,
        config: ExecutorConfig,
        executor_id: String,
        app_version: String,
        shutdown: watch::Receiver<bool>,
        halt: watch::Receiver<bool>,
    ) -> Self {
        let handles = Arc::new(HandleBackend::new(
            Arc::clone(&store),
            config.handle_poll_interval,
        ));

        Self {
            shared: Arc::new(EngineShared {
                store,
                registry,
                queues,
                config,
                executor_id,
                app_version,
                handles,
                dispatch_wake: Arc::new(Notify::new()),
                shutdown,
                halt,
                attempts: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Create a top-level instance and start it (directly or via its queue)
    #[instrument(skip(self, input, options), fields(queue = ?options.queue_name))]
    pub async fn start_workflow(
        &self,
        workflow_type: &str,
        input: Value,
        options: StartOptions,
    ) -> Result<Uuid, ExecutorError> {
        let shared = &self.shared;
        if shared.is_shutting_down() {
            return Err(ExecutorError::ShuttingDown);
        }
        if !shared.registry.contains(workflow_type) {
            return Err(RegistryError::UnknownWorkflowType(workflow_type.to_string()).into());
        }
        if let Some(queue) = &options.queue_name {
            if !shared.queues.contains_key(queue) {
                return Err(ExecutorError::UnknownQueue(queue.clone()));
            }
        }

        let workflow_id = options.workflow_id.unwrap_or_else(Uuid::now_v7);
        let workflow = NewWorkflow {
            id: workflow_id,
            workflow_type: workflow_type.to_string(),
            input,
            app_version: shared.app_version.clone(),
            executor_id: match options.queue_name {
                Some(_) => None,
                None => Some(shared.executor_id.clone()),
            },
            parent_id: None,
        };

        match &options.queue_name {
            Some(queue) => {
                shared.store.enqueue_workflow(workflow, queue).await?;
                debug!(%workflow_id, "Workflow enqueued");
                shared.wake_dispatcher();
            }
            None => {
                shared.store.create_workflow(workflow).await?;
                debug!(%workflow_id, "Workflow created");
                shared.spawn_attempt(workflow_id);
            }
        }

        Ok(workflow_id)
    }

    /// Handle for any instance id
    pub fn handle<T>(&self, workflow_id: Uuid) -> WorkflowHandle<T> {
        WorkflowHandle::new(workflow_id, Arc::clone(&self.shared.handles))
    }

    /// Move a PENDING or RUNNING instance to CANCELLED
    ///
    /// A running body stops at its next fresh step; recorded steps remain.
    #[instrument(skip(self))]
    pub async fn cancel_workflow(&self, workflow_id: Uuid) -> Result<(), ExecutorError> {
        self.shared
            .store
            .transition_workflow(
                workflow_id,
                &[WorkflowStatus::Pending, WorkflowStatus::Running],
                Transition::Cancel,
            )
            .await?;

        info!(%workflow_id, "Workflow cancelled");
        self.shared.handles.publish(workflow_id);
        self.shared.wake_dispatcher();
        Ok(())
    }

    /// Resume this executor's unfinished instances after a restart
    #[instrument(skip(self), fields(executor_id = %self.shared.executor_id))]
    pub async fn recover(&self) -> Result<usize, ExecutorError> {
        let recovered = self
            .shared
            .store
            .recover_workflows(&self.shared.executor_id, &self.shared.app_version)
            .await?;

        if !recovered.is_empty() {
            info!(count = recovered.len(), "Recovering workflows");
        }
        for workflow_id in &recovered {
            self.shared.spawn_attempt(*workflow_id);
        }
        self.shared.wake_dispatcher();
        Ok(recovered.len())
    }

    pub(crate) fn spawn_dispatcher(&self, config: PollerConfig) -> JoinHandle<()> {
        Dispatcher::new(Arc::clone(&self.shared), config).spawn()
    }

    /// Number of instances with an attempt in flight in this process
    pub fn active_attempts(&self) -> usize {
        self.shared.attempts.lock().len()
    }

    pub fn executor_id(&self) -> &str {
        &self.shared.executor_id
    }

    pub fn store(&self) -> &Arc<dyn WorkflowEventStore> {
        &self.shared.store
    }

    /// Wait for in-flight attempts to stop; false on timeout
    pub(crate) async fn drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let remaining = self.active_attempts();
            if remaining == 0 {
                debug!("All attempts stopped");
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(remaining, "Shutdown timeout reached with attempts in flight");
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryWorkflowEventStore;
    use crate::step::StepError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn executor(
        store: Arc<InMemoryWorkflowEventStore>,
        registry: WorkflowRegistry,
    ) -> (WorkflowExecutor, (watch::Sender<bool>, watch::Sender<bool>)) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (halt_tx, halt_rx) = watch::channel(false);
        let executor = WorkflowExecutor::new(
            store,
            registry,
            HashMap::new(),
            ExecutorConfig::default().with_handle_poll_interval(Duration::from_millis(20)),
            "test-executor".to_string(),
            "v1".to_string(),
            shutdown_rx,
            halt_rx,
        );
        (executor, (shutdown_tx, halt_tx))
    }

    #[test]
    fn test_executor_config_defaults() {
        let config = ExecutorConfig::default();
        assert_eq!(config.suspend_threshold, Duration::from_secs(5));
        assert_eq!(config.store_retry.delay_for_attempt(1), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_start_runs_to_completion() {
        let store = Arc::new(InMemoryWorkflowEventStore::new());
        let mut registry = WorkflowRegistry::new();
        registry
            .register_fn("add", |ctx: WorkflowContext, n: u32| async move {
                let one = ctx
                    .run_step("one", || async { Ok::<_, StepError>(1u32) })
                    .await?;
                Ok::<_, WorkflowError>(n + one)
            })
            .unwrap();

        let (executor, _shutdown) = executor(store.clone(), registry);
        let id = executor
            .start_workflow("add", serde_json::json!(41), StartOptions::new())
            .await
            .unwrap();

        let result: u32 = executor.handle(id).get_result().await.unwrap();
        assert_eq!(result, 42);
        assert_eq!(store.step_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_type_and_queue_rejected() {
        let store = Arc::new(InMemoryWorkflowEventStore::new());
        let mut registry = WorkflowRegistry::new();
        registry
            .register_fn("noop", |_ctx, _: ()| async { Ok::<_, WorkflowError>(()) })
            .unwrap();
        let (executor, _shutdown) = executor(store.clone(), registry);

        let unknown = executor
            .start_workflow("missing", Value::Null, StartOptions::new())
            .await;
        assert!(matches!(
            unknown,
            Err(ExecutorError::Registry(RegistryError::UnknownWorkflowType(_)))
        ));

        let no_queue = executor
            .start_workflow("noop", Value::Null, StartOptions::new().on_queue("nope"))
            .await;
        assert!(matches!(no_queue, Err(ExecutorError::UnknownQueue(_))));
        assert_eq!(store.workflow_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_top_level_id_rejected() {
        let store = Arc::new(InMemoryWorkflowEventStore::new());
        let mut registry = WorkflowRegistry::new();
        registry
            .register_fn("noop", |_ctx, _: ()| async { Ok::<_, WorkflowError>(()) })
            .unwrap();
        let (executor, _shutdown) = executor(store, registry);

        let id = Uuid::now_v7();
        let options = StartOptions::new().with_workflow_id(id);
        executor
            .start_workflow("noop", Value::Null, options.clone())
            .await
            .unwrap();

        let second = executor.start_workflow("noop", Value::Null, options).await;
        assert!(matches!(
            second,
            Err(ExecutorError::Store(StoreError::DuplicateInstance(dup))) if dup == id
        ));
    }

    #[tokio::test]
    async fn test_terminal_instance_is_not_rerun() {
        let store = Arc::new(InMemoryWorkflowEventStore::new());
        let runs = Arc::new(AtomicU32::new(0));
        let mut registry = WorkflowRegistry::new();
        let counter = Arc::clone(&runs);
        registry
            .register_fn("count", move |_ctx, _: ()| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, WorkflowError>(())
                }
            })
            .unwrap();
        let (executor, _shutdown) = executor(store, registry);

        let id = executor
            .start_workflow("count", Value::Null, StartOptions::new())
            .await
            .unwrap();
        executor.handle::<()>(id).get_result().await.unwrap();

        executor.shared.spawn_attempt(id);
        assert!(executor.drain(Duration::from_secs(1)).await);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
