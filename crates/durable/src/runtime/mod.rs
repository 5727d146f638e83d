//! Durable runtime: the application-facing entry point
//!
//! [`DurableRuntime`] composes the store, the workflow registry, the queues,
//! the executor and the dispatcher into one object with a lifecycle:
//!
//! ```text
//! Configured --launch()--> Running --shutdown()--> Shutdown
//! ```
//!
//! Workflow types and queues are registered while Configured. Starting,
//! retrieving and cancelling workflows requires Running.

mod config;

pub use config::{ConfigError, DurableConfig, StoreConfig, DEFAULT_APP_VERSION, DEFAULT_EXECUTOR_ID};

use std::collections::HashMap;
use std::future::Future;
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::{ExecutorError, RegistryError, StartOptions, WorkflowExecutor, WorkflowRegistry};
use crate::handle::{HandleError, WorkflowHandle};
use crate::persistence::{
    InMemoryWorkflowEventStore, PostgresWorkflowEventStore, StoreError, WorkflowEventStore,
    WorkflowFilter, WorkflowInfo,
};
use crate::queue::Queue;
use crate::workflow::{Workflow, WorkflowContext, WorkflowError};

/// Errors from runtime operations
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("runtime has not been launched")]
    NotLaunched,

    #[error("runtime is already launched")]
    AlreadyLaunched,

    #[error("runtime has been shut down")]
    AlreadyShutdown,

    #[error("unknown queue: {0}")]
    UnknownQueue(String),

    #[error("queue already registered: {0}")]
    DuplicateQueue(String),

    #[error("unknown workflow type: {0}")]
    UnknownWorkflowType(String),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("registry error: {0}")]
    Registry(RegistryError),

    #[error("executor error: {0}")]
    Executor(ExecutorError),

    #[error(transparent)]
    Handle(#[from] HandleError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<RegistryError> for RuntimeError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::UnknownWorkflowType(name) => Self::UnknownWorkflowType(name),
            other => Self::Registry(other),
        }
    }
}

impl From<ExecutorError> for RuntimeError {
    fn from(err: ExecutorError) -> Self {
        match err {
            ExecutorError::Store(e) => Self::Store(e),
            ExecutorError::Registry(e) => e.into(),
            ExecutorError::UnknownQueue(name) => Self::UnknownQueue(name),
            ExecutorError::Serialization(e) => Self::Serialization(e),
            ExecutorError::ShuttingDown => Self::AlreadyShutdown,
        }
    }
}

enum RuntimeState {
    Configured {
        registry: WorkflowRegistry,
        queues: HashMap<String, Queue>,
    },
    Running(Running),
    Shutdown,
}

/// How long halted attempts get to unwind after the shutdown timeout
const HALT_GRACE: Duration = Duration::from_secs(1);

struct Running {
    executor: WorkflowExecutor,
    dispatcher: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
    halt_tx: watch::Sender<bool>,
    /// Opened from the configuration, so closed on shutdown
    owns_store: bool,
}

/// The durable workflow runtime
///
/// # Example
///
/// ```ignore
/// use steadfast_durable::prelude::*;
///
/// let mut runtime = DurableRuntime::new(DurableConfig::from_env()?);
/// runtime.register_fn("greet", |ctx: WorkflowContext, name: String| async move {
///     let greeting = ctx
///         .run_step("format", || {
///             let name = name.clone();
///             async move { Ok::<_, StepError>(format!("hello, {name}")) }
///         })
///         .await?;
///     Ok::<_, WorkflowError>(greeting)
/// })?;
/// runtime.launch().await?;
///
/// let greeting: String = runtime.run_workflow("greet", &"world").await?;
/// runtime.shutdown().await?;
/// ```
pub struct DurableRuntime {
    config: DurableConfig,
    store: Option<Arc<dyn WorkflowEventStore>>,
    state: RuntimeState,
}

impl DurableRuntime {
    pub fn new(config: DurableConfig) -> Self {
        Self {
            config,
            store: None,
            state: RuntimeState::Configured {
                registry: WorkflowRegistry::new(),
                queues: HashMap::new(),
            },
        }
    }

    /// Use an existing store instead of building one from the configuration
    pub fn with_store(mut self, store: Arc<dyn WorkflowEventStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &DurableConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, RuntimeState::Running(_))
    }

    fn configuring(&mut self) -> Result<(&mut WorkflowRegistry, &mut HashMap<String, Queue>), RuntimeError> {
        match &mut self.state {
            RuntimeState::Configured { registry, queues } => Ok((registry, queues)),
            RuntimeState::Running(_) => Err(RuntimeError::AlreadyLaunched),
            RuntimeState::Shutdown => Err(RuntimeError::AlreadyShutdown),
        }
    }

    fn running(&self) -> Result<&Running, RuntimeError> {
        match &self.state {
            RuntimeState::Running(running) => Ok(running),
            RuntimeState::Configured { .. } => Err(RuntimeError::NotLaunched),
            RuntimeState::Shutdown => Err(RuntimeError::AlreadyShutdown),
        }
    }

    /// Register a workflow type
    pub fn register<W: Workflow>(&mut self, workflow: W) -> Result<(), RuntimeError> {
        let (registry, _) = self.configuring()?;
        registry.register(workflow)?;
        Ok(())
    }

    /// Register an async closure as a workflow type
    pub fn register_fn<F, Fut, I, O>(&mut self, workflow_type: &str, body: F) -> Result<(), RuntimeError>
    where
        F: Fn(WorkflowContext, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, WorkflowError>> + Send + 'static,
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
    {
        let (registry, _) = self.configuring()?;
        registry.register_fn(workflow_type, body)?;
        Ok(())
    }

    /// Register a named queue
    pub fn register_queue(&mut self, queue: Queue) -> Result<(), RuntimeError> {
        let (_, queues) = self.configuring()?;
        if queues.contains_key(&queue.name) {
            return Err(RuntimeError::DuplicateQueue(queue.name));
        }
        queues.insert(queue.name.clone(), queue);
        Ok(())
    }

    /// Open the store, recover unfinished workflows and start the dispatcher
    ///
    /// A failed recovery leaves the runtime shut down.
    pub async fn launch(&mut self) -> Result<(), RuntimeError> {
        self.configuring()?;
        self.config.validate()?;

        let owns_store = self.store.is_none();
        let store = match &self.store {
            Some(store) => Arc::clone(store),
            None => open_store(&self.config).await?,
        };

        let RuntimeState::Configured { registry, queues } =
            mem::replace(&mut self.state, RuntimeState::Shutdown)
        else {
            return Err(RuntimeError::AlreadyLaunched);
        };

        info!(
            app_name = %self.config.app_name,
            app_version = %self.config.app_version,
            executor_id = %self.config.executor_id,
            workflow_types = registry.len(),
            queues = queues.len(),
            "Launching durable runtime"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (halt_tx, halt_rx) = watch::channel(false);
        let executor = WorkflowExecutor::new(
            Arc::clone(&store),
            registry,
            queues,
            self.config.executor.clone(),
            self.config.executor_id.clone(),
            self.config.app_version.clone(),
            shutdown_rx,
            halt_rx,
        );
        self.store = Some(Arc::clone(&store));

        // Recovery requeues this executor's DISPATCHED entries, so it must
        // finish before the dispatcher starts admitting new ones
        if let Err(e) = executor.recover().await {
            let _ = shutdown_tx.send(true);
            let _ = halt_tx.send(true);
            if owns_store {
                store.close().await;
            }
            return Err(e.into());
        }
        let dispatcher = executor.spawn_dispatcher(self.config.dispatcher.clone());

        self.state = RuntimeState::Running(Running {
            executor,
            dispatcher,
            shutdown_tx,
            halt_tx,
            owns_store,
        });
        Ok(())
    }

    /// Start a workflow and return a handle to it
    pub async fn start_workflow<O, I>(
        &self,
        workflow_type: &str,
        input: &I,
    ) -> Result<WorkflowHandle<O>, RuntimeError>
    where
        I: Serialize + ?Sized,
    {
        self.start_workflow_with(workflow_type, input, StartOptions::new())
            .await
    }

    /// Start a workflow with an explicit id or through a queue
    pub async fn start_workflow_with<O, I>(
        &self,
        workflow_type: &str,
        input: &I,
        options: StartOptions,
    ) -> Result<WorkflowHandle<O>, RuntimeError>
    where
        I: Serialize + ?Sized,
    {
        let running = self.running()?;
        let input = serde_json::to_value(input)?;
        let workflow_id = running
            .executor
            .start_workflow(workflow_type, input, options)
            .await?;
        Ok(running.executor.handle(workflow_id))
    }

    /// Start a workflow and wait for its result
    pub async fn run_workflow<O, I>(&self, workflow_type: &str, input: &I) -> Result<O, RuntimeError>
    where
        O: DeserializeOwned,
        I: Serialize + ?Sized,
    {
        let handle: WorkflowHandle<O> = self.start_workflow(workflow_type, input).await?;
        Ok(handle.get_result().await?)
    }

    /// Handle for an existing instance, possibly started by another process
    pub async fn retrieve_workflow<O>(&self, workflow_id: Uuid) -> Result<WorkflowHandle<O>, RuntimeError> {
        let running = self.running()?;
        running
            .executor
            .store()
            .get_workflow_status(workflow_id)
            .await?;
        Ok(running.executor.handle(workflow_id))
    }

    /// Cancel a PENDING or RUNNING instance
    pub async fn cancel_workflow(&self, workflow_id: Uuid) -> Result<(), RuntimeError> {
        self.running()?.executor.cancel_workflow(workflow_id).await?;
        Ok(())
    }

    /// List instances matching `filter`, newest first
    pub async fn list_workflows(&self, filter: WorkflowFilter) -> Result<Vec<WorkflowInfo>, RuntimeError> {
        let running = self.running()?;
        Ok(running.executor.store().list_workflows(filter).await?)
    }

    /// The running executor
    pub fn executor(&self) -> Result<&WorkflowExecutor, RuntimeError> {
        Ok(&self.running()?.executor)
    }

    /// The store, once launched or injected
    pub fn store(&self) -> Option<&Arc<dyn WorkflowEventStore>> {
        self.store.as_ref()
    }

    /// Stop the dispatcher and in-flight attempts, then close the store
    ///
    /// Workflows stop at their next durable call; a step already executing
    /// runs to completion and is recorded. Attempts still running after
    /// `shutdown_timeout` are halted. Interrupted instances stay RUNNING and
    /// are recovered by the next launch with the same executor id.
    pub async fn shutdown(&mut self) -> Result<(), RuntimeError> {
        match mem::replace(&mut self.state, RuntimeState::Shutdown) {
            RuntimeState::Shutdown => Err(RuntimeError::AlreadyShutdown),
            RuntimeState::Configured { .. } => {
                info!("Durable runtime shut down before launch");
                Ok(())
            }
            RuntimeState::Running(running) => {
                info!(executor_id = %self.config.executor_id, "Shutting down durable runtime");
                let _ = running.shutdown_tx.send(true);

                if let Err(e) = running.dispatcher.await {
                    warn!(error = %e, "Dispatcher task ended abnormally");
                }
                if !running.executor.drain(self.config.shutdown_timeout).await {
                    warn!(
                        remaining = running.executor.active_attempts(),
                        "Halting attempts still in flight after shutdown timeout"
                    );
                    let _ = running.halt_tx.send(true);
                    if !running.executor.drain(HALT_GRACE).await {
                        warn!(
                            remaining = running.executor.active_attempts(),
                            "Attempts did not stop after halt"
                        );
                    }
                }
                if running.owns_store {
                    running.executor.store().close().await;
                }

                info!("Durable runtime stopped");
                Ok(())
            }
        }
    }
}

impl Drop for DurableRuntime {
    fn drop(&mut self) {
        if let RuntimeState::Running(running) = &self.state {
            let _ = running.shutdown_tx.send(true);
            let _ = running.halt_tx.send(true);
        }
    }
}

async fn open_store(config: &DurableConfig) -> Result<Arc<dyn WorkflowEventStore>, RuntimeError> {
    match &config.store {
        StoreConfig::Memory => Ok(Arc::new(InMemoryWorkflowEventStore::new())),
        StoreConfig::Postgres {
            url,
            user,
            password,
            max_connections,
        } => {
            let store = PostgresWorkflowEventStore::connect(
                url,
                user.as_deref(),
                password.as_deref(),
                *max_connections,
            )
            .await?;
            store.migrate().await?;
            Ok(Arc::new(store))
        }
    }
}
