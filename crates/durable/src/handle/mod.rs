//! Handles for awaiting workflow outcomes
//!
//! A [`WorkflowHandle`] is only an id plus a way to reach the store, so it
//! can be rebuilt from the id at any time and shared freely. Waiting uses
//! the in-process broadcast of terminal transitions and falls back to
//! polling the store, which also covers instances finished by another
//! process.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::persistence::{StoreError, WorkflowEventStore, WorkflowInfo, WorkflowStatus};
use crate::workflow::{Interrupt, Interrupter, WorkflowError};

/// Handle errors
#[derive(Debug, thiserror::Error)]
pub enum HandleError {
    #[error("workflow not found: {0}")]
    UnknownInstance(Uuid),

    #[error("workflow failed: {0}")]
    Failed(WorkflowError),

    #[error("workflow was cancelled")]
    Cancelled,

    #[error("timed out waiting for workflow result")]
    Timeout,

    #[error("store error: {0}")]
    Store(StoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl HandleError {
    /// Stable code for the error kind
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownInstance(_) => "UNKNOWN_INSTANCE",
            Self::Failed(_) => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Timeout => "TIMEOUT",
            Self::Store(_) => "STORE",
            Self::Serialization(_) => "SERIALIZATION",
        }
    }
}

impl From<StoreError> for HandleError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::UnknownInstance(id) => Self::UnknownInstance(id),
            other => Self::Store(other),
        }
    }
}

/// What a handle needs to observe instances
pub(crate) struct HandleBackend {
    pub(crate) store: Arc<dyn WorkflowEventStore>,
    pub(crate) completions: broadcast::Sender<Uuid>,
    pub(crate) poll_interval: Duration,
}

impl HandleBackend {
    pub(crate) fn new(store: Arc<dyn WorkflowEventStore>, poll_interval: Duration) -> Self {
        let (completions, _) = broadcast::channel(1024);
        Self {
            store,
            completions,
            poll_interval,
        }
    }

    /// Announce that an instance reached a terminal status
    pub(crate) fn publish(&self, workflow_id: Uuid) {
        // No receivers is fine
        let _ = self.completions.send(workflow_id);
    }
}

/// Reference to a workflow instance with a typed output
///
/// Reading through a handle never changes the instance.
pub struct WorkflowHandle<T> {
    workflow_id: Uuid,
    backend: Arc<HandleBackend>,
    interrupter: Option<Interrupter>,
    _output: PhantomData<fn() -> T>,
}

impl<T> Clone for WorkflowHandle<T> {
    fn clone(&self) -> Self {
        Self {
            workflow_id: self.workflow_id,
            backend: Arc::clone(&self.backend),
            interrupter: self.interrupter.clone(),
            _output: PhantomData,
        }
    }
}

impl<T> fmt::Debug for WorkflowHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowHandle")
            .field("workflow_id", &self.workflow_id)
            .finish()
    }
}

impl<T> WorkflowHandle<T> {
    pub(crate) fn new(workflow_id: Uuid, backend: Arc<HandleBackend>) -> Self {
        Self {
            workflow_id,
            backend,
            interrupter: None,
            _output: PhantomData,
        }
    }

    /// Handles created inside a workflow hand store failures to the executor
    pub(crate) fn with_interrupter(mut self, interrupter: Interrupter) -> Self {
        self.interrupter = Some(interrupter);
        self
    }

    pub fn workflow_id(&self) -> Uuid {
        self.workflow_id
    }

    /// Current status, without waiting
    pub async fn get_status(&self) -> Result<WorkflowStatus, HandleError> {
        let status = self.backend.store.get_workflow_status(self.workflow_id).await;
        self.surface(status.map_err(HandleError::from)).await
    }

    /// Full instance record, without waiting
    pub async fn get_info(&self) -> Result<WorkflowInfo, HandleError> {
        let info = self.backend.store.get_workflow_info(self.workflow_id).await;
        self.surface(info.map_err(HandleError::from)).await
    }

    /// Wait until the instance is terminal and return its record
    ///
    /// Inside a workflow the wait gives way to runtime shutdown.
    pub(crate) async fn wait_terminal(&self) -> Result<WorkflowInfo, HandleError> {
        match &self.interrupter {
            Some(interrupter) => interrupter.unless_shutdown(self.poll_terminal()).await,
            None => self.poll_terminal().await,
        }
    }

    async fn poll_terminal(&self) -> Result<WorkflowInfo, HandleError> {
        let mut completions = self.backend.completions.subscribe();

        loop {
            let info = self.get_info().await?;
            if info.status.is_terminal() {
                return Ok(info);
            }

            let poll = tokio::time::sleep(self.backend.poll_interval);
            tokio::pin!(poll);
            loop {
                tokio::select! {
                    _ = &mut poll => break,
                    received = completions.recv() => match received {
                        Ok(id) if id == self.workflow_id => break,
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(_)) => break,
                        Err(broadcast::error::RecvError::Closed) => {
                            poll.as_mut().await;
                            break;
                        }
                    },
                }
            }
        }
    }

    /// Pass results through, turning store failures into interrupts when
    /// the handle belongs to a running workflow
    async fn surface<V>(&self, result: Result<V, HandleError>) -> Result<V, HandleError> {
        match (result, &self.interrupter) {
            (Err(HandleError::Store(e)), Some(interrupter)) => {
                interrupter.raise(Interrupt::Store(e.to_string())).await
            }
            (result, _) => result,
        }
    }
}

impl<T: DeserializeOwned> WorkflowHandle<T> {
    /// Wait for the instance to finish and return its output
    ///
    /// A FAILED instance returns its recorded error as
    /// [`HandleError::Failed`]; a CANCELLED one returns
    /// [`HandleError::Cancelled`].
    pub async fn get_result(&self) -> Result<T, HandleError> {
        let info = self.wait_terminal().await?;
        decode_outcome(info)
    }

    /// [`get_result`](Self::get_result) with a caller-side deadline
    ///
    /// Timing out leaves the instance untouched.
    pub async fn get_result_timeout(&self, timeout: Duration) -> Result<T, HandleError> {
        match tokio::time::timeout(timeout, self.get_result()).await {
            Ok(result) => result,
            Err(_) => Err(HandleError::Timeout),
        }
    }
}

fn decode_outcome<T: DeserializeOwned>(info: WorkflowInfo) -> Result<T, HandleError> {
    match info.status {
        WorkflowStatus::Completed => {
            let value = info.result.unwrap_or(serde_json::Value::Null);
            Ok(serde_json::from_value(value)?)
        }
        WorkflowStatus::Failed => Err(HandleError::Failed(info.error.unwrap_or_else(|| {
            WorkflowError::new("workflow failed without error detail")
        }))),
        _ => Err(HandleError::Cancelled),
    }
}

/// Collects results of many handles in completion order
///
/// Completion order depends on timing; inside a workflow body use
/// [`WorkflowContext::wait_any`](crate::WorkflowContext::wait_any) so the
/// order is recorded.
pub struct HandleSet<T> {
    handles: Vec<WorkflowHandle<T>>,
    pending: FuturesUnordered<BoxFuture<'static, (usize, Result<T, HandleError>)>>,
}

impl<T: DeserializeOwned + Send + 'static> HandleSet<T> {
    pub fn new() -> Self {
        Self {
            handles: Vec::new(),
            pending: FuturesUnordered::new(),
        }
    }

    /// Add a handle; returns its submission position
    pub fn push(&mut self, handle: WorkflowHandle<T>) -> usize {
        let position = self.handles.len();
        let waiter = handle.clone();
        self.pending
            .push(Box::pin(async move { (position, waiter.get_result().await) }));
        self.handles.push(handle);
        position
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Handles in submission order
    pub fn handles(&self) -> &[WorkflowHandle<T>] {
        &self.handles
    }

    /// Next finished workflow as (submission position, result)
    ///
    /// Returns `None` once every result has been yielded.
    pub async fn next_completed(&mut self) -> Option<(usize, Result<T, HandleError>)> {
        self.pending.next().await
    }

    /// Wait for every remaining workflow; results in submission order
    ///
    /// Positions already yielded by `next_completed` are fetched again.
    pub async fn wait_all(self) -> Vec<Result<T, HandleError>> {
        let mut results: Vec<Option<Result<T, HandleError>>> =
            self.handles.iter().map(|_| None).collect();

        let mut pending = self.pending;
        while let Some((position, result)) = pending.next().await {
            results[position] = Some(result);
        }

        let mut ordered = Vec::with_capacity(results.len());
        for (position, result) in results.into_iter().enumerate() {
            match result {
                Some(result) => ordered.push(result),
                None => ordered.push(self.handles[position].get_result().await),
            }
        }
        ordered
    }
}

impl<T: DeserializeOwned + Send + 'static> Default for HandleSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned + Send + 'static> FromIterator<WorkflowHandle<T>> for HandleSet<T> {
    fn from_iter<I: IntoIterator<Item = WorkflowHandle<T>>>(iter: I) -> Self {
        let mut set = Self::new();
        for handle in iter {
            set.push(handle);
        }
        set
    }
}
