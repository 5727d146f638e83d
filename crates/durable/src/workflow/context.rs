//! Workflow context: the durable surface a workflow body calls into
//!
//! Every call made through the context consumes the next step index of the
//! current attempt. A call whose index is already in the step log returns
//! the recorded outcome; a fresh call executes and records it.
//!
//! Infrastructure trouble (store errors, cancellation, suspension) is never
//! returned to workflow logic. The context raises an [`Interrupt`] and parks
//! the body; the executor observes the interrupt and drops the attempt.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;

use super::WorkflowError;
use crate::engine::EngineShared;
use crate::handle::WorkflowHandle;
use crate::persistence::{
    NewWorkflow, StepKind, StepRecord, StoreError, WorkflowStatus,
};
use crate::step::{execute_attempts, StepError, StepOptions};

const SLEEP_STEP: &str = "sleep";
const WAIT_ANY_STEP: &str = "wait_any";

/// Reason an attempt stopped before its body returned
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Interrupt {
    /// Durable sleep persisted a wake time; resume when due
    Suspended { resume_at: DateTime<Utc> },
    /// Instance was cancelled; stop before the next fresh step
    Cancelled,
    /// Replay diverged from the recorded steps
    NonDeterministic(String),
    /// Store failure; the attempt is retried
    Store(String),
    /// Runtime is shutting down; resume on the next launch
    Shutdown,
}

/// Sending half of an attempt's interrupt channel
#[derive(Clone)]
pub(crate) struct Interrupter {
    tx: Arc<watch::Sender<Option<Interrupt>>>,
    shutdown: watch::Receiver<bool>,
}

impl Interrupter {
    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Run `fut` unless shutdown starts first
    pub(crate) async fn unless_shutdown<F: Future>(&self, fut: F) -> F::Output {
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            output = fut => return output,
            _ = shutdown.wait_for(|stopped| *stopped) => {}
        }
        self.raise(Interrupt::Shutdown).await
    }

    /// Record `reason` (first one wins) and park forever
    pub(crate) async fn raise<T>(&self, reason: Interrupt) -> T {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
        std::future::pending().await
    }

    pub(crate) async fn check<T>(&self, result: Result<T, StoreError>) -> T {
        match result {
            Ok(value) => value,
            Err(e) => self.raise(Interrupt::Store(e.to_string())).await,
        }
    }
}

/// Receiving half of an attempt's interrupt channel
pub(crate) struct AttemptInterrupts {
    rx: watch::Receiver<Option<Interrupt>>,
}

impl AttemptInterrupts {
    /// Resolve once an interrupt is raised
    ///
    /// Never resolves if every context of the attempt is dropped first.
    pub(crate) async fn wait(&mut self) -> Interrupt {
        // Copy out before awaiting again; the borrow guard is not Send
        let seen = match self.rx.wait_for(Option::is_some).await {
            Ok(interrupt) => interrupt.clone(),
            Err(_) => None,
        };
        match seen {
            Some(interrupt) => interrupt,
            None => std::future::pending().await,
        }
    }
}

struct StepCursor {
    next_index: i32,
    recorded: HashMap<i32, StepRecord>,
}

struct ContextInner {
    workflow_id: Uuid,
    workflow_type: String,
    engine: Arc<EngineShared>,
    cursor: Mutex<StepCursor>,
    interrupter: Interrupter,
}

/// Handle passed to a workflow body for durable calls
///
/// Cheap to clone; clones share the step cursor of the attempt.
#[derive(Clone)]
pub struct WorkflowContext {
    inner: Arc<ContextInner>,
}

impl WorkflowContext {
    pub(crate) fn new(
        engine: Arc<EngineShared>,
        workflow_id: Uuid,
        workflow_type: String,
        steps: Vec<StepRecord>,
    ) -> (Self, AttemptInterrupts) {
        let (tx, rx) = watch::channel(None);
        let engine_shutdown = engine.shutdown_signal();
        let recorded = steps.into_iter().map(|s| (s.step_index, s)).collect();

        let ctx = Self {
            inner: Arc::new(ContextInner {
                workflow_id,
                workflow_type,
                engine,
                cursor: Mutex::new(StepCursor {
                    next_index: 0,
                    recorded,
                }),
                interrupter: Interrupter {
                    tx: Arc::new(tx),
                    shutdown: engine_shutdown,
                },
            }),
        };
        (ctx, AttemptInterrupts { rx })
    }

    /// Id of the running workflow instance
    pub fn workflow_id(&self) -> Uuid {
        self.inner.workflow_id
    }

    /// Registered type of the running workflow
    pub fn workflow_type(&self) -> &str {
        &self.inner.workflow_type
    }

    /// Run a step once, recording its outcome
    ///
    /// On replay the recorded output is returned (or the recorded error
    /// re-raised) without calling `f`. A failing step is recorded and
    /// returned; the workflow may handle it and continue.
    pub async fn run_step<T, E, F, Fut>(&self, name: impl Into<String>, f: F) -> Result<T, StepError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        T: Serialize + DeserializeOwned,
        E: Into<StepError>,
    {
        self.run_step_with_options(name, StepOptions::default(), f)
            .await
    }

    /// [`run_step`](Self::run_step) with an explicit retry policy
    pub async fn run_step_with_options<T, E, F, Fut>(
        &self,
        name: impl Into<String>,
        options: StepOptions,
        mut f: F,
    ) -> Result<T, StepError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        T: Serialize + DeserializeOwned,
        E: Into<StepError>,
    {
        let name = name.into();
        let (step_index, recorded) = self.next_step();

        let record = match recorded {
            Some(record) => {
                debug!(workflow_id = %self.workflow_id(), step_index, step = %name, "Replaying recorded step");
                self.replayed(record, &name, StepKind::Step).await
            }
            None => {
                self.guard_fresh().await;
                debug!(workflow_id = %self.workflow_id(), step_index, step = %name, "Executing step");

                let outcome = execute_attempts(&name, &options, || {
                    let attempt = f();
                    async move {
                        match attempt.await {
                            Ok(value) => {
                                serde_json::to_value(value).map_err(StepError::serialization)
                            }
                            Err(e) => Err(e.into()),
                        }
                    }
                })
                .await;

                let record = match outcome {
                    Ok(output) => StepRecord::completed(
                        self.workflow_id(),
                        step_index,
                        &name,
                        StepKind::Step,
                        output,
                    ),
                    Err(error) => {
                        info!(workflow_id = %self.workflow_id(), step_index, step = %name, error = %error, "Step failed");
                        StepRecord::failed(self.workflow_id(), step_index, &name, StepKind::Step, error)
                    }
                };
                self.persist(record).await
            }
        };

        record
            .outcome()
            .and_then(|value| serde_json::from_value(value).map_err(StepError::serialization))
    }

    /// Durable sleep
    ///
    /// The wake time is recorded on first execution, so a resumed instance
    /// only waits for whatever remains. Short waits happen in place; longer
    /// ones suspend the instance and release the attempt until the wake time.
    pub async fn sleep(&self, duration: Duration) {
        let (step_index, recorded) = self.next_step();

        let record = match recorded {
            Some(record) => self.replayed(record, SLEEP_STEP, StepKind::Sleep).await,
            None => {
                self.guard_fresh().await;
                let delta = chrono::Duration::from_std(duration)
                    .unwrap_or_else(|_| chrono::Duration::weeks(52 * 100));
                let wake_at = Utc::now() + delta;
                self.persist(StepRecord::completed(
                    self.workflow_id(),
                    step_index,
                    SLEEP_STEP,
                    StepKind::Sleep,
                    serde_json::json!(wake_at),
                ))
                .await
            }
        };

        let wake_at = match record
            .output
            .and_then(|v| serde_json::from_value::<DateTime<Utc>>(v).ok())
        {
            Some(wake_at) => wake_at,
            None => {
                let message = format!("sleep at step {step_index} has no recorded wake time");
                self.interrupt(Interrupt::NonDeterministic(message)).await
            }
        };

        let remaining = match (wake_at - Utc::now()).to_std() {
            Ok(remaining) if !remaining.is_zero() => remaining,
            _ => return,
        };

        if remaining < self.inner.engine.config.suspend_threshold {
            self.inner
                .interrupter
                .unless_shutdown(tokio::time::sleep(remaining))
                .await;
            return;
        }

        let suspended = self
            .inner
            .engine
            .store
            .suspend_workflow(self.workflow_id(), wake_at)
            .await;
        self.inner.interrupter.check(suspended).await;
        self.interrupt(Interrupt::Suspended { resume_at: wake_at })
            .await
    }

    /// Start a child workflow that runs immediately on this executor
    ///
    /// The child id is derived from this instance and the call position, so
    /// a replayed call returns a handle to the same child.
    pub async fn start_workflow<O, I>(
        &self,
        workflow_type: &str,
        input: &I,
    ) -> Result<WorkflowHandle<O>, WorkflowError>
    where
        I: Serialize + ?Sized,
    {
        self.start_child(workflow_type, serde_json::to_value(input)?, None)
            .await
    }

    /// Enqueue a child workflow on a named queue
    ///
    /// Returns as soon as the child is durably queued; the dispatcher starts
    /// it when the queue has capacity.
    pub async fn enqueue_workflow<O, I>(
        &self,
        queue_name: &str,
        workflow_type: &str,
        input: &I,
    ) -> Result<WorkflowHandle<O>, WorkflowError>
    where
        I: Serialize + ?Sized,
    {
        if !self.inner.engine.queues.contains_key(queue_name) {
            return Err(WorkflowError::new(format!("unknown queue: {queue_name}"))
                .with_code("UNKNOWN_QUEUE"));
        }
        self.start_child(workflow_type, serde_json::to_value(input)?, Some(queue_name))
            .await
    }

    /// Index (into `handles`) of the first workflow to reach a terminal status
    ///
    /// The choice is recorded, so a replayed call returns the same index even
    /// if several of the workflows have finished since.
    pub async fn wait_any<T>(&self, handles: &[WorkflowHandle<T>]) -> Result<usize, WorkflowError> {
        if handles.is_empty() {
            return Err(WorkflowError::new("wait_any needs at least one handle").with_code("EMPTY_WAIT"));
        }

        let (step_index, recorded) = self.next_step();
        let record = match recorded {
            Some(record) => self.replayed(record, WAIT_ANY_STEP, StepKind::Await).await,
            None => {
                self.guard_fresh().await;

                let mut pending: FuturesUnordered<_> = handles
                    .iter()
                    .enumerate()
                    .map(|(position, handle)| async move {
                        let _ = handle.wait_terminal().await;
                        position
                    })
                    .collect();
                let position = self
                    .inner
                    .interrupter
                    .unless_shutdown(pending.next())
                    .await
                    .unwrap_or_default();
                drop(pending);

                self.persist(StepRecord::completed(
                    self.workflow_id(),
                    step_index,
                    WAIT_ANY_STEP,
                    StepKind::Await,
                    serde_json::json!(position),
                ))
                .await
            }
        };

        match record.output.as_ref().and_then(|v| v.as_u64()) {
            Some(position) if (position as usize) < handles.len() => Ok(position as usize),
            _ => {
                let message = format!(
                    "wait_any at step {step_index} recorded {:?} for {} handles",
                    record.output,
                    handles.len()
                );
                self.interrupt(Interrupt::NonDeterministic(message)).await
            }
        }
    }

    /// Whether the instance has been cancelled
    pub async fn is_cancelled(&self) -> bool {
        let status = self
            .inner
            .engine
            .store
            .get_workflow_status(self.workflow_id())
            .await;
        self.inner.interrupter.check(status).await == WorkflowStatus::Cancelled
    }

    async fn start_child<O>(
        &self,
        workflow_type: &str,
        input: serde_json::Value,
        queue_name: Option<&str>,
    ) -> Result<WorkflowHandle<O>, WorkflowError> {
        let engine = &self.inner.engine;
        if !engine.registry.contains(workflow_type) {
            return Err(
                WorkflowError::new(format!("unknown workflow type: {workflow_type}"))
                    .with_code("UNKNOWN_WORKFLOW_TYPE"),
            );
        }

        let (step_index, recorded) = self.next_step();
        let child_id = child_workflow_id(self.workflow_id(), step_index);

        match recorded {
            Some(record) => {
                self.replayed(record, workflow_type, StepKind::StartChild).await;
            }
            None => {
                self.guard_fresh().await;

                let child = NewWorkflow {
                    id: child_id,
                    workflow_type: workflow_type.to_string(),
                    input,
                    app_version: engine.app_version.clone(),
                    executor_id: match queue_name {
                        Some(_) => None,
                        None => Some(engine.executor_id.clone()),
                    },
                    parent_id: Some(self.workflow_id()),
                };

                let created = match queue_name {
                    Some(queue) => engine.store.enqueue_workflow(child, queue).await,
                    None => engine.store.create_workflow(child).await,
                };
                match created {
                    Ok(()) | Err(StoreError::DuplicateInstance(_)) => {}
                    Err(e) => self.interrupt(Interrupt::Store(e.to_string())).await,
                }

                self.persist(StepRecord::completed(
                    self.workflow_id(),
                    step_index,
                    workflow_type,
                    StepKind::StartChild,
                    serde_json::json!({ "workflow_id": child_id }),
                ))
                .await;

                debug!(
                    workflow_id = %self.workflow_id(),
                    %child_id,
                    child_type = workflow_type,
                    queue = queue_name.unwrap_or("-"),
                    "Started child workflow"
                );

                match queue_name {
                    Some(_) => engine.wake_dispatcher(),
                    None => engine.spawn_attempt(child_id),
                }
            }
        }

        Ok(WorkflowHandle::new(child_id, Arc::clone(&engine.handles))
            .with_interrupter(self.inner.interrupter.clone()))
    }

    fn next_step(&self) -> (i32, Option<StepRecord>) {
        let mut cursor = self.inner.cursor.lock();
        let index = cursor.next_index;
        cursor.next_index += 1;
        (index, cursor.recorded.remove(&index))
    }

    async fn replayed(&self, record: StepRecord, name: &str, kind: StepKind) -> StepRecord {
        if record.kind == kind && record.step_name == name {
            return record;
        }

        let message = format!(
            "step {} replayed as {} '{}' but was recorded as {} '{}'",
            record.step_index,
            kind.as_str(),
            name,
            record.kind.as_str(),
            record.step_name
        );
        self.interrupt(Interrupt::NonDeterministic(message)).await
    }

    /// Stop before a fresh step on shutdown or if the instance was cancelled
    ///
    /// A step already past this point runs to completion and is recorded.
    async fn guard_fresh(&self) {
        if self.inner.interrupter.is_shutting_down() {
            debug!(workflow_id = %self.workflow_id(), "Stopping before fresh step for shutdown");
            self.interrupt(Interrupt::Shutdown).await
        }
        if self.is_cancelled().await {
            self.interrupt(Interrupt::Cancelled).await
        }
    }

    async fn persist(&self, record: StepRecord) -> StepRecord {
        let step_index = record.step_index;
        let result = self.inner.engine.store.record_step(record.clone()).await;
        let stored = self.inner.interrupter.check(result).await;

        if stored.status != record.status || stored.output != record.output {
            debug!(
                workflow_id = %self.workflow_id(),
                step_index,
                "Step already recorded by another attempt, using stored outcome"
            );
        }
        stored
    }

    async fn interrupt<T>(&self, reason: Interrupt) -> T {
        self.inner.interrupter.raise(reason).await
    }
}

/// Deterministic id of the child started at `step_index` of `parent_id`
pub fn child_workflow_id(parent_id: Uuid, step_index: i32) -> Uuid {
    Uuid::new_v5(&parent_id, format!("child:{step_index}").as_bytes())
}
