//! WorkflowEventStore trait definition

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::step::StepError;
use crate::workflow::WorkflowError;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No workflow instance with this id
    #[error("unknown workflow instance: {0}")]
    UnknownInstance(Uuid),

    /// A workflow instance with this id already exists
    #[error("workflow instance already exists: {0}")]
    DuplicateInstance(Uuid),

    /// Status guard violated (compare-and-set failed)
    #[error("invalid transition for workflow {workflow_id}: {from} -> {to}")]
    InvalidTransition {
        workflow_id: Uuid,
        from: WorkflowStatus,
        to: WorkflowStatus,
    },

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Workflow status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Workflow created but not started
    Pending,

    /// Workflow is running (or suspended in a durable sleep)
    Running,

    /// Workflow completed successfully
    Completed,

    /// Workflow failed
    Failed,

    /// Workflow was cancelled
    Cancelled,
}

impl WorkflowStatus {
    /// Terminal states are immutable once written
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the lifecycle PENDING -> RUNNING -> {COMPLETED|FAILED|CANCELLED}
    /// allows moving from `self` to `to`
    pub fn can_transition_to(&self, to: WorkflowStatus) -> bool {
        match (self, to) {
            (Self::Pending, Self::Running) => true,
            (Self::Pending, Self::Cancelled) => true,
            (Self::Running, t) => t.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(StoreError::Serialization(format!(
                "invalid workflow status: {other}"
            ))),
        }
    }
}

/// What a step record stands for in the log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// A user step (`run_step`)
    Step,
    /// A durable sleep marker holding the wake time
    Sleep,
    /// Launch of a child workflow holding the child id
    StartChild,
    /// A recorded completion-order choice (`wait_any`)
    Await,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Step => "step",
            Self::Sleep => "sleep",
            Self::StartChild => "start_child",
            Self::Await => "await",
        }
    }
}

impl FromStr for StepKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "step" => Ok(Self::Step),
            "sleep" => Ok(Self::Sleep),
            "start_child" => Ok(Self::StartChild),
            "await" => Ok(Self::Await),
            other => Err(StoreError::Serialization(format!("invalid step kind: {other}"))),
        }
    }
}

/// Terminal status of a recorded step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for StepStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(StoreError::Serialization(format!("invalid step status: {other}"))),
        }
    }
}

/// Durable outcome of one step, keyed by (workflow_id, step_index)
///
/// Records are immutable: the first writer for an index wins and every later
/// attempt observes the stored outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub workflow_id: Uuid,
    pub step_index: i32,
    pub step_name: String,
    pub kind: StepKind,
    pub status: StepStatus,
    pub output: Option<serde_json::Value>,
    pub error: Option<StepError>,
    pub recorded_at: DateTime<Utc>,
}

impl StepRecord {
    /// A successful step outcome
    pub fn completed(
        workflow_id: Uuid,
        step_index: i32,
        step_name: impl Into<String>,
        kind: StepKind,
        output: serde_json::Value,
    ) -> Self {
        Self {
            workflow_id,
            step_index,
            step_name: step_name.into(),
            kind,
            status: StepStatus::Completed,
            output: Some(output),
            error: None,
            recorded_at: Utc::now(),
        }
    }

    /// A failed step outcome
    pub fn failed(
        workflow_id: Uuid,
        step_index: i32,
        step_name: impl Into<String>,
        kind: StepKind,
        error: StepError,
    ) -> Self {
        Self {
            workflow_id,
            step_index,
            step_name: step_name.into(),
            kind,
            status: StepStatus::Failed,
            output: None,
            error: Some(error),
            recorded_at: Utc::now(),
        }
    }

    /// The stored outcome as a result
    pub fn outcome(&self) -> Result<serde_json::Value, StepError> {
        match self.status {
            StepStatus::Completed => Ok(self.output.clone().unwrap_or(serde_json::Value::Null)),
            StepStatus::Failed => Err(self
                .error
                .clone()
                .unwrap_or_else(|| StepError::non_retryable("step failed without error detail"))),
        }
    }
}

/// Request to create a workflow instance
#[derive(Debug, Clone)]
pub struct NewWorkflow {
    pub id: Uuid,
    pub workflow_type: String,
    pub input: serde_json::Value,
    pub app_version: String,
    /// Executor that owns a directly started instance (None for queued ones)
    pub executor_id: Option<String>,
    pub parent_id: Option<Uuid>,
}

/// Queue entry dispatch status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueEntryStatus {
    Waiting,
    Dispatched,
}

impl QueueEntryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Dispatched => "dispatched",
        }
    }
}

impl FromStr for QueueEntryStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "dispatched" => Ok(Self::Dispatched),
            other => Err(StoreError::Serialization(format!(
                "invalid queue entry status: {other}"
            ))),
        }
    }
}

/// A pending or dispatched request to run a queued workflow
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub queue_name: String,
    pub workflow_id: Uuid,
    pub status: QueueEntryStatus,
    /// Monotonic enqueue order (FIFO tie-breaker)
    pub sequence: i64,
    pub enqueued_at: DateTime<Utc>,
    pub executor_id: Option<String>,
}

/// Status change applied by [`WorkflowEventStore::transition_workflow`]
#[derive(Debug, Clone)]
pub enum Transition {
    /// PENDING -> RUNNING, owned by `executor_id`
    Start { executor_id: String },
    /// -> COMPLETED with output
    Complete(serde_json::Value),
    /// -> FAILED with error
    Fail(WorkflowError),
    /// -> CANCELLED
    Cancel,
}

impl Transition {
    /// Target status of this transition
    pub fn target(&self) -> WorkflowStatus {
        match self {
            Self::Start { .. } => WorkflowStatus::Running,
            Self::Complete(_) => WorkflowStatus::Completed,
            Self::Fail(_) => WorkflowStatus::Failed,
            Self::Cancel => WorkflowStatus::Cancelled,
        }
    }
}

/// Workflow information stored in the database
#[derive(Debug, Clone)]
pub struct WorkflowInfo {
    pub id: Uuid,
    pub workflow_type: String,
    pub status: WorkflowStatus,
    pub input: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error: Option<WorkflowError>,
    pub queue_name: Option<String>,
    pub parent_id: Option<Uuid>,
    pub app_version: String,
    pub executor_id: Option<String>,
    /// Wake time of an instance suspended in a durable sleep
    pub resume_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Filter for listing workflows
#[derive(Debug, Clone)]
pub struct WorkflowFilter {
    pub status: Option<WorkflowStatus>,
    pub workflow_type: Option<String>,
    pub queue_name: Option<String>,
    pub parent_id: Option<Uuid>,
    pub limit: u32,
}

impl Default for WorkflowFilter {
    fn default() -> Self {
        Self {
            status: None,
            workflow_type: None,
            queue_name: None,
            parent_id: None,
            limit: 100,
        }
    }
}

impl WorkflowFilter {
    pub fn with_status(mut self, status: WorkflowStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_workflow_type(mut self, workflow_type: impl Into<String>) -> Self {
        self.workflow_type = Some(workflow_type.into());
        self
    }

    pub fn with_queue(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = Some(queue_name.into());
        self
    }

    pub fn with_parent(mut self, parent_id: Uuid) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    pub(crate) fn matches(&self, info: &WorkflowInfo) -> bool {
        self.status.map_or(true, |s| info.status == s)
            && self
                .workflow_type
                .as_ref()
                .map_or(true, |t| &info.workflow_type == t)
            && self
                .queue_name
                .as_ref()
                .map_or(true, |q| info.queue_name.as_ref() == Some(q))
            && self.parent_id.map_or(true, |p| info.parent_id == Some(p))
    }
}

/// Durable log of workflow instances, step records and queue entries
///
/// Every operation is atomic with respect to a single instance. Queue
/// dispatch is additionally atomic per queue so concurrent dispatchers never
/// exceed a queue's concurrency limit. Implementations must be thread-safe.
#[async_trait]
pub trait WorkflowEventStore: Send + Sync + 'static {
    // =========================================================================
    // Instance Operations
    // =========================================================================

    /// Create a new PENDING workflow instance
    ///
    /// Fails with [`StoreError::DuplicateInstance`] if the id exists.
    async fn create_workflow(&self, workflow: NewWorkflow) -> Result<(), StoreError>;

    /// Get workflow status
    async fn get_workflow_status(&self, workflow_id: Uuid) -> Result<WorkflowStatus, StoreError>;

    /// Get full workflow info
    async fn get_workflow_info(&self, workflow_id: Uuid) -> Result<WorkflowInfo, StoreError>;

    /// Compare-and-set the instance status
    ///
    /// Applies `transition` only if the current status is one of `from`,
    /// otherwise fails with [`StoreError::InvalidTransition`].
    async fn transition_workflow(
        &self,
        workflow_id: Uuid,
        from: &[WorkflowStatus],
        transition: Transition,
    ) -> Result<(), StoreError>;

    /// List workflows, newest first
    async fn list_workflows(&self, filter: WorkflowFilter)
        -> Result<Vec<WorkflowInfo>, StoreError>;

    // =========================================================================
    // Step Log Operations
    // =========================================================================

    /// Insert a step record if none exists at its index
    ///
    /// Returns the stored record: the given one when inserted, the existing
    /// one otherwise.
    async fn record_step(&self, record: StepRecord) -> Result<StepRecord, StoreError>;

    /// Load all step records of a workflow ordered by index
    async fn load_steps(&self, workflow_id: Uuid) -> Result<Vec<StepRecord>, StoreError>;

    // =========================================================================
    // Queue Operations
    // =========================================================================

    /// Create a PENDING instance together with a WAITING queue entry
    async fn enqueue_workflow(
        &self,
        workflow: NewWorkflow,
        queue_name: &str,
    ) -> Result<(), StoreError>;

    /// Move WAITING entries of a queue to DISPATCHED in FIFO order
    ///
    /// At most `concurrency - active` entries are dispatched, where active
    /// counts DISPATCHED entries plus RUNNING instances of the queue. Entries
    /// whose instance was created by another application version are skipped.
    async fn dispatch_queued(
        &self,
        queue_name: &str,
        concurrency: Option<u32>,
        executor_id: &str,
        app_version: &str,
        max: usize,
    ) -> Result<Vec<Uuid>, StoreError>;

    /// All entries of a queue in FIFO order
    async fn list_queue_entries(&self, queue_name: &str) -> Result<Vec<QueueEntry>, StoreError>;

    // =========================================================================
    // Suspension & Recovery
    // =========================================================================

    /// Persist the wake time of a RUNNING instance that released its worker
    async fn suspend_workflow(
        &self,
        workflow_id: Uuid,
        resume_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Claim suspended instances whose wake time has passed
    ///
    /// Claiming clears the wake time so each wake-up is handed out once.
    async fn claim_due_workflows(
        &self,
        executor_id: &str,
        now: DateTime<Utc>,
        max: usize,
    ) -> Result<Vec<Uuid>, StoreError>;

    /// Prepare this executor's unfinished work for resumption after restart
    ///
    /// Resets this executor's DISPATCHED queue entries to WAITING and returns
    /// its RUNNING (not suspended) and PENDING directly started instances.
    async fn recover_workflows(
        &self,
        executor_id: &str,
        app_version: &str,
    ) -> Result<Vec<Uuid>, StoreError>;

    /// Release connections; called once by the runtime that opened the store
    async fn close(&self) {}
}
