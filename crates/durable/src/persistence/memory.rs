//! In-memory implementation of WorkflowEventStore for testing

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;

/// Everything lives behind one lock so cross-table operations (enqueue,
/// dispatch, start) stay atomic the way a database transaction would.
#[derive(Default)]
struct MemoryState {
    workflows: HashMap<Uuid, WorkflowInfo>,
    steps: HashMap<Uuid, BTreeMap<i32, StepRecord>>,
    queue: BTreeMap<i64, QueueEntry>,
    next_sequence: i64,
}

impl MemoryState {
    fn workflow(&self, workflow_id: Uuid) -> Result<&WorkflowInfo, StoreError> {
        self.workflows
            .get(&workflow_id)
            .ok_or(StoreError::UnknownInstance(workflow_id))
    }

    fn insert_workflow(
        &mut self,
        workflow: NewWorkflow,
        queue_name: Option<&str>,
    ) -> Result<(), StoreError> {
        if self.workflows.contains_key(&workflow.id) {
            return Err(StoreError::DuplicateInstance(workflow.id));
        }

        self.workflows.insert(
            workflow.id,
            WorkflowInfo {
                id: workflow.id,
                workflow_type: workflow.workflow_type,
                status: WorkflowStatus::Pending,
                input: workflow.input,
                result: None,
                error: None,
                queue_name: queue_name.map(str::to_string),
                parent_id: workflow.parent_id,
                app_version: workflow.app_version,
                executor_id: workflow.executor_id,
                resume_at: None,
                created_at: Utc::now(),
                started_at: None,
                completed_at: None,
            },
        );
        Ok(())
    }

    /// Slots a queue has in use: DISPATCHED entries plus RUNNING instances
    fn active_in_queue(&self, queue_name: &str) -> usize {
        let dispatched = self
            .queue
            .values()
            .filter(|e| e.queue_name == queue_name && e.status == QueueEntryStatus::Dispatched)
            .count();
        let running = self
            .workflows
            .values()
            .filter(|w| {
                w.queue_name.as_deref() == Some(queue_name) && w.status == WorkflowStatus::Running
            })
            .count();
        dispatched + running
    }

    fn remove_queue_entry(&mut self, workflow_id: Uuid) {
        self.queue.retain(|_, e| e.workflow_id != workflow_id);
    }
}

/// In-memory implementation of WorkflowEventStore
///
/// This is primarily for testing. It stores all data in memory and
/// provides the same semantics as the PostgreSQL implementation, but does
/// not survive a process restart. Share one instance between runtimes (via
/// `Arc`) to simulate a restart against the same durable state.
///
/// # Example
///
/// ```
/// use steadfast_durable::InMemoryWorkflowEventStore;
///
/// let store = InMemoryWorkflowEventStore::new();
/// assert_eq!(store.workflow_count(), 0);
/// ```
pub struct InMemoryWorkflowEventStore {
    state: RwLock<MemoryState>,
}

impl InMemoryWorkflowEventStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
        }
    }

    /// Get the number of workflows
    pub fn workflow_count(&self) -> usize {
        self.state.read().workflows.len()
    }

    /// Get the number of recorded steps across all workflows
    pub fn step_count(&self) -> usize {
        self.state.read().steps.values().map(BTreeMap::len).sum()
    }

    /// Get the number of entries still held by a queue
    pub fn queue_depth(&self, queue_name: &str) -> usize {
        self.state
            .read()
            .queue
            .values()
            .filter(|e| e.queue_name == queue_name)
            .count()
    }

    /// Get the number of concurrency slots a queue holds, read atomically
    pub fn queue_active(&self, queue_name: &str) -> usize {
        self.state.read().active_in_queue(queue_name)
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        *self.state.write() = MemoryState::default();
    }
}

impl Default for InMemoryWorkflowEventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkflowEventStore for InMemoryWorkflowEventStore {
    async fn create_workflow(&self, workflow: NewWorkflow) -> Result<(), StoreError> {
        self.state.write().insert_workflow(workflow, None)
    }

    async fn get_workflow_status(&self, workflow_id: Uuid) -> Result<WorkflowStatus, StoreError> {
        self.state.read().workflow(workflow_id).map(|w| w.status)
    }

    async fn get_workflow_info(&self, workflow_id: Uuid) -> Result<WorkflowInfo, StoreError> {
        self.state.read().workflow(workflow_id).cloned()
    }

    async fn transition_workflow(
        &self,
        workflow_id: Uuid,
        from: &[WorkflowStatus],
        transition: Transition,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let workflow = state
            .workflows
            .get_mut(&workflow_id)
            .ok_or(StoreError::UnknownInstance(workflow_id))?;

        let to = transition.target();
        if !from.contains(&workflow.status) || !workflow.status.can_transition_to(to) {
            return Err(StoreError::InvalidTransition {
                workflow_id,
                from: workflow.status,
                to,
            });
        }

        workflow.status = to;
        match transition {
            Transition::Start { executor_id } => {
                workflow.executor_id = Some(executor_id);
                workflow.started_at = Some(Utc::now());
            }
            Transition::Complete(result) => {
                workflow.result = Some(result);
                workflow.completed_at = Some(Utc::now());
            }
            Transition::Fail(error) => {
                workflow.error = Some(error);
                workflow.completed_at = Some(Utc::now());
            }
            Transition::Cancel => {
                workflow.completed_at = Some(Utc::now());
            }
        }
        if to.is_terminal() {
            workflow.resume_at = None;
        }

        // A started or finished instance no longer occupies a queue entry
        state.remove_queue_entry(workflow_id);
        Ok(())
    }

    async fn list_workflows(
        &self,
        filter: WorkflowFilter,
    ) -> Result<Vec<WorkflowInfo>, StoreError> {
        let state = self.state.read();
        let mut workflows: Vec<_> = state
            .workflows
            .values()
            .filter(|w| filter.matches(w))
            .cloned()
            .collect();

        workflows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        workflows.truncate(filter.limit as usize);
        Ok(workflows)
    }

    async fn record_step(&self, record: StepRecord) -> Result<StepRecord, StoreError> {
        let mut state = self.state.write();
        state.workflow(record.workflow_id)?;

        let steps = state.steps.entry(record.workflow_id).or_default();
        let stored = steps.entry(record.step_index).or_insert(record);
        Ok(stored.clone())
    }

    async fn load_steps(&self, workflow_id: Uuid) -> Result<Vec<StepRecord>, StoreError> {
        let state = self.state.read();
        state.workflow(workflow_id)?;

        Ok(state
            .steps
            .get(&workflow_id)
            .map(|steps| steps.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn enqueue_workflow(
        &self,
        workflow: NewWorkflow,
        queue_name: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let workflow_id = workflow.id;
        state.insert_workflow(workflow, Some(queue_name))?;

        state.next_sequence += 1;
        let sequence = state.next_sequence;
        state.queue.insert(
            sequence,
            QueueEntry {
                queue_name: queue_name.to_string(),
                workflow_id,
                status: QueueEntryStatus::Waiting,
                sequence,
                enqueued_at: Utc::now(),
                executor_id: None,
            },
        );
        Ok(())
    }

    async fn dispatch_queued(
        &self,
        queue_name: &str,
        concurrency: Option<u32>,
        executor_id: &str,
        app_version: &str,
        max: usize,
    ) -> Result<Vec<Uuid>, StoreError> {
        let mut state = self.state.write();

        let capacity = match concurrency {
            Some(limit) => (limit as usize).saturating_sub(state.active_in_queue(queue_name)),
            None => usize::MAX,
        };
        let budget = capacity.min(max);
        if budget == 0 {
            return Ok(vec![]);
        }

        let candidates: Vec<(i64, Uuid)> = state
            .queue
            .values()
            .filter(|e| e.queue_name == queue_name && e.status == QueueEntryStatus::Waiting)
            .filter(|e| {
                state
                    .workflows
                    .get(&e.workflow_id)
                    .is_some_and(|w| w.app_version == app_version)
            })
            .take(budget)
            .map(|e| (e.sequence, e.workflow_id))
            .collect();

        let mut claimed = Vec::with_capacity(candidates.len());
        for (sequence, workflow_id) in candidates {
            if let Some(entry) = state.queue.get_mut(&sequence) {
                entry.status = QueueEntryStatus::Dispatched;
                entry.executor_id = Some(executor_id.to_string());
                claimed.push(workflow_id);
            }
        }
        Ok(claimed)
    }

    async fn list_queue_entries(&self, queue_name: &str) -> Result<Vec<QueueEntry>, StoreError> {
        Ok(self
            .state
            .read()
            .queue
            .values()
            .filter(|e| e.queue_name == queue_name)
            .cloned()
            .collect())
    }

    async fn suspend_workflow(
        &self,
        workflow_id: Uuid,
        resume_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write();
        let workflow = state
            .workflows
            .get_mut(&workflow_id)
            .ok_or(StoreError::UnknownInstance(workflow_id))?;

        if workflow.status != WorkflowStatus::Running {
            return Err(StoreError::InvalidTransition {
                workflow_id,
                from: workflow.status,
                to: WorkflowStatus::Running,
            });
        }
        workflow.resume_at = Some(resume_at);
        Ok(())
    }

    async fn claim_due_workflows(
        &self,
        executor_id: &str,
        now: DateTime<Utc>,
        max: usize,
    ) -> Result<Vec<Uuid>, StoreError> {
        let mut state = self.state.write();
        let mut due: Vec<_> = state
            .workflows
            .values_mut()
            .filter(|w| {
                w.status == WorkflowStatus::Running
                    && w.executor_id.as_deref() == Some(executor_id)
                    && w.resume_at.is_some_and(|at| at <= now)
            })
            .collect();
        due.sort_by_key(|w| w.resume_at);

        Ok(due
            .into_iter()
            .take(max)
            .map(|w| {
                w.resume_at = None;
                w.id
            })
            .collect())
    }

    async fn recover_workflows(
        &self,
        executor_id: &str,
        app_version: &str,
    ) -> Result<Vec<Uuid>, StoreError> {
        let mut state = self.state.write();

        for entry in state.queue.values_mut() {
            if entry.status == QueueEntryStatus::Dispatched
                && entry.executor_id.as_deref() == Some(executor_id)
            {
                entry.status = QueueEntryStatus::Waiting;
                entry.executor_id = None;
            }
        }

        let mut recovered: Vec<_> = state
            .workflows
            .values()
            .filter(|w| {
                w.executor_id.as_deref() == Some(executor_id)
                    && w.app_version == app_version
                    && w.resume_at.is_none()
                    && match w.status {
                        WorkflowStatus::Running => true,
                        WorkflowStatus::Pending => w.queue_name.is_none(),
                        _ => false,
                    }
            })
            .map(|w| (w.created_at, w.id))
            .collect();
        recovered.sort();

        Ok(recovered.into_iter().map(|(_, id)| id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::StepError;
    use crate::workflow::WorkflowError;
    use std::sync::Arc;

    fn new_workflow(app_version: &str) -> NewWorkflow {
        NewWorkflow {
            id: Uuid::now_v7(),
            workflow_type: "test_workflow".to_string(),
            input: serde_json::json!({"key": "value"}),
            app_version: app_version.to_string(),
            executor_id: Some("local".to_string()),
            parent_id: None,
        }
    }

    fn start() -> Transition {
        Transition::Start {
            executor_id: "local".to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_and_get_workflow() {
        let store = InMemoryWorkflowEventStore::new();
        let workflow = new_workflow("v1");
        let workflow_id = workflow.id;

        store.create_workflow(workflow).await.unwrap();

        let status = store.get_workflow_status(workflow_id).await.unwrap();
        assert_eq!(status, WorkflowStatus::Pending);

        let info = store.get_workflow_info(workflow_id).await.unwrap();
        assert_eq!(info.workflow_type, "test_workflow");
        assert_eq!(info.input, serde_json::json!({"key": "value"}));
    }

    #[tokio::test]
    async fn test_duplicate_instance() {
        let store = InMemoryWorkflowEventStore::new();
        let workflow = new_workflow("v1");

        store.create_workflow(workflow.clone()).await.unwrap();
        let result = store.create_workflow(workflow).await;

        assert!(matches!(result, Err(StoreError::DuplicateInstance(_))));
    }

    #[tokio::test]
    async fn test_unknown_instance() {
        let store = InMemoryWorkflowEventStore::new();
        let result = store.get_workflow_status(Uuid::now_v7()).await;

        assert!(matches!(result, Err(StoreError::UnknownInstance(_))));
    }

    #[tokio::test]
    async fn test_transition_guard() {
        let store = InMemoryWorkflowEventStore::new();
        let workflow = new_workflow("v1");
        let workflow_id = workflow.id;
        store.create_workflow(workflow).await.unwrap();

        store
            .transition_workflow(workflow_id, &[WorkflowStatus::Pending], start())
            .await
            .unwrap();
        store
            .transition_workflow(
                workflow_id,
                &[WorkflowStatus::Running],
                Transition::Complete(serde_json::json!(3)),
            )
            .await
            .unwrap();

        // Second completion must not overwrite the first
        let result = store
            .transition_workflow(
                workflow_id,
                &[WorkflowStatus::Running],
                Transition::Fail(WorkflowError::new("late")),
            )
            .await;
        assert!(matches!(
            result,
            Err(StoreError::InvalidTransition {
                from: WorkflowStatus::Completed,
                to: WorkflowStatus::Failed,
                ..
            })
        ));

        let info = store.get_workflow_info(workflow_id).await.unwrap();
        assert_eq!(info.result, Some(serde_json::json!(3)));
        assert!(info.error.is_none());
        assert!(info.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_record_step_is_insert_if_absent() {
        let store = InMemoryWorkflowEventStore::new();
        let workflow = new_workflow("v1");
        let workflow_id = workflow.id;
        store.create_workflow(workflow).await.unwrap();

        let first = StepRecord::completed(workflow_id, 0, "step 0", StepKind::Step, 1.into());
        let second = StepRecord::completed(workflow_id, 0, "step 0", StepKind::Step, 2.into());

        let stored = store.record_step(first).await.unwrap();
        assert_eq!(stored.output, Some(serde_json::json!(1)));

        let stored = store.record_step(second).await.unwrap();
        assert_eq!(stored.output, Some(serde_json::json!(1)));

        assert_eq!(store.load_steps(workflow_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_record_step_single_winner() {
        let store = Arc::new(InMemoryWorkflowEventStore::new());
        let workflow = new_workflow("v1");
        let workflow_id = workflow.id;
        store.create_workflow(workflow).await.unwrap();

        let mut tasks = vec![];
        for attempt in 0..8 {
            let store = Arc::clone(&store);
            tasks.push(tokio::spawn(async move {
                store
                    .record_step(StepRecord::completed(
                        workflow_id,
                        0,
                        "racy",
                        StepKind::Step,
                        attempt.into(),
                    ))
                    .await
                    .unwrap()
            }));
        }

        let mut outputs = vec![];
        for task in tasks {
            outputs.push(task.await.unwrap().output);
        }

        // Every racer observes the same stored outcome
        assert!(outputs.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(store.step_count(), 1);
    }

    #[tokio::test]
    async fn test_load_steps_ordered() {
        let store = InMemoryWorkflowEventStore::new();
        let workflow = new_workflow("v1");
        let workflow_id = workflow.id;
        store.create_workflow(workflow).await.unwrap();

        for index in [2, 0, 1] {
            store
                .record_step(StepRecord::failed(
                    workflow_id,
                    index,
                    format!("step {index}"),
                    StepKind::Step,
                    StepError::non_retryable("nope"),
                ))
                .await
                .unwrap();
        }

        let indexes: Vec<_> = store
            .load_steps(workflow_id)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.step_index)
            .collect();
        assert_eq!(indexes, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_dispatch_respects_concurrency() {
        let store = InMemoryWorkflowEventStore::new();
        let mut ids = vec![];
        for _ in 0..5 {
            let mut workflow = new_workflow("v1");
            workflow.executor_id = None;
            ids.push(workflow.id);
            store.enqueue_workflow(workflow, "q").await.unwrap();
        }

        let first = store
            .dispatch_queued("q", Some(2), "local", "v1", 10)
            .await
            .unwrap();
        assert_eq!(first, ids[..2].to_vec());

        // Slots are still held by dispatched entries
        let none = store
            .dispatch_queued("q", Some(2), "local", "v1", 10)
            .await
            .unwrap();
        assert!(none.is_empty());

        // Start the first one: entry removed, slot still held by RUNNING instance
        store
            .transition_workflow(ids[0], &[WorkflowStatus::Pending], start())
            .await
            .unwrap();
        assert!(store
            .dispatch_queued("q", Some(2), "local", "v1", 10)
            .await
            .unwrap()
            .is_empty());

        // Finishing it frees the slot
        store
            .transition_workflow(
                ids[0],
                &[WorkflowStatus::Running],
                Transition::Complete(serde_json::json!(null)),
            )
            .await
            .unwrap();
        let next = store
            .dispatch_queued("q", Some(2), "local", "v1", 10)
            .await
            .unwrap();
        assert_eq!(next, vec![ids[2]]);

        // ids[1] and ids[2] dispatched, ids[3] and ids[4] still waiting
        assert_eq!(store.queue_depth("q"), 4);
        let entries = store.list_queue_entries("q").await.unwrap();
        assert_eq!(
            entries
                .iter()
                .filter(|e| e.status == QueueEntryStatus::Dispatched)
                .count(),
            2
        );
        assert_eq!(store.queue_active("q"), 2);
    }

    #[tokio::test]
    async fn test_dispatch_skips_other_app_versions() {
        let store = InMemoryWorkflowEventStore::new();
        let mut old = new_workflow("v0");
        old.executor_id = None;
        let mut current = new_workflow("v1");
        current.executor_id = None;
        let current_id = current.id;

        store.enqueue_workflow(old, "q").await.unwrap();
        store.enqueue_workflow(current, "q").await.unwrap();

        let dispatched = store
            .dispatch_queued("q", None, "local", "v1", 10)
            .await
            .unwrap();
        assert_eq!(dispatched, vec![current_id]);
    }

    #[tokio::test]
    async fn test_suspend_and_claim_due() {
        let store = InMemoryWorkflowEventStore::new();
        let workflow = new_workflow("v1");
        let workflow_id = workflow.id;
        store.create_workflow(workflow).await.unwrap();
        store
            .transition_workflow(workflow_id, &[WorkflowStatus::Pending], start())
            .await
            .unwrap();

        let wake = Utc::now() + chrono::Duration::seconds(60);
        store.suspend_workflow(workflow_id, wake).await.unwrap();

        let early = store
            .claim_due_workflows("local", Utc::now(), 10)
            .await
            .unwrap();
        assert!(early.is_empty());

        let later = wake + chrono::Duration::seconds(1);
        let due = store.claim_due_workflows("local", later, 10).await.unwrap();
        assert_eq!(due, vec![workflow_id]);

        // Claimed exactly once
        let again = store.claim_due_workflows("local", later, 10).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_recover_workflows() {
        let store = InMemoryWorkflowEventStore::new();

        let running = new_workflow("v1");
        let running_id = running.id;
        store.create_workflow(running).await.unwrap();
        store
            .transition_workflow(running_id, &[WorkflowStatus::Pending], start())
            .await
            .unwrap();

        let mut queued = new_workflow("v1");
        queued.executor_id = None;
        let queued_id = queued.id;
        store.enqueue_workflow(queued, "q").await.unwrap();
        store
            .dispatch_queued("q", None, "local", "v1", 10)
            .await
            .unwrap();

        let recovered = store.recover_workflows("local", "v1").await.unwrap();
        assert_eq!(recovered, vec![running_id]);

        let entries = store.list_queue_entries("q").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].workflow_id, queued_id);
        assert_eq!(entries[0].status, QueueEntryStatus::Waiting);

        // Other versions and executors are left alone
        assert!(store.recover_workflows("local", "v2").await.unwrap().is_empty());
        assert!(store.recover_workflows("other", "v1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_workflows_filter() {
        let store = InMemoryWorkflowEventStore::new();
        let parent = new_workflow("v1");
        let parent_id = parent.id;
        store.create_workflow(parent).await.unwrap();

        for _ in 0..3 {
            let mut child = new_workflow("v1");
            child.parent_id = Some(parent_id);
            store.create_workflow(child).await.unwrap();
        }

        let children = store
            .list_workflows(WorkflowFilter::default().with_parent(parent_id))
            .await
            .unwrap();
        assert_eq!(children.len(), 3);

        let limited = store
            .list_workflows(WorkflowFilter::default().with_limit(2))
            .await
            .unwrap();
        assert_eq!(limited.len(), 2);
    }
}
