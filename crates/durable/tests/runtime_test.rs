//! End-to-end tests of the durable runtime on the in-memory store

mod common;

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use steadfast_durable::persistence::{StepKind, StepStatus, Transition};
use steadfast_durable::prelude::*;
use steadfast_durable::{InMemoryWorkflowEventStore, StoreError, WorkflowEventStore};
use uuid::Uuid;

const RESULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Records how many instances are inside their step at once
struct TrackedTask {
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl TrackedTask {
    fn new() -> (Self, Arc<AtomicUsize>) {
        let peak = Arc::new(AtomicUsize::new(0));
        let task = Self {
            active: Arc::new(AtomicUsize::new(0)),
            peak: Arc::clone(&peak),
        };
        (task, peak)
    }
}

#[async_trait]
impl Workflow for TrackedTask {
    const TYPE: &'static str = "tracked";
    type Input = u32;
    type Output = u32;

    async fn run(&self, ctx: WorkflowContext, input: u32) -> Result<u32, WorkflowError> {
        let active = Arc::clone(&self.active);
        let peak = Arc::clone(&self.peak);

        let value = ctx
            .run_step("work", || {
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(15)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, StepError>(input)
                }
            })
            .await?;
        Ok(value)
    }
}

#[test_log::test(tokio::test)]
async fn test_three_steps_sum_their_indexes() {
    let store = Arc::new(InMemoryWorkflowEventStore::new());
    let mut runtime = common::runtime_on(&store, common::test_config());
    runtime
        .register_fn("sum", |ctx: WorkflowContext, steps: u32| async move {
            let mut total = 0;
            for i in 0..steps {
                total += ctx
                    .run_step(format!("step-{i}"), || async move { Ok::<_, StepError>(i) })
                    .await?;
            }
            Ok::<_, WorkflowError>(total)
        })
        .unwrap();
    runtime.launch().await.unwrap();

    let handle: WorkflowHandle<u32> = runtime.start_workflow("sum", &3u32).await.unwrap();
    assert_eq!(handle.get_result_timeout(RESULT_TIMEOUT).await.unwrap(), 3);

    let steps = store.load_steps(handle.workflow_id()).await.unwrap();
    assert_eq!(steps.len(), 3);
    for (i, step) in steps.iter().enumerate() {
        assert_eq!(step.step_index, i as i32);
        assert_eq!(step.step_name, format!("step-{i}"));
        assert_eq!(step.kind, StepKind::Step);
        assert_eq!(step.status, StepStatus::Completed);
        assert_eq!(step.output, Some(json!(i)));
    }

    let info = handle.get_info().await.unwrap();
    assert_eq!(info.status, WorkflowStatus::Completed);
    assert_eq!(info.result, Some(json!(3)));
    assert!(info.started_at.is_some());
    assert!(info.completed_at.is_some());

    runtime.shutdown().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_queue_never_exceeds_concurrency_limit() {
    let store = Arc::new(InMemoryWorkflowEventStore::new());
    let (task, peak) = TrackedTask::new();
    let mut runtime = common::runtime_on(&store, common::test_config());
    runtime.register(task).unwrap();
    runtime
        .register_queue(Queue::new("limited").with_concurrency(5))
        .unwrap();
    runtime.launch().await.unwrap();

    // DISPATCHED entries plus RUNNING instances, as the store sees them
    let sampling = Arc::new(AtomicBool::new(true));
    let sampler = tokio::spawn({
        let store = Arc::clone(&store);
        let sampling = Arc::clone(&sampling);
        async move {
            let mut held = 0;
            while sampling.load(Ordering::SeqCst) {
                held = usize::max(held, store.queue_active("limited"));
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            held
        }
    });

    let mut handles = HandleSet::new();
    for i in 0..50u32 {
        let handle: WorkflowHandle<u32> = runtime
            .start_workflow_with("tracked", &i, StartOptions::new().on_queue("limited"))
            .await
            .unwrap();
        handles.push(handle);
    }

    let results = tokio::time::timeout(RESULT_TIMEOUT, handles.wait_all())
        .await
        .expect("queued workflows did not finish");
    let values: Vec<u32> = results.into_iter().map(Result::unwrap).collect();
    assert_eq!(values, (0..50).collect::<Vec<_>>());

    let peak = peak.load(Ordering::SeqCst);
    assert!(peak >= 1);
    assert!(peak <= 5, "observed {peak} concurrent instances");
    assert_eq!(store.queue_depth("limited"), 0);

    sampling.store(false, Ordering::SeqCst);
    let held = sampler.await.unwrap();
    assert!(held >= 1);
    assert!(held <= 5, "queue held {held} slots at once");
    assert_eq!(store.queue_active("limited"), 0);

    runtime.shutdown().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_parent_fans_out_children_through_queue() {
    let store = Arc::new(InMemoryWorkflowEventStore::new());
    let (task, peak) = TrackedTask::new();
    let mut runtime = common::runtime_on(&store, common::test_config());
    runtime.register(task).unwrap();
    runtime
        .register_fn("fan-out", |ctx: WorkflowContext, count: u32| async move {
            let mut handles = Vec::new();
            for i in 0..count {
                let handle: WorkflowHandle<u32> =
                    ctx.enqueue_workflow("pair", "tracked", &i).await?;
                handles.push(handle);
            }

            let mut total = 0;
            for handle in &handles {
                total += handle.get_result().await?;
            }
            Ok::<_, WorkflowError>(total)
        })
        .unwrap();
    runtime
        .register_queue(Queue::new("pair").with_concurrency(2))
        .unwrap();
    runtime.launch().await.unwrap();

    let parent: WorkflowHandle<u32> = runtime.start_workflow("fan-out", &5u32).await.unwrap();
    assert_eq!(parent.get_result_timeout(RESULT_TIMEOUT).await.unwrap(), 10);

    let children = runtime
        .list_workflows(WorkflowFilter::default().with_parent(parent.workflow_id()))
        .await
        .unwrap();
    assert_eq!(children.len(), 5);
    for child in &children {
        assert_eq!(child.status, WorkflowStatus::Completed);
        assert_eq!(child.queue_name.as_deref(), Some("pair"));
    }
    assert!(peak.load(Ordering::SeqCst) <= 2);

    // Parent records one launch per child, in call order
    let steps = store.load_steps(parent.workflow_id()).await.unwrap();
    assert_eq!(steps.len(), 5);
    assert!(steps.iter().all(|s| s.kind == StepKind::StartChild));

    runtime.shutdown().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_results_errors_and_unknown_instances() {
    let store = Arc::new(InMemoryWorkflowEventStore::new());
    let mut runtime = common::runtime_on(&store, common::test_config());
    runtime
        .register_fn("echo", |_ctx: WorkflowContext, input: String| async move {
            Ok::<_, WorkflowError>(input)
        })
        .unwrap();
    runtime
        .register_fn("fails", |_ctx: WorkflowContext, _: ()| async move {
            Err::<(), _>(WorkflowError::new("boom").with_code("BOOM"))
        })
        .unwrap();
    runtime.launch().await.unwrap();

    let echoed: String = runtime.run_workflow("echo", "hello").await.unwrap();
    assert_eq!(echoed, "hello");

    let failing: WorkflowHandle<()> = runtime.start_workflow("fails", &()).await.unwrap();
    match failing.get_result_timeout(RESULT_TIMEOUT).await {
        Err(HandleError::Failed(error)) => {
            assert_eq!(error.message, "boom");
            assert!(error.has_code("BOOM"));
        }
        other => panic!("expected recorded failure, got {other:?}"),
    }
    assert!(matches!(
        runtime.run_workflow::<(), _>("fails", &()).await,
        Err(RuntimeError::Handle(HandleError::Failed(_)))
    ));

    let unknown = runtime.executor().unwrap().handle::<u32>(Uuid::now_v7());
    assert!(matches!(
        unknown.get_result().await,
        Err(HandleError::UnknownInstance(_))
    ));
    assert!(matches!(
        runtime.retrieve_workflow::<u32>(Uuid::now_v7()).await,
        Err(RuntimeError::Store(StoreError::UnknownInstance(_)))
    ));
    assert!(matches!(
        runtime.start_workflow::<(), _>("missing", &()).await,
        Err(RuntimeError::UnknownWorkflowType(name)) if name == "missing"
    ));
    assert!(matches!(
        runtime
            .start_workflow_with::<(), _>("echo", "x", StartOptions::new().on_queue("nope"))
            .await,
        Err(RuntimeError::UnknownQueue(name)) if name == "nope"
    ));

    runtime.shutdown().await.unwrap();
    assert!(matches!(
        runtime.run_workflow::<String, _>("echo", "late").await,
        Err(RuntimeError::AlreadyShutdown)
    ));
}

#[test_log::test(tokio::test)]
async fn test_terminal_instances_reject_transitions() {
    let store = Arc::new(InMemoryWorkflowEventStore::new());
    let mut runtime = common::runtime_on(&store, common::test_config());
    runtime
        .register_fn("noop", |_ctx: WorkflowContext, _: ()| async move {
            Ok::<_, WorkflowError>(())
        })
        .unwrap();
    runtime.launch().await.unwrap();

    let handle: WorkflowHandle<()> = runtime.start_workflow("noop", &()).await.unwrap();
    handle.get_result_timeout(RESULT_TIMEOUT).await.unwrap();
    let id = handle.workflow_id();

    let err = store
        .transition_workflow(id, &[WorkflowStatus::Running], Transition::Cancel)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::InvalidTransition {
            from: WorkflowStatus::Completed,
            ..
        }
    ));
    assert!(matches!(
        runtime.cancel_workflow(id).await,
        Err(RuntimeError::Store(StoreError::InvalidTransition { .. }))
    ));
    assert_eq!(handle.get_status().await.unwrap(), WorkflowStatus::Completed);

    runtime.shutdown().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_step_retries_and_recorded_failures() {
    let store = Arc::new(InMemoryWorkflowEventStore::new());
    let attempts = Arc::new(AtomicU32::new(0));
    let mut runtime = common::runtime_on(&store, common::test_config());

    let counter = Arc::clone(&attempts);
    runtime
        .register_fn("flaky", move |ctx: WorkflowContext, _: ()| {
            let counter = Arc::clone(&counter);
            async move {
                let options = StepOptions::new()
                    .with_retry(RetryPolicy::fixed(Duration::from_millis(5), 3));
                let value = ctx
                    .run_step_with_options("flaky", options, || {
                        let counter = Arc::clone(&counter);
                        async move {
                            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                            if n < 3 {
                                Err(StepError::retryable(format!("attempt {n} failed")))
                            } else {
                                Ok(n)
                            }
                        }
                    })
                    .await?;

                let handled = match ctx
                    .run_step("refuse", || async {
                        Err::<u32, _>(StepError::non_retryable("refused"))
                    })
                    .await
                {
                    Ok(_) => "unexpected".to_string(),
                    Err(error) => error.message,
                };
                Ok::<_, WorkflowError>((value, handled))
            }
        })
        .unwrap();
    runtime.launch().await.unwrap();

    let handle: WorkflowHandle<(u32, String)> =
        runtime.start_workflow("flaky", &()).await.unwrap();
    let (value, handled) = handle.get_result_timeout(RESULT_TIMEOUT).await.unwrap();
    assert_eq!(value, 3);
    assert_eq!(handled, "refused");
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    let steps = store.load_steps(handle.workflow_id()).await.unwrap();
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[0].status, StepStatus::Completed);
    assert_eq!(steps[0].output, Some(json!(3)));
    assert_eq!(steps[1].status, StepStatus::Failed);
    assert_eq!(
        steps[1].error.as_ref().map(|e| e.message.as_str()),
        Some("refused")
    );

    runtime.shutdown().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_wait_any_records_first_finished_child() {
    let store = Arc::new(InMemoryWorkflowEventStore::new());
    let mut runtime = common::runtime_on(&store, common::test_config());
    runtime
        .register_fn("delay", |ctx: WorkflowContext, millis: u64| async move {
            ctx.run_step("pause", || async move {
                tokio::time::sleep(Duration::from_millis(millis)).await;
                Ok::<_, StepError>(())
            })
            .await?;
            Ok::<_, WorkflowError>(millis)
        })
        .unwrap();
    runtime
        .register_fn("race", |ctx: WorkflowContext, _: ()| async move {
            let slow: WorkflowHandle<u64> = ctx.start_workflow("delay", &400u64).await?;
            let fast: WorkflowHandle<u64> = ctx.start_workflow("delay", &10u64).await?;
            let handles = [slow, fast];

            let winner = ctx.wait_any(&handles).await?;
            let value = handles[winner].get_result().await?;
            Ok::<_, WorkflowError>((winner, value))
        })
        .unwrap();
    runtime.launch().await.unwrap();

    let handle: WorkflowHandle<(usize, u64)> = runtime.start_workflow("race", &()).await.unwrap();
    assert_eq!(handle.get_result_timeout(RESULT_TIMEOUT).await.unwrap(), (1, 10));

    let steps = store.load_steps(handle.workflow_id()).await.unwrap();
    let kinds: Vec<StepKind> = steps.iter().map(|s| s.kind).collect();
    assert_eq!(
        kinds,
        vec![StepKind::StartChild, StepKind::StartChild, StepKind::Await]
    );
    assert_eq!(steps[2].output, Some(json!(1)));

    let children = runtime
        .list_workflows(WorkflowFilter::default().with_parent(handle.workflow_id()))
        .await
        .unwrap();
    assert_eq!(children.len(), 2);

    runtime.shutdown().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_cancel_stops_before_next_step() {
    let store = Arc::new(InMemoryWorkflowEventStore::new());
    let gate = Arc::new(tokio::sync::Notify::new());
    let after = Arc::new(AtomicU32::new(0));
    let mut runtime = common::runtime_on(&store, common::test_config());

    let (body_gate, body_after) = (Arc::clone(&gate), Arc::clone(&after));
    runtime
        .register_fn("gated", move |ctx: WorkflowContext, _: ()| {
            let gate = Arc::clone(&body_gate);
            let after = Arc::clone(&body_after);
            async move {
                ctx.run_step("block", || {
                    let gate = Arc::clone(&gate);
                    async move {
                        gate.notified().await;
                        Ok::<_, StepError>(())
                    }
                })
                .await?;
                ctx.run_step("after", || {
                    let after = Arc::clone(&after);
                    async move {
                        after.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, StepError>(())
                    }
                })
                .await?;
                Ok::<_, WorkflowError>(())
            }
        })
        .unwrap();
    runtime.launch().await.unwrap();

    let handle: WorkflowHandle<()> = runtime.start_workflow("gated", &()).await.unwrap();
    let running = common::eventually(Duration::from_secs(5), || {
        let handle = handle.clone();
        async move { matches!(handle.get_status().await, Ok(WorkflowStatus::Running)) }
    })
    .await;
    assert!(running);

    runtime.cancel_workflow(handle.workflow_id()).await.unwrap();
    assert!(matches!(
        handle.get_result_timeout(RESULT_TIMEOUT).await,
        Err(HandleError::Cancelled)
    ));

    gate.notify_one();
    let executor = runtime.executor().unwrap().clone();
    assert!(
        common::eventually(Duration::from_secs(5), || {
            let executor = executor.clone();
            async move { executor.active_attempts() == 0 }
        })
        .await
    );

    assert_eq!(after.load(Ordering::SeqCst), 0);
    let steps = store.load_steps(handle.workflow_id()).await.unwrap();
    assert!(steps.iter().all(|s| s.step_name != "after"));
    assert_eq!(handle.get_status().await.unwrap(), WorkflowStatus::Cancelled);

    runtime.shutdown().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_long_sleep_suspends_and_resumes() {
    let store = Arc::new(InMemoryWorkflowEventStore::new());
    let config = common::test_config().with_executor(
        ExecutorConfig::default()
            .with_suspend_threshold(Duration::from_millis(50))
            .with_handle_poll_interval(Duration::from_millis(20)),
    );
    let mut runtime = common::runtime_on(&store, config);
    runtime
        .register_fn("nap", |ctx: WorkflowContext, millis: u64| async move {
            ctx.run_step("before", || async { Ok::<_, StepError>("before".to_string()) })
                .await?;
            ctx.sleep(Duration::from_millis(millis)).await;
            ctx.run_step("after", || async { Ok::<_, StepError>("after".to_string()) })
                .await?;
            Ok::<_, WorkflowError>(())
        })
        .unwrap();
    runtime.launch().await.unwrap();

    let started = Instant::now();
    let handle: WorkflowHandle<()> = runtime.start_workflow("nap", &300u64).await.unwrap();

    let suspended = common::eventually(Duration::from_secs(2), || {
        let handle = handle.clone();
        async move {
            matches!(
                handle.get_info().await,
                Ok(info) if info.status == WorkflowStatus::Running && info.resume_at.is_some()
            )
        }
    })
    .await;
    assert!(suspended, "instance never persisted a wake time");

    handle.get_result_timeout(RESULT_TIMEOUT).await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(300));

    let steps = store.load_steps(handle.workflow_id()).await.unwrap();
    let kinds: Vec<StepKind> = steps.iter().map(|s| s.kind).collect();
    assert_eq!(kinds, vec![StepKind::Step, StepKind::Sleep, StepKind::Step]);
    assert!(handle.get_info().await.unwrap().resume_at.is_none());

    runtime.shutdown().await.unwrap();
}
