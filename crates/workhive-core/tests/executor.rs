//! Integration tests for in-process execution.
//!
//! Covers the `None` and `IsolatedContext` strategies end to end: outcome
//! completeness, failure isolation, static-state separation and callbacks.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::{Value, json};

use workhive_core::{
    ActionContext, ActionRegistry, ActionResult, CompletionCallback, ContextOptions, Error,
    Executor, ExecutorConfig, FailureKind, ItemStatus, Outcome, Parameters, ProcessOptions,
    WorkItemId, WorkQueueConfig,
};

fn square(params: &Parameters, _: &ActionContext<'_>) -> ActionResult {
    let n: i64 = params.get("n")?;
    Ok(json!(n * n))
}

fn fail(params: &Parameters, _: &ActionContext<'_>) -> ActionResult {
    let message: String = params.get_opt("message")?.unwrap_or_else(|| "failed".to_string());
    Err(message.into())
}

fn explode(_: &Parameters, _: &ActionContext<'_>) -> ActionResult {
    panic!("boom");
}

/// Bumps a counter kept in the context's static state.
fn counter(params: &Parameters, ctx: &ActionContext<'_>) -> ActionResult {
    let hits = ctx.statics().get_or_init("hits", || AtomicU64::new(0))?;
    if let Some(ms) = params.get_opt::<u64>("sleep_ms")? {
        thread::sleep(Duration::from_millis(ms));
    }
    Ok(json!(hits.fetch_add(1, Ordering::SeqCst) + 1))
}

fn registry() -> ActionRegistry {
    let mut registry = ActionRegistry::new();
    registry
        .register_fn("square", square)
        .register_fn("fail", fail)
        .register_fn("explode", explode)
        .register_fn("counter", counter);
    registry
}

fn executor() -> Executor {
    Executor::with_config(ExecutorConfig::default().with_max_workers(4), registry()).unwrap()
}

fn n(value: i64) -> Parameters {
    Parameters::new().with("n", value).unwrap()
}

fn values(outcomes: &[(WorkItemId, Outcome)]) -> Vec<Value> {
    let mut sorted: Vec<_> = outcomes.to_vec();
    sorted.sort_by_key(|(id, _)| *id);
    sorted
        .into_iter()
        .map(|(_, o)| o.value().cloned().unwrap_or(Value::Null))
        .collect()
}

#[test]
fn test_every_submitted_item_has_one_outcome() {
    let executor = executor();
    let queue = executor.new_work_queue(WorkQueueConfig::None).unwrap();

    let handles: Vec<_> = (0..50).map(|i| queue.submit("square", n(i)).unwrap()).collect();
    let outcomes = executor.await_all().unwrap();

    assert_eq!(outcomes.len(), 50);
    let ids: BTreeSet<_> = outcomes.iter().map(|(id, _)| *id).collect();
    let submitted: BTreeSet<_> = handles.iter().map(|h| h.id()).collect();
    assert_eq!(ids, submitted);
    assert!(handles.iter().all(|h| h.status() == ItemStatus::Completed));

    let expected: Vec<Value> = (0..50i64).map(|i| json!(i * i)).collect();
    assert_eq!(values(&outcomes), expected);
    assert_eq!(executor.in_flight(), 0);
}

#[test]
fn test_failures_do_not_affect_siblings() {
    let executor = executor();
    let queue = executor.new_work_queue(WorkQueueConfig::None).unwrap();

    queue.submit("square", n(3)).unwrap();
    queue
        .submit("fail", Parameters::new().with("message", "bad input").unwrap())
        .unwrap();
    queue.submit("explode", Parameters::new()).unwrap();
    queue.submit("square", n(4)).unwrap();

    let err = executor.await_all().unwrap_err();
    let aggregate = match err {
        Error::Aggregate(aggregate) => aggregate,
        other => panic!("expected aggregate failure, got {other:?}"),
    };
    assert_eq!(aggregate.outcomes().len(), 4);
    assert_eq!(aggregate.successes().count(), 2);

    let messages: Vec<String> = aggregate
        .failures()
        .map(|(_, o)| {
            let failure = o.failure().unwrap();
            assert_eq!(failure.kind, FailureKind::Action);
            failure.message.clone()
        })
        .collect();
    assert!(messages.iter().any(|m| m.contains("bad input")));
    assert!(messages.iter().any(|m| m.contains("boom")));

    let mut squares: Vec<_> = aggregate
        .successes()
        .filter_map(|(_, o)| o.value().and_then(Value::as_i64))
        .collect();
    squares.sort();
    assert_eq!(squares, vec![9, 16]);
}

#[test]
fn test_await_all_is_repeatable() {
    let executor = executor();
    let queue = executor.new_work_queue(WorkQueueConfig::None).unwrap();

    queue.submit("square", n(2)).unwrap();
    assert_eq!(executor.await_all().unwrap().len(), 1);

    queue.submit("square", n(5)).unwrap();
    queue.submit("square", n(6)).unwrap();
    assert_eq!(values(&executor.await_all().unwrap()), vec![json!(25), json!(36)]);
}

#[test]
fn test_none_strategy_shares_host_statics() {
    let executor = executor();
    let a = executor.new_work_queue(WorkQueueConfig::None).unwrap();
    let b = executor.new_work_queue(WorkQueueConfig::None).unwrap();

    for _ in 0..3 {
        a.submit("counter", Parameters::new()).unwrap();
        b.submit("counter", Parameters::new()).unwrap();
    }
    let mut seen: Vec<i64> = executor
        .await_all()
        .unwrap()
        .iter()
        .filter_map(|(_, o)| o.value().and_then(Value::as_i64))
        .collect();
    seen.sort();
    assert_eq!(seen, vec![1, 2, 3, 4, 5, 6]);
}

#[test]
fn test_isolated_contexts_keep_statics_apart() {
    let executor = executor();
    let alpha = ContextOptions::new().with_setting("tenant", "alpha");
    let beta = ContextOptions::new().with_setting("tenant", "beta");

    let qa = executor
        .new_work_queue(WorkQueueConfig::IsolatedContext(alpha.clone()))
        .unwrap();
    let qb = executor
        .new_work_queue(WorkQueueConfig::IsolatedContext(beta))
        .unwrap();
    // Same options as `qa`, so the same context.
    let qa2 = executor
        .new_work_queue(WorkQueueConfig::IsolatedContext(alpha))
        .unwrap();

    let mut alpha_ids = BTreeSet::new();
    let mut beta_ids = BTreeSet::new();
    for _ in 0..3 {
        alpha_ids.insert(qa.submit("counter", Parameters::new()).unwrap().id());
        alpha_ids.insert(qa2.submit("counter", Parameters::new()).unwrap().id());
        beta_ids.insert(qb.submit("counter", Parameters::new()).unwrap().id());
    }

    let outcomes = executor.await_all().unwrap();
    let collect = |ids: &BTreeSet<WorkItemId>| {
        let mut v: Vec<i64> = outcomes
            .iter()
            .filter(|(id, _)| ids.contains(id))
            .filter_map(|(_, o)| o.value().and_then(Value::as_i64))
            .collect();
        v.sort();
        v
    };
    assert_eq!(collect(&alpha_ids), vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(collect(&beta_ids), vec![1, 2, 3]);
}

fn tenant(_: &Parameters, ctx: &ActionContext<'_>) -> ActionResult {
    Ok(json!(ctx.setting("tenant")))
}

#[test]
fn test_context_settings_reach_actions() {
    let mut registry = registry();
    registry.register_fn("tenant", tenant);
    let executor = Executor::new(registry).unwrap();

    let queue = executor
        .new_work_queue(WorkQueueConfig::IsolatedContext(
            ContextOptions::new().with_setting("tenant", "gamma"),
        ))
        .unwrap();
    queue.submit("tenant", Parameters::new()).unwrap();
    let plain = executor.new_work_queue(WorkQueueConfig::None).unwrap();
    plain.submit("tenant", Parameters::new()).unwrap();

    let mut results = values(&executor.await_all().unwrap());
    results.sort_by_key(|v| v.is_null());
    assert_eq!(results, vec![json!("gamma"), Value::Null]);
}

#[derive(Clone, Default)]
struct Recorder {
    started: Arc<Mutex<Vec<(WorkItemId, String)>>>,
    completed: Arc<Mutex<Vec<(WorkItemId, bool)>>>,
}

impl CompletionCallback for Recorder {
    fn on_item_started(&self, item: WorkItemId, action: &str) {
        self.started.lock().unwrap().push((item, action.to_string()));
    }

    fn on_item_completed(&self, item: WorkItemId, outcome: &Outcome) {
        self.completed.lock().unwrap().push((item, outcome.is_success()));
    }
}

#[test]
fn test_callbacks_see_every_item() {
    let recorder = Recorder::default();
    let executor = Executor::builder(registry())
        .callback(recorder.clone())
        .build()
        .unwrap();
    let queue = executor.new_work_queue(WorkQueueConfig::None).unwrap();

    let ok = queue.submit("square", n(7)).unwrap();
    let bad = queue.submit("fail", Parameters::new()).unwrap();
    assert!(executor.await_all().is_err());

    let mut started = recorder.started.lock().unwrap().clone();
    started.sort();
    assert_eq!(
        started,
        vec![(ok.id(), "square".to_string()), (bad.id(), "fail".to_string())]
    );

    let mut completed = recorder.completed.lock().unwrap().clone();
    completed.sort();
    assert_eq!(completed, vec![(ok.id(), true), (bad.id(), false)]);
}

#[test]
fn test_invalid_queue_configs_fail_at_creation() {
    let executor = executor();

    let missing_library = WorkQueueConfig::IsolatedContext(
        ContextOptions::new().with_library("/nonexistent/libnothing.so"),
    );
    assert!(matches!(
        executor.new_work_queue(missing_library),
        Err(Error::Configuration(_))
    ));

    let missing_program = WorkQueueConfig::IsolatedProcess(
        ProcessOptions::new().with_program("/nonexistent/workhive-daemon"),
    );
    assert!(matches!(
        executor.new_work_queue(missing_program),
        Err(Error::Configuration(_))
    ));

    let bad_env =
        WorkQueueConfig::IsolatedProcess(ProcessOptions::new().with_env("A=B", "value"));
    assert!(matches!(
        executor.new_work_queue(bad_env),
        Err(Error::Configuration(_))
    ));

    assert_eq!(executor.queue_count(), 0);
}

#[test]
fn test_unknown_action_rejected_at_submit() {
    let executor = executor();
    let queue = executor
        .new_work_queue(WorkQueueConfig::IsolatedContext(ContextOptions::new()))
        .unwrap();

    let err = queue.submit("no-such-action", Parameters::new()).unwrap_err();
    assert!(matches!(err, Error::UnknownAction(ref name) if name == "no-such-action"));
    assert!(executor.await_all().unwrap().is_empty());
}

#[test]
fn test_concurrent_submitters() {
    let executor = executor();
    let submitters: Vec<_> = (0..4)
        .map(|t| {
            let executor = executor.clone();
            thread::spawn(move || {
                let queue = executor.new_work_queue(WorkQueueConfig::None).unwrap();
                for i in 0..25 {
                    queue.submit("square", n(t * 100 + i)).unwrap();
                }
            })
        })
        .collect();
    for submitter in submitters {
        submitter.join().unwrap();
    }

    let outcomes = executor.await_all().unwrap();
    assert_eq!(outcomes.len(), 100);
    assert!(outcomes.iter().all(|(_, o)| o.is_success()));
    assert_eq!(executor.queue_count(), 0);
}

#[test]
fn test_in_flight_counts_running_items() {
    let executor = executor();
    let queue = executor.new_work_queue(WorkQueueConfig::None).unwrap();

    let handle = queue
        .submit("counter", Parameters::new().with("sleep_ms", 200u64).unwrap())
        .unwrap();
    assert_eq!(executor.in_flight(), 1);
    assert_ne!(handle.status(), ItemStatus::Completed);

    executor.await_all().unwrap();
    assert_eq!(executor.in_flight(), 0);
    assert_eq!(handle.status(), ItemStatus::Completed);
}
