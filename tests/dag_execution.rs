//! Black-box end-to-end scenarios against the scheduler's public API
//! (§8 "End-to-end scenarios" 1, 2, 3, 7).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use integration_sync_engine::error::EngineError;
use integration_sync_engine::job_state::EngineContext;
use integration_sync_engine::types::{ExecutionHandler, Step, StepStartState, StepStatus};
use integration_sync_engine::StepScheduler;

fn ok_handler() -> ExecutionHandler {
    Arc::new(|_ctx| Box::pin(async { Ok(()) }))
}

fn failing_handler(fatal: bool) -> ExecutionHandler {
    Arc::new(move |ctx| {
        Box::pin(async move { Err(EngineError::step_handler(ctx.step_id.clone(), "boom", fatal)) })
    })
}

fn step(id: &str, depends_on: &[&str], handler: ExecutionHandler) -> Step {
    Step {
        id: id.to_string(),
        name: id.to_string(),
        depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
        entities: vec![],
        relationships: vec![],
        mapped_relationships: vec![],
        execution_handler: handler,
    }
}

fn engine() -> Arc<EngineContext> {
    let tmp = tempfile::tempdir().unwrap();
    Arc::new(EngineContext::new(tmp.path().to_path_buf()))
}

#[tokio::test]
async fn linear_chain_completes_in_dependency_order() {
    let steps = vec![
        step("a", &[], ok_handler()),
        step("b", &["a"], ok_handler()),
        step("c", &["b"], ok_handler()),
    ];

    let scheduler = StepScheduler::new(engine(), None, 1);
    let results = scheduler.run(steps, HashMap::new()).await.unwrap();

    assert_eq!(
        results.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
        vec!["a", "b", "c"]
    );
    assert!(results.iter().all(|r| r.status == StepStatus::Success));
}

#[tokio::test]
async fn diamond_with_a_failing_dependency_yields_partial_success() {
    let steps = vec![
        step("a", &[], ok_handler()),
        step("b", &["a"], failing_handler(false)),
        step("c", &["a"], ok_handler()),
        step("d", &["b", "c"], ok_handler()),
    ];

    let scheduler = StepScheduler::new(engine(), None, 4);
    let results = scheduler.run(steps, HashMap::new()).await.unwrap();
    let by_id: HashMap<_, _> = results.into_iter().map(|r| (r.id, r.status)).collect();

    assert_eq!(by_id["a"], StepStatus::Success);
    assert_eq!(by_id["b"], StepStatus::Failure);
    assert_eq!(by_id["c"], StepStatus::Success);
    assert_eq!(by_id["d"], StepStatus::PartialSuccessDueToDependencyFailure);
}

#[tokio::test]
async fn disabled_step_blocks_its_dependent_without_running_it() {
    let ran = Arc::new(AtomicBool::new(false));
    let ran_clone = ran.clone();
    let c_handler: ExecutionHandler = Arc::new(move |_ctx| {
        let ran = ran_clone.clone();
        Box::pin(async move {
            ran.store(true, Ordering::SeqCst);
            Ok(())
        })
    });

    let steps = vec![
        step("a", &[], ok_handler()),
        step("b", &[], ok_handler()),
        step("c", &["b"], c_handler),
    ];

    let mut start_states = HashMap::new();
    start_states.insert(
        "b".to_string(),
        StepStartState {
            disabled: true,
            step_cache_path: None,
        },
    );

    let scheduler = StepScheduler::new(engine(), None, 4);
    let results = scheduler.run(steps, start_states).await.unwrap();
    let by_id: HashMap<_, _> = results.into_iter().map(|r| (r.id, r.status)).collect();

    assert_eq!(by_id["a"], StepStatus::Success);
    assert_eq!(by_id["b"], StepStatus::Disabled);
    assert_eq!(by_id["c"], StepStatus::Disabled);
    assert!(!ran.load(Ordering::SeqCst));
}

#[tokio::test]
async fn fatal_handler_error_pauses_the_run_and_rejects_it() {
    let steps = vec![
        step("a", &[], failing_handler(true)),
        step("b", &["a"], ok_handler()),
    ];

    let scheduler = StepScheduler::new(engine(), None, 1);
    let err = scheduler.run(steps, HashMap::new()).await.unwrap_err();
    assert!(matches!(err, EngineError::StepHandler { fatal: true, .. }));
}

#[tokio::test]
async fn a_cyclic_dependency_graph_is_rejected_before_any_step_runs() {
    let ran = Arc::new(AtomicBool::new(false));
    let ran_clone = ran.clone();
    let handler: ExecutionHandler = Arc::new(move |_ctx| {
        let ran = ran_clone.clone();
        Box::pin(async move {
            ran.store(true, Ordering::SeqCst);
            Ok(())
        })
    });

    let steps = vec![step("a", &["b"], handler.clone()), step("b", &["a"], handler)];

    let scheduler = StepScheduler::new(engine(), None, 1);
    let err = scheduler.run(steps, HashMap::new()).await.unwrap_err();
    assert!(matches!(err, EngineError::Configuration(_)));
    assert!(!ran.load(Ordering::SeqCst));
}
