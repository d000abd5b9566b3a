//! The step scheduler (§4.2): executes the dependency DAG with bounded
//! concurrency, honoring step start states, dependency-failure
//! propagation, and fatal cancellation.
//!
//! The working graph is a cloned, mutable copy of the dependency DAG;
//! nodes are removed as they're admitted into the work queue. This is
//! a convenience over an equivalent counter-based ready queue, chosen
//! here as a direct extension of `graph.rs`'s existing `StepGraph`
//! usage.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use petgraph::Direction::Incoming;
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::cache_loader::load_cache_for_step;
use crate::error::{EngineError, EngineResult};
use crate::graph::{build_step_graph, StepGraph};
use crate::job_state::{EngineContext, JobState, StepExecutionContext};
use crate::sync::UploadSink;
use crate::types::{Step, StepResult, StepStartState, StepStatus};

type SharedResults = Arc<AsyncMutex<HashMap<String, StepResult>>>;

struct StepOutcome {
    step_id: String,
    status: StepStatus,
    encountered_types: HashSet<String>,
    fatal_error: Option<EngineError>,
}

/// Bounded-concurrency, dependency-aware executor for a step catalog.
pub struct StepScheduler {
    engine: Arc<EngineContext>,
    upload_sink: Option<Arc<UploadSink>>,
    concurrency: usize,
}

impl StepScheduler {
    pub fn new(engine: Arc<EngineContext>, upload_sink: Option<Arc<UploadSink>>, concurrency: usize) -> Self {
        StepScheduler {
            engine,
            upload_sink,
            concurrency: concurrency.max(1),
        }
    }

    /// Runs every step in `steps` to completion, returning results in the
    /// dependency graph's overall topological order (§3 "Results are
    /// emitted in the dependency graph's overall topological order").
    pub async fn run(
        &self,
        steps: Vec<Step>,
        start_states: HashMap<String, StepStartState>,
    ) -> EngineResult<Vec<StepResult>> {
        let (mut working_graph, ordered_ids) = build_step_graph(&steps)?;

        let steps_by_id: HashMap<String, Step> =
            steps.iter().map(|s| (s.id.clone(), s.clone())).collect();

        // Seed: a step is DISABLED if explicitly disabled, or if any
        // (already-seeded, since we walk in topological order) dependency
        // is itself DISABLED.
        let mut disabled: HashSet<String> = HashSet::new();
        let mut results: HashMap<String, StepResult> = HashMap::new();
        for id in &ordered_ids {
            let step = &steps_by_id[id];
            let explicitly_disabled = start_states.get(id).map(|s| s.disabled).unwrap_or(false);
            let depends_on_disabled = step.depends_on.iter().any(|d| disabled.contains(d));
            let is_disabled = explicitly_disabled || depends_on_disabled;
            if is_disabled {
                disabled.insert(id.clone());
            }
            let status = if is_disabled {
                StepStatus::Disabled
            } else {
                StepStatus::PendingEvaluation
            };
            results.insert(id.clone(), StepResult::seed(step, status));
        }

        let results: SharedResults = Arc::new(AsyncMutex::new(results));
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let paused = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let mut join_set: JoinSet<StepOutcome> = JoinSet::new();

        self.schedule_ready(
            &mut working_graph,
            &steps_by_id,
            &start_states,
            &results,
            &semaphore,
            &paused,
            &mut join_set,
        )
        .await;

        let mut fatal: Option<EngineError> = None;

        while let Some(joined) = join_set.join_next().await {
            let outcome = joined.expect("step task panicked");

            if let Some(err) = outcome.fatal_error {
                paused.store(true, std::sync::atomic::Ordering::SeqCst);
                if fatal.is_none() {
                    fatal = Some(err);
                }
                // Don't record a result for a step that aborted the run;
                // its status stays PENDING_EVALUATION in the seeded map,
                // which is itself diagnostic of "never finished".
                continue;
            }

            let mut guard = results.lock().await;
            if let Some(result) = guard.get_mut(&outcome.step_id) {
                result.status = outcome.status;
                result.encountered_types = outcome.encountered_types;
            }
            drop(guard);

            self.schedule_ready(
                &mut working_graph,
                &steps_by_id,
                &start_states,
                &results,
                &semaphore,
                &paused,
                &mut join_set,
            )
            .await;
        }

        if let Some(err) = fatal {
            return Err(err);
        }

        let results = results.lock().await;
        Ok(ordered_ids
            .iter()
            .map(|id| results.get(id).cloned().expect("seeded for every step"))
            .collect())
    }

    /// Finds every currently-ready leaf (no remaining dependency nodes in
    /// the working graph) and, for each one that is enabled and whose
    /// dependencies have all reached a terminal status, removes it from
    /// the working graph and admits it into the work queue.
    #[allow(clippy::too_many_arguments)]
    async fn schedule_ready(
        &self,
        working_graph: &mut StepGraph,
        steps_by_id: &HashMap<String, Step>,
        start_states: &HashMap<String, StepStartState>,
        results: &SharedResults,
        semaphore: &Arc<Semaphore>,
        paused: &Arc<std::sync::atomic::AtomicBool>,
        join_set: &mut JoinSet<StepOutcome>,
    ) {
        if paused.load(std::sync::atomic::Ordering::SeqCst) {
            return;
        }

        let leaves: Vec<_> = working_graph
            .node_indices()
            .filter(|idx| {
                working_graph
                    .edges_directed(*idx, Incoming)
                    .next()
                    .is_none()
            })
            .collect();

        for idx in leaves {
            let step_id = working_graph[idx].step.id.clone();

            let status = {
                let guard = results.lock().await;
                guard.get(&step_id).map(|r| r.status)
            };

            match status {
                Some(StepStatus::Disabled) => {
                    // Barrier: never dispatched, never removed.
                    continue;
                }
                Some(StepStatus::PendingEvaluation) => {}
                _ => continue, // already dispatched or otherwise terminal
            }

            let step = &steps_by_id[&step_id];
            let deps_terminal = {
                let guard = results.lock().await;
                step.depends_on
                    .iter()
                    .all(|dep| guard.get(dep).map(|r| r.status.is_terminal()).unwrap_or(false))
            };
            if !deps_terminal {
                continue;
            }

            working_graph.remove_node(idx);

            let step = step.clone();
            let start_state = start_states.get(&step_id).cloned().unwrap_or_default();
            let engine = self.engine.clone();
            let upload_sink = self.upload_sink.clone();
            let semaphore = semaphore.clone();
            let results = results.clone();

            join_set.spawn(Self::execute_step(
                step,
                start_state,
                engine,
                upload_sink,
                semaphore,
                results,
            ));
        }
    }

    async fn execute_step(
        step: Step,
        start_state: StepStartState,
        engine: Arc<EngineContext>,
        upload_sink: Option<Arc<UploadSink>>,
        semaphore: Arc<Semaphore>,
        results: SharedResults,
    ) -> StepOutcome {
        let _permit = semaphore
            .acquire_owned()
            .await
            .expect("semaphore is never closed");

        let job_state = Arc::new(JobState::new(&step.id, &engine, upload_sink));
        let ctx = StepExecutionContext::new(
            step.id.clone(),
            job_state.clone(),
            engine.before_add_entity.clone(),
        );

        let mut status: Option<StepStatus> = None;
        let mut fatal_error: Option<EngineError> = None;

        if start_state.has_cache_path() {
            let cache_path = start_state.step_cache_path.clone().unwrap();
            match load_cache_for_step(&cache_path, &ctx).await {
                Ok(outcome) if outcome.any_loaded() => status = Some(StepStatus::Cached),
                Ok(_) => {} // falls through to the handler, per the open-question resolution
                Err(e) => status = Some(Self::status_for_error(e, &step.id, &mut fatal_error)),
            }
        }

        if status.is_none() {
            match (step.execution_handler)(ctx).await {
                Ok(()) => {
                    let deps_had_problems = {
                        let guard = results.lock().await;
                        step.depends_on.iter().any(|dep| {
                            matches!(
                                guard.get(dep).map(|r| r.status),
                                Some(StepStatus::Failure)
                                    | Some(StepStatus::PartialSuccessDueToDependencyFailure)
                            )
                        })
                    };
                    status = Some(if deps_had_problems {
                        StepStatus::PartialSuccessDueToDependencyFailure
                    } else {
                        StepStatus::Success
                    });

                    let encountered = job_state.encountered_types();
                    let declared = step.declared_types();
                    let undeclared: Vec<_> = encountered.difference(&declared).cloned().collect();
                    if !undeclared.is_empty() {
                        warn!(
                            step_id = %step.id,
                            undeclared_types = ?undeclared,
                            "step encountered types not in its declared schema"
                        );
                    }
                }
                Err(e) => {
                    status = Some(Self::status_for_error(e, &step.id, &mut fatal_error));
                }
            }
        }

        // Flush (and wait for uploads) unconditionally, even after a fatal
        // handler error: the store is append-only during a step, so
        // whatever the handler already added before failing still needs
        // to land on disk.
        if let Err(flush_err) = job_state.flush() {
            warn!(step_id = %step.id, error = %flush_err, "flush failed, downgrading step to FAILURE");
            status = Some(StepStatus::Failure);
        } else if let Err(upload_err) = job_state.wait_until_uploads_complete().await {
            warn!(step_id = %step.id, error = %upload_err, "upload wait failed, downgrading step to FAILURE");
            status = Some(StepStatus::Failure);
        }

        let encountered_types = job_state.encountered_types();
        info!(step_id = %step.id, status = ?status, "step completed");

        StepOutcome {
            step_id: step.id.clone(),
            status: status.unwrap_or(StepStatus::Failure),
            encountered_types,
            fatal_error,
        }
    }

    fn status_for_error(
        error: EngineError,
        step_id: &str,
        fatal_error: &mut Option<EngineError>,
    ) -> StepStatus {
        if error.is_fatal() {
            warn!(step_id, "fatal error, pausing scheduler: {error}");
            *fatal_error = Some(error);
            StepStatus::Failure
        } else {
            warn!(step_id, "step failed: {error}");
            StepStatus::Failure
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ExecutionHandler;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn handler_ok() -> ExecutionHandler {
        Arc::new(|_ctx| Box::pin(async { Ok(()) }))
    }

    fn handler_fail(fatal: bool) -> ExecutionHandler {
        Arc::new(move |ctx| {
            Box::pin(async move {
                Err(EngineError::step_handler(ctx.step_id.clone(), "boom", fatal))
            })
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
    async fn linear_chain_all_succeed_in_order() {
        let steps = vec![
            step("a", &[], handler_ok()),
            step("b", &["a"], handler_ok()),
            step("c", &["b"], handler_ok()),
        ];

        let scheduler = StepScheduler::new(engine(), None, 1);
        let results = scheduler.run(steps, HashMap::new()).await.unwrap();

        assert_eq!(results.iter().map(|r| &r.id).collect::<Vec<_>>(), vec!["a", "b", "c"]);
        for r in &results {
            assert_eq!(r.status, StepStatus::Success);
        }
    }

    #[tokio::test]
    async fn diamond_with_failure_propagates_partial_success() {
        let steps = vec![
            step("a", &[], handler_ok()),
            step("b", &["a"], handler_fail(false)),
            step("c", &["a"], handler_ok()),
            step("d", &["b", "c"], handler_ok()),
        ];

        let scheduler = StepScheduler::new(engine(), None, 4);
        let results = scheduler.run(steps, HashMap::new()).await.unwrap();

        let by_id: HashMap<_, _> = results.iter().map(|r| (r.id.clone(), r.status)).collect();
        assert_eq!(by_id["a"], StepStatus::Success);
        assert_eq!(by_id["b"], StepStatus::Failure);
        assert_eq!(by_id["c"], StepStatus::Success);
        assert_eq!(
            by_id["d"],
            StepStatus::PartialSuccessDueToDependencyFailure
        );
    }

    #[tokio::test]
    async fn disabled_barrier_blocks_dependent_without_running_its_handler() {
        let ran_c = Arc::new(AtomicBool::new(false));
        let ran_c_clone = ran_c.clone();
        let c_handler: ExecutionHandler = Arc::new(move |_ctx| {
            let ran_c = ran_c_clone.clone();
            Box::pin(async move {
                ran_c.store(true, Ordering::SeqCst);
                Ok(())
            })
        });

        let steps = vec![
            step("a", &[], handler_ok()),
            step("b", &[], handler_ok()),
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

        let by_id: HashMap<_, _> = results.iter().map(|r| (r.id.clone(), r.status)).collect();
        assert_eq!(by_id["a"], StepStatus::Success);
        assert_eq!(by_id["b"], StepStatus::Disabled);
        assert_eq!(by_id["c"], StepStatus::Disabled);
        assert!(!ran_c.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn fatal_error_pauses_scheduler_and_rejects_run() {
        let steps = vec![
            step("a", &[], handler_fail(true)),
            step("b", &["a"], handler_ok()),
        ];

        let scheduler = StepScheduler::new(engine(), None, 1);
        let err = scheduler.run(steps, HashMap::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::StepHandler { fatal: true, .. }));
    }

    #[tokio::test]
    async fn cached_step_skips_its_execution_handler() {
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = ran.clone();
        let handler: ExecutionHandler = Arc::new(move |_ctx| {
            let ran = ran_clone.clone();
            Box::pin(async move {
                ran.store(true, Ordering::SeqCst);
                Ok(())
            })
        });

        let cache_dir = tempfile::tempdir().unwrap();
        let entities_dir = cache_dir.path().join("entities");
        std::fs::create_dir_all(&entities_dir).unwrap();
        let entity = crate::types::Entity {
            _key: "k1".into(),
            _type: "host".into(),
            _class: vec!["Host".into()],
            properties: serde_json::Map::new(),
            _raw_data: None,
        };
        std::fs::write(
            entities_dir.join("batch-0.ndjson"),
            serde_json::to_string(&entity).unwrap(),
        )
        .unwrap();

        let steps = vec![step("a", &[], handler)];
        let mut start_states = HashMap::new();
        start_states.insert(
            "a".to_string(),
            StepStartState {
                disabled: false,
                step_cache_path: Some(cache_dir.path().to_path_buf()),
            },
        );

        let scheduler = StepScheduler::new(engine(), None, 1);
        let results = scheduler.run(steps, start_states).await.unwrap();

        assert_eq!(results[0].status, StepStatus::Cached);
        assert!(!ran.load(Ordering::SeqCst));
    }
}
