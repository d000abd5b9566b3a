//! Dependency graph construction (§4.1): builds a DAG of steps from their
//! declared `depends_on` sets and computes a topological order, failing
//! fast on a cycle or a dependency naming an unknown step.

use std::collections::HashMap;

use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use tracing::debug;

use crate::error::EngineError;
use crate::types::Step;

/// Wraps a `Step` as a graph node.
#[derive(Clone)]
pub struct StepNode {
    pub step: Step,
}

/// A `StableDiGraph` rather than a plain `DiGraph`: the scheduler clones
/// this into a mutable working copy and removes nodes as they dispatch
/// (§9 "Mutable working graph" design note), and `StableDiGraph` keeps
/// every other node's `NodeIndex` valid across a `remove_node` call.
pub type StepGraph = StableDiGraph<StepNode, ()>;

/// Builds the dependency graph and returns it along with the ids in
/// topological order. A cycle or a `depends_on` naming an unknown step is
/// a fatal configuration error raised before any step executes.
pub fn build_step_graph(steps: &[Step]) -> Result<(StepGraph, Vec<String>), EngineError> {
    let mut graph = StepGraph::new();
    let mut node_indices: HashMap<String, NodeIndex> = HashMap::new();

    for step in steps {
        let index = graph.add_node(StepNode { step: step.clone() });
        node_indices.insert(step.id.clone(), index);
    }

    for step in steps {
        let from_idx = *node_indices.get(&step.id).expect("just inserted");
        for dep in &step.depends_on {
            let Some(dep_idx) = node_indices.get(dep) else {
                return Err(EngineError::Configuration(format!(
                    "step '{}' depends on unknown step '{}'",
                    step.id, dep
                )));
            };
            // Edge points dependency -> dependent, matching the "leaves
            // have no remaining dependencies" framing the scheduler uses.
            graph.add_edge(*dep_idx, from_idx, ());
        }
    }

    let order = petgraph::algo::toposort(&graph, None).map_err(|cycle| {
        EngineError::Configuration(format!(
            "dependency graph contains a cycle at step '{}'",
            graph[cycle.node_id()].step.id
        ))
    })?;

    let ordered_ids: Vec<String> = order.iter().map(|idx| graph[*idx].step.id.clone()).collect();

    debug!(step_count = steps.len(), "built step dependency graph");

    Ok((graph, ordered_ids))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ExecutionHandler;
    use std::sync::Arc;

    fn noop_handler() -> ExecutionHandler {
        Arc::new(|_ctx| Box::pin(async { Ok(()) }))
    }

    fn step(id: &str, depends_on: &[&str]) -> Step {
        Step {
            id: id.to_string(),
            name: id.to_string(),
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
            entities: vec![],
            relationships: vec![],
            mapped_relationships: vec![],
            execution_handler: noop_handler(),
        }
    }

    #[test]
    fn linear_chain_topo_orders_a_before_b_before_c() {
        let steps = vec![step("a", &[]), step("b", &["a"]), step("c", &["b"])];
        let (_graph, order) = build_step_graph(&steps).unwrap();
        assert_eq!(order, vec!["a".to_string(), "b".to_string(), "c".to_string()]);
    }

    #[test]
    fn cycle_is_rejected() {
        let steps = vec![step("a", &["b"]), step("b", &["a"])];
        let err = build_step_graph(&steps).unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let steps = vec![step("a", &["missing"])];
        let err = build_step_graph(&steps).unwrap_err();
        assert!(err.to_string().contains("unknown step"));
    }

    #[test]
    fn diamond_dependencies_produce_a_valid_topological_order() {
        let steps = vec![
            step("a", &[]),
            step("b", &["a"]),
            step("c", &["a"]),
            step("d", &["b", "c"]),
        ];
        let (_graph, order) = build_step_graph(&steps).unwrap();
        let pos = |id: &str| order.iter().position(|s| s == id).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("a") < pos("c"));
        assert!(pos("b") < pos("d"));
        assert!(pos("c") < pos("d"));
    }
}
