//! Core graph data model: steps, their declared outputs, and the graph
//! objects (entities/relationships) steps produce.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::EngineError;
use crate::job_state::StepExecutionContext;

/// A declared output type for a step (§3 `TypeSchema`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeSchema {
    #[serde(rename = "_type")]
    pub _type: String,
    #[serde(default)]
    pub partial: bool,
}

impl TypeSchema {
    pub fn new(_type: impl Into<String>, partial: bool) -> Self {
        Self {
            _type: _type.into(),
            partial,
        }
    }
}

/// Future type returned by an execution handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), EngineError>> + Send>>;

/// A handler invoked with the step's execution context.
pub type ExecutionHandler = Arc<dyn Fn(StepExecutionContext) -> HandlerFuture + Send + Sync>;

/// A declarative unit of collection work.
#[derive(Clone)]
pub struct Step {
    // NB: `execution_handler` is an `Arc<dyn Fn...>`, so cloning a `Step`
    // is cheap and shares the same handler — required since the
    // scheduler clones the dependency graph into a mutable working copy.
    pub id: String,
    pub name: String,
    pub depends_on: HashSet<String>,
    pub entities: Vec<TypeSchema>,
    pub relationships: Vec<TypeSchema>,
    pub mapped_relationships: Vec<TypeSchema>,
    pub execution_handler: ExecutionHandler,
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("depends_on", &self.depends_on)
            .field("entities", &self.entities)
            .field("relationships", &self.relationships)
            .field("mapped_relationships", &self.mapped_relationships)
            .finish()
    }
}

impl Step {
    /// All declared `_type` values (entities + relationships + mapped
    /// relationships), used to warn on undeclared encountered types.
    pub fn declared_types(&self) -> HashSet<String> {
        self.entities
            .iter()
            .chain(self.relationships.iter())
            .chain(self.mapped_relationships.iter())
            .map(|t| t._type.clone())
            .collect()
    }
}

/// Per-step start state: whether a step runs, and an optional cache
/// redirect (§3 `StepStartState`).
#[derive(Debug, Clone, Default)]
pub struct StepStartState {
    pub disabled: bool,
    pub step_cache_path: Option<std::path::PathBuf>,
}

impl StepStartState {
    /// Truthiness check on `step_cache_path`, resolving the open question
    /// in the design notes: a present path (regardless of whether the
    /// directory exists yet) means "attempt the cache loader".
    pub fn has_cache_path(&self) -> bool {
        self.step_cache_path.is_some()
    }
}

/// Lifecycle status of a single step (§3 `StepResult.status`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    Disabled,
    PendingEvaluation,
    Success,
    Failure,
    PartialSuccessDueToDependencyFailure,
    Cached,
    Skipped,
    NotExecuted,
}

impl StepStatus {
    /// Terminal statuses never change once assigned.
    pub fn is_terminal(self) -> bool {
        !matches!(self, StepStatus::PendingEvaluation)
    }
}

/// Lifecycle record for one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub id: String,
    pub name: String,
    pub depends_on: HashSet<String>,
    pub declared_types: HashSet<String>,
    pub partial_types: HashSet<String>,
    pub encountered_types: HashSet<String>,
    pub status: StepStatus,
}

impl StepResult {
    pub fn seed(step: &Step, status: StepStatus) -> Self {
        let partial_types = step
            .entities
            .iter()
            .chain(step.relationships.iter())
            .chain(step.mapped_relationships.iter())
            .filter(|t| t.partial)
            .map(|t| t._type.clone())
            .collect();

        StepResult {
            id: step.id.clone(),
            name: step.name.clone(),
            depends_on: step.depends_on.clone(),
            declared_types: step.declared_types(),
            partial_types,
            encountered_types: HashSet::new(),
            status,
        }
    }
}

/// A single raw-data attachment on an entity (§3 `RawDataEntry`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawDataEntry {
    pub name: String,
    #[serde(rename = "rawData")]
    pub raw_data: Map<String, Value>,
}

/// A graph entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    #[serde(rename = "_key")]
    pub _key: String,
    #[serde(rename = "_type")]
    pub _type: String,
    #[serde(rename = "_class")]
    pub _class: Vec<String>,
    #[serde(flatten)]
    pub properties: Map<String, Value>,
    #[serde(rename = "_rawData", skip_serializing_if = "Option::is_none", default)]
    pub _raw_data: Option<Vec<RawDataEntry>>,
}

/// Where a mapped relationship's target is described instead of a literal
/// `_toEntityKey`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingTarget {
    #[serde(rename = "_type")]
    pub _type: String,
    pub target_filter_keys: Vec<Vec<String>>,
    pub target_entity: Map<String, Value>,
}

/// A graph relationship. Mapped relationships carry `mapping` instead of
/// `_to_entity_key`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    #[serde(rename = "_key")]
    pub _key: String,
    #[serde(rename = "_type")]
    pub _type: String,
    #[serde(rename = "_fromEntityKey")]
    pub _from_entity_key: String,
    #[serde(rename = "_toEntityKey", skip_serializing_if = "Option::is_none", default)]
    pub _to_entity_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub mapping: Option<MappingTarget>,
    #[serde(flatten)]
    pub properties: Map<String, Value>,
}

/// Remote-issued synchronization job handle (§3 `SynchronizationJob`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynchronizationJob {
    pub id: String,
    pub integration_job_id: Option<String>,
    pub integration_instance_id: String,
    pub status: String,
}

/// A filter applied by `iterateEntities` / `iterateRelationships`.
#[derive(Debug, Clone, Default)]
pub struct TypeFilter {
    pub _type: Option<String>,
}

/// Partial-dataset bookkeeping reported at finalize time (§ glossary
/// "Partial dataset").
pub type PartialDatasets = HashMap<String, bool>;
