//! The per-step façade over the graph object store, trackers, and the
//! optional streaming upload sink. This is the only surface a step's
//! `executionHandler` uses to read or write shared run state (§4.3).

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;

use crate::data_store::DataStore;
use crate::error::EngineResult;
use crate::graph_object_store::GraphObjectStore;
use crate::sync::UploadSink;
use crate::tracker::{DuplicateKeyTracker, TypeTracker};
use crate::types::{Entity, Relationship, TypeFilter};

/// Extensibility hook invoked before an entity is admitted. Receives the
/// owning step's execution context and the candidate entity, and may
/// transform it. Defaults to the identity function (§9 "Hooks / middleware").
pub type BeforeAddEntity =
    Arc<dyn Fn(&StepExecutionContext, Entity) -> EngineResult<Entity> + Send + Sync>;

fn identity_before_add_entity(_ctx: &StepExecutionContext, entity: Entity) -> EngineResult<Entity> {
    Ok(entity)
}

/// Run-scoped singletons shared across every step's `JobState`. Held by
/// the scheduler and handed to each per-step `JobState` it constructs.
pub struct EngineContext {
    pub store: Arc<GraphObjectStore>,
    pub duplicate_keys: Arc<DuplicateKeyTracker>,
    pub types: Arc<TypeTracker>,
    pub data: Arc<DataStore>,
    pub before_add_entity: BeforeAddEntity,
}

impl EngineContext {
    pub fn new(storage_root: impl Into<PathBuf>) -> Self {
        EngineContext {
            store: Arc::new(GraphObjectStore::new(storage_root)),
            duplicate_keys: Arc::new(DuplicateKeyTracker::new()),
            types: Arc::new(TypeTracker::new()),
            data: Arc::new(DataStore::new()),
            before_add_entity: Arc::new(identity_before_add_entity),
        }
    }

    pub fn with_before_add_entity(mut self, hook: BeforeAddEntity) -> Self {
        self.before_add_entity = hook;
        self
    }
}

/// The per-step API surface. Created fresh for each step, flushed once at
/// step end, then discarded; the trackers, data store, and graph object
/// store it wraps outlive it for the whole run.
pub struct JobState {
    pub step_id: String,
    store: Arc<GraphObjectStore>,
    duplicate_keys: Arc<DuplicateKeyTracker>,
    types: Arc<TypeTracker>,
    data: Arc<DataStore>,
    upload_sink: Option<Arc<UploadSink>>,
}

impl JobState {
    pub fn new(step_id: impl Into<String>, engine: &EngineContext, upload_sink: Option<Arc<UploadSink>>) -> Self {
        JobState {
            step_id: step_id.into(),
            store: engine.store.clone(),
            duplicate_keys: engine.duplicate_keys.clone(),
            types: engine.types.clone(),
            data: engine.data.clone(),
            upload_sink,
        }
    }

    pub async fn add_entity(&self, ctx: &StepExecutionContext, entity: Entity) -> EngineResult<()> {
        let entity = (ctx.before_add_entity)(ctx, entity)?;
        self.duplicate_keys.register(&entity._key, &self.step_id)?;
        self.types.record(&self.step_id, &entity._type);
        self.store.add_entity(&self.step_id, entity.clone());
        if let Some(sink) = &self.upload_sink {
            sink.enqueue_entity(entity).await;
        }
        Ok(())
    }

    pub async fn add_entities(
        &self,
        ctx: &StepExecutionContext,
        entities: Vec<Entity>,
    ) -> EngineResult<()> {
        for entity in entities {
            self.add_entity(ctx, entity).await?;
        }
        Ok(())
    }

    pub async fn add_relationship(&self, relationship: Relationship) -> EngineResult<()> {
        self.duplicate_keys
            .register(&relationship._key, &self.step_id)?;
        self.types.record(&self.step_id, &relationship._type);
        self.store.add_relationship(&self.step_id, relationship.clone());
        if let Some(sink) = &self.upload_sink {
            sink.enqueue_relationship(relationship).await;
        }
        Ok(())
    }

    pub async fn add_relationships(&self, relationships: Vec<Relationship>) -> EngineResult<()> {
        for relationship in relationships {
            self.add_relationship(relationship).await?;
        }
        Ok(())
    }

    pub fn find_entity(&self, key: &str) -> Option<Entity> {
        self.store.find_entity(key)
    }

    pub fn iterate_entities(&self, filter: TypeFilter) -> impl Iterator<Item = Entity> {
        self.store.iterate_entities(filter)
    }

    pub fn iterate_relationships(&self, filter: TypeFilter) -> impl Iterator<Item = Relationship> {
        self.store.iterate_relationships(filter)
    }

    pub fn set_data(&self, scope: &str, key: &str, value: Value) {
        self.data.set(scope, key, value);
    }

    pub fn get_data(&self, scope: &str, key: &str) -> Option<Value> {
        self.data.get(scope, key)
    }

    /// Forces the graph object store to materialize this step's pending
    /// writes. Idempotent: a step with nothing pending is a no-op.
    pub fn flush(&self) -> EngineResult<()> {
        self.store.flush(&self.step_id).map(|_paths| ())
    }

    /// Blocks until the upload sink, if configured, has drained every
    /// batch this step enqueued.
    pub async fn wait_until_uploads_complete(&self) -> EngineResult<()> {
        if let Some(sink) = &self.upload_sink {
            sink.wait_until_complete().await
        } else {
            Ok(())
        }
    }

    pub fn encountered_types(&self) -> std::collections::HashSet<String> {
        self.types.encountered_types(&self.step_id)
    }
}

/// Context handed to a step's `executionHandler`: identifies the step
/// and wraps its `JobState`, plus the hook used by `JobState::add_entity`.
#[derive(Clone)]
pub struct StepExecutionContext {
    pub step_id: String,
    pub job_state: Arc<JobState>,
    before_add_entity: BeforeAddEntity,
}

impl StepExecutionContext {
    pub fn new(step_id: impl Into<String>, job_state: Arc<JobState>, before_add_entity: BeforeAddEntity) -> Self {
        StepExecutionContext {
            step_id: step_id.into(),
            job_state,
            before_add_entity,
        }
    }

    pub async fn add_entity(&self, entity: Entity) -> EngineResult<()> {
        self.job_state.add_entity(self, entity).await
    }

    pub async fn add_entities(&self, entities: Vec<Entity>) -> EngineResult<()> {
        self.job_state.add_entities(self, entities).await
    }

    pub async fn add_relationship(&self, relationship: Relationship) -> EngineResult<()> {
        self.job_state.add_relationship(relationship).await
    }

    pub async fn add_relationships(&self, relationships: Vec<Relationship>) -> EngineResult<()> {
        self.job_state.add_relationships(relationships).await
    }
}
