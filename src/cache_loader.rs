//! Step-level cache loader: reads pre-materialized graph object files as a
//! substitute for running a step's `executionHandler` (§4.4).
//!
//! Reads the same NDJSON format the graph object store writes
//! (`graph_object_store.rs`), which is what makes the cache-loader round
//! trip exact: flushing a step's writes and later loading them back from
//! the same directory re-materializes the identical entities and
//! relationships by `_key`.

use std::fs;
use std::path::Path;

use tracing::warn;

use crate::error::EngineResult;
use crate::job_state::StepExecutionContext;
use crate::types::{Entity, Relationship};

#[derive(Debug, Default, Clone, Copy)]
pub struct CacheLoadOutcome {
    pub entities_loaded: usize,
    pub relationships_loaded: usize,
}

impl CacheLoadOutcome {
    pub fn any_loaded(self) -> bool {
        self.entities_loaded > 0 || self.relationships_loaded > 0
    }
}

fn read_ndjson_dir<T: serde::de::DeserializeOwned>(dir: &Path) -> EngineResult<Vec<T>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut entries: Vec<_> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();
    entries.sort();

    let mut items = Vec::new();
    for path in entries {
        let contents = fs::read_to_string(&path)?;
        for line in contents.lines() {
            if line.trim().is_empty() {
                continue;
            }
            items.push(serde_json::from_str(line)?);
        }
    }
    Ok(items)
}

/// Loads `<base>/entities/*` and `<base>/relationships/*`, injecting every
/// parsed object into `ctx.job_state` via `addEntities`/`addRelationships`.
///
/// Returns an outcome with zero counts (and logs a warning) if neither
/// subdirectory yielded any objects; the scheduler falls through to
/// invoking the step's handler in that case (§4.2 step 1, §9 open
/// question resolution).
pub async fn load_cache_for_step(
    base: &Path,
    ctx: &StepExecutionContext,
) -> EngineResult<CacheLoadOutcome> {
    let entities: Vec<Entity> = read_ndjson_dir(&base.join("entities"))?;
    let relationships: Vec<Relationship> = read_ndjson_dir(&base.join("relationships"))?;

    let outcome = CacheLoadOutcome {
        entities_loaded: entities.len(),
        relationships_loaded: relationships.len(),
    };

    if !entities.is_empty() {
        ctx.add_entities(entities).await?;
    }
    if !relationships.is_empty() {
        ctx.add_relationships(relationships).await?;
    }

    if !outcome.any_loaded() {
        warn!(step_id = %ctx.step_id, cache_path = %base.display(), "no cached objects found");
    }

    Ok(outcome)
}
