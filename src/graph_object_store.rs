//! The run-scoped graph object store: an append-only in-memory index of
//! every entity and relationship inserted so far, paired with an on-disk
//! writer that materializes each step's objects to NDJSON files on
//! `flush()`.
//!
//! The on-disk layout (`<root>/entities/<step-id>-<seq>.ndjson` and
//! `<root>/relationships/<step-id>-<seq>.ndjson`, one JSON object per
//! line) is the format this crate owns end-to-end: the cache loader
//! (`cache_loader.rs`) reads it back, and the synchronization pipeline
//! (`sync/pipeline.rs`) iterates it to build upload batches. Keeping both
//! sides of that contract in one format is what makes the cache-loader
//! round trip in the test suite exact.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::EngineResult;
use crate::types::{Entity, Relationship, TypeFilter};

#[derive(Default)]
struct StepBuffer {
    entities: Vec<Entity>,
    relationships: Vec<Relationship>,
}

pub struct GraphObjectStore {
    root: PathBuf,
    entities: Mutex<Vec<Arc<Entity>>>,
    entities_by_key: Mutex<HashMap<String, Arc<Entity>>>,
    relationships: Mutex<Vec<Arc<Relationship>>>,
    pending: Mutex<HashMap<String, StepBuffer>>,
    seq: AtomicU64,
}

impl GraphObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        GraphObjectStore {
            root: root.into(),
            entities: Mutex::new(Vec::new()),
            entities_by_key: Mutex::new(HashMap::new()),
            relationships: Mutex::new(Vec::new()),
            pending: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(0),
        }
    }

    pub fn add_entity(&self, step_id: &str, entity: Entity) {
        let shared = Arc::new(entity.clone());
        self.entities.lock().unwrap().push(shared.clone());
        self.entities_by_key
            .lock()
            .unwrap()
            .insert(entity._key.clone(), shared);
        self.pending
            .lock()
            .unwrap()
            .entry(step_id.to_string())
            .or_default()
            .entities
            .push(entity);
    }

    pub fn add_relationship(&self, step_id: &str, relationship: Relationship) {
        self.relationships
            .lock()
            .unwrap()
            .push(Arc::new(relationship.clone()));
        self.pending
            .lock()
            .unwrap()
            .entry(step_id.to_string())
            .or_default()
            .relationships
            .push(relationship);
    }

    pub fn find_entity(&self, key: &str) -> Option<Entity> {
        self.entities_by_key
            .lock()
            .unwrap()
            .get(key)
            .map(|e| (**e).clone())
    }

    /// Restartable, filtered snapshot iterator. Each call takes a cheap
    /// `Arc`-cloned view of the current store and filters lazily.
    pub fn iterate_entities(&self, filter: TypeFilter) -> impl Iterator<Item = Entity> {
        let snapshot = self.entities.lock().unwrap().clone();
        snapshot.into_iter().filter_map(move |e| match &filter._type {
            Some(t) if *t != e._type => None,
            _ => Some((*e).clone()),
        })
    }

    pub fn iterate_relationships(&self, filter: TypeFilter) -> impl Iterator<Item = Relationship> {
        let snapshot = self.relationships.lock().unwrap().clone();
        snapshot.into_iter().filter_map(move |r| match &filter._type {
            Some(t) if *t != r._type => None,
            _ => Some((*r).clone()),
        })
    }

    /// Materializes a step's pending writes to disk, returning the file
    /// paths written (possibly empty if the step added nothing).
    pub fn flush(&self, step_id: &str) -> EngineResult<Vec<PathBuf>> {
        let buffer = self.pending.lock().unwrap().remove(step_id);
        let Some(buffer) = buffer else {
            return Ok(Vec::new());
        };

        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let mut written = Vec::new();

        if !buffer.entities.is_empty() {
            let path = self.write_ndjson("entities", step_id, seq, &buffer.entities)?;
            written.push(path);
        }
        if !buffer.relationships.is_empty() {
            let path = self.write_ndjson("relationships", step_id, seq, &buffer.relationships)?;
            written.push(path);
        }

        Ok(written)
    }

    fn write_ndjson<T: serde::Serialize>(
        &self,
        kind: &str,
        step_id: &str,
        seq: u64,
        items: &[T],
    ) -> EngineResult<PathBuf> {
        let dir = self.root.join(kind);
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{step_id}-{seq}.ndjson"));
        let mut out = String::new();
        for item in items {
            out.push_str(&serde_json::to_string(item)?);
            out.push('\n');
        }
        fs::write(&path, out)?;
        Ok(path)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// All persisted entity/relationship file paths under this store's
    /// root, for the synchronization pipeline's upload walk.
    pub fn persisted_files(&self, kind: &str) -> EngineResult<Vec<PathBuf>> {
        let dir = self.root.join(kind);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut paths: Vec<PathBuf> = fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("ndjson"))
            .collect();
        paths.sort();
        Ok(paths)
    }
}
