//! Run-scoped trackers shared across every step's job state.
//!
//! Both trackers are cheap `Mutex`-guarded maps. The original engine is
//! single-threaded and relies on cooperative scheduling for exclusivity;
//! this engine genuinely runs steps concurrently (see `scheduler.rs`), so
//! the locks are load-bearing rather than decorative (§5 "Cooperative
//! concurrency" design note).

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::error::EngineError;

/// Records, per step id, the set of `_type` values observed while that
/// step executed.
#[derive(Default)]
pub struct TypeTracker {
    types_by_step: Mutex<HashMap<String, HashSet<String>>>,
}

impl TypeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, step_id: &str, _type: &str) {
        let mut map = self.types_by_step.lock().unwrap();
        map.entry(step_id.to_string())
            .or_default()
            .insert(_type.to_string());
    }

    pub fn encountered_types(&self, step_id: &str) -> HashSet<String> {
        self.types_by_step
            .lock()
            .unwrap()
            .get(step_id)
            .cloned()
            .unwrap_or_default()
    }
}

/// Process-wide set of `_key` values admitted so far. The first insertion
/// of a key wins; every subsequent attempt is rejected.
#[derive(Default)]
pub struct DuplicateKeyTracker {
    keys: Mutex<HashMap<String, String>>,
}

impl DuplicateKeyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `key` as inserted by `step_id`. Returns an error naming
    /// the offending key and the step attempting the second insertion if
    /// the key was already claimed.
    pub fn register(&self, key: &str, step_id: &str) -> Result<(), EngineError> {
        let mut keys = self.keys.lock().unwrap();
        if keys.contains_key(key) {
            return Err(EngineError::DuplicateKey {
                key: key.to_string(),
                step_id: step_id.to_string(),
            });
        }
        keys.insert(key.to_string(), step_id.to_string());
        Ok(())
    }
}
