//! The run-scoped, free-form key/value store steps use to pass small
//! artifacts between each other outside of graph objects (§4.3 `setData`
//! / `getData`).

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;

/// Process-wide `(scope, key) -> value` map. Coordination between a
/// producer and consumer step is the steps' own responsibility; the DAG
/// edges are the intended mechanism (§5 "Data Store").
#[derive(Default)]
pub struct DataStore {
    values: Mutex<HashMap<(String, String), Value>>,
}

impl DataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, scope: &str, key: &str, value: Value) {
        self.values
            .lock()
            .unwrap()
            .insert((scope.to_string(), key.to_string()), value);
    }

    pub fn get(&self, scope: &str, key: &str) -> Option<Value> {
        self.values
            .lock()
            .unwrap()
            .get(&(scope.to_string(), key.to_string()))
            .cloned()
    }
}
