//! `summary.json`: the structured run report written to the storage
//! root after a run completes (§6 "Persistent state layout").

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::EngineResult;
use crate::types::{PartialDatasets, StepResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteIntegrationResultMetadata {
    pub partial_datasets: PartialDatasets,
}

/// Mirrors the external collaborator's `ExecuteIntegrationResult` shape
/// (§6), written once the scheduler resolves (or rejects) so a caller
/// inspecting the storage directory after the fact can reconstruct what
/// happened without re-running anything.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteIntegrationResult {
    pub metadata: ExecuteIntegrationResultMetadata,
    pub step_results: Vec<StepResult>,
}

impl ExecuteIntegrationResult {
    pub fn new(step_results: Vec<StepResult>, partial_datasets: PartialDatasets) -> Self {
        ExecuteIntegrationResult {
            metadata: ExecuteIntegrationResultMetadata { partial_datasets },
            step_results,
        }
    }

    /// The process exit code the CLI should use: non-zero if any step
    /// didn't land on a "clean" terminal status (§7 "User-visible
    /// behavior").
    pub fn has_non_success_steps(&self) -> bool {
        use crate::types::StepStatus::*;
        self.step_results
            .iter()
            .any(|r| !matches!(r.status, Success | Cached | Disabled))
    }

    pub fn write_to(&self, storage_root: &Path) -> EngineResult<()> {
        let path = storage_root.join("summary.json");
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}

/// Small helper used by steps/CLI callers building up `partialDatasets`
/// incrementally (a step acknowledging its own output may be incomplete).
pub fn partial_datasets_from(pairs: impl IntoIterator<Item = (String, bool)>) -> HashMap<String, bool> {
    pairs.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{StepResult, StepStatus};
    use std::collections::HashSet;

    fn result(id: &str, status: StepStatus) -> StepResult {
        StepResult {
            id: id.to_string(),
            name: id.to_string(),
            depends_on: HashSet::new(),
            declared_types: HashSet::new(),
            partial_types: HashSet::new(),
            encountered_types: HashSet::new(),
            status,
        }
    }

    #[test]
    fn writes_and_reports_non_success() {
        let tmp = tempfile::tempdir().unwrap();
        let summary = ExecuteIntegrationResult::new(
            vec![result("a", StepStatus::Success), result("b", StepStatus::Failure)],
            partial_datasets_from([("host".to_string(), true)]),
        );
        assert!(summary.has_non_success_steps());

        summary.write_to(tmp.path()).unwrap();
        let contents = std::fs::read_to_string(tmp.path().join("summary.json")).unwrap();
        assert!(contents.contains("\"partial_datasets\""));
    }

    #[test]
    fn all_success_or_cached_or_disabled_has_no_non_success_steps() {
        let summary = ExecuteIntegrationResult::new(
            vec![
                result("a", StepStatus::Success),
                result("b", StepStatus::Cached),
                result("c", StepStatus::Disabled),
            ],
            HashMap::new(),
        );
        assert!(!summary.has_non_success_steps());
    }
}
