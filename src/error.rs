//! Error taxonomy for the engine.
//!
//! Kinds mirror the taxonomy in the design doc: configuration errors are
//! fatal before execution starts, step handler errors carry their own
//! `fatal` flag, and synchronization errors wrap the underlying transport
//! failure with a stable code.

use thiserror::Error;

/// Top-level error type returned by every fallible engine operation.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid dependency graph or missing/invalid configuration field.
    /// Always fatal, always raised before any step executes.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An `executionHandler` returned an error. `fatal` distinguishes a
    /// run-terminating error from one that only fails the owning step.
    #[error("step '{step_id}' failed: {message}")]
    StepHandler {
        step_id: String,
        message: String,
        fatal: bool,
    },

    /// A `_key` was inserted twice. Always non-fatal; the handler (or the
    /// scheduler, if the handler doesn't catch it) downgrades the owning
    /// step to `FAILURE`.
    #[error("duplicate key '{key}' inserted by step '{step_id}'")]
    DuplicateKey { key: String, step_id: String },

    /// Transport-level or protocol-level failure from the synchronization
    /// API. `fatal` is set only for `JOB_NOT_AWAITING_UPLOADS`.
    #[error("synchronization API error ({code}): {message}")]
    SynchronizationApi {
        code: String,
        message: String,
        fatal: bool,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// `shrinkRawData` could not reduce a batch below the size cap because
    /// the largest entity carries no `_rawData` to truncate.
    #[error("upload failed: {0}")]
    UploadFailed(String),

    /// Propagated I/O failure (cache loader reads, graph object store
    /// flushes, summary writes).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Propagated JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Whether this error should pause the scheduler and abort the entire
    /// run, as opposed to only failing the step that raised it.
    pub fn is_fatal(&self) -> bool {
        match self {
            EngineError::Configuration(_) => true,
            EngineError::StepHandler { fatal, .. } => *fatal,
            EngineError::SynchronizationApi { fatal, .. } => *fatal,
            EngineError::DuplicateKey { .. } => false,
            EngineError::UploadFailed(_) => false,
            EngineError::Io(_) => false,
            EngineError::Serialization(_) => false,
        }
    }

    pub fn step_handler(step_id: impl Into<String>, message: impl Into<String>, fatal: bool) -> Self {
        EngineError::StepHandler {
            step_id: step_id.into(),
            message: message.into(),
            fatal,
        }
    }

    pub fn synchronization_api(
        code: impl Into<String>,
        message: impl Into<String>,
        fatal: bool,
    ) -> Self {
        EngineError::SynchronizationApi {
            code: code.into(),
            message: message.into(),
            fatal,
            source: None,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
