//! Task model — requests arriving from the contract and terminal results.
//!
//! A `TaskRequest` is consumed exactly once by the coordinator loop; the
//! matching `TaskResult` is handed back to the contract port and not retained.

use std::collections::BTreeMap;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Source error carried inside a [`TaskError`] stage wrapper.
pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// One unit of work emitted by the contract.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Opaque identifier, arbitrary characters. Must be non-empty.
    pub task_id: String,
    /// Content identifier of the Wasm module bytes.
    pub wasm_cid: String,
    /// Reserved for external input resolution; carried through, never
    /// consumed by the coordinator.
    #[serde(default)]
    pub input_cid: String,
    /// Exported function the executor should invoke.
    #[serde(default)]
    pub entry: String,
    /// Environment variables recognized by the sandbox runner.
    #[serde(default)]
    pub args: BTreeMap<String, String>,
    /// Inline input payload (JSON text). Empty means absent; takes
    /// precedence over `input_cid`.
    #[serde(default)]
    pub input_json: String,
    /// Copied verbatim onto the result.
    #[serde(default)]
    pub result_metadata: BTreeMap<String, String>,
}

/// Terminal record for a task.
#[derive(Debug)]
pub struct TaskResult {
    pub task_id: String,
    pub success: bool,
    /// Last non-empty line of the pod's stdout, empty on failure.
    pub output_value: String,
    pub logs: String,
    pub finished_at: SystemTime,
    /// Populated exactly when `success` is false.
    pub error: Option<TaskError>,
    /// Echo of the request's `result_metadata`.
    pub metadata: BTreeMap<String, String>,
}

/// Why a task failed, by pipeline stage.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("fetch module: {0}")]
    FetchModule(#[source] BoxedError),
    #[error("create job: {0}")]
    CreateJob(#[source] BoxedError),
    #[error("wait job: {0}")]
    WaitJob(#[source] BoxedError),
    #[error("job failed: {0}")]
    JobFailed(String),
    #[error("job failed without condition")]
    JobFailedWithoutCondition,
    #[error("task cancelled")]
    Cancelled,
}
