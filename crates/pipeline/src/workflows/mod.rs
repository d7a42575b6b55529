// Pipeline workflows
//
// Deterministic state machines driven by the durable engine:
// - `process_video`: the top-level pipeline
// - `transcode`: fan-out over transcode profiles (sub-workflow)
// - `approval`: approval request raced against a timeout (sub-workflow)
// - `periodic`: an unbounded loop kept small with continue-as-new

mod approval;
mod periodic;
mod process_video;
mod transcode;

pub use approval::ApprovalWorkflow;
pub use periodic::{PeriodicSummary, PeriodicWorkflow};
pub use process_video::ProcessVideoWorkflow;
pub use transcode::TranscodeWorkflow;

use reelflow_durable::{WorkflowAction, WorkflowError, WorkflowRegistry};
use serde::{de::DeserializeOwned, Serialize};

/// Registry with every pipeline workflow type
pub fn pipeline_workflows() -> WorkflowRegistry {
    let mut registry = WorkflowRegistry::new();
    registry.register::<ProcessVideoWorkflow>();
    registry.register::<TranscodeWorkflow>();
    registry.register::<ApprovalWorkflow>();
    registry.register::<PeriodicWorkflow>();
    registry
}

fn decode<T: DeserializeOwned>(what: &str, value: serde_json::Value) -> Result<T, WorkflowError> {
    serde_json::from_value(value).map_err(|err| {
        WorkflowError::new(format!("unexpected {what} payload: {err}")).with_code("INVALID_PAYLOAD")
    })
}

fn encode<T: Serialize>(value: &T) -> Result<serde_json::Value, WorkflowError> {
    serde_json::to_value(value).map_err(|err| {
        WorkflowError::new(format!("payload not serializable: {err}")).with_code("INVALID_PAYLOAD")
    })
}

fn complete_with<T: Serialize>(result: &T) -> WorkflowAction {
    match encode(result) {
        Ok(result) => WorkflowAction::complete(result),
        Err(error) => WorkflowAction::fail(error),
    }
}

fn or_fail(actions: Result<Vec<WorkflowAction>, WorkflowError>) -> Vec<WorkflowAction> {
    actions.unwrap_or_else(|error| vec![WorkflowAction::fail(error)])
}
