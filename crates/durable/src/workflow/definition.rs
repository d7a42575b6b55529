//! Workflow trait definition

use serde::{de::DeserializeOwned, Serialize};

use super::{ExternalEvent, WorkflowAction, WorkflowContext};
use crate::step::StepError;

/// Error type for workflow failures
#[derive(Debug, Clone, Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct WorkflowError {
    /// Error message
    pub message: String,

    /// Error code for programmatic handling
    pub code: Option<String>,

    /// Whether this error is retryable
    pub retryable: bool,
}

impl WorkflowError {
    /// Create a new workflow error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            retryable: false,
        }
    }

    /// Create a retryable error
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            retryable: true,
        }
    }

    /// Set the error code
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl std::fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for WorkflowError {}

impl From<&StepError> for WorkflowError {
    fn from(error: &StepError) -> Self {
        let mut converted = Self::new(error.message.clone());
        converted.code = error.error_type.clone();
        converted
    }
}

/// A workflow is a deterministic state machine driven by history events
///
/// Workflows define:
/// - How to start execution (`on_start`)
/// - How to react to step outcomes (`on_step_completed`, `on_step_failed`)
/// - How to react to timers (`on_timer_fired`) and external events (`on_event`)
/// - How to react to sub-workflow results (`on_sub_workflow_completed`,
///   `on_sub_workflow_failed`)
///
/// Termination is expressed through actions: `CompleteWorkflow`,
/// `FailWorkflow` or `ContinueAsNew`.
///
/// # Determinism
///
/// Given the same sequence of history events a workflow must produce the
/// same sequence of actions. Handlers must not read the wall clock, use
/// random numbers, or perform I/O directly; the [`WorkflowContext`] provides
/// history-derived time and randomness, and side effects belong in steps.
///
/// # Example
///
/// ```ignore
/// use reelflow_durable::prelude::*;
///
/// struct OrderWorkflow {
///     order_id: String,
/// }
///
/// impl Workflow for OrderWorkflow {
///     const TYPE: &'static str = "order_workflow";
///     type Input = OrderInput;
///     type Output = OrderResult;
///
///     fn new(input: Self::Input) -> Self {
///         Self { order_id: input.order_id }
///     }
///
///     fn on_start(&mut self, _ctx: &WorkflowContext) -> Vec<WorkflowAction> {
///         vec![WorkflowAction::schedule_step(
///             "validate",
///             "validate_order",
///             json!({ "order_id": self.order_id }),
///         )]
///     }
///
///     // ... implement other handlers
/// }
/// ```
pub trait Workflow: Send + Sync + 'static {
    /// Unique type identifier for this workflow
    ///
    /// This is used to look up the workflow in the registry during replay.
    const TYPE: &'static str;

    /// Input type for starting the workflow
    type Input: Serialize + DeserializeOwned + Send + Clone;

    /// Output type when workflow completes successfully
    type Output: Serialize + DeserializeOwned + Send;

    /// Create a new workflow instance from input
    ///
    /// This is called on every replay, so it must not have side effects.
    fn new(input: Self::Input) -> Self;

    /// Called once at the start of every replay
    fn on_start(&mut self, ctx: &WorkflowContext) -> Vec<WorkflowAction>;

    /// Called when a step completes successfully
    fn on_step_completed(
        &mut self,
        ctx: &WorkflowContext,
        step_id: &str,
        result: serde_json::Value,
    ) -> Vec<WorkflowAction>;

    /// Called when a step fails (after all retries are exhausted)
    fn on_step_failed(
        &mut self,
        ctx: &WorkflowContext,
        step_id: &str,
        error: &StepError,
    ) -> Vec<WorkflowAction>;

    /// Called when a timer fires
    fn on_timer_fired(&mut self, ctx: &WorkflowContext, timer_id: &str) -> Vec<WorkflowAction> {
        let _ = (ctx, timer_id);
        vec![]
    }

    /// Called when an awaited external event is delivered
    fn on_event(
        &mut self,
        ctx: &WorkflowContext,
        wait_id: &str,
        event: &ExternalEvent,
    ) -> Vec<WorkflowAction> {
        let _ = (ctx, wait_id, event);
        vec![]
    }

    /// Called when a sub-workflow completes successfully
    fn on_sub_workflow_completed(
        &mut self,
        ctx: &WorkflowContext,
        step_id: &str,
        result: serde_json::Value,
    ) -> Vec<WorkflowAction> {
        let _ = (ctx, step_id, result);
        vec![]
    }

    /// Called when a sub-workflow fails
    ///
    /// Propagates the failure by default.
    fn on_sub_workflow_failed(
        &mut self,
        ctx: &WorkflowContext,
        step_id: &str,
        error: &WorkflowError,
    ) -> Vec<WorkflowAction> {
        let _ = (ctx, step_id);
        vec![WorkflowAction::fail(error.clone())]
    }
}
