//! Workflow actions and step options

use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::WorkflowError;
use crate::reliability::RetryPolicy;

/// Commands a workflow issues in response to events
///
/// Each action is recorded as a decision event in history before its
/// side effect is dispatched. On replay the same actions must be produced
/// in the same order, otherwise the instance is non-deterministic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowAction {
    /// Schedule a step for execution on the worker pool
    ScheduleStep {
        /// Identifier for this step within the workflow
        step_id: String,

        /// Type of step to execute (used to look up in the step registry)
        step_type: String,

        /// Input data for the step (JSON)
        input: serde_json::Value,

        /// Execution options (retries, timeouts)
        options: StepOptions,
    },

    /// Start a timer that fires after the specified duration
    StartTimer {
        /// Identifier for this timer within the workflow
        timer_id: String,

        /// Duration to wait before firing
        #[serde(with = "duration_serde")]
        duration: Duration,
    },

    /// Cancel a previously started timer
    CancelTimer {
        /// Timer to cancel
        timer_id: String,
    },

    /// Suspend until a named external event is delivered
    WaitForEvent {
        /// Identifier for this wait within the workflow
        wait_id: String,

        /// Name of the event to consume
        event_name: String,
    },

    /// Start a nested workflow instance and await its terminal result
    ScheduleSubWorkflow {
        /// Identifier for the sub-workflow within the parent
        step_id: String,

        /// Type of workflow to start
        workflow_type: String,

        /// Input for the sub-workflow
        input: serde_json::Value,

        /// Explicit instance id; derived from the parent when absent
        #[serde(default)]
        instance_id: Option<Uuid>,
    },

    /// Complete the workflow successfully with a result
    CompleteWorkflow {
        /// Result value (JSON)
        result: serde_json::Value,
    },

    /// Fail the workflow with an error
    FailWorkflow {
        /// Error details
        error: WorkflowError,
    },

    /// Close this generation and restart the workflow with a new input
    ContinueAsNew {
        /// Input for the next generation
        input: serde_json::Value,

        /// Carry still-buffered events over to the next generation
        #[serde(default = "carry_events")]
        preserve_unprocessed_events: bool,
    },

    /// No action (used when event handling doesn't trigger new work)
    None,
}

impl WorkflowAction {
    /// Schedule a step with default options
    pub fn schedule_step(
        step_id: impl Into<String>,
        step_type: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        Self::schedule_step_with(step_id, step_type, input, StepOptions::default())
    }

    /// Schedule a step with explicit options
    pub fn schedule_step_with(
        step_id: impl Into<String>,
        step_type: impl Into<String>,
        input: serde_json::Value,
        options: StepOptions,
    ) -> Self {
        Self::ScheduleStep {
            step_id: step_id.into(),
            step_type: step_type.into(),
            input,
            options,
        }
    }

    /// Create a timer action
    pub fn timer(timer_id: impl Into<String>, duration: Duration) -> Self {
        Self::StartTimer {
            timer_id: timer_id.into(),
            duration,
        }
    }

    /// Cancel a timer
    pub fn cancel_timer(timer_id: impl Into<String>) -> Self {
        Self::CancelTimer {
            timer_id: timer_id.into(),
        }
    }

    /// Wait for a named external event
    pub fn wait_for_event(wait_id: impl Into<String>, event_name: impl Into<String>) -> Self {
        Self::WaitForEvent {
            wait_id: wait_id.into(),
            event_name: event_name.into(),
        }
    }

    /// Start a sub-workflow whose id is derived from the parent
    pub fn sub_workflow(
        step_id: impl Into<String>,
        workflow_type: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        Self::ScheduleSubWorkflow {
            step_id: step_id.into(),
            workflow_type: workflow_type.into(),
            input,
            instance_id: None,
        }
    }

    /// Create a complete workflow action
    pub fn complete(result: serde_json::Value) -> Self {
        Self::CompleteWorkflow { result }
    }

    /// Create a fail workflow action
    pub fn fail(error: WorkflowError) -> Self {
        Self::FailWorkflow { error }
    }

    /// Restart as a fresh generation
    ///
    /// Events raised against this generation that no wait consumed yet are
    /// carried into the next one.
    pub fn continue_as_new(input: serde_json::Value) -> Self {
        Self::ContinueAsNew {
            input,
            preserve_unprocessed_events: true,
        }
    }

    /// Restart as a fresh generation, moving unconsumed events to the
    /// discarded log instead of carrying them
    pub fn continue_as_new_discarding(input: serde_json::Value) -> Self {
        Self::ContinueAsNew {
            input,
            preserve_unprocessed_events: false,
        }
    }

    /// Whether this action ends the current generation
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::CompleteWorkflow { .. } | Self::FailWorkflow { .. } | Self::ContinueAsNew { .. }
        )
    }
}

fn carry_events() -> bool {
    true
}

/// Options for step execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepOptions {
    /// Retry policy for this step
    #[serde(default)]
    pub retry_policy: RetryPolicy,

    /// Maximum time for a single attempt
    #[serde(with = "duration_serde")]
    pub start_to_close_timeout: Duration,
}

impl Default for StepOptions {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::default(),
            start_to_close_timeout: Duration::from_secs(300),
        }
    }
}

impl StepOptions {
    /// Create options with a specific retry policy
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Set the start-to-close timeout
    pub fn with_start_to_close_timeout(mut self, timeout: Duration) -> Self {
        self.start_to_close_timeout = timeout;
        self
    }
}

/// Serde support for Duration (as milliseconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
