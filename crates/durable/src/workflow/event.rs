//! History events for persistence

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{StepOptions, WorkflowError};
use crate::step::StepError;

/// Events stored in a workflow instance's history
///
/// The history is an append-only log per instance generation. Events fall
/// into two groups:
/// - *decisions*, recorded from the actions a workflow produced
///   (`StepScheduled`, `TimerCreated`, ...), which replay checks for
///   determinism
/// - *outcomes*, recorded when the outside world answers a decision
///   (`StepCompleted`, `TimerFired`, ...), which replay feeds back into the
///   workflow
///
/// Outcomes reference the sequence number of the decision they answer via
/// `scheduled_seq`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    // =========================================================================
    // Lifecycle
    // =========================================================================
    /// Generation started with the given input
    WorkflowStarted {
        /// The input of this generation
        input: serde_json::Value,

        /// Generation counter (0 for the first run)
        #[serde(default)]
        generation: u32,
    },

    /// Workflow completed successfully
    WorkflowCompleted {
        /// The result value
        result: serde_json::Value,
    },

    /// Workflow failed with an error
    WorkflowFailed {
        /// Error details
        error: WorkflowError,
    },

    /// Generation closed; the next one starts with `input`
    WorkflowContinuedAsNew {
        /// Input for the next generation
        input: serde_json::Value,

        /// Whether still-buffered events move to the next generation
        #[serde(default)]
        preserve_unprocessed_events: bool,
    },

    // =========================================================================
    // Steps
    // =========================================================================
    /// Step was scheduled for execution
    StepScheduled {
        /// Step identifier within the workflow
        step_id: String,

        /// Type of step to execute
        step_type: String,

        /// Input for the step
        input: serde_json::Value,

        /// Execution options
        options: StepOptions,
    },

    /// Step completed successfully
    StepCompleted {
        /// Sequence of the `StepScheduled` event
        scheduled_seq: u64,

        /// Result returned by the step
        result: serde_json::Value,
    },

    /// Step failed after exhausting its retry policy
    StepFailed {
        /// Sequence of the `StepScheduled` event
        scheduled_seq: u64,

        /// Final error
        error: StepError,
    },

    // =========================================================================
    // Timers
    // =========================================================================
    /// Timer was created
    TimerCreated {
        /// Timer identifier
        timer_id: String,

        /// Logical instant the timer fires at
        fire_at: DateTime<Utc>,
    },

    /// Timer fired
    TimerFired {
        /// Sequence of the `TimerCreated` event
        scheduled_seq: u64,
    },

    /// Timer was cancelled by the workflow
    TimerCancelled {
        /// Timer identifier
        timer_id: String,

        /// Sequence of the open `TimerCreated` event, if any
        scheduled_seq: Option<u64>,
    },

    // =========================================================================
    // External events
    // =========================================================================
    /// Workflow began waiting for a named event
    EventWaitStarted {
        /// Wait identifier
        wait_id: String,

        /// Name of the awaited event
        event_name: String,
    },

    /// A buffered external event was delivered to a wait
    EventReceived {
        /// Sequence of the `EventWaitStarted` event
        scheduled_seq: u64,

        /// Event name
        event_name: String,

        /// Event payload
        payload: serde_json::Value,
    },

    // =========================================================================
    // Sub-workflows
    // =========================================================================
    /// Sub-workflow was scheduled
    SubWorkflowScheduled {
        /// Step identifier within the parent
        step_id: String,

        /// Type of the sub-workflow
        workflow_type: String,

        /// Instance id of the sub-workflow
        instance_id: Uuid,

        /// Input for the sub-workflow
        input: serde_json::Value,
    },

    /// Sub-workflow completed successfully
    SubWorkflowCompleted {
        /// Sequence of the `SubWorkflowScheduled` event
        scheduled_seq: u64,

        /// Result from the sub-workflow
        result: serde_json::Value,
    },

    /// Sub-workflow failed
    SubWorkflowFailed {
        /// Sequence of the `SubWorkflowScheduled` event
        scheduled_seq: u64,

        /// Error from the sub-workflow
        error: WorkflowError,
    },
}

impl WorkflowEvent {
    /// Whether this event was recorded from a workflow action
    pub fn is_decision(&self) -> bool {
        matches!(
            self,
            Self::StepScheduled { .. }
                | Self::TimerCreated { .. }
                | Self::TimerCancelled { .. }
                | Self::EventWaitStarted { .. }
                | Self::SubWorkflowScheduled { .. }
                | Self::WorkflowCompleted { .. }
                | Self::WorkflowFailed { .. }
                | Self::WorkflowContinuedAsNew { .. }
        )
    }

    /// The decision an outcome event answers
    pub fn scheduled_seq(&self) -> Option<u64> {
        match self {
            Self::StepCompleted { scheduled_seq, .. }
            | Self::StepFailed { scheduled_seq, .. }
            | Self::TimerFired { scheduled_seq }
            | Self::EventReceived { scheduled_seq, .. }
            | Self::SubWorkflowCompleted { scheduled_seq, .. }
            | Self::SubWorkflowFailed { scheduled_seq, .. } => Some(*scheduled_seq),
            _ => None,
        }
    }

    /// Whether this event is an outcome answering an earlier decision
    pub fn is_outcome(&self) -> bool {
        self.scheduled_seq().is_some()
    }

    /// Check if this event ends the generation
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::WorkflowCompleted { .. }
                | Self::WorkflowFailed { .. }
                | Self::WorkflowContinuedAsNew { .. }
        )
    }

    /// Short kind name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Self::WorkflowStarted { .. } => "workflow_started",
            Self::WorkflowCompleted { .. } => "workflow_completed",
            Self::WorkflowFailed { .. } => "workflow_failed",
            Self::WorkflowContinuedAsNew { .. } => "workflow_continued_as_new",
            Self::StepScheduled { .. } => "step_scheduled",
            Self::StepCompleted { .. } => "step_completed",
            Self::StepFailed { .. } => "step_failed",
            Self::TimerCreated { .. } => "timer_created",
            Self::TimerFired { .. } => "timer_fired",
            Self::TimerCancelled { .. } => "timer_cancelled",
            Self::EventWaitStarted { .. } => "event_wait_started",
            Self::EventReceived { .. } => "event_received",
            Self::SubWorkflowScheduled { .. } => "sub_workflow_scheduled",
            Self::SubWorkflowCompleted { .. } => "sub_workflow_completed",
            Self::SubWorkflowFailed { .. } => "sub_workflow_failed",
        }
    }
}

/// A recorded event with its position in the history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEvent {
    /// Monotonic sequence number within the generation, starting at 0
    pub sequence: u64,

    /// When the event was appended
    pub recorded_at: DateTime<Utc>,

    /// The event itself
    pub event: WorkflowEvent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_workflow_event_serialization() {
        let event = WorkflowEvent::WorkflowStarted {
            input: json!({"video_location": "video.mp4"}),
            generation: 0,
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"workflow_started\""));

        let parsed: WorkflowEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event, parsed);
    }

    #[test]
    fn test_decision_and_outcome_split() {
        let scheduled = WorkflowEvent::StepScheduled {
            step_id: "s".into(),
            step_type: "t".into(),
            input: json!({}),
            options: StepOptions::default(),
        };
        assert!(scheduled.is_decision());
        assert!(!scheduled.is_outcome());

        let completed = WorkflowEvent::StepCompleted {
            scheduled_seq: 1,
            result: json!(null),
        };
        assert!(completed.is_outcome());
        assert!(!completed.is_decision());
        assert_eq!(completed.scheduled_seq(), Some(1));

        let started = WorkflowEvent::WorkflowStarted {
            input: json!({}),
            generation: 0,
        };
        assert!(!started.is_decision());
        assert!(!started.is_outcome());
    }

    #[test]
    fn test_is_terminal() {
        assert!(WorkflowEvent::WorkflowCompleted { result: json!({}) }.is_terminal());
        assert!(WorkflowEvent::WorkflowFailed {
            error: WorkflowError::new("error")
        }
        .is_terminal());
        assert!(WorkflowEvent::WorkflowContinuedAsNew {
            input: json!({}),
            preserve_unprocessed_events: false
        }
        .is_terminal());
        assert!(!WorkflowEvent::TimerFired { scheduled_seq: 3 }.is_terminal());
    }
}
