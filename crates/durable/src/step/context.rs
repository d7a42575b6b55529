//! Step execution context

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::persistence::ClaimedTask;

/// Context handed to a step for one execution attempt
#[derive(Debug, Clone)]
pub struct StepContext {
    /// Unique execution attempt ID
    pub attempt_id: Uuid,

    /// Current attempt number (1-based)
    pub attempt: u32,

    /// Maximum attempts allowed by the retry policy
    pub max_attempts: u32,

    /// Workflow instance that scheduled this step
    pub workflow_id: Uuid,

    /// Generation of the instance at scheduling time
    pub generation: u32,

    /// Sequence number of the `StepScheduled` event
    pub scheduled_seq: u64,

    /// Step ID chosen by the workflow
    pub step_id: String,

    cancellation: CancellationToken,
}

impl StepContext {
    /// Create a new step context
    pub fn new(
        workflow_id: Uuid,
        step_id: impl Into<String>,
        attempt: u32,
        max_attempts: u32,
    ) -> Self {
        Self {
            attempt_id: Uuid::now_v7(),
            attempt,
            max_attempts,
            workflow_id,
            generation: 0,
            scheduled_seq: 0,
            step_id: step_id.into(),
            cancellation: CancellationToken::new(),
        }
    }

    /// Build the context for a claimed task
    pub fn for_task(task: &ClaimedTask, cancellation: CancellationToken) -> Self {
        Self {
            attempt_id: Uuid::now_v7(),
            attempt: task.attempt,
            max_attempts: task.max_attempts,
            workflow_id: task.workflow_id,
            generation: task.generation,
            scheduled_seq: task.scheduled_seq,
            step_id: task.step_id.clone(),
            cancellation,
        }
    }

    /// Check if this is the last retry attempt
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Whether the worker pool is shutting down
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves when the worker pool begins shutting down
    ///
    /// ```ignore
    /// tokio::select! {
    ///     result = do_work() => { ... }
    ///     _ = ctx.cancelled() => {
    ///         return Err(StepError::retryable("worker shutting down"));
    ///     }
    /// }
    /// ```
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }
}
