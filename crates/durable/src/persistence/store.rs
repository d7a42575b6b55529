//! WorkflowEventStore trait definition

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::step::StepError;
use crate::workflow::{HistoryEvent, StepOptions, WorkflowError, WorkflowEvent};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Workflow not found
    #[error("workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    /// Task not found
    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    /// Concurrency conflict (optimistic locking failed)
    #[error("concurrency conflict: expected sequence {expected}, got {actual}")]
    ConcurrencyConflict { expected: u64, actual: u64 },

    /// Write addressed to a generation that is no longer current
    #[error("workflow {workflow_id} is at generation {actual}, not {expected}")]
    GenerationMismatch {
        workflow_id: Uuid,
        expected: u32,
        actual: u32,
    },

    /// An outcome for this decision was already recorded
    #[error("workflow {workflow_id} already has an outcome for sequence {scheduled_seq}")]
    DuplicateOutcome { workflow_id: Uuid, scheduled_seq: u64 },

    /// Correlation code already in use
    #[error("correlation code already exists: {0}")]
    DuplicateCorrelationCode(String),
}

/// Workflow status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Workflow is running
    Running,

    /// Workflow completed successfully
    Completed,

    /// Workflow failed
    Failed,

    /// Generation handed off to its successor
    ContinuedAsNew,
}

impl WorkflowStatus {
    /// Whether the instance will never run again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::ContinuedAsNew => write!(f, "continued_as_new"),
        }
    }
}

/// Back-reference from a sub-workflow to the decision that started it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentLink {
    pub workflow_id: Uuid,
    pub generation: u32,
    pub scheduled_seq: u64,
}

/// A workflow instance as stored
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: Uuid,
    pub workflow_type: String,
    pub input: serde_json::Value,
    pub status: WorkflowStatus,
    pub generation: u32,
    pub result: Option<serde_json::Value>,
    pub error: Option<WorkflowError>,
    pub parent: Option<ParentLink>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowInstance {
    /// A freshly started instance at generation 0
    pub fn new(
        id: Uuid,
        workflow_type: impl Into<String>,
        input: serde_json::Value,
        parent: Option<ParentLink>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            workflow_type: workflow_type.into(),
            input,
            status: WorkflowStatus::Running,
            generation: 0,
            result: None,
            error: None,
            parent,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Summary of a generation closed by continue-as-new
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRecord {
    pub generation: u32,
    pub status: WorkflowStatus,
    pub input: serde_json::Value,
    pub event_count: usize,
    pub closed_at: DateTime<Utc>,
}

/// Task status in the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Claimed,
    Completed,
    Failed,
}

/// Definition of a task to be enqueued
///
/// `(workflow_id, generation, scheduled_seq)` identifies the task; the
/// queue accepts each key once.
#[derive(Debug, Clone)]
pub struct TaskDefinition {
    pub workflow_id: Uuid,
    pub generation: u32,
    pub scheduled_seq: u64,
    pub step_id: String,
    pub step_type: String,
    pub input: serde_json::Value,
    pub options: StepOptions,
}

/// A task that has been claimed by a worker
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub generation: u32,
    pub scheduled_seq: u64,
    pub step_id: String,
    pub step_type: String,
    pub input: serde_json::Value,
    pub options: StepOptions,
    pub attempt: u32,
    pub max_attempts: u32,
}

/// Outcome of failing a task
#[derive(Debug, Clone, PartialEq)]
pub enum TaskFailureOutcome {
    /// Task will be retried after `delay`
    WillRetry { next_attempt: u32, delay: Duration },

    /// No retries left; the failure goes to the workflow
    Exhausted { attempts: u32 },
}

/// An external event waiting to be consumed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingExternalEvent {
    pub workflow_id: Uuid,
    pub generation: u32,
    pub name: String,
    pub payload: serde_json::Value,
    /// Arrival order across all events of the instance
    pub arrival: u64,
    pub received_at: DateTime<Utc>,
}

/// An event that could no longer be delivered
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscardedExternalEvent {
    pub event: PendingExternalEvent,
    pub reason: String,
    pub discarded_at: DateTime<Utc>,
}

/// Maps a short human-facing code to the instance it addresses
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CorrelationRecord {
    pub code: String,
    pub workflow_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Store for workflow history, the task queue, and external events
///
/// This trait defines the interface for persisting workflow state.
/// Implementations must be thread-safe and support concurrent access.
/// Every write is either an append or an insert-once; history entries are
/// never modified in place.
#[async_trait]
pub trait WorkflowEventStore: Send + Sync + 'static {
    // =========================================================================
    // Workflow Operations
    // =========================================================================

    /// Create an instance together with its `WorkflowStarted` event
    ///
    /// Returns `false` without touching anything if the id already exists.
    async fn create_workflow(
        &self,
        instance: WorkflowInstance,
        started_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Get a snapshot of an instance
    async fn get_workflow(&self, workflow_id: Uuid) -> Result<WorkflowInstance, StoreError>;

    /// List instances, optionally filtered by status
    async fn list_workflows(
        &self,
        status: Option<WorkflowStatus>,
    ) -> Result<Vec<WorkflowInstance>, StoreError>;

    /// Update workflow status
    async fn update_workflow_status(
        &self,
        workflow_id: Uuid,
        status: WorkflowStatus,
        result: Option<serde_json::Value>,
        error: Option<WorkflowError>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Append events to the current generation (with optimistic concurrency)
    ///
    /// Rejects a second outcome for the same decision with
    /// [`StoreError::DuplicateOutcome`]. Returns the next sequence number.
    async fn append_events(
        &self,
        workflow_id: Uuid,
        generation: u32,
        expected_sequence: u64,
        events: Vec<WorkflowEvent>,
        recorded_at: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Load the current generation's history (for replay)
    async fn load_events(&self, workflow_id: Uuid) -> Result<Vec<HistoryEvent>, StoreError>;

    /// Archive the current generation and start the next one with `input`
    ///
    /// The new history holds a single `WorkflowStarted` event. When
    /// `carry_events` is set, still-buffered events move to the new
    /// generation. Returns the new generation number.
    async fn start_next_generation(
        &self,
        workflow_id: Uuid,
        expected_generation: u32,
        input: serde_json::Value,
        carry_events: bool,
        now: DateTime<Utc>,
    ) -> Result<u32, StoreError>;

    /// Generations closed by continue-as-new, oldest first
    async fn generation_history(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<GenerationRecord>, StoreError>;

    // =========================================================================
    // Task Queue Operations
    // =========================================================================

    /// Enqueue a step task; `None` if the key was already enqueued
    async fn enqueue_task(&self, task: TaskDefinition) -> Result<Option<Uuid>, StoreError>;

    /// Claim due tasks for execution
    async fn claim_tasks(
        &self,
        worker_id: &str,
        step_types: &[String],
        max_tasks: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<ClaimedTask>, StoreError>;

    /// Earliest time an unclaimed task of these types may be claimed
    ///
    /// `None` when nothing is pending. A task due now reports its enqueue
    /// time or retry time, which may be in the past.
    async fn next_task_due(
        &self,
        step_types: &[String],
    ) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Complete a task successfully
    async fn complete_task(&self, task_id: Uuid) -> Result<(), StoreError>;

    /// Fail a task attempt, rescheduling it if the retry policy allows
    async fn fail_task(
        &self,
        task_id: Uuid,
        error: &StepError,
        now: DateTime<Utc>,
    ) -> Result<TaskFailureOutcome, StoreError>;

    /// Fail every task still claimed by a worker that is gone
    ///
    /// Used on recovery. The returned tasks are not retried.
    async fn abandon_claimed_tasks(&self) -> Result<Vec<ClaimedTask>, StoreError>;

    // =========================================================================
    // External Event Operations
    // =========================================================================

    /// Buffer an event for a generation; returns its arrival number
    async fn buffer_external_event(
        &self,
        workflow_id: Uuid,
        generation: u32,
        name: &str,
        payload: serde_json::Value,
        received_at: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Remove and return the oldest buffered event with `name`
    async fn take_external_event(
        &self,
        workflow_id: Uuid,
        generation: u32,
        name: &str,
    ) -> Result<Option<PendingExternalEvent>, StoreError>;

    /// All buffered events of an instance, in arrival order
    async fn pending_external_events(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<PendingExternalEvent>, StoreError>;

    /// Move a generation's buffered events to the discarded log
    async fn discard_external_events(
        &self,
        workflow_id: Uuid,
        generation: u32,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<PendingExternalEvent>, StoreError>;

    /// Events that were discarded instead of delivered
    async fn discarded_external_events(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<DiscardedExternalEvent>, StoreError>;

    // =========================================================================
    // Correlation Operations
    // =========================================================================

    /// Insert a correlation record; duplicate codes are rejected
    async fn insert_correlation(&self, record: CorrelationRecord) -> Result<(), StoreError>;

    /// Look up a correlation record by exact code
    async fn lookup_correlation(&self, code: &str)
        -> Result<Option<CorrelationRecord>, StoreError>;
}
