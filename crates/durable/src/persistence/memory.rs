//! In-memory implementation of WorkflowEventStore

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;
use crate::step::StepError;
use crate::workflow::{HistoryEvent, WorkflowError, WorkflowEvent};

/// Internal workflow state
struct WorkflowState {
    instance: WorkflowInstance,
    events: Vec<HistoryEvent>,
    generations: Vec<GenerationRecord>,
    pending_events: Vec<PendingExternalEvent>,
    discarded_events: Vec<DiscardedExternalEvent>,
    next_arrival: u64,
}

impl WorkflowState {
    fn new(instance: WorkflowInstance, started_at: DateTime<Utc>) -> Self {
        let started = HistoryEvent {
            sequence: 0,
            recorded_at: started_at,
            event: WorkflowEvent::WorkflowStarted {
                input: instance.input.clone(),
                generation: instance.generation,
            },
        };
        Self {
            instance,
            events: vec![started],
            generations: vec![],
            pending_events: vec![],
            discarded_events: vec![],
            next_arrival: 0,
        }
    }

    fn check_generation(&self, expected: u32) -> Result<(), StoreError> {
        if self.instance.generation != expected {
            return Err(StoreError::GenerationMismatch {
                workflow_id: self.instance.id,
                expected,
                actual: self.instance.generation,
            });
        }
        Ok(())
    }

    fn has_outcome_for(&self, scheduled_seq: u64) -> bool {
        self.events
            .iter()
            .any(|e| e.event.scheduled_seq() == Some(scheduled_seq))
    }
}

/// Internal task state
struct TaskState {
    definition: TaskDefinition,
    status: TaskStatus,
    attempt: u32,
    not_before: Option<DateTime<Utc>>,
    claimed_by: Option<String>,
    error_history: Vec<String>,
}

impl TaskState {
    fn to_claimed(&self, task_id: Uuid) -> ClaimedTask {
        ClaimedTask {
            id: task_id,
            workflow_id: self.definition.workflow_id,
            generation: self.definition.generation,
            scheduled_seq: self.definition.scheduled_seq,
            step_id: self.definition.step_id.clone(),
            step_type: self.definition.step_type.clone(),
            input: self.definition.input.clone(),
            options: self.definition.options.clone(),
            attempt: self.attempt,
            max_attempts: self.definition.options.retry_policy.max_attempts(),
        }
    }
}

type TaskKey = (Uuid, u32, u64);

/// In-memory implementation of WorkflowEventStore
///
/// State lives for the lifetime of the process. Each operation takes the
/// relevant lock once, so every trait method is atomic.
///
/// # Example
///
/// ```
/// use reelflow_durable::InMemoryWorkflowEventStore;
///
/// let store = InMemoryWorkflowEventStore::new();
/// assert_eq!(store.workflow_count(), 0);
/// ```
pub struct InMemoryWorkflowEventStore {
    workflows: RwLock<HashMap<Uuid, WorkflowState>>,
    // Keyed by v7 ids, so iteration roughly follows enqueue order
    tasks: RwLock<BTreeMap<Uuid, TaskState>>,
    task_keys: RwLock<HashMap<TaskKey, Uuid>>,
    correlations: RwLock<HashMap<String, CorrelationRecord>>,
}

impl InMemoryWorkflowEventStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            workflows: RwLock::new(HashMap::new()),
            tasks: RwLock::new(BTreeMap::new()),
            task_keys: RwLock::new(HashMap::new()),
            correlations: RwLock::new(HashMap::new()),
        }
    }

    /// Get the number of workflows
    pub fn workflow_count(&self) -> usize {
        self.workflows.read().len()
    }

    /// Get the number of pending tasks
    pub fn pending_task_count(&self) -> usize {
        self.tasks
            .read()
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .count()
    }

    /// Attempts made so far for the task answering `scheduled_seq`
    pub fn task_attempts(&self, workflow_id: Uuid, generation: u32, scheduled_seq: u64) -> Option<u32> {
        let task_id = *self
            .task_keys
            .read()
            .get(&(workflow_id, generation, scheduled_seq))?;
        self.tasks.read().get(&task_id).map(|t| t.attempt)
    }

    /// Error messages recorded for each failed attempt of a task
    pub fn task_errors(&self, task_id: Uuid) -> Vec<String> {
        self.tasks
            .read()
            .get(&task_id)
            .map(|t| t.error_history.clone())
            .unwrap_or_default()
    }

    /// Clear all data
    pub fn clear(&self) {
        self.workflows.write().clear();
        self.tasks.write().clear();
        self.task_keys.write().clear();
        self.correlations.write().clear();
    }
}

impl Default for InMemoryWorkflowEventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkflowEventStore for InMemoryWorkflowEventStore {
    async fn create_workflow(
        &self,
        instance: WorkflowInstance,
        started_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut workflows = self.workflows.write();
        if workflows.contains_key(&instance.id) {
            return Ok(false);
        }
        workflows.insert(instance.id, WorkflowState::new(instance, started_at));
        Ok(true)
    }

    async fn get_workflow(&self, workflow_id: Uuid) -> Result<WorkflowInstance, StoreError> {
        let workflows = self.workflows.read();
        workflows
            .get(&workflow_id)
            .map(|w| w.instance.clone())
            .ok_or(StoreError::WorkflowNotFound(workflow_id))
    }

    async fn list_workflows(
        &self,
        status: Option<WorkflowStatus>,
    ) -> Result<Vec<WorkflowInstance>, StoreError> {
        let workflows = self.workflows.read();
        let mut instances: Vec<_> = workflows
            .values()
            .filter(|w| status.map_or(true, |s| w.instance.status == s))
            .map(|w| w.instance.clone())
            .collect();
        instances.sort_by_key(|i| i.created_at);
        Ok(instances)
    }

    async fn update_workflow_status(
        &self,
        workflow_id: Uuid,
        status: WorkflowStatus,
        result: Option<serde_json::Value>,
        error: Option<WorkflowError>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut workflows = self.workflows.write();
        let workflow = workflows
            .get_mut(&workflow_id)
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;

        workflow.instance.status = status;
        workflow.instance.result = result;
        workflow.instance.error = error;
        workflow.instance.updated_at = now;
        Ok(())
    }

    async fn append_events(
        &self,
        workflow_id: Uuid,
        generation: u32,
        expected_sequence: u64,
        events: Vec<WorkflowEvent>,
        recorded_at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut workflows = self.workflows.write();
        let workflow = workflows
            .get_mut(&workflow_id)
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;

        workflow.check_generation(generation)?;

        let current_sequence = workflow.events.len() as u64;
        if current_sequence != expected_sequence {
            return Err(StoreError::ConcurrencyConflict {
                expected: expected_sequence,
                actual: current_sequence,
            });
        }

        // Validate the whole batch before writing any of it
        let mut answered = vec![];
        for event in &events {
            if let Some(scheduled_seq) = event.scheduled_seq() {
                if workflow.has_outcome_for(scheduled_seq) || answered.contains(&scheduled_seq) {
                    return Err(StoreError::DuplicateOutcome {
                        workflow_id,
                        scheduled_seq,
                    });
                }
                answered.push(scheduled_seq);
            }
        }

        for event in events {
            let sequence = workflow.events.len() as u64;
            workflow.events.push(HistoryEvent {
                sequence,
                recorded_at,
                event,
            });
        }
        workflow.instance.updated_at = recorded_at;
        Ok(workflow.events.len() as u64)
    }

    async fn load_events(&self, workflow_id: Uuid) -> Result<Vec<HistoryEvent>, StoreError> {
        let workflows = self.workflows.read();
        let workflow = workflows
            .get(&workflow_id)
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;
        Ok(workflow.events.clone())
    }

    async fn start_next_generation(
        &self,
        workflow_id: Uuid,
        expected_generation: u32,
        input: serde_json::Value,
        carry_events: bool,
        now: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        let mut workflows = self.workflows.write();
        let workflow = workflows
            .get_mut(&workflow_id)
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;

        workflow.check_generation(expected_generation)?;

        workflow.generations.push(GenerationRecord {
            generation: expected_generation,
            status: WorkflowStatus::ContinuedAsNew,
            input: workflow.instance.input.clone(),
            event_count: workflow.events.len(),
            closed_at: now,
        });

        let next = expected_generation + 1;
        if carry_events {
            for event in workflow
                .pending_events
                .iter_mut()
                .filter(|e| e.generation == expected_generation)
            {
                event.generation = next;
            }
        }

        workflow.instance.generation = next;
        workflow.instance.input = input.clone();
        workflow.instance.status = WorkflowStatus::Running;
        workflow.instance.updated_at = now;
        workflow.events = vec![HistoryEvent {
            sequence: 0,
            recorded_at: now,
            event: WorkflowEvent::WorkflowStarted {
                input,
                generation: next,
            },
        }];
        Ok(next)
    }

    async fn generation_history(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<GenerationRecord>, StoreError> {
        let workflows = self.workflows.read();
        let workflow = workflows
            .get(&workflow_id)
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;
        Ok(workflow.generations.clone())
    }

    async fn enqueue_task(&self, task: TaskDefinition) -> Result<Option<Uuid>, StoreError> {
        let key = (task.workflow_id, task.generation, task.scheduled_seq);
        let mut task_keys = self.task_keys.write();
        if task_keys.contains_key(&key) {
            return Ok(None);
        }

        let task_id = Uuid::now_v7();
        task_keys.insert(key, task_id);
        self.tasks.write().insert(
            task_id,
            TaskState {
                definition: task,
                status: TaskStatus::Pending,
                attempt: 0,
                not_before: None,
                claimed_by: None,
                error_history: vec![],
            },
        );
        Ok(Some(task_id))
    }

    async fn claim_tasks(
        &self,
        worker_id: &str,
        step_types: &[String],
        max_tasks: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<ClaimedTask>, StoreError> {
        let mut tasks = self.tasks.write();
        let mut claimed = vec![];

        for (task_id, task) in tasks.iter_mut() {
            if claimed.len() >= max_tasks {
                break;
            }

            let due = task.not_before.map_or(true, |at| at <= now);
            if task.status == TaskStatus::Pending
                && due
                && step_types.contains(&task.definition.step_type)
            {
                task.status = TaskStatus::Claimed;
                task.claimed_by = Some(worker_id.to_string());
                task.attempt += 1;
                claimed.push(task.to_claimed(*task_id));
            }
        }

        Ok(claimed)
    }

    async fn next_task_due(
        &self,
        step_types: &[String],
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let tasks = self.tasks.read();
        let due = tasks
            .values()
            .filter(|task| {
                task.status == TaskStatus::Pending
                    && step_types.contains(&task.definition.step_type)
            })
            .map(|task| task.not_before.unwrap_or(DateTime::<Utc>::MIN_UTC))
            .min();
        Ok(due)
    }

    async fn complete_task(&self, task_id: Uuid) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;

        task.status = TaskStatus::Completed;
        task.claimed_by = None;
        Ok(())
    }

    async fn fail_task(
        &self,
        task_id: Uuid,
        error: &StepError,
        now: DateTime<Utc>,
    ) -> Result<TaskFailureOutcome, StoreError> {
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;

        task.error_history.push(error.message.clone());
        task.claimed_by = None;

        let policy = &task.definition.options.retry_policy;
        if policy.should_retry(error, task.attempt) {
            let next_attempt = task.attempt + 1;
            let delay = policy.delay_for_attempt(next_attempt);
            task.status = TaskStatus::Pending;
            task.not_before = Some(now + chrono::Duration::from_std(delay).unwrap_or_default());
            Ok(TaskFailureOutcome::WillRetry {
                next_attempt,
                delay,
            })
        } else {
            task.status = TaskStatus::Failed;
            Ok(TaskFailureOutcome::Exhausted {
                attempts: task.attempt,
            })
        }
    }

    async fn abandon_claimed_tasks(&self) -> Result<Vec<ClaimedTask>, StoreError> {
        let mut tasks = self.tasks.write();
        let mut abandoned = vec![];

        for (task_id, task) in tasks.iter_mut() {
            if task.status == TaskStatus::Claimed {
                task.status = TaskStatus::Failed;
                task.claimed_by = None;
                task.error_history.push("worker lost".to_string());
                abandoned.push(task.to_claimed(*task_id));
            }
        }

        Ok(abandoned)
    }

    async fn buffer_external_event(
        &self,
        workflow_id: Uuid,
        generation: u32,
        name: &str,
        payload: serde_json::Value,
        received_at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut workflows = self.workflows.write();
        let workflow = workflows
            .get_mut(&workflow_id)
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;

        workflow.check_generation(generation)?;

        let arrival = workflow.next_arrival;
        workflow.next_arrival += 1;
        workflow.pending_events.push(PendingExternalEvent {
            workflow_id,
            generation,
            name: name.to_string(),
            payload,
            arrival,
            received_at,
        });
        Ok(arrival)
    }

    async fn take_external_event(
        &self,
        workflow_id: Uuid,
        generation: u32,
        name: &str,
    ) -> Result<Option<PendingExternalEvent>, StoreError> {
        let mut workflows = self.workflows.write();
        let workflow = workflows
            .get_mut(&workflow_id)
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;

        // pending_events is kept in arrival order
        let position = workflow
            .pending_events
            .iter()
            .position(|e| e.generation == generation && e.name == name);
        Ok(position.map(|i| workflow.pending_events.remove(i)))
    }

    async fn pending_external_events(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<PendingExternalEvent>, StoreError> {
        let workflows = self.workflows.read();
        let workflow = workflows
            .get(&workflow_id)
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;
        Ok(workflow.pending_events.clone())
    }

    async fn discard_external_events(
        &self,
        workflow_id: Uuid,
        generation: u32,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<PendingExternalEvent>, StoreError> {
        let mut workflows = self.workflows.write();
        let workflow = workflows
            .get_mut(&workflow_id)
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;

        let (discarded, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut workflow.pending_events)
            .into_iter()
            .partition(|e| e.generation == generation);
        workflow.pending_events = kept;

        workflow
            .discarded_events
            .extend(discarded.iter().cloned().map(|event| DiscardedExternalEvent {
                event,
                reason: reason.to_string(),
                discarded_at: now,
            }));
        Ok(discarded)
    }

    async fn discarded_external_events(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<DiscardedExternalEvent>, StoreError> {
        let workflows = self.workflows.read();
        let workflow = workflows
            .get(&workflow_id)
            .ok_or(StoreError::WorkflowNotFound(workflow_id))?;
        Ok(workflow.discarded_events.clone())
    }

    async fn insert_correlation(&self, record: CorrelationRecord) -> Result<(), StoreError> {
        let mut correlations = self.correlations.write();
        if correlations.contains_key(&record.code) {
            return Err(StoreError::DuplicateCorrelationCode(record.code));
        }
        correlations.insert(record.code.clone(), record);
        Ok(())
    }

    async fn lookup_correlation(
        &self,
        code: &str,
    ) -> Result<Option<CorrelationRecord>, StoreError> {
        Ok(self.correlations.read().get(code).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reliability::RetryPolicy;
    use crate::workflow::StepOptions;
    use serde_json::json;
    use std::time::Duration;

    async fn create(store: &InMemoryWorkflowEventStore) -> Uuid {
        let id = Uuid::now_v7();
        let instance = WorkflowInstance::new(id, "test", json!({"n": 1}), None, Utc::now());
        assert!(store.create_workflow(instance, Utc::now()).await.unwrap());
        id
    }

    fn task(workflow_id: Uuid, seq: u64, options: StepOptions) -> TaskDefinition {
        TaskDefinition {
            workflow_id,
            generation: 0,
            scheduled_seq: seq,
            step_id: format!("step-{seq}"),
            step_type: "test_step".to_string(),
            input: json!({}),
            options,
        }
    }

    fn scheduled() -> WorkflowEvent {
        WorkflowEvent::StepScheduled {
            step_id: "step-1".to_string(),
            step_type: "test_step".to_string(),
            input: json!({}),
            options: StepOptions::default(),
        }
    }

    #[tokio::test]
    async fn test_create_workflow_records_started_event() {
        let store = InMemoryWorkflowEventStore::new();
        let id = create(&store).await;

        let instance = store.get_workflow(id).await.unwrap();
        assert_eq!(instance.status, WorkflowStatus::Running);
        assert_eq!(instance.generation, 0);

        let events = store.load_events(id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0].event,
            WorkflowEvent::WorkflowStarted { generation: 0, .. }
        ));
    }

    #[tokio::test]
    async fn test_create_workflow_is_insert_once() {
        let store = InMemoryWorkflowEventStore::new();
        let id = create(&store).await;

        let again = WorkflowInstance::new(id, "other", json!({}), None, Utc::now());
        assert!(!store.create_workflow(again, Utc::now()).await.unwrap());
        assert_eq!(store.get_workflow(id).await.unwrap().workflow_type, "test");
    }

    #[tokio::test]
    async fn test_append_and_load_events() {
        let store = InMemoryWorkflowEventStore::new();
        let id = create(&store).await;

        let next = store
            .append_events(id, 0, 1, vec![scheduled()], Utc::now())
            .await
            .unwrap();
        assert_eq!(next, 2);

        let next = store
            .append_events(
                id,
                0,
                2,
                vec![WorkflowEvent::StepCompleted {
                    scheduled_seq: 1,
                    result: json!("ok"),
                }],
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(next, 3);

        let events = store.load_events(id).await.unwrap();
        let sequences: Vec<_> = events.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_concurrency_conflict() {
        let store = InMemoryWorkflowEventStore::new();
        let id = create(&store).await;

        let result = store
            .append_events(id, 0, 5, vec![scheduled()], Utc::now())
            .await;
        assert!(matches!(
            result,
            Err(StoreError::ConcurrencyConflict {
                expected: 5,
                actual: 1
            })
        ));
    }

    #[tokio::test]
    async fn test_duplicate_outcome_rejected() {
        let store = InMemoryWorkflowEventStore::new();
        let id = create(&store).await;
        store
            .append_events(id, 0, 1, vec![scheduled()], Utc::now())
            .await
            .unwrap();

        let completed = WorkflowEvent::StepCompleted {
            scheduled_seq: 1,
            result: json!(1),
        };
        store
            .append_events(id, 0, 2, vec![completed.clone()], Utc::now())
            .await
            .unwrap();

        let result = store
            .append_events(id, 0, 3, vec![completed], Utc::now())
            .await;
        assert!(matches!(
            result,
            Err(StoreError::DuplicateOutcome { scheduled_seq: 1, .. })
        ));
        assert_eq!(store.load_events(id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_append_to_stale_generation_rejected() {
        let store = InMemoryWorkflowEventStore::new();
        let id = create(&store).await;
        store
            .start_next_generation(id, 0, json!({"n": 2}), false, Utc::now())
            .await
            .unwrap();

        let result = store
            .append_events(id, 0, 1, vec![scheduled()], Utc::now())
            .await;
        assert!(matches!(
            result,
            Err(StoreError::GenerationMismatch {
                expected: 0,
                actual: 1,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_start_next_generation_resets_history() {
        let store = InMemoryWorkflowEventStore::new();
        let id = create(&store).await;
        store
            .append_events(id, 0, 1, vec![scheduled()], Utc::now())
            .await
            .unwrap();

        let next = store
            .start_next_generation(id, 0, json!({"n": 2}), false, Utc::now())
            .await
            .unwrap();
        assert_eq!(next, 1);

        let instance = store.get_workflow(id).await.unwrap();
        assert_eq!(instance.generation, 1);
        assert_eq!(instance.input, json!({"n": 2}));

        let events = store.load_events(id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0].event,
            WorkflowEvent::WorkflowStarted { generation: 1, .. }
        ));

        let generations = store.generation_history(id).await.unwrap();
        assert_eq!(generations.len(), 1);
        assert_eq!(generations[0].generation, 0);
        assert_eq!(generations[0].event_count, 2);
        assert_eq!(generations[0].input, json!({"n": 1}));
    }

    #[tokio::test]
    async fn test_enqueue_task_is_insert_once() {
        let store = InMemoryWorkflowEventStore::new();
        let id = create(&store).await;

        let first = store
            .enqueue_task(task(id, 1, StepOptions::default()))
            .await
            .unwrap();
        let second = store
            .enqueue_task(task(id, 1, StepOptions::default()))
            .await
            .unwrap();

        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(store.pending_task_count(), 1);
    }

    #[tokio::test]
    async fn test_claim_filters_step_types() {
        let store = InMemoryWorkflowEventStore::new();
        let id = create(&store).await;
        store
            .enqueue_task(task(id, 1, StepOptions::default()))
            .await
            .unwrap();

        let other = vec!["other_step".to_string()];
        let claimed = store.claim_tasks("w1", &other, 10, Utc::now()).await.unwrap();
        assert!(claimed.is_empty());

        let types = vec!["test_step".to_string()];
        let claimed = store.claim_tasks("w1", &types, 10, Utc::now()).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].attempt, 1);
        assert_eq!(claimed[0].max_attempts, 1);

        // Already claimed
        let claimed = store.claim_tasks("w2", &types, 10, Utc::now()).await.unwrap();
        assert!(claimed.is_empty());
    }

    #[tokio::test]
    async fn test_fail_task_retries_then_exhausts() {
        let store = InMemoryWorkflowEventStore::new();
        let id = create(&store).await;
        let options =
            StepOptions::default().with_retry(RetryPolicy::fixed(Duration::from_secs(5), 1));
        store.enqueue_task(task(id, 1, options)).await.unwrap();

        let types = vec!["test_step".to_string()];
        let now = Utc::now();
        let claimed = store.claim_tasks("w1", &types, 1, now).await.unwrap();
        let task_id = claimed[0].id;

        let outcome = store
            .fail_task(task_id, &StepError::retryable("boom"), now)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            TaskFailureOutcome::WillRetry {
                next_attempt: 2,
                delay: Duration::from_secs(5)
            }
        );

        // Not due yet
        assert!(store.claim_tasks("w1", &types, 1, now).await.unwrap().is_empty());
        assert_eq!(
            store.next_task_due(&types).await.unwrap(),
            Some(now + chrono::Duration::seconds(5))
        );
        assert_eq!(
            store.next_task_due(&["other".to_string()]).await.unwrap(),
            None
        );

        let later = now + chrono::Duration::seconds(5);
        let claimed = store.claim_tasks("w1", &types, 1, later).await.unwrap();
        assert_eq!(claimed[0].attempt, 2);

        let outcome = store
            .fail_task(task_id, &StepError::retryable("boom again"), later)
            .await
            .unwrap();
        assert_eq!(outcome, TaskFailureOutcome::Exhausted { attempts: 2 });
        assert_eq!(store.task_attempts(id, 0, 1), Some(2));
        assert_eq!(store.task_errors(task_id), vec!["boom", "boom again"]);
    }

    #[tokio::test]
    async fn test_non_retryable_failure_is_not_retried() {
        let store = InMemoryWorkflowEventStore::new();
        let id = create(&store).await;
        let options =
            StepOptions::default().with_retry(RetryPolicy::fixed(Duration::from_secs(5), 4));
        store.enqueue_task(task(id, 1, options)).await.unwrap();

        let types = vec!["test_step".to_string()];
        let claimed = store.claim_tasks("w1", &types, 1, Utc::now()).await.unwrap();
        let outcome = store
            .fail_task(claimed[0].id, &StepError::non_retryable("bad input"), Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome, TaskFailureOutcome::Exhausted { attempts: 1 });
    }

    #[tokio::test]
    async fn test_abandon_claimed_tasks() {
        let store = InMemoryWorkflowEventStore::new();
        let id = create(&store).await;
        store
            .enqueue_task(task(id, 1, StepOptions::default()))
            .await
            .unwrap();
        store
            .enqueue_task(task(id, 2, StepOptions::default()))
            .await
            .unwrap();

        let types = vec!["test_step".to_string()];
        store.claim_tasks("w1", &types, 1, Utc::now()).await.unwrap();

        let abandoned = store.abandon_claimed_tasks().await.unwrap();
        assert_eq!(abandoned.len(), 1);
        assert_eq!(store.pending_task_count(), 1);

        // The abandoned task is never handed out again
        let claimed = store.claim_tasks("w2", &types, 10, Utc::now()).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_ne!(claimed[0].id, abandoned[0].id);
    }

    #[tokio::test]
    async fn test_external_events_fifo_per_name() {
        let store = InMemoryWorkflowEventStore::new();
        let id = create(&store).await;

        for (name, payload) in [("a", 1), ("b", 2), ("a", 3)] {
            store
                .buffer_external_event(id, 0, name, json!(payload), Utc::now())
                .await
                .unwrap();
        }

        let first = store.take_external_event(id, 0, "a").await.unwrap().unwrap();
        let second = store.take_external_event(id, 0, "a").await.unwrap().unwrap();
        assert_eq!(first.payload, json!(1));
        assert_eq!(second.payload, json!(3));
        assert!(first.arrival < second.arrival);
        assert!(store.take_external_event(id, 0, "a").await.unwrap().is_none());

        let pending = store.pending_external_events(id).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].name, "b");
    }

    #[tokio::test]
    async fn test_discard_and_carry_external_events() {
        let store = InMemoryWorkflowEventStore::new();
        let id = create(&store).await;
        store
            .buffer_external_event(id, 0, "a", json!(1), Utc::now())
            .await
            .unwrap();

        store
            .start_next_generation(id, 0, json!({}), true, Utc::now())
            .await
            .unwrap();
        let carried = store.take_external_event(id, 1, "a").await.unwrap();
        assert!(carried.is_some());

        store
            .buffer_external_event(id, 1, "b", json!(2), Utc::now())
            .await
            .unwrap();
        let discarded = store
            .discard_external_events(id, 1, "continued as new", Utc::now())
            .await
            .unwrap();
        assert_eq!(discarded.len(), 1);
        assert!(store.pending_external_events(id).await.unwrap().is_empty());

        let log = store.discarded_external_events(id).await.unwrap();
        assert_eq!(log[0].event.name, "b");
        assert_eq!(log[0].reason, "continued as new");
    }

    #[tokio::test]
    async fn test_correlation_codes_are_unique() {
        let store = InMemoryWorkflowEventStore::new();
        let record = CorrelationRecord {
            code: "ABCD1234".to_string(),
            workflow_id: Uuid::now_v7(),
            created_at: Utc::now(),
        };

        store.insert_correlation(record.clone()).await.unwrap();
        let duplicate = store.insert_correlation(record.clone()).await;
        assert!(matches!(duplicate, Err(StoreError::DuplicateCorrelationCode(_))));

        assert_eq!(store.lookup_correlation("ABCD1234").await.unwrap(), Some(record));
        assert_eq!(store.lookup_correlation("abcd1234").await.unwrap(), None);
    }
}
