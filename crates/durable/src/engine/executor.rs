//! Durable engine with replay support
//!
//! The `DurableEngine` is responsible for:
//! - Starting new workflows and sub-workflows
//! - Replaying workflows from their history
//! - Recording new decisions, then performing their side effects
//!   (enqueue step tasks, arm timers, create children)
//! - Taking in outcomes (step results, timer fires, external events)
//! - Rebuilding in-flight work after a restart

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::clock::EngineClock;
use super::registry::{RegistryError, WorkflowRegistry};
use super::replay::{replay, ReplayError, ReplayState, INVALID_ACTION};
use super::timer::{TimerKey, TimerService};
use crate::persistence::{
    ClaimedTask, ParentLink, StoreError, TaskDefinition, WorkflowEventStore, WorkflowInstance,
    WorkflowStatus,
};
use crate::step::StepError;
use crate::worker::StepOutcomeSink;
use crate::workflow::{
    sub_workflow_id, HistoryEvent, Workflow, WorkflowAction, WorkflowError, WorkflowEvent,
};

/// Error type reported when a claimed step's outcome was lost in a crash
pub const OUTCOME_LOST: &str = "OUTCOME_LOST";

/// Configuration for the durable engine
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum events in a single generation's history
    pub max_events_per_generation: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_events_per_generation: 10_000,
        }
    }
}

impl ExecutorConfig {
    /// Set the per-generation event limit
    pub fn with_max_events_per_generation(mut self, max: usize) -> Self {
        self.max_events_per_generation = max;
        self
    }
}

/// Errors from engine operations
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Registry error
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Replay error (non-determinism detected)
    #[error("replay error: {0}")]
    Replay(#[from] ReplayError),

    /// Workflow not found
    #[error("workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    /// Workflow reached a terminal state
    #[error("workflow {0} is closed")]
    WorkflowClosed(Uuid),

    /// Caller addressed a generation that was already continued-as-new
    #[error("workflow {workflow_id} is at generation {actual}; generation {expected} is gone")]
    StaleGeneration {
        workflow_id: Uuid,
        expected: u32,
        actual: u32,
    },

    /// Too many events
    #[error("workflow {0} has too many events ({1} > {2})")]
    TooManyEvents(Uuid, usize, usize),

    /// Invalid action
    #[error("invalid action: {0}")]
    InvalidAction(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Waiting for a terminal state took too long
    #[error("timed out waiting for workflow {0}")]
    Timeout(Uuid),
}

/// What `recover()` found and restarted
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub instances_resumed: usize,
    pub timers_rearmed: usize,
    pub tasks_requeued: usize,
    pub tasks_abandoned: usize,
    pub sub_workflows_ensured: usize,
}

struct EngineInner<S: WorkflowEventStore> {
    store: Arc<S>,
    registry: WorkflowRegistry,
    config: ExecutorConfig,
    clock: EngineClock,
    timers: TimerService,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
    status_changes: watch::Sender<u64>,
}

/// Durable workflow engine
///
/// Cheap to clone; clones share the store, registry and timers. Every
/// piece of workflow code for one instance runs under that instance's
/// lock, so at most one replay per instance is in flight.
///
/// # Example
///
/// ```ignore
/// use reelflow_durable::prelude::*;
///
/// let store = Arc::new(InMemoryWorkflowEventStore::new());
/// let mut registry = WorkflowRegistry::new();
/// registry.register::<MyWorkflow>();
///
/// let engine = DurableEngine::new(store.clone(), registry);
/// let workflow_id = engine.start_workflow::<MyWorkflow>(input).await?;
/// let instance = engine
///     .wait_for_completion(workflow_id, Duration::from_secs(60))
///     .await?;
/// ```
pub struct DurableEngine<S: WorkflowEventStore> {
    inner: Arc<EngineInner<S>>,
}

impl<S: WorkflowEventStore> Clone for DurableEngine<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: WorkflowEventStore> DurableEngine<S> {
    /// Create an engine over `store` with the given workflow types
    pub fn new(store: Arc<S>, registry: WorkflowRegistry) -> Self {
        Self::with_config(store, registry, ExecutorConfig::default())
    }

    /// Create an engine with custom config
    pub fn with_config(store: Arc<S>, registry: WorkflowRegistry, config: ExecutorConfig) -> Self {
        let clock = EngineClock::new();
        let (status_changes, _) = watch::channel(0);
        Self {
            inner: Arc::new(EngineInner {
                store,
                registry,
                config,
                clock,
                timers: TimerService::new(clock),
                locks: DashMap::new(),
                status_changes,
            }),
        }
    }

    /// Get a reference to the store
    pub fn store(&self) -> &S {
        &self.inner.store
    }

    /// The engine's time source
    pub fn clock(&self) -> EngineClock {
        self.inner.clock
    }

    /// The registered workflow types
    pub fn registry(&self) -> &WorkflowRegistry {
        &self.inner.registry
    }

    /// Number of timers currently armed
    pub fn armed_timer_count(&self) -> usize {
        self.inner.timers.armed_count()
    }

    /// Number of instances currently holding a lock entry
    ///
    /// Entries exist only for open instances.
    pub fn lock_count(&self) -> usize {
        self.inner.locks.len()
    }

    // =========================================================================
    // Public API
    // =========================================================================

    /// Start a new workflow
    #[instrument(skip(self, input), fields(workflow_type = W::TYPE))]
    pub async fn start_workflow<W: Workflow>(&self, input: W::Input) -> Result<Uuid, ExecutorError> {
        let input = serde_json::to_value(&input)?;
        self.start_workflow_json(W::TYPE, None, input).await
    }

    /// Start a workflow by type name
    ///
    /// The input is validated against the registered type before anything
    /// is written. Starting an id that already exists is a no-op.
    #[instrument(skip(self, input))]
    pub async fn start_workflow_json(
        &self,
        workflow_type: &str,
        instance_id: Option<Uuid>,
        input: serde_json::Value,
    ) -> Result<Uuid, ExecutorError> {
        self.inner.registry.create(workflow_type, input.clone())?;

        let workflow_id = instance_id.unwrap_or_else(Uuid::now_v7);
        let now = self.inner.clock.now();
        let instance = WorkflowInstance::new(workflow_id, workflow_type, input, None, now);

        if self.inner.store.create_workflow(instance, now).await? {
            info!(%workflow_id, workflow_type, "workflow started");
        } else {
            debug!(%workflow_id, "workflow already exists");
        }

        self.run_guarded(workflow_id).await?;
        Ok(workflow_id)
    }

    /// Current snapshot of an instance
    pub async fn get_workflow(&self, workflow_id: Uuid) -> Result<WorkflowInstance, ExecutorError> {
        self.inner
            .store
            .get_workflow(workflow_id)
            .await
            .map_err(|err| match err {
                StoreError::WorkflowNotFound(id) => ExecutorError::WorkflowNotFound(id),
                other => other.into(),
            })
    }

    /// History of the current generation
    pub async fn history(&self, workflow_id: Uuid) -> Result<Vec<HistoryEvent>, ExecutorError> {
        self.get_workflow(workflow_id).await?;
        Ok(self.inner.store.load_events(workflow_id).await?)
    }

    /// Replay an instance and act on anything new
    pub async fn process_workflow(&self, workflow_id: Uuid) -> Result<(), ExecutorError> {
        self.run_guarded(workflow_id).await
    }

    /// Raise a named external event for an instance
    ///
    /// The event is buffered and delivered to the oldest open wait for that
    /// name, now or once the workflow reaches one. With `generation` set,
    /// the event is rejected unless that generation is still current.
    /// Returns the arrival number.
    #[instrument(skip(self, payload))]
    pub async fn raise_event(
        &self,
        workflow_id: Uuid,
        generation: Option<u32>,
        name: &str,
        payload: serde_json::Value,
    ) -> Result<u64, ExecutorError> {
        if self.get_workflow(workflow_id).await?.status.is_terminal() {
            warn!(%workflow_id, "event raised for closed workflow");
            return Err(ExecutorError::WorkflowClosed(workflow_id));
        }

        let lock = self.lock_for(workflow_id);
        let _guard = lock.lock().await;

        let instance = self.get_workflow(workflow_id).await?;
        if instance.status.is_terminal() {
            self.release_lock(workflow_id);
            warn!(%workflow_id, status = %instance.status, "event raised for closed workflow");
            return Err(ExecutorError::WorkflowClosed(workflow_id));
        }
        if let Some(expected) = generation {
            if expected != instance.generation {
                warn!(%workflow_id, expected, actual = instance.generation, "event raised for stale generation");
                return Err(ExecutorError::StaleGeneration {
                    workflow_id,
                    expected,
                    actual: instance.generation,
                });
            }
        }

        let arrival = self
            .inner
            .store
            .buffer_external_event(
                workflow_id,
                instance.generation,
                name,
                payload,
                self.inner.clock.now(),
            )
            .await?;
        info!(%workflow_id, generation = instance.generation, arrival, "external event buffered");

        self.run_locked(workflow_id).await?;
        Ok(arrival)
    }

    /// Record a step's result
    ///
    /// Returns false when the outcome was not needed: the generation is
    /// gone, or the step was already answered.
    pub async fn on_step_completed(
        &self,
        task: &ClaimedTask,
        result: serde_json::Value,
    ) -> Result<bool, ExecutorError> {
        let event = WorkflowEvent::StepCompleted {
            scheduled_seq: task.scheduled_seq,
            result,
        };
        self.record_outcome(task.workflow_id, task.generation, event)
            .await
    }

    /// Record a step's final failure
    pub async fn on_step_failed(
        &self,
        task: &ClaimedTask,
        error: StepError,
    ) -> Result<bool, ExecutorError> {
        let event = WorkflowEvent::StepFailed {
            scheduled_seq: task.scheduled_seq,
            error,
        };
        self.record_outcome(task.workflow_id, task.generation, event)
            .await
    }

    /// Wait until an instance is Completed or Failed
    pub async fn wait_for_completion(
        &self,
        workflow_id: Uuid,
        timeout: Duration,
    ) -> Result<WorkflowInstance, ExecutorError> {
        let mut changes = self.inner.status_changes.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let instance = self.get_workflow(workflow_id).await?;
            if instance.status.is_terminal() {
                return Ok(instance);
            }

            match tokio::time::timeout_at(deadline, changes.changed()).await {
                Ok(Ok(())) => continue,
                _ => return Err(ExecutorError::Timeout(workflow_id)),
            }
        }
    }

    /// Resume every running instance after a restart
    ///
    /// Steps whose claim outlived the previous process are not run again;
    /// each is reported to its workflow as a non-retryable
    /// [`OUTCOME_LOST`] failure.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<RecoveryReport, ExecutorError> {
        let mut report = RecoveryReport::default();

        for task in self.inner.store.abandon_claimed_tasks().await? {
            warn!(
                workflow_id = %task.workflow_id,
                step_id = %task.step_id,
                attempt = task.attempt,
                "step claimed before restart; outcome lost"
            );
            let error = StepError::non_retryable(format!(
                "outcome of step {} was lost: worker stopped during attempt {}",
                task.step_id, task.attempt
            ))
            .with_type(OUTCOME_LOST)
            .with_attempts(task.attempt);
            self.on_step_failed(&task, error).await?;
            report.tasks_abandoned += 1;
        }

        let running = self
            .inner
            .store
            .list_workflows(Some(WorkflowStatus::Running))
            .await?;

        for instance in running {
            match self.resume(instance.id, &mut report).await {
                Ok(true) => report.instances_resumed += 1,
                Ok(false) => {}
                Err(err) => {
                    error!(workflow_id = %instance.id, error = %err, "failed to resume workflow");
                }
            }
        }

        info!(?report, "recovery finished");
        Ok(report)
    }

    /// Disarm all timers
    pub fn shutdown(&self) {
        self.inner.timers.shutdown();
        info!("durable engine shut down");
    }

    // =========================================================================
    // Internal Methods
    // =========================================================================

    fn lock_for(&self, workflow_id: Uuid) -> Arc<Mutex<()>> {
        self.inner
            .locks
            .entry(workflow_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Forget the lock of a closed instance
    ///
    /// Only valid once the instance is terminal: anyone still holding the
    /// old lock finds it closed and leaves without writing.
    fn release_lock(&self, workflow_id: Uuid) {
        self.inner.locks.remove(&workflow_id);
    }

    fn publish_status_change(&self) {
        self.inner
            .status_changes
            .send_modify(|version| *version = version.wrapping_add(1));
    }

    /// Lock and run; boxed so spawned runs can name the future type
    fn run_guarded(&self, workflow_id: Uuid) -> BoxFuture<'static, Result<(), ExecutorError>> {
        let engine = self.clone();
        async move {
            let lock = engine.lock_for(workflow_id);
            let _guard = lock.lock().await;
            let result = engine.run_locked(workflow_id).await;
            if matches!(result, Err(ExecutorError::WorkflowNotFound(_))) {
                engine.release_lock(workflow_id);
            }
            result
        }
        .boxed()
    }

    fn spawn_run(&self, workflow_id: Uuid) {
        let run = self.run_guarded(workflow_id);
        tokio::spawn(async move {
            if let Err(err) = run.await {
                error!(%workflow_id, error = %err, "workflow run failed");
            }
        });
    }

    /// Replay, record, deliver; repeat until nothing changes
    ///
    /// Caller must hold the instance lock.
    async fn run_locked(&self, workflow_id: Uuid) -> Result<(), ExecutorError> {
        loop {
            let instance = self.get_workflow(workflow_id).await?;
            if instance.status.is_terminal() {
                self.release_lock(workflow_id);
                debug!(%workflow_id, status = %instance.status, "workflow already in terminal state");
                return Ok(());
            }

            let history = self.inner.store.load_events(workflow_id).await?;
            let max_events = self.inner.config.max_events_per_generation;
            if history.len() > max_events {
                return Err(ExecutorError::TooManyEvents(
                    workflow_id,
                    history.len(),
                    max_events,
                ));
            }

            let mut workflow = self
                .inner
                .registry
                .create(&instance.workflow_type, instance.input.clone())?;
            let outcome = replay(&mut *workflow, workflow_id, instance.generation, &history)
                .inspect_err(|err| {
                    error!(%workflow_id, generation = instance.generation, error = %err, "replay failed");
                })?;

            debug!(
                %workflow_id,
                events = history.len(),
                new_actions = outcome.new_actions.len(),
                "replayed history"
            );

            if let Some(terminal) = outcome.state.terminal().cloned() {
                if self.finish_generation(&instance, terminal).await? {
                    continue;
                }
                return Ok(());
            }

            if !outcome.new_actions.is_empty() {
                self.record_actions(&instance, outcome.state, outcome.new_actions)
                    .await?;
                continue;
            }

            if self.deliver_buffered_event(&instance, &outcome.state).await? {
                continue;
            }

            return Ok(());
        }
    }

    /// Append one decision and mirror it into `state`
    async fn append_decision(
        &self,
        instance: &WorkflowInstance,
        sequence: u64,
        state: &mut ReplayState,
        event: WorkflowEvent,
        now: DateTime<Utc>,
    ) -> Result<u64, ExecutorError> {
        debug!(workflow_id = %instance.id, sequence, kind = event.kind(), "recording decision");
        state.record_decision(sequence, &event);
        let next = self
            .inner
            .store
            .append_events(instance.id, instance.generation, sequence, vec![event], now)
            .await?;
        Ok(next)
    }

    /// Record new decisions, each followed by its side effect
    async fn record_actions(
        &self,
        instance: &WorkflowInstance,
        mut state: ReplayState,
        actions: Vec<WorkflowAction>,
    ) -> Result<(), ExecutorError> {
        let workflow_id = instance.id;
        let generation = instance.generation;
        let mut sequence = state.next_sequence();

        for action in actions {
            let now = self.inner.clock.now();
            let decision_seq = sequence;

            match action {
                WorkflowAction::ScheduleStep {
                    step_id,
                    step_type,
                    input,
                    options,
                } => {
                    let event = WorkflowEvent::StepScheduled {
                        step_id: step_id.clone(),
                        step_type: step_type.clone(),
                        input: input.clone(),
                        options: options.clone(),
                    };
                    sequence = self
                        .append_decision(instance, sequence, &mut state, event, now)
                        .await?;

                    let task = TaskDefinition {
                        workflow_id,
                        generation,
                        scheduled_seq: decision_seq,
                        step_id: step_id.clone(),
                        step_type: step_type.clone(),
                        input,
                        options,
                    };
                    if let Some(task_id) = self.inner.store.enqueue_task(task).await? {
                        debug!(%workflow_id, %step_id, %step_type, %task_id, "step enqueued");
                    }
                }

                WorkflowAction::StartTimer { timer_id, duration } => {
                    let Some(fire_at) = timer_deadline(now, duration) else {
                        warn!(%workflow_id, %timer_id, ?duration, "timer deadline out of range");
                        let error = WorkflowError::new(format!(
                            "timer {timer_id} duration {duration:?} is out of range"
                        ))
                        .with_code(INVALID_ACTION);
                        let event = WorkflowEvent::WorkflowFailed { error };
                        self.append_decision(instance, sequence, &mut state, event, now)
                            .await?;
                        break;
                    };
                    debug!(%workflow_id, %timer_id, %fire_at, "starting timer");

                    let event = WorkflowEvent::TimerCreated { timer_id, fire_at };
                    sequence = self
                        .append_decision(instance, sequence, &mut state, event, now)
                        .await?;

                    self.arm_timer(
                        TimerKey {
                            workflow_id,
                            generation,
                            scheduled_seq: decision_seq,
                        },
                        fire_at,
                    );
                }

                WorkflowAction::CancelTimer { timer_id } => {
                    let timer_seq = state.open_timer_seq(&timer_id);
                    debug!(%workflow_id, %timer_id, ?timer_seq, "cancelling timer");

                    let event = WorkflowEvent::TimerCancelled {
                        timer_id,
                        scheduled_seq: timer_seq,
                    };
                    sequence = self
                        .append_decision(instance, sequence, &mut state, event, now)
                        .await?;

                    if let Some(scheduled_seq) = timer_seq {
                        self.inner.timers.cancel(&TimerKey {
                            workflow_id,
                            generation,
                            scheduled_seq,
                        });
                    }
                }

                WorkflowAction::WaitForEvent {
                    wait_id,
                    event_name,
                } => {
                    debug!(%workflow_id, %wait_id, %event_name, "waiting for event");
                    let event = WorkflowEvent::EventWaitStarted {
                        wait_id,
                        event_name,
                    };
                    sequence = self
                        .append_decision(instance, sequence, &mut state, event, now)
                        .await?;
                }

                WorkflowAction::ScheduleSubWorkflow {
                    step_id,
                    workflow_type,
                    input,
                    instance_id,
                } => {
                    let child_id = instance_id
                        .unwrap_or_else(|| sub_workflow_id(workflow_id, generation, &step_id));
                    debug!(%workflow_id, %child_id, %workflow_type, "scheduling sub-workflow");

                    let event = WorkflowEvent::SubWorkflowScheduled {
                        step_id,
                        workflow_type: workflow_type.clone(),
                        instance_id: child_id,
                        input: input.clone(),
                    };
                    sequence = self
                        .append_decision(instance, sequence, &mut state, event, now)
                        .await?;

                    let link = ParentLink {
                        workflow_id,
                        generation,
                        scheduled_seq: decision_seq,
                    };
                    self.ensure_sub_workflow(link, child_id, &workflow_type, input)
                        .await?;
                }

                WorkflowAction::CompleteWorkflow { result } => {
                    let event = WorkflowEvent::WorkflowCompleted { result };
                    self.append_decision(instance, sequence, &mut state, event, now)
                        .await?;
                    break;
                }

                WorkflowAction::FailWorkflow { error } => {
                    let event = WorkflowEvent::WorkflowFailed { error };
                    self.append_decision(instance, sequence, &mut state, event, now)
                        .await?;
                    break;
                }

                WorkflowAction::ContinueAsNew {
                    input,
                    preserve_unprocessed_events,
                } => {
                    let event = WorkflowEvent::WorkflowContinuedAsNew {
                        input,
                        preserve_unprocessed_events,
                    };
                    self.append_decision(instance, sequence, &mut state, event, now)
                        .await?;
                    break;
                }

                WorkflowAction::None => {}
            }
        }

        Ok(())
    }

    /// Apply the side effects of a recorded terminal decision
    ///
    /// Idempotent, so it is safe to repeat after a crash. Returns true when
    /// a new generation was started.
    async fn finish_generation(
        &self,
        instance: &WorkflowInstance,
        terminal: WorkflowEvent,
    ) -> Result<bool, ExecutorError> {
        let workflow_id = instance.id;
        let generation = instance.generation;
        let now = self.inner.clock.now();

        self.inner.timers.cancel_generation(workflow_id, generation);

        match terminal {
            WorkflowEvent::WorkflowCompleted { result } => {
                self.inner
                    .store
                    .update_workflow_status(
                        workflow_id,
                        WorkflowStatus::Completed,
                        Some(result.clone()),
                        None,
                        now,
                    )
                    .await?;
                self.release_lock(workflow_id);
                info!(%workflow_id, workflow_type = %instance.workflow_type, "workflow completed");

                if let Some(link) = instance.parent {
                    self.spawn_parent_notification(
                        link,
                        WorkflowEvent::SubWorkflowCompleted {
                            scheduled_seq: link.scheduled_seq,
                            result,
                        },
                    );
                }
                self.publish_status_change();
                Ok(false)
            }

            WorkflowEvent::WorkflowFailed { error } => {
                self.inner
                    .store
                    .update_workflow_status(
                        workflow_id,
                        WorkflowStatus::Failed,
                        None,
                        Some(error.clone()),
                        now,
                    )
                    .await?;
                self.release_lock(workflow_id);
                warn!(%workflow_id, workflow_type = %instance.workflow_type, error = %error, "workflow failed");

                if let Some(link) = instance.parent {
                    self.spawn_parent_notification(
                        link,
                        WorkflowEvent::SubWorkflowFailed {
                            scheduled_seq: link.scheduled_seq,
                            error,
                        },
                    );
                }
                self.publish_status_change();
                Ok(false)
            }

            WorkflowEvent::WorkflowContinuedAsNew {
                input,
                preserve_unprocessed_events,
            } => {
                if !preserve_unprocessed_events {
                    let discarded = self
                        .inner
                        .store
                        .discard_external_events(
                            workflow_id,
                            generation,
                            "generation closed by continue-as-new",
                            now,
                        )
                        .await?;
                    if !discarded.is_empty() {
                        warn!(
                            %workflow_id,
                            generation,
                            count = discarded.len(),
                            "discarded unprocessed external events"
                        );
                    }
                }

                let next = self
                    .inner
                    .store
                    .start_next_generation(
                        workflow_id,
                        generation,
                        input,
                        preserve_unprocessed_events,
                        now,
                    )
                    .await?;
                info!(%workflow_id, generation = next, "workflow continued as new");
                self.publish_status_change();
                Ok(true)
            }

            _ => Ok(false),
        }
    }

    /// Hand the oldest matching buffered event to the oldest open wait
    async fn deliver_buffered_event(
        &self,
        instance: &WorkflowInstance,
        state: &ReplayState,
    ) -> Result<bool, ExecutorError> {
        let waits: Vec<(u64, String)> = state
            .open_waits()
            .map(|(seq, wait)| (seq, wait.event_name.clone()))
            .collect();

        for (scheduled_seq, event_name) in waits {
            let Some(pending) = self
                .inner
                .store
                .take_external_event(instance.id, instance.generation, &event_name)
                .await?
            else {
                continue;
            };

            debug!(
                workflow_id = %instance.id,
                scheduled_seq,
                %event_name,
                arrival = pending.arrival,
                "delivering external event"
            );
            let event = WorkflowEvent::EventReceived {
                scheduled_seq,
                event_name,
                payload: pending.payload,
            };
            self.inner
                .store
                .append_events(
                    instance.id,
                    instance.generation,
                    state.next_sequence(),
                    vec![event],
                    self.inner.clock.now(),
                )
                .await?;
            return Ok(true);
        }

        Ok(false)
    }

    /// Append an outcome for an open decision, then run the instance
    async fn record_outcome(
        &self,
        workflow_id: Uuid,
        generation: u32,
        event: WorkflowEvent,
    ) -> Result<bool, ExecutorError> {
        let Some(scheduled_seq) = event.scheduled_seq() else {
            return Err(ExecutorError::InvalidAction(format!(
                "{} is not an outcome",
                event.kind()
            )));
        };

        let lock = self.lock_for(workflow_id);
        let _guard = lock.lock().await;

        let instance = self.get_workflow(workflow_id).await?;
        if instance.status.is_terminal() {
            self.release_lock(workflow_id);
        }
        if instance.generation != generation || instance.status.is_terminal() {
            debug!(
                %workflow_id,
                generation,
                current = instance.generation,
                kind = event.kind(),
                "ignoring outcome for closed generation"
            );
            return Ok(false);
        }

        let history = self.inner.store.load_events(workflow_id).await?;
        let state = ReplayState::from_history(&history)?;
        if !state.is_open(scheduled_seq) {
            debug!(%workflow_id, scheduled_seq, kind = event.kind(), "ignoring outcome for settled decision");
            return Ok(false);
        }

        let kind = event.kind();
        match self
            .inner
            .store
            .append_events(
                workflow_id,
                generation,
                state.next_sequence(),
                vec![event],
                self.inner.clock.now(),
            )
            .await
        {
            Ok(_) => {}
            Err(StoreError::DuplicateOutcome { .. }) => return Ok(false),
            Err(err) => return Err(err.into()),
        }
        debug!(%workflow_id, scheduled_seq, kind, "outcome recorded");

        self.run_locked(workflow_id).await?;
        Ok(true)
    }

    fn arm_timer(&self, key: TimerKey, fire_at: DateTime<Utc>) {
        let engine = self.clone();
        self.inner
            .timers
            .schedule(key, fire_at, move || engine.fire_timer(key));
    }

    fn fire_timer(&self, key: TimerKey) -> BoxFuture<'static, ()> {
        let engine = self.clone();
        async move {
            let event = WorkflowEvent::TimerFired {
                scheduled_seq: key.scheduled_seq,
            };
            if let Err(err) = engine
                .record_outcome(key.workflow_id, key.generation, event)
                .await
            {
                error!(workflow_id = %key.workflow_id, error = %err, "failed to record timer fire");
            }
        }
        .boxed()
    }

    fn spawn_parent_notification(&self, link: ParentLink, event: WorkflowEvent) {
        let engine = self.clone();
        let notify: BoxFuture<'static, ()> = async move {
            if let Err(err) = engine
                .record_outcome(link.workflow_id, link.generation, event)
                .await
            {
                error!(parent_id = %link.workflow_id, error = %err, "failed to notify parent workflow");
            }
        }
        .boxed();
        tokio::spawn(notify);
    }

    /// Create a sub-workflow if it does not exist yet, then run it
    async fn ensure_sub_workflow(
        &self,
        link: ParentLink,
        child_id: Uuid,
        workflow_type: &str,
        input: serde_json::Value,
    ) -> Result<(), ExecutorError> {
        if let Err(err) = self.inner.registry.create(workflow_type, input.clone()) {
            warn!(parent_id = %link.workflow_id, %child_id, error = %err, "sub-workflow cannot start");
            let error = WorkflowError::new(err.to_string()).with_code("SUB_WORKFLOW_START_FAILED");
            self.spawn_parent_notification(
                link,
                WorkflowEvent::SubWorkflowFailed {
                    scheduled_seq: link.scheduled_seq,
                    error,
                },
            );
            return Ok(());
        }

        let now = self.inner.clock.now();
        let child = WorkflowInstance::new(child_id, workflow_type, input, Some(link), now);
        if self.inner.store.create_workflow(child, now).await? {
            info!(parent_id = %link.workflow_id, %child_id, workflow_type, "sub-workflow started");
        }

        self.spawn_run(child_id);
        Ok(())
    }

    /// Re-arm timers, re-enqueue steps and re-ensure children of one instance
    async fn resume(
        &self,
        workflow_id: Uuid,
        report: &mut RecoveryReport,
    ) -> Result<bool, ExecutorError> {
        let lock = self.lock_for(workflow_id);
        let _guard = lock.lock().await;

        let instance = self.get_workflow(workflow_id).await?;
        if instance.status.is_terminal() {
            self.release_lock(workflow_id);
            return Ok(false);
        }
        let generation = instance.generation;

        let history = self.inner.store.load_events(workflow_id).await?;
        let state = ReplayState::from_history(&history)?;

        for (scheduled_seq, timer) in state.open_timers() {
            self.arm_timer(
                TimerKey {
                    workflow_id,
                    generation,
                    scheduled_seq,
                },
                timer.fire_at,
            );
            report.timers_rearmed += 1;
        }

        let open_steps: Vec<_> = state
            .open_steps()
            .map(|(seq, step)| (seq, step.clone()))
            .collect();
        for (scheduled_seq, step) in open_steps {
            let task = TaskDefinition {
                workflow_id,
                generation,
                scheduled_seq,
                step_id: step.step_id,
                step_type: step.step_type,
                input: step.input,
                options: step.options,
            };
            if self.inner.store.enqueue_task(task).await?.is_some() {
                report.tasks_requeued += 1;
            }
        }

        let open_children: Vec<_> = state
            .open_sub_workflows()
            .map(|(seq, child)| (seq, child.clone()))
            .collect();
        for (scheduled_seq, child) in open_children {
            let link = ParentLink {
                workflow_id,
                generation,
                scheduled_seq,
            };
            self.ensure_sub_workflow(link, child.instance_id, &child.workflow_type, child.input)
                .await?;
            report.sub_workflows_ensured += 1;
        }

        self.run_locked(workflow_id).await?;
        Ok(true)
    }
}

/// Absolute deadline of a timer started at `now`; `None` when out of range
fn timer_deadline(now: DateTime<Utc>, duration: Duration) -> Option<DateTime<Utc>> {
    let delta = chrono::Duration::from_std(duration).ok()?;
    now.checked_add_signed(delta)
}

#[async_trait]
impl<S: WorkflowEventStore> StepOutcomeSink for DurableEngine<S> {
    async fn step_completed(
        &self,
        task: &ClaimedTask,
        result: serde_json::Value,
    ) -> anyhow::Result<()> {
        self.on_step_completed(task, result).await?;
        Ok(())
    }

    async fn step_failed(&self, task: &ClaimedTask, error: StepError) -> anyhow::Result<()> {
        self.on_step_failed(task, error).await?;
        Ok(())
    }
}
