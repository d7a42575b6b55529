//! Worker pool for step execution
//!
//! Claims step tasks, runs them concurrently and reports their outcomes,
//! with graceful shutdown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::poller::{duration_millis, ClaimedSlot, PollerConfig, PollerError, TaskPoller, Wake};
use crate::engine::EngineClock;
use crate::persistence::{ClaimedTask, StoreError, TaskFailureOutcome, WorkflowEventStore};
use crate::step::{Step, StepContext, StepError};

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Unique worker ID (generated if not provided)
    pub worker_id: String,

    /// Step types this worker handles; empty means every registered type
    pub step_types: Vec<String>,

    /// Maximum concurrent step executions
    pub max_concurrency: usize,

    /// Poller configuration
    pub poller: PollerConfig,

    /// Graceful shutdown timeout
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            step_types: vec![],
            max_concurrency: 10,
            poller: PollerConfig::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    /// Create a new worker pool configuration
    pub fn new(step_types: Vec<String>) -> Self {
        Self {
            step_types,
            ..Default::default()
        }
    }

    /// Set the worker ID
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    /// Set maximum concurrency
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }

    /// Set poller configuration
    pub fn with_poller(mut self, config: PollerConfig) -> Self {
        self.poller = config;
        self
    }

    /// Set shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Worker pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPoolStatus {
    /// Worker is running and accepting tasks
    Running,
    /// Worker is draining (completing current tasks, not accepting new ones)
    Draining,
    /// Worker has stopped
    Stopped,
}

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Poller error
    #[error("poller error: {0}")]
    Poller(#[from] PollerError),

    /// Worker already running
    #[error("worker pool is already running")]
    AlreadyRunning,

    /// Shutdown timeout
    #[error("graceful shutdown timed out")]
    ShutdownTimeout,

    /// Step handler not found
    #[error("no handler registered for step type: {0}")]
    HandlerNotFound(String),
}

/// Receives the final outcome of every step attempt that counts
///
/// Implemented by the engine. A completion is reported before the task is
/// marked complete, so an outcome is never dropped between the two.
#[async_trait]
pub trait StepOutcomeSink: Send + Sync + 'static {
    /// A step attempt succeeded
    async fn step_completed(
        &self,
        task: &ClaimedTask,
        result: serde_json::Value,
    ) -> anyhow::Result<()>;

    /// A step failed with no retries left
    async fn step_failed(&self, task: &ClaimedTask, error: StepError) -> anyhow::Result<()>;
}

/// Step execution result
pub type StepResult = Result<serde_json::Value, StepError>;

/// Type-erased step handler
pub type StepHandler =
    Arc<dyn Fn(StepContext, serde_json::Value) -> BoxFuture<'static, StepResult> + Send + Sync>;

/// Handlers by step type
#[derive(Clone, Default)]
pub struct StepRegistry {
    handlers: HashMap<String, StepHandler>,
}

impl StepRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed step under `St::TYPE`
    pub fn register<St: Step>(&mut self, step: St) {
        let step = Arc::new(step);
        let handler: StepHandler = Arc::new(move |ctx, input| {
            let step = step.clone();
            async move {
                let input: St::Input = serde_json::from_value(input).map_err(|err| {
                    StepError::non_retryable(format!("invalid input for {}: {err}", St::TYPE))
                        .with_type("INVALID_INPUT")
                })?;
                let output = step.execute(&ctx, input).await?;
                serde_json::to_value(output).map_err(|err| {
                    StepError::non_retryable(format!("invalid output from {}: {err}", St::TYPE))
                        .with_type("INVALID_OUTPUT")
                })
            }
            .boxed()
        });
        self.handlers.insert(St::TYPE.to_string(), handler);
    }

    /// Register a closure as the handler for `step_type`
    pub fn register_fn<F, Fut>(&mut self, step_type: &str, handler: F)
    where
        F: Fn(StepContext, serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = StepResult> + Send + 'static,
    {
        let handler: StepHandler = Arc::new(move |ctx, input| handler(ctx, input).boxed());
        self.handlers.insert(step_type.to_string(), handler);
    }

    /// Handler for a step type
    pub fn get(&self, step_type: &str) -> Option<StepHandler> {
        self.handlers.get(step_type).cloned()
    }

    /// Registered step types, sorted
    pub fn step_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepRegistry")
            .field("step_types", &self.step_types())
            .finish()
    }
}

/// Everything a spawned step execution needs
#[derive(Clone)]
struct ExecutionContext {
    store: Arc<dyn WorkflowEventStore>,
    sink: Arc<dyn StepOutcomeSink>,
    clock: EngineClock,
    cancellation: CancellationToken,
}

/// Worker pool for executing steps
///
/// # Example
///
/// ```ignore
/// use reelflow_durable::worker::{StepRegistry, WorkerPool, WorkerPoolConfig};
///
/// let mut steps = StepRegistry::new();
/// steps.register(TranscodeStep::new(processor));
///
/// let config = WorkerPoolConfig::default().with_max_concurrency(10);
/// let pool = WorkerPool::new(store, Arc::new(engine.clone()), steps, config)
///     .with_clock(engine.clock());
///
/// pool.start()?;
///
/// // ... later, graceful shutdown
/// pool.shutdown().await?;
/// ```
pub struct WorkerPool {
    store: Arc<dyn WorkflowEventStore>,
    sink: Arc<dyn StepOutcomeSink>,
    steps: StepRegistry,
    config: WorkerPoolConfig,
    clock: EngineClock,
    shutdown_tx: watch::Sender<bool>,
    cancellation: CancellationToken,
    status: RwLock<WorkerPoolStatus>,
    active_tasks: Arc<Semaphore>,
    poll_handle: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Create a new worker pool
    pub fn new(
        store: Arc<dyn WorkflowEventStore>,
        sink: Arc<dyn StepOutcomeSink>,
        steps: StepRegistry,
        config: WorkerPoolConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let active_tasks = Arc::new(Semaphore::new(config.max_concurrency));

        Self {
            store,
            sink,
            steps,
            config,
            clock: EngineClock::new(),
            shutdown_tx,
            cancellation: CancellationToken::new(),
            status: RwLock::new(WorkerPoolStatus::Stopped),
            active_tasks,
            poll_handle: Mutex::new(None),
        }
    }

    /// Share the engine's clock so retry delays line up with engine time
    pub fn with_clock(mut self, clock: EngineClock) -> Self {
        self.clock = clock;
        self
    }

    /// Start the worker pool
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub fn start(&self) -> Result<(), WorkerPoolError> {
        if *self.status.read() != WorkerPoolStatus::Stopped {
            return Err(WorkerPoolError::AlreadyRunning);
        }

        let step_types = if self.config.step_types.is_empty() {
            self.steps.step_types()
        } else {
            self.config.step_types.clone()
        };
        if let Some(missing) = step_types.iter().find(|t| self.steps.get(t).is_none()) {
            return Err(WorkerPoolError::HandlerNotFound(missing.clone()));
        }

        info!(
            worker_id = %self.config.worker_id,
            step_types = ?step_types,
            max_concurrency = self.config.max_concurrency,
            "starting worker pool"
        );

        // Fresh signal so a stopped pool can be restarted
        self.shutdown_tx.send_replace(false);
        *self.status.write() = WorkerPoolStatus::Running;
        self.start_poll_loop(step_types);

        Ok(())
    }

    /// Shutdown the worker pool gracefully
    ///
    /// Running steps observe cancellation through their `StepContext`.
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn shutdown(&self) -> Result<(), WorkerPoolError> {
        if *self.status.read() == WorkerPoolStatus::Stopped {
            return Ok(());
        }

        info!(worker_id = %self.config.worker_id, "initiating graceful shutdown");

        *self.status.write() = WorkerPoolStatus::Draining;
        self.shutdown_tx.send_replace(true);
        self.cancellation.cancel();

        let poll_handle = self.poll_handle.lock().take();
        if let Some(handle) = poll_handle {
            if let Err(err) = handle.await {
                warn!(error = %err, "poll loop ended abnormally");
            }
        }

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        loop {
            let available = self.active_tasks.available_permits();
            if available == self.config.max_concurrency {
                debug!("all steps finished");
                break;
            }

            if tokio::time::Instant::now() >= deadline {
                warn!(
                    remaining_tasks = self.config.max_concurrency - available,
                    "shutdown timeout reached"
                );
                return Err(WorkerPoolError::ShutdownTimeout);
            }

            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        *self.status.write() = WorkerPoolStatus::Stopped;
        info!(worker_id = %self.config.worker_id, "worker pool stopped");
        Ok(())
    }

    /// Get current status
    pub fn status(&self) -> WorkerPoolStatus {
        *self.status.read()
    }

    /// Number of steps executing right now
    pub fn current_load(&self) -> usize {
        self.config.max_concurrency - self.active_tasks.available_permits()
    }

    /// Get the worker ID
    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    fn start_poll_loop(&self, step_types: Vec<String>) {
        let steps = self.steps.clone();
        let execution = ExecutionContext {
            store: Arc::clone(&self.store),
            sink: Arc::clone(&self.sink),
            clock: self.clock,
            cancellation: self.cancellation.clone(),
        };
        let mut poller = TaskPoller::new(
            Arc::clone(&self.store),
            self.clock,
            self.config.worker_id.clone(),
            step_types,
            self.config.poller.clone(),
            Arc::clone(&self.active_tasks),
            self.shutdown_tx.subscribe(),
        );

        let handle = tokio::spawn(async move {
            loop {
                match poller.claim().await {
                    Ok(claimed) => {
                        for ClaimedSlot { task, permit } in claimed {
                            let handler = steps.get(&task.step_type);
                            let execution = execution.clone();
                            tokio::spawn(async move {
                                execute_task(execution, handler, task).await;
                                drop(permit);
                            });
                        }
                    }
                    Err(err) => {
                        error!(error = %err, "claim failed");
                    }
                }

                if poller.wait().await == Wake::Shutdown {
                    break;
                }
            }

            debug!("poll loop exited");
        });

        *self.poll_handle.lock() = Some(handle);
    }
}

/// Run one attempt and report its outcome
async fn execute_task(
    execution: ExecutionContext,
    handler: Option<StepHandler>,
    task: ClaimedTask,
) {
    let task_id = task.id;
    let timeout = task.options.start_to_close_timeout;
    debug!(
        %task_id,
        workflow_id = %task.workflow_id,
        step_id = %task.step_id,
        attempt = task.attempt,
        "executing step"
    );

    let result = match handler {
        Some(handler) => {
            let ctx = StepContext::for_task(&task, execution.cancellation.child_token());
            match tokio::time::timeout(timeout, handler(ctx, task.input.clone())).await {
                Ok(result) => result,
                Err(_) => Err(StepError::retryable(format!(
                    "step {} timed out after {}ms",
                    task.step_id,
                    timeout.as_millis()
                ))
                .with_type("TIMEOUT")),
            }
        }
        None => Err(StepError::non_retryable(format!(
            "no handler registered for step type: {}",
            task.step_type
        ))
        .with_type("HANDLER_NOT_FOUND")),
    };

    match result {
        Ok(output) => {
            if let Err(err) = execution.sink.step_completed(&task, output).await {
                // The task stays claimed; recovery reports it as lost
                error!(%task_id, error = %err, "failed to report step completion");
                return;
            }
            if let Err(err) = execution.store.complete_task(task_id).await {
                error!(%task_id, error = %err, "failed to complete task");
            }
        }
        Err(step_error) => {
            let outcome = execution
                .store
                .fail_task(task_id, &step_error, execution.clock.now())
                .await;
            match outcome {
                Ok(TaskFailureOutcome::WillRetry {
                    next_attempt,
                    delay,
                }) => {
                    warn!(
                        %task_id,
                        step_id = %task.step_id,
                        attempt = task.attempt,
                        next_attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %step_error,
                        "step failed, retrying"
                    );
                }
                Ok(TaskFailureOutcome::Exhausted { attempts }) => {
                    warn!(
                        %task_id,
                        step_id = %task.step_id,
                        attempts,
                        error = %step_error,
                        "step failed, no retries left"
                    );
                    let step_error = step_error.with_attempts(attempts);
                    if let Err(err) = execution.sink.step_failed(&task, step_error).await {
                        error!(%task_id, error = %err, "failed to report step failure");
                    }
                }
                Err(err) => {
                    error!(%task_id, error = %err, "failed to fail task");
                }
            }
        }
    }
}
