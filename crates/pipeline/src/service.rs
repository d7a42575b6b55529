// Public entry points of the video pipeline
//
// `VideoPipeline` owns the engine and the worker pool. The HTTP layer is a
// thin mapping onto these methods.

use std::sync::Arc;
use std::time::Duration;

use reelflow_durable::prelude::*;
use reelflow_durable::worker::WorkerPoolStatus;
use reelflow_durable::StepOutcomeSink;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::config::{PipelineConfig, MAX_WAIT};
use crate::models::{
    PeriodicInput, ProcessVideoInput, RaisedEvent, StartedWorkflow, APPROVAL_RESULT_EVENT,
};
use crate::notifier::ApprovalNotifier;
use crate::processor::VideoProcessor;
use crate::steps::pipeline_steps;
use crate::workflows::{pipeline_workflows, PeriodicWorkflow, ProcessVideoWorkflow};

/// Errors from pipeline entry points
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Caller input rejected before anything was started
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Neither a known correlation code nor a known instance id
    #[error("unknown workflow or correlation code: {0}")]
    UnknownTarget(String),

    /// Engine error
    #[error(transparent)]
    Engine(#[from] ExecutorError),

    /// Worker pool error
    #[error("worker pool error: {0}")]
    Worker(#[from] WorkerPoolError),
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        Self::Engine(ExecutorError::from(err))
    }
}

/// Reject waits the engine cannot schedule sensibly
fn check_wait(what: &str, wait: Duration) -> Result<(), PipelineError> {
    if wait.is_zero() {
        return Err(PipelineError::InvalidInput(format!("{what} must be positive")));
    }
    if wait > MAX_WAIT {
        return Err(PipelineError::InvalidInput(format!(
            "{what} must be at most {} seconds",
            MAX_WAIT.as_secs()
        )));
    }
    Ok(())
}

/// The video pipeline service
///
/// # Example
///
/// ```ignore
/// let pipeline = VideoPipeline::new(
///     Arc::new(InMemoryWorkflowEventStore::new()),
///     PipelineConfig::from_env(),
///     Arc::new(MockVideoProcessor::default()),
///     Arc::new(LoggingNotifier),
/// );
/// pipeline.start()?;
///
/// let started = pipeline.start_workflow("uploads/video.mp4").await?;
/// println!("poll {}", started.status_query_url);
/// ```
pub struct VideoPipeline<S: WorkflowEventStore> {
    engine: DurableEngine<S>,
    pool: WorkerPool,
    config: PipelineConfig,
}

impl<S: WorkflowEventStore> VideoPipeline<S> {
    /// Wire the engine, steps and worker pool over `store`
    pub fn new(
        store: Arc<S>,
        config: PipelineConfig,
        processor: Arc<dyn VideoProcessor>,
        notifier: Arc<dyn ApprovalNotifier>,
    ) -> Self {
        let engine = DurableEngine::new(store.clone(), pipeline_workflows());
        let steps = pipeline_steps(&config, store.clone(), processor, notifier);

        let pool_config = WorkerPoolConfig::default()
            .with_worker_id(format!("reelflow-{}", Uuid::now_v7()))
            .with_max_concurrency(config.worker_concurrency);
        let sink: Arc<dyn StepOutcomeSink> = Arc::new(engine.clone());
        let pool = WorkerPool::new(store, sink, steps, pool_config).with_clock(engine.clock());

        Self {
            engine,
            pool,
            config,
        }
    }

    pub fn engine(&self) -> &DurableEngine<S> {
        &self.engine
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn worker_status(&self) -> WorkerPoolStatus {
        self.pool.status()
    }

    /// Start executing steps
    pub fn start(&self) -> Result<(), PipelineError> {
        self.pool.start()?;
        Ok(())
    }

    /// Resume instances left running by a previous process
    pub async fn recover(&self) -> Result<RecoveryReport, PipelineError> {
        Ok(self.engine.recover().await?)
    }

    /// Drain the worker pool and disarm timers
    pub async fn shutdown(&self) -> Result<(), PipelineError> {
        let drained = self.pool.shutdown().await;
        self.engine.shutdown();
        drained?;
        Ok(())
    }

    /// Start processing a video with the configured approval timeout
    pub async fn start_workflow(&self, video_location: &str) -> Result<StartedWorkflow, PipelineError> {
        self.start_workflow_with(video_location, None).await
    }

    /// Start processing a video
    ///
    /// `approval_timeout` overrides the configured default. An empty
    /// location is rejected and no instance is created.
    #[instrument(skip(self))]
    pub async fn start_workflow_with(
        &self,
        video_location: &str,
        approval_timeout: Option<Duration>,
    ) -> Result<StartedWorkflow, PipelineError> {
        let video_location = video_location.trim();
        if video_location.is_empty() {
            return Err(PipelineError::InvalidInput(
                "Please pass a video location".to_string(),
            ));
        }
        if let Some(timeout) = approval_timeout {
            check_wait("approval timeout", timeout)?;
        }

        let mut input = ProcessVideoInput::new(video_location);
        input.thumbnail_retry = self.config.thumbnail_retry_policy();
        input.approval_timeout_seconds = approval_timeout.map(|timeout| timeout.as_secs().max(1));

        let instance_id = self
            .engine
            .start_workflow::<ProcessVideoWorkflow>(input)
            .await?;
        info!(%instance_id, video = %video_location, "video processing started");
        Ok(self.started(instance_id))
    }

    /// Start the periodic loop
    #[instrument(skip(self))]
    pub async fn start_periodic(
        &self,
        interval: Option<Duration>,
        max_iterations: Option<u64>,
    ) -> Result<StartedWorkflow, PipelineError> {
        let interval = interval.unwrap_or(self.config.periodic_interval);
        check_wait("periodic interval", interval)?;

        let input = PeriodicInput {
            iteration: 0,
            interval_seconds: interval.as_secs().max(1),
            max_iterations,
        };
        let instance_id = self.engine.start_workflow::<PeriodicWorkflow>(input).await?;
        info!(%instance_id, "periodic task started");
        Ok(self.started(instance_id))
    }

    /// Raise a named event for a correlation code or an instance id
    #[instrument(skip(self, payload))]
    pub async fn raise_event(
        &self,
        target: &str,
        event_name: &str,
        payload: serde_json::Value,
        generation: Option<u32>,
    ) -> Result<RaisedEvent, PipelineError> {
        if event_name.trim().is_empty() {
            return Err(PipelineError::InvalidInput(
                "event name must not be empty".to_string(),
            ));
        }

        let instance_id = self.resolve_target(target).await?;
        let arrival = self
            .engine
            .raise_event(instance_id, generation, event_name, payload)
            .await?;
        info!(%instance_id, event_name, arrival, "event raised");

        Ok(RaisedEvent {
            instance_id,
            event_name: event_name.to_string(),
            arrival,
        })
    }

    /// Deliver an approval decision for a correlation code
    #[instrument(skip(self))]
    pub async fn submit_approval(&self, code: &str, result: &str) -> Result<RaisedEvent, PipelineError> {
        let record = self
            .engine
            .store()
            .lookup_correlation(code)
            .await?
            .ok_or_else(|| PipelineError::UnknownTarget(code.to_string()))?;

        info!(
            instance_id = %record.workflow_id,
            result,
            "sending approval result"
        );
        self.raise_event(
            &record.workflow_id.to_string(),
            APPROVAL_RESULT_EVENT,
            serde_json::Value::String(result.to_string()),
            None,
        )
        .await
    }

    /// Current snapshot of an instance
    pub async fn get_status(&self, instance_id: Uuid) -> Result<WorkflowInstance, PipelineError> {
        self.engine
            .get_workflow(instance_id)
            .await
            .map_err(|err| match err {
                ExecutorError::WorkflowNotFound(id) => PipelineError::UnknownTarget(id.to_string()),
                other => other.into(),
            })
    }

    /// Wait until an instance completes or fails
    pub async fn wait_for_completion(
        &self,
        instance_id: Uuid,
        timeout: Duration,
    ) -> Result<WorkflowInstance, PipelineError> {
        Ok(self.engine.wait_for_completion(instance_id, timeout).await?)
    }

    async fn resolve_target(&self, target: &str) -> Result<Uuid, PipelineError> {
        let target = target.trim();
        if let Some(record) = self.engine.store().lookup_correlation(target).await? {
            return Ok(record.workflow_id);
        }
        match Uuid::parse_str(target) {
            Ok(instance_id) => match self.engine.get_workflow(instance_id).await {
                Ok(_) => Ok(instance_id),
                Err(ExecutorError::WorkflowNotFound(_)) => {
                    Err(PipelineError::UnknownTarget(target.to_string()))
                }
                Err(err) => Err(err.into()),
            },
            Err(_) => Err(PipelineError::UnknownTarget(target.to_string())),
        }
    }

    fn started(&self, instance_id: Uuid) -> StartedWorkflow {
        StartedWorkflow {
            instance_id,
            status_query_url: self.config.url_for(&format!("/api/workflows/{instance_id}")),
        }
    }
}
