// Pipeline steps
//
// Each step is a thin adapter from a workflow-scheduled task to one
// collaborator call. All I/O of the pipeline happens here.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reelflow_durable::prelude::*;
use reelflow_durable::{generate_correlation_code, CorrelationRecord};

use crate::config::PipelineConfig;
use crate::models::{
    ApprovalRequest, ApprovalTicket, PeriodicTick, ProfilesRequest, TranscodeProfile,
    TranscodeRequest, TranscodedAsset,
};
use crate::notifier::{ApprovalNotice, ApprovalNotifier};
use crate::processor::VideoProcessor;

/// Attempts at finding an unused correlation code
const CODE_ATTEMPTS: usize = 5;

fn tool_error(error_type: &str, err: anyhow::Error) -> StepError {
    StepError::from(err).with_type(error_type)
}

/// Returns the configured renditions
pub struct GetTranscodeProfilesStep {
    profiles: Vec<TranscodeProfile>,
}

impl GetTranscodeProfilesStep {
    pub fn new(profiles: Vec<TranscodeProfile>) -> Self {
        Self { profiles }
    }
}

#[async_trait]
impl Step for GetTranscodeProfilesStep {
    const TYPE: &'static str = "get_transcode_profiles";
    type Input = ProfilesRequest;
    type Output = Vec<TranscodeProfile>;

    async fn execute(
        &self,
        _ctx: &StepContext,
        input: Self::Input,
    ) -> Result<Self::Output, StepError> {
        tracing::debug!(
            video = %input.video_location,
            profiles = self.profiles.len(),
            "resolved transcode profiles"
        );
        Ok(self.profiles.clone())
    }
}

pub struct TranscodeVideoStep {
    processor: Arc<dyn VideoProcessor>,
}

impl TranscodeVideoStep {
    pub fn new(processor: Arc<dyn VideoProcessor>) -> Self {
        Self { processor }
    }
}

#[async_trait]
impl Step for TranscodeVideoStep {
    const TYPE: &'static str = "transcode_video";
    type Input = TranscodeRequest;
    type Output = TranscodedAsset;

    async fn execute(
        &self,
        _ctx: &StepContext,
        input: Self::Input,
    ) -> Result<Self::Output, StepError> {
        self.processor
            .transcode(&input)
            .await
            .map_err(|err| tool_error("TRANSCODE_FAILED", err))
    }
}

/// Thumbnail extraction; the tool fails intermittently
pub struct ExtractThumbnailStep {
    processor: Arc<dyn VideoProcessor>,
}

impl ExtractThumbnailStep {
    pub fn new(processor: Arc<dyn VideoProcessor>) -> Self {
        Self { processor }
    }
}

#[async_trait]
impl Step for ExtractThumbnailStep {
    const TYPE: &'static str = "extract_thumbnail";
    type Input = String;
    type Output = String;

    async fn execute(&self, ctx: &StepContext, location: String) -> Result<String, StepError> {
        match self.processor.extract_thumbnail(&location).await {
            Ok(thumbnail) => Ok(thumbnail),
            Err(err) => {
                tracing::warn!(
                    workflow_id = %ctx.workflow_id,
                    attempt = ctx.attempt,
                    max_attempts = ctx.max_attempts,
                    error = %err,
                    "thumbnail extraction failed"
                );
                Err(tool_error("THUMBNAIL_FAILED", err))
            }
        }
    }
}

pub struct PrependIntroStep {
    processor: Arc<dyn VideoProcessor>,
    intro_location: String,
}

impl PrependIntroStep {
    pub fn new(processor: Arc<dyn VideoProcessor>, intro_location: impl Into<String>) -> Self {
        Self {
            processor,
            intro_location: intro_location.into(),
        }
    }
}

#[async_trait]
impl Step for PrependIntroStep {
    const TYPE: &'static str = "prepend_intro";
    type Input = String;
    type Output = String;

    async fn execute(&self, _ctx: &StepContext, location: String) -> Result<String, StepError> {
        self.processor
            .prepend_intro(&location, &self.intro_location)
            .await
            .map_err(|err| tool_error("INTRO_FAILED", err))
    }
}

/// Registers a correlation code and notifies the approver
pub struct SendApprovalRequestStep {
    store: Arc<dyn WorkflowEventStore>,
    notifier: Arc<dyn ApprovalNotifier>,
    public_base_url: String,
    default_timeout: Duration,
}

impl SendApprovalRequestStep {
    pub fn new(
        store: Arc<dyn WorkflowEventStore>,
        notifier: Arc<dyn ApprovalNotifier>,
        public_base_url: impl Into<String>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            store,
            notifier,
            public_base_url: public_base_url.into(),
            default_timeout,
        }
    }

    async fn register_code(&self, request: &ApprovalRequest) -> Result<String, StepError> {
        for _ in 0..CODE_ATTEMPTS {
            let record = CorrelationRecord {
                code: generate_correlation_code(),
                workflow_id: request.instance_id,
                created_at: Utc::now(),
            };
            let code = record.code.clone();
            match self.store.insert_correlation(record).await {
                Ok(()) => return Ok(code),
                Err(StoreError::DuplicateCorrelationCode(_)) => continue,
                Err(err) => return Err(StepError::retryable(err.to_string())),
            }
        }
        Err(StepError::retryable("no unused correlation code found").with_type("CODE_EXHAUSTED"))
    }
}

#[async_trait]
impl Step for SendApprovalRequestStep {
    const TYPE: &'static str = "send_approval_request";
    type Input = ApprovalRequest;
    type Output = ApprovalTicket;

    async fn execute(
        &self,
        _ctx: &StepContext,
        request: Self::Input,
    ) -> Result<Self::Output, StepError> {
        let timeout_seconds = request
            .timeout_seconds
            .unwrap_or(self.default_timeout.as_secs());
        let code = self.register_code(&request).await?;

        let approval_url = format!("{}/api/approvals/{}", self.public_base_url, code);
        let notice = ApprovalNotice {
            code: code.clone(),
            instance_id: request.instance_id,
            video_location: request.video_location.clone(),
            approve_url: format!("{approval_url}?result=Approved"),
            reject_url: format!("{approval_url}?result=Rejected"),
            timeout_seconds,
        };
        self.notifier
            .request_approval(&notice)
            .await
            .map_err(|err| tool_error("NOTIFY_FAILED", err))?;

        Ok(ApprovalTicket {
            code,
            timeout_seconds,
        })
    }
}

pub struct PublishVideoStep {
    processor: Arc<dyn VideoProcessor>,
}

impl PublishVideoStep {
    pub fn new(processor: Arc<dyn VideoProcessor>) -> Self {
        Self { processor }
    }
}

#[async_trait]
impl Step for PublishVideoStep {
    const TYPE: &'static str = "publish_video";
    type Input = Vec<String>;
    type Output = ();

    async fn execute(&self, _ctx: &StepContext, locations: Vec<String>) -> Result<(), StepError> {
        self.processor
            .publish(&locations)
            .await
            .map_err(|err| tool_error("PUBLISH_FAILED", err))
    }
}

pub struct RejectVideoStep {
    processor: Arc<dyn VideoProcessor>,
}

impl RejectVideoStep {
    pub fn new(processor: Arc<dyn VideoProcessor>) -> Self {
        Self { processor }
    }
}

#[async_trait]
impl Step for RejectVideoStep {
    const TYPE: &'static str = "reject_video";
    type Input = Vec<String>;
    type Output = ();

    async fn execute(&self, _ctx: &StepContext, locations: Vec<String>) -> Result<(), StepError> {
        self.processor
            .reject(&locations)
            .await
            .map_err(|err| tool_error("REJECT_FAILED", err))
    }
}

/// Compensation after a failed run; never retried
pub struct CleanupStep {
    processor: Arc<dyn VideoProcessor>,
}

impl CleanupStep {
    pub fn new(processor: Arc<dyn VideoProcessor>) -> Self {
        Self { processor }
    }
}

#[async_trait]
impl Step for CleanupStep {
    const TYPE: &'static str = "cleanup";
    type Input = String;
    type Output = ();

    async fn execute(&self, _ctx: &StepContext, location: String) -> Result<(), StepError> {
        self.processor
            .cleanup(&location)
            .await
            .map_err(|err| StepError::non_retryable(format!("{err:#}")).with_type("CLEANUP_FAILED"))
    }
}

/// The unit of work of the periodic loop
pub struct PeriodicTickStep;

#[async_trait]
impl Step for PeriodicTickStep {
    const TYPE: &'static str = "periodic_tick";
    type Input = PeriodicTick;
    type Output = PeriodicTick;

    async fn execute(
        &self,
        ctx: &StepContext,
        tick: Self::Input,
    ) -> Result<Self::Output, StepError> {
        tracing::info!(
            workflow_id = %ctx.workflow_id,
            generation = ctx.generation,
            iteration = tick.iteration,
            "periodic tick"
        );
        Ok(tick)
    }
}

/// Every pipeline step, wired to its collaborators
pub fn pipeline_steps(
    config: &PipelineConfig,
    store: Arc<dyn WorkflowEventStore>,
    processor: Arc<dyn VideoProcessor>,
    notifier: Arc<dyn ApprovalNotifier>,
) -> StepRegistry {
    let mut steps = StepRegistry::new();
    steps.register(GetTranscodeProfilesStep::new(config.transcode_profiles()));
    steps.register(TranscodeVideoStep::new(processor.clone()));
    steps.register(ExtractThumbnailStep::new(processor.clone()));
    steps.register(PrependIntroStep::new(
        processor.clone(),
        config.intro_location.clone(),
    ));
    steps.register(SendApprovalRequestStep::new(
        store,
        notifier,
        config.public_base_url.clone(),
        config.approval_timeout,
    ));
    steps.register(PublishVideoStep::new(processor.clone()));
    steps.register(RejectVideoStep::new(processor.clone()));
    steps.register(CleanupStep::new(processor));
    steps.register(PeriodicTickStep);
    steps
}
