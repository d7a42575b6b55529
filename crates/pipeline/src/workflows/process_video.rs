use reelflow_durable::prelude::*;
use serde_json::{json, Value};

use super::{decode, encode, ApprovalWorkflow, TranscodeWorkflow};
use crate::models::{
    ApprovalInput, ApprovalOutcome, ProcessVideoInput, ProcessVideoResult, TranscodeInput,
    TranscodedAsset,
};

const TRANSCODE: &str = "transcode";
const THUMBNAIL: &str = "thumbnail";
const INTRO: &str = "intro";
const APPROVAL: &str = "approval";
const PUBLISH: &str = "publish";
const REJECT: &str = "reject";
const CLEANUP: &str = "cleanup";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Transcoding,
    ExtractingThumbnail,
    PrependingIntro,
    AwaitingApproval,
    Finishing(ApprovalOutcome),
    CleaningUp,
}

/// The video pipeline
///
/// transcode (sub-workflow) → thumbnail (retried) → intro → approval
/// (sub-workflow) → publish or reject. Any failure runs a single cleanup
/// attempt and then fails the instance with the original reason.
pub struct ProcessVideoWorkflow {
    input: ProcessVideoInput,
    stage: Stage,
    assets: Vec<TranscodedAsset>,
    transcoded_location: String,
    thumbnail_location: String,
    with_intro_location: String,
    failure: Option<WorkflowError>,
}

impl ProcessVideoWorkflow {
    fn select_rendition(&mut self, result: Value) -> Result<Vec<WorkflowAction>, WorkflowError> {
        self.assets = decode("transcode result", result)?;
        let selected = self
            .assets
            .iter()
            .filter(|asset| asset.is_mp4())
            .max_by_key(|asset| asset.bitrate)
            .ok_or_else(|| {
                WorkflowError::new("transcoding produced no mp4 rendition").with_code("NO_MP4_ASSET")
            })?;
        self.transcoded_location = selected.location.clone();
        self.stage = Stage::ExtractingThumbnail;

        let options = StepOptions::default().with_retry(self.input.thumbnail_retry.clone());
        Ok(vec![WorkflowAction::schedule_step_with(
            THUMBNAIL,
            "extract_thumbnail",
            json!(self.transcoded_location),
            options,
        )])
    }

    fn prepend_intro(&mut self, result: Value) -> Result<Vec<WorkflowAction>, WorkflowError> {
        self.thumbnail_location = decode("thumbnail location", result)?;
        self.stage = Stage::PrependingIntro;

        Ok(vec![WorkflowAction::schedule_step(
            INTRO,
            "prepend_intro",
            json!(self.transcoded_location),
        )])
    }

    fn request_approval(&mut self, result: Value) -> Result<Vec<WorkflowAction>, WorkflowError> {
        self.with_intro_location = decode("intro location", result)?;
        self.stage = Stage::AwaitingApproval;

        let input = ApprovalInput {
            video_location: self.with_intro_location.clone(),
            timeout_seconds: self.input.approval_timeout_seconds,
        };
        Ok(vec![WorkflowAction::sub_workflow(
            APPROVAL,
            ApprovalWorkflow::TYPE,
            encode(&input)?,
        )])
    }

    fn act_on_decision(&mut self, result: Value) -> Result<Vec<WorkflowAction>, WorkflowError> {
        let outcome: ApprovalOutcome = decode("approval outcome", result)?;
        self.stage = Stage::Finishing(outcome);

        let (step_id, step_type) = match outcome {
            ApprovalOutcome::Approved => (PUBLISH, "publish_video"),
            ApprovalOutcome::Rejected | ApprovalOutcome::TimedOut => (REJECT, "reject_video"),
        };
        Ok(vec![WorkflowAction::schedule_step(
            step_id,
            step_type,
            json!(self.files()),
        )])
    }

    fn finish(&self, outcome: ApprovalOutcome) -> Result<Vec<WorkflowAction>, WorkflowError> {
        let result = ProcessVideoResult {
            status: outcome.final_status().to_string(),
            outcome,
            transcoded_location: self.transcoded_location.clone(),
            thumbnail_location: self.thumbnail_location.clone(),
            with_intro_location: self.with_intro_location.clone(),
            assets: self.assets.clone(),
        };
        Ok(vec![WorkflowAction::complete(encode(&result)?)])
    }

    fn files(&self) -> Vec<String> {
        [
            &self.transcoded_location,
            &self.thumbnail_location,
            &self.with_intro_location,
        ]
        .into_iter()
        .filter(|location| !location.is_empty())
        .cloned()
        .collect()
    }

    /// Record `reason` and run the compensating cleanup once
    fn clean_up(&mut self, reason: WorkflowError) -> Vec<WorkflowAction> {
        if self.stage == Stage::CleaningUp {
            return vec![];
        }
        self.stage = Stage::CleaningUp;
        self.failure = Some(reason);

        vec![WorkflowAction::schedule_step(
            CLEANUP,
            "cleanup",
            json!(self.input.video_location),
        )]
    }

    fn fail_after_cleanup(&mut self) -> Vec<WorkflowAction> {
        let reason = self
            .failure
            .take()
            .unwrap_or_else(|| WorkflowError::new("Failed to process video"));
        vec![WorkflowAction::fail(reason)]
    }

    fn or_clean_up(
        &mut self,
        actions: Result<Vec<WorkflowAction>, WorkflowError>,
    ) -> Vec<WorkflowAction> {
        match actions {
            Ok(actions) => actions,
            Err(error) => {
                let reason = WorkflowError {
                    message: format!("Failed to process video: {}", error.message),
                    ..error
                };
                self.clean_up(reason)
            }
        }
    }
}

impl Workflow for ProcessVideoWorkflow {
    const TYPE: &'static str = "process_video";
    type Input = ProcessVideoInput;
    type Output = ProcessVideoResult;

    fn new(input: Self::Input) -> Self {
        Self {
            input,
            stage: Stage::Transcoding,
            assets: Vec::new(),
            transcoded_location: String::new(),
            thumbnail_location: String::new(),
            with_intro_location: String::new(),
            failure: None,
        }
    }

    fn on_start(&mut self, _ctx: &WorkflowContext) -> Vec<WorkflowAction> {
        let input = TranscodeInput {
            video_location: self.input.video_location.clone(),
        };
        let actions = encode(&input)
            .map(|input| vec![WorkflowAction::sub_workflow(TRANSCODE, TranscodeWorkflow::TYPE, input)]);
        self.or_clean_up(actions)
    }

    fn on_step_completed(
        &mut self,
        _ctx: &WorkflowContext,
        step_id: &str,
        result: Value,
    ) -> Vec<WorkflowAction> {
        let actions = match (step_id, self.stage) {
            (THUMBNAIL, Stage::ExtractingThumbnail) => self.prepend_intro(result),
            (INTRO, Stage::PrependingIntro) => self.request_approval(result),
            (PUBLISH | REJECT, Stage::Finishing(outcome)) => self.finish(outcome),
            (CLEANUP, _) => return self.fail_after_cleanup(),
            _ => return vec![],
        };
        self.or_clean_up(actions)
    }

    fn on_step_failed(
        &mut self,
        _ctx: &WorkflowContext,
        step_id: &str,
        error: &StepError,
    ) -> Vec<WorkflowAction> {
        if step_id == CLEANUP {
            return self.fail_after_cleanup();
        }
        let reason = WorkflowError::new(format!(
            "Failed to process video: {step_id} failed after {} attempt(s): {}",
            error.attempts, error.message
        ))
        .with_code(error.error_type.as_deref().unwrap_or("STEP_FAILED"));
        self.clean_up(reason)
    }

    fn on_sub_workflow_completed(
        &mut self,
        _ctx: &WorkflowContext,
        step_id: &str,
        result: Value,
    ) -> Vec<WorkflowAction> {
        let actions = match (step_id, self.stage) {
            (TRANSCODE, Stage::Transcoding) => self.select_rendition(result),
            (APPROVAL, Stage::AwaitingApproval) => self.act_on_decision(result),
            _ => return vec![],
        };
        self.or_clean_up(actions)
    }

    fn on_sub_workflow_failed(
        &mut self,
        _ctx: &WorkflowContext,
        step_id: &str,
        error: &WorkflowError,
    ) -> Vec<WorkflowAction> {
        let mut reason = WorkflowError::new(format!(
            "Failed to process video: {step_id} failed: {}",
            error.message
        ));
        reason.code = error.code.clone();
        self.clean_up(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn ctx() -> WorkflowContext {
        WorkflowContext::new(Uuid::now_v7(), 0, 1, Utc::now(), false)
    }

    fn assets() -> Value {
        json!([
            { "bitrate": 1000, "location": "video-1000.mp4", "output_extension": ".mp4" },
            { "bitrate": 4000, "location": "video-4000.mp4", "output_extension": ".mp4" },
            { "bitrate": 8000, "location": "video-8000.webm", "output_extension": ".webm" }
        ])
    }

    fn step_type(actions: &[WorkflowAction]) -> &str {
        match actions {
            [WorkflowAction::ScheduleStep { step_type, .. }] => step_type.as_str(),
            other => panic!("unexpected actions {other:?}"),
        }
    }

    #[test]
    fn test_selects_highest_mp4_rendition() {
        let mut wf = ProcessVideoWorkflow::new(ProcessVideoInput::new("video.mp4"));
        wf.on_start(&ctx());

        let actions = wf.on_sub_workflow_completed(&ctx(), TRANSCODE, assets());
        match &actions[..] {
            [WorkflowAction::ScheduleStep {
                step_type,
                input,
                options,
                ..
            }] => {
                assert_eq!(step_type, "extract_thumbnail");
                assert_eq!(input, &json!("video-4000.mp4"));
                assert_eq!(options.retry_policy.max_attempts(), 5);
            }
            other => panic!("unexpected actions {other:?}"),
        }
    }

    #[test]
    fn test_timed_out_approval_rejects() {
        let mut wf = ProcessVideoWorkflow::new(ProcessVideoInput::new("video.mp4"));
        wf.on_start(&ctx());
        wf.on_sub_workflow_completed(&ctx(), TRANSCODE, assets());
        wf.on_step_completed(&ctx(), THUMBNAIL, json!("thumb.jpg"));
        wf.on_step_completed(&ctx(), INTRO, json!("intro.mp4"));

        let actions = wf.on_sub_workflow_completed(&ctx(), APPROVAL, json!("TimedOut"));
        assert_eq!(step_type(&actions), "reject_video");

        match &wf.on_step_completed(&ctx(), REJECT, Value::Null)[..] {
            [WorkflowAction::CompleteWorkflow { result }] => {
                assert_eq!(result["status"], "Timed out");
                assert_eq!(result["outcome"], "TimedOut");
            }
            other => panic!("unexpected actions {other:?}"),
        }
    }

    #[test]
    fn test_step_failure_cleans_up_then_fails() {
        let mut wf = ProcessVideoWorkflow::new(ProcessVideoInput::new("error.mp4"));
        wf.on_start(&ctx());
        wf.on_sub_workflow_completed(&ctx(), TRANSCODE, assets());

        let error = StepError::retryable("tool crashed")
            .with_type("THUMBNAIL_FAILED")
            .with_attempts(5);
        let actions = wf.on_step_failed(&ctx(), THUMBNAIL, &error);
        assert_eq!(step_type(&actions), "cleanup");

        match &wf.on_step_completed(&ctx(), CLEANUP, Value::Null)[..] {
            [WorkflowAction::FailWorkflow { error }] => {
                assert_eq!(error.code.as_deref(), Some("THUMBNAIL_FAILED"));
                assert!(error.message.starts_with("Failed to process video"));
                assert!(error.message.contains("5 attempt(s)"));
            }
            other => panic!("unexpected actions {other:?}"),
        }
    }

    #[test]
    fn test_missing_mp4_rendition_cleans_up() {
        let mut wf = ProcessVideoWorkflow::new(ProcessVideoInput::new("video.mov"));
        wf.on_start(&ctx());

        let actions = wf.on_sub_workflow_completed(
            &ctx(),
            TRANSCODE,
            json!([{ "bitrate": 1000, "location": "v.webm", "output_extension": ".webm" }]),
        );
        assert_eq!(step_type(&actions), "cleanup");

        let actions = wf.on_step_failed(
            &ctx(),
            CLEANUP,
            &StepError::non_retryable("disk offline"),
        );
        assert!(matches!(
            &actions[..],
            [WorkflowAction::FailWorkflow { error }] if error.code.as_deref() == Some("NO_MP4_ASSET")
        ));
    }
}
