use reelflow_durable::prelude::*;
use serde_json::{json, Value};

use super::{complete_with, decode, encode, or_fail};
use crate::models::{TranscodeInput, TranscodeProfile, TranscodeRequest, TranscodedAsset};

const PROFILES: &str = "profiles";

/// Transcodes a video into every configured profile in parallel
///
/// Completes with the renditions in profile order, whatever order the
/// transcodes finished in.
pub struct TranscodeWorkflow {
    input: TranscodeInput,
    renditions: FanIn<TranscodedAsset>,
}

impl TranscodeWorkflow {
    fn fan_out(&mut self, profiles: Value) -> Result<Vec<WorkflowAction>, WorkflowError> {
        let profiles: Vec<TranscodeProfile> = decode("transcode profiles", profiles)?;
        if profiles.is_empty() {
            return Err(WorkflowError::new("no transcode profiles configured")
                .with_code("NO_PROFILES"));
        }

        let mut actions = Vec::with_capacity(profiles.len());
        for profile in profiles {
            let step_id = format!("transcode-{}", profile.bitrate);
            if self.renditions.contains(&step_id) {
                continue;
            }
            self.renditions.expect(step_id.clone());

            let request = TranscodeRequest {
                input_location: self.input.video_location.clone(),
                profile,
            };
            actions.push(WorkflowAction::schedule_step(
                step_id,
                "transcode_video",
                encode(&request)?,
            ));
        }
        Ok(actions)
    }

    fn collect(&mut self, step_id: &str, result: Value) -> Result<Vec<WorkflowAction>, WorkflowError> {
        let asset: TranscodedAsset = decode("transcoded asset", result)?;
        self.renditions.resolve(step_id, asset);

        if !self.renditions.is_complete() {
            return Ok(vec![]);
        }
        let assets: Vec<TranscodedAsset> = std::mem::take(&mut self.renditions)
            .into_results()
            .into_iter()
            .map(|(_, asset)| asset)
            .collect();
        Ok(vec![complete_with(&assets)])
    }
}

impl Workflow for TranscodeWorkflow {
    const TYPE: &'static str = "transcode";
    type Input = TranscodeInput;
    type Output = Vec<TranscodedAsset>;

    fn new(input: Self::Input) -> Self {
        Self {
            input,
            renditions: FanIn::new(),
        }
    }

    fn on_start(&mut self, _ctx: &WorkflowContext) -> Vec<WorkflowAction> {
        vec![WorkflowAction::schedule_step(
            PROFILES,
            "get_transcode_profiles",
            json!({ "video_location": self.input.video_location }),
        )]
    }

    fn on_step_completed(
        &mut self,
        _ctx: &WorkflowContext,
        step_id: &str,
        result: Value,
    ) -> Vec<WorkflowAction> {
        if step_id == PROFILES {
            return or_fail(self.fan_out(result));
        }
        if self.renditions.contains(step_id) {
            return or_fail(self.collect(step_id, result));
        }
        vec![]
    }

    fn on_step_failed(
        &mut self,
        _ctx: &WorkflowContext,
        step_id: &str,
        error: &StepError,
    ) -> Vec<WorkflowAction> {
        let mut failure = WorkflowError::from(error);
        failure.message = format!("{step_id} failed: {}", error.message);
        vec![WorkflowAction::fail(failure)]
    }
}
