// Pipeline data types
//
// Workflow inputs and outputs, step payloads, and the entry point
// responses. Everything here is serde data recorded in workflow history.

use reelflow_durable::RetryPolicy;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Name of the external event that carries an approval decision
pub const APPROVAL_RESULT_EVENT: &str = "ApprovalResult";

/// One output rendition of the transcode fan-out
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TranscodeProfile {
    pub bitrate: u32,
    pub output_extension: String,
}

impl TranscodeProfile {
    pub fn mp4(bitrate: u32) -> Self {
        Self {
            bitrate,
            output_extension: ".mp4".to_string(),
        }
    }
}

/// Input of the `transcode_video` step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TranscodeRequest {
    pub input_location: String,
    pub profile: TranscodeProfile,
}

/// Output of the `transcode_video` step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TranscodedAsset {
    pub bitrate: u32,
    pub location: String,
    pub output_extension: String,
}

impl TranscodedAsset {
    pub fn is_mp4(&self) -> bool {
        self.output_extension.eq_ignore_ascii_case(".mp4")
    }
}

/// Input of the `get_transcode_profiles` step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProfilesRequest {
    pub video_location: String,
}

/// Input of the `send_approval_request` step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApprovalRequest {
    /// Instance the approval decision is delivered to
    pub instance_id: Uuid,
    pub video_location: String,
    /// Caller override of the configured approval timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

/// Output of the `send_approval_request` step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApprovalTicket {
    /// Short code the approver uses instead of the instance id
    pub code: String,
    pub timeout_seconds: u64,
}

/// How the approval gate ended
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ApprovalOutcome {
    Approved,
    Rejected,
    TimedOut,
}

impl ApprovalOutcome {
    /// Interpret an `ApprovalResult` payload
    ///
    /// Only "Approved" (any case) approves; anything else rejects.
    pub fn from_payload(payload: &serde_json::Value) -> Self {
        let text = match payload {
            serde_json::Value::String(s) => Some(s.as_str()),
            serde_json::Value::Object(map) => map.get("result").and_then(|v| v.as_str()),
            _ => None,
        };
        match text {
            Some(text) if text.trim().eq_ignore_ascii_case("approved") => Self::Approved,
            _ => Self::Rejected,
        }
    }

    /// Final status text of a processed video
    pub fn final_status(&self) -> &'static str {
        match self {
            Self::Approved => "Approved and published",
            Self::Rejected => "Rejected",
            Self::TimedOut => "Timed out",
        }
    }
}

impl std::fmt::Display for ApprovalOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Approved => write!(f, "Approved"),
            Self::Rejected => write!(f, "Rejected"),
            Self::TimedOut => write!(f, "TimedOut"),
        }
    }
}

fn default_thumbnail_retry() -> RetryPolicy {
    RetryPolicy::fixed(std::time::Duration::from_secs(5), 4)
}

/// Input of the `process_video` workflow
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessVideoInput {
    pub video_location: String,
    #[serde(default = "default_thumbnail_retry")]
    pub thumbnail_retry: RetryPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_timeout_seconds: Option<u64>,
}

impl ProcessVideoInput {
    pub fn new(video_location: impl Into<String>) -> Self {
        Self {
            video_location: video_location.into(),
            thumbnail_retry: default_thumbnail_retry(),
            approval_timeout_seconds: None,
        }
    }
}

/// Result of a `process_video` workflow that ran to the end
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessVideoResult {
    pub status: String,
    pub outcome: ApprovalOutcome,
    pub transcoded_location: String,
    pub thumbnail_location: String,
    pub with_intro_location: String,
    pub assets: Vec<TranscodedAsset>,
}

/// Input of the `transcode` sub-workflow
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TranscodeInput {
    pub video_location: String,
}

/// Input of the `approval` sub-workflow
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApprovalInput {
    pub video_location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

/// Input of the `periodic` workflow; carried across generations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeriodicInput {
    /// Completed cycles before this generation
    pub iteration: u64,
    pub interval_seconds: u64,
    /// Stop after this many cycles; run forever when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u64>,
}

/// Payload of the `periodic_tick` step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeriodicTick {
    pub iteration: u64,
}

/// Response of the start entry points
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StartedWorkflow {
    pub instance_id: Uuid,
    /// Where to poll for status
    pub status_query_url: String,
}

/// Acknowledgement of a raised event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RaisedEvent {
    pub instance_id: Uuid,
    pub event_name: String,
    /// Arrival order among the instance's events
    pub arrival: u64,
}
