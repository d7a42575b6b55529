// Reelflow video pipeline
//
// Durable workflows that transcode an uploaded video, extract a thumbnail,
// prepend an intro, wait for a human approval and publish or reject the
// result. Built on `reelflow-durable`; the HTTP surface lives in `http`.

pub mod config;
pub mod http;
pub mod models;
pub mod notifier;
pub mod processor;
pub mod service;
pub mod steps;
pub mod telemetry;
pub mod workflows;

pub use config::PipelineConfig;
pub use models::{
    ApprovalOutcome, ProcessVideoInput, ProcessVideoResult, RaisedEvent, StartedWorkflow,
    APPROVAL_RESULT_EVENT,
};
pub use notifier::{ApprovalNotice, ApprovalNotifier, LoggingNotifier};
pub use processor::{MockVideoProcessor, ProcessorCall, VideoProcessor};
pub use service::{PipelineError, VideoPipeline};
pub use workflows::{
    pipeline_workflows, ApprovalWorkflow, PeriodicWorkflow, ProcessVideoWorkflow,
    TranscodeWorkflow,
};
