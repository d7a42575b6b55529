//! End-to-end tests for the video pipeline over the in-memory store
//!
//! Tests run on a paused tokio clock: retry intervals, approval deadlines
//! and periodic sleeps elapse instantly.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tower::ServiceExt;
use tracing_subscriber::layer::SubscriberExt;

use reelflow_durable::prelude::*;
use reelflow_pipeline::http::{routes, ErrorResponse, HealthResponse};
use reelflow_pipeline::{
    ApprovalNotice, ApprovalNotifier, MockVideoProcessor, PipelineConfig, PipelineError,
    ProcessorCall, StartedWorkflow, VideoPipeline,
};

type Pipeline = VideoPipeline<InMemoryWorkflowEventStore>;

/// Keeps every notice so tests can act as the approver
#[derive(Default)]
struct CapturingNotifier {
    notices: Mutex<Vec<ApprovalNotice>>,
}

impl CapturingNotifier {
    fn latest(&self) -> Option<ApprovalNotice> {
        self.notices.lock().last().cloned()
    }
}

#[async_trait]
impl ApprovalNotifier for CapturingNotifier {
    async fn request_approval(&self, notice: &ApprovalNotice) -> anyhow::Result<()> {
        self.notices.lock().push(notice.clone());
        Ok(())
    }
}

/// Level of every logged event, by message
#[derive(Clone, Default)]
struct LevelCapture(Arc<Mutex<Vec<(tracing::Level, String)>>>);

impl LevelCapture {
    fn levels_of(&self, message: &str) -> Vec<tracing::Level> {
        self.0
            .lock()
            .iter()
            .filter(|(_, logged)| logged == message)
            .map(|(level, _)| *level)
            .collect()
    }
}

impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for LevelCapture {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        struct Message(String);

        impl tracing::field::Visit for Message {
            fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
                if field.name() == "message" {
                    self.0 = format!("{value:?}");
                }
            }
        }

        let mut message = Message(String::new());
        event.record(&mut message);
        self.0.lock().push((*event.metadata().level(), message.0));
    }
}

struct Harness {
    store: Arc<InMemoryWorkflowEventStore>,
    processor: Arc<MockVideoProcessor>,
    notifier: Arc<CapturingNotifier>,
    pipeline: Arc<Pipeline>,
}

impl Harness {
    fn start() -> Self {
        let store = Arc::new(InMemoryWorkflowEventStore::new());
        let processor = Arc::new(MockVideoProcessor::default());
        let notifier = Arc::new(CapturingNotifier::default());
        let pipeline = Arc::new(VideoPipeline::new(
            store.clone(),
            PipelineConfig::default(),
            processor.clone(),
            notifier.clone(),
        ));
        pipeline.start().unwrap();

        Self {
            store,
            processor,
            notifier,
            pipeline,
        }
    }

    /// Wait until an approval request went out
    async fn approval_notice(&self) -> ApprovalNotice {
        for _ in 0..600 {
            if let Some(notice) = self.notifier.latest() {
                return notice;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("no approval request was sent");
    }

    async fn finish(&self, started: &StartedWorkflow) -> WorkflowInstance {
        let instance = self
            .pipeline
            .wait_for_completion(started.instance_id, Duration::from_secs(300))
            .await
            .unwrap();
        self.pipeline.shutdown().await.unwrap();
        instance
    }

    fn count(&self, predicate: impl Fn(&ProcessorCall) -> bool) -> usize {
        self.processor.count(predicate)
    }
}

fn is_transcode(call: &ProcessorCall) -> bool {
    matches!(call, ProcessorCall::Transcode { .. })
}

fn is_thumbnail(call: &ProcessorCall) -> bool {
    matches!(call, ProcessorCall::ExtractThumbnail { .. })
}

fn is_publish(call: &ProcessorCall) -> bool {
    matches!(call, ProcessorCall::Publish { .. })
}

fn is_reject(call: &ProcessorCall) -> bool {
    matches!(call, ProcessorCall::Reject { .. })
}

fn is_cleanup(call: &ProcessorCall) -> bool {
    matches!(call, ProcessorCall::Cleanup { .. })
}

// =============================================================================
// Pipeline
// =============================================================================

#[test_log::test(tokio::test(start_paused = true))]
async fn test_approved_video_is_published_after_thumbnail_retries() {
    let harness = Harness::start();
    harness
        .processor
        .fail_thumbnail_times("uploads/video-4000.mp4", 2);

    let started = harness
        .pipeline
        .start_workflow("uploads/video.mp4")
        .await
        .unwrap();
    assert_eq!(
        started.status_query_url,
        format!("http://localhost:9000/api/workflows/{}", started.instance_id)
    );

    let notice = harness.approval_notice().await;
    assert_eq!(notice.video_location, "uploads/video-4000.mp4-with-intro.mp4");
    assert!(notice.approve_url.ends_with("?result=Approved"));

    let raised = harness
        .pipeline
        .submit_approval(&notice.code, "Approved")
        .await
        .unwrap();
    assert_eq!(raised.instance_id, notice.instance_id);

    let instance = harness.finish(&started).await;
    assert_eq!(instance.status, WorkflowStatus::Completed);

    let result = instance.result.unwrap();
    assert_eq!(result["status"], "Approved and published");
    assert_eq!(result["transcoded_location"], "uploads/video-4000.mp4");
    assert_eq!(
        result["thumbnail_location"],
        "uploads/video-4000.mp4-thumbnail.jpg"
    );
    assert_eq!(result["assets"].as_array().unwrap().len(), 4);

    assert_eq!(harness.count(is_transcode), 4);
    assert_eq!(harness.count(is_thumbnail), 3);
    assert_eq!(harness.count(is_publish), 1);
    assert_eq!(harness.count(is_reject), 0);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_approval_ten_seconds_in_beats_default_deadline() {
    let harness = Harness::start();
    let started = harness
        .pipeline
        .start_workflow("uploads/beach.mp4")
        .await
        .unwrap();

    let notice = harness.approval_notice().await;
    assert_eq!(notice.timeout_seconds, 30);

    tokio::time::sleep(Duration::from_secs(10)).await;
    harness
        .pipeline
        .submit_approval(&notice.code, "Approved")
        .await
        .unwrap();

    let instance = harness.finish(&started).await;
    assert_eq!(instance.status, WorkflowStatus::Completed);
    assert_eq!(instance.result.unwrap()["status"], "Approved and published");
    assert_eq!(harness.count(is_publish), 1);
    assert_eq!(harness.count(is_reject), 0);

    let history = harness
        .pipeline
        .engine()
        .history(notice.instance_id)
        .await
        .unwrap();
    let created = history
        .iter()
        .find(|e| matches!(&e.event, WorkflowEvent::TimerCreated { timer_id, .. } if timer_id == "deadline"))
        .expect("deadline timer was started");
    let cancelled = history
        .iter()
        .find(|e| matches!(&e.event, WorkflowEvent::TimerCancelled { timer_id, .. } if timer_id == "deadline"))
        .expect("deadline timer was cancelled");
    assert!(!history
        .iter()
        .any(|e| matches!(e.event, WorkflowEvent::TimerFired { .. })));

    let waited = cancelled.recorded_at - created.recorded_at;
    assert!(waited >= chrono::Duration::seconds(10), "{waited}");
    assert!(waited < chrono::Duration::seconds(30), "{waited}");
    assert_eq!(harness.pipeline.engine().lock_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_approval_submission_logs_at_info() {
    let capture = LevelCapture::default();
    let _subscriber =
        tracing::subscriber::set_default(tracing_subscriber::registry().with(capture.clone()));

    let harness = Harness::start();
    let started = harness
        .pipeline
        .start_workflow("uploads/owl.mp4")
        .await
        .unwrap();
    let notice = harness.approval_notice().await;
    harness
        .pipeline
        .submit_approval(&notice.code, "Approved")
        .await
        .unwrap();
    harness.finish(&started).await;

    assert_eq!(
        capture.levels_of("sending approval result"),
        vec![tracing::Level::INFO]
    );
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_rejected_video_is_not_published() {
    let harness = Harness::start();
    let started = harness
        .pipeline
        .start_workflow("uploads/cat.mp4")
        .await
        .unwrap();

    let notice = harness.approval_notice().await;
    harness
        .pipeline
        .submit_approval(&notice.code, "Rejected")
        .await
        .unwrap();

    let instance = harness.finish(&started).await;
    assert_eq!(instance.status, WorkflowStatus::Completed);
    assert_eq!(instance.result.unwrap()["status"], "Rejected");
    assert_eq!(harness.count(is_publish), 0);
    assert_eq!(harness.count(is_reject), 1);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_unanswered_approval_times_out_and_rejects() {
    let harness = Harness::start();
    let started = harness
        .pipeline
        .start_workflow_with("uploads/late.mp4", Some(Duration::from_secs(5)))
        .await
        .unwrap();

    let instance = harness.finish(&started).await;
    assert_eq!(instance.status, WorkflowStatus::Completed);
    let result = instance.result.unwrap();
    assert_eq!(result["status"], "Timed out");
    assert_eq!(result["outcome"], "TimedOut");
    assert_eq!(harness.notifier.latest().unwrap().timeout_seconds, 5);
    assert_eq!(harness.count(is_reject), 1);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_late_approval_is_refused_once_closed() {
    let harness = Harness::start();
    let started = harness
        .pipeline
        .start_workflow_with("uploads/late.mp4", Some(Duration::from_secs(5)))
        .await
        .unwrap();
    let notice = harness.approval_notice().await;
    harness
        .pipeline
        .wait_for_completion(started.instance_id, Duration::from_secs(300))
        .await
        .unwrap();

    let err = harness
        .pipeline
        .submit_approval(&notice.code, "Approved")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Engine(ExecutorError::WorkflowClosed(_))
    ));
    harness.pipeline.shutdown().await.unwrap();
    assert_eq!(harness.count(is_publish), 0);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_exhausted_thumbnail_retries_clean_up_and_fail() {
    let harness = Harness::start();
    let started = harness
        .pipeline
        .start_workflow("uploads/error.mp4")
        .await
        .unwrap();

    let instance = harness.finish(&started).await;
    assert_eq!(instance.status, WorkflowStatus::Failed);

    let error = instance.error.unwrap();
    assert!(error.message.starts_with("Failed to process video"), "{}", error.message);
    assert!(error.message.contains("5 attempt(s)"), "{}", error.message);
    assert_eq!(error.code.as_deref(), Some("THUMBNAIL_FAILED"));

    assert_eq!(harness.count(is_thumbnail), 5);
    assert_eq!(harness.count(is_cleanup), 1);
    assert!(harness.notifier.latest().is_none());
}

#[test_log::test(tokio::test)]
async fn test_empty_location_starts_nothing() {
    let harness = Harness::start();

    let err = harness.pipeline.start_workflow("   ").await.unwrap_err();
    assert!(matches!(err, PipelineError::InvalidInput(_)));
    assert_eq!(harness.store.workflow_count(), 0);
    harness.pipeline.shutdown().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_unknown_code_is_reported() {
    let harness = Harness::start();

    let err = harness
        .pipeline
        .submit_approval("NOPE0000", "Approved")
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::UnknownTarget(_)));

    let err = harness
        .pipeline
        .raise_event("not-a-code", "ApprovalResult", json!("Approved"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::UnknownTarget(_)));
    harness.pipeline.shutdown().await.unwrap();
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_event_by_instance_id_reaches_approval() {
    let harness = Harness::start();
    let started = harness
        .pipeline
        .start_workflow("uploads/dog.mp4")
        .await
        .unwrap();

    let notice = harness.approval_notice().await;
    harness
        .pipeline
        .raise_event(
            &notice.instance_id.to_string(),
            "ApprovalResult",
            json!({ "result": "approved" }),
            None,
        )
        .await
        .unwrap();

    let instance = harness.finish(&started).await;
    assert_eq!(instance.result.unwrap()["status"], "Approved and published");
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_periodic_loop_continues_as_new_until_limit() {
    let harness = Harness::start();
    let started = harness
        .pipeline
        .start_periodic(Some(Duration::from_secs(1)), Some(3))
        .await
        .unwrap();

    let instance = harness.finish(&started).await;
    assert_eq!(instance.status, WorkflowStatus::Completed);
    assert_eq!(instance.generation, 2);
    assert_eq!(instance.result.unwrap(), json!({ "iterations": 3 }));

    // Each generation keeps only its own cycle
    let history = harness
        .pipeline
        .engine()
        .history(started.instance_id)
        .await
        .unwrap();
    assert!(history.len() < 10, "history grew to {}", history.len());
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_event_raised_during_periodic_sleep_is_kept() {
    let harness = Harness::start();
    let started = harness
        .pipeline
        .start_periodic(Some(Duration::from_secs(5)), Some(2))
        .await
        .unwrap();

    let raised = harness
        .pipeline
        .raise_event(
            &started.instance_id.to_string(),
            "ping",
            json!("tick"),
            Some(0),
        )
        .await
        .unwrap();
    assert_eq!(raised.arrival, 0);

    let instance = harness.finish(&started).await;
    assert_eq!(instance.generation, 1);

    let store = harness.pipeline.engine().store();
    assert!(store
        .discarded_external_events(started.instance_id)
        .await
        .unwrap()
        .is_empty());
    let pending = store
        .pending_external_events(started.instance_id)
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].generation, 1);
    assert_eq!(pending[0].payload, json!("tick"));
}

#[test_log::test(tokio::test)]
async fn test_oversized_waits_start_nothing() {
    let harness = Harness::start();
    let huge = Duration::from_secs(u64::MAX / 4);

    let err = harness
        .pipeline
        .start_workflow_with("uploads/video.mp4", Some(huge))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidInput(_)), "{err}");

    let err = harness
        .pipeline
        .start_periodic(Some(huge), Some(2))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidInput(_)), "{err}");

    assert_eq!(harness.store.workflow_count(), 0);
    harness.pipeline.shutdown().await.unwrap();
}

// =============================================================================
// HTTP
// =============================================================================

async fn send(app: axum::Router, method: &str, uri: &str, body: Body) -> (StatusCode, Value) {
    let response = app
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .header("content-type", "application/json")
                .body(body)
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn test_http_health() {
    let harness = Harness::start();
    let (status, body) = send(routes(harness.pipeline.clone()), "GET", "/health", Body::empty()).await;

    assert_eq!(status, StatusCode::OK);
    let health: HealthResponse = serde_json::from_value(body).unwrap();
    assert_eq!(health.status, "ok");
    harness.pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_http_start_requires_video() {
    let harness = Harness::start();
    let (status, body) = send(
        routes(harness.pipeline.clone()),
        "POST",
        "/api/process-video",
        Body::empty(),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    let error: ErrorResponse = serde_json::from_value(body).unwrap();
    assert!(error.error.contains("video location"));
    assert_eq!(harness.store.workflow_count(), 0);
    harness.pipeline.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_http_start_and_query() {
    let harness = Harness::start();
    let app = routes(harness.pipeline.clone());

    let (status, body) = send(
        app.clone(),
        "POST",
        "/api/process-video",
        Body::from(r#"{"video":"uploads/clip.mp4"}"#),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let started: StartedWorkflow = serde_json::from_value(body).unwrap();

    let (status, body) = send(
        app.clone(),
        "GET",
        &format!("/api/workflows/{}", started.instance_id),
        Body::empty(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["workflow_type"], "process_video");

    let (status, _) = send(
        app,
        "GET",
        &format!("/api/workflows/{}", uuid::Uuid::now_v7()),
        Body::empty(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    harness.pipeline.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_http_approval_link() {
    let harness = Harness::start();
    let app = routes(harness.pipeline.clone());

    let (status, _) = send(app.clone(), "GET", "/api/approvals/NOPE0000?result=Approved", Body::empty()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let started = harness
        .pipeline
        .start_workflow("uploads/link.mp4")
        .await
        .unwrap();
    let notice = harness.approval_notice().await;

    let (status, body) = send(
        app.clone(),
        "GET",
        &format!("/api/approvals/{}", notice.code),
        Body::empty(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Need an approval result");

    let path = notice
        .approve_url
        .trim_start_matches(harness.pipeline.config().public_base_url.as_str())
        .to_string();
    let (status, body) = send(app, "GET", &path, Body::empty()).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["event_name"], "ApprovalResult");

    let instance = harness.finish(&started).await;
    assert_eq!(instance.result.unwrap()["status"], "Approved and published");
}
