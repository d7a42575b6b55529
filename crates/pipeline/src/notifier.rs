// Approval request delivery
//
// Approvers are reached through `ApprovalNotifier`. The bundled
// implementation only logs the approve and reject links.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What an approver needs to act on a video
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApprovalNotice {
    pub code: String,
    pub instance_id: Uuid,
    pub video_location: String,
    pub approve_url: String,
    pub reject_url: String,
    pub timeout_seconds: u64,
}

/// Sends approval requests to a human
#[async_trait]
pub trait ApprovalNotifier: Send + Sync {
    async fn request_approval(&self, notice: &ApprovalNotice) -> anyhow::Result<()>;
}

/// Writes approval requests to the log
#[derive(Debug, Clone, Default)]
pub struct LoggingNotifier;

#[async_trait]
impl ApprovalNotifier for LoggingNotifier {
    async fn request_approval(&self, notice: &ApprovalNotice) -> anyhow::Result<()> {
        tracing::info!(
            code = %notice.code,
            instance_id = %notice.instance_id,
            video = %notice.video_location,
            approve = %notice.approve_url,
            reject = %notice.reject_url,
            timeout_seconds = notice.timeout_seconds,
            "approval requested"
        );
        Ok(())
    }
}
