//! External events raised by callers outside the engine

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Length of generated correlation codes
pub const CORRELATION_CODE_LEN: usize = 8;

/// A named signal delivered to a waiting workflow
///
/// Events raised before the workflow reaches its wait are buffered and
/// delivered FIFO per name once the wait is recorded.
///
/// # Example
///
/// ```ignore
/// engine
///     .raise_event(instance_id, "ApprovalResult", json!("Approved"))
///     .await?;
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExternalEvent {
    /// Event name
    pub name: String,

    /// Event payload (JSON)
    pub payload: serde_json::Value,

    /// When the event was delivered to the workflow
    pub received_at: DateTime<Utc>,
}

impl ExternalEvent {
    /// Create a new event
    pub fn new(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            payload,
            received_at: Utc::now(),
        }
    }

    /// Payload as a plain string, if it is one
    pub fn payload_str(&self) -> Option<&str> {
        self.payload.as_str()
    }
}

/// Generate a short, human-typeable correlation code
///
/// Codes are uppercase alphanumerics. Uniqueness is enforced by the store
/// on insert, not here.
pub fn generate_correlation_code() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(CORRELATION_CODE_LEN)
        .map(|c| (c as char).to_ascii_uppercase())
        .collect()
}
