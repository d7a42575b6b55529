//! Step trait definition

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::StepContext;

/// Error type for step failures
///
/// Once a step has exhausted its retry policy this is what the workflow
/// receives in [`Workflow::on_step_failed`](crate::Workflow::on_step_failed).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepError {
    /// Error message
    pub message: String,

    /// Error type/code for programmatic handling
    pub error_type: Option<String>,

    /// Whether this error is retryable
    ///
    /// Non-retryable errors skip any remaining retries.
    pub retryable: bool,

    /// Additional error details (for debugging)
    pub details: Option<serde_json::Value>,

    /// Number of attempts made before the failure was surfaced
    #[serde(default)]
    pub attempts: u32,
}

impl StepError {
    /// Create a new retryable error
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: true,
            details: None,
            attempts: 0,
        }
    }

    /// Create a non-retryable error
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: false,
            details: None,
            attempts: 0,
        }
    }

    /// Set the error type
    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    /// Add error details
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Record how many attempts were made
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }
}

impl std::fmt::Display for StepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for StepError {}

impl From<anyhow::Error> for StepError {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable(format!("{err:#}"))
    }
}

/// A step is a side-effecting unit of work run outside workflow code
///
/// Steps are where all real I/O happens. They:
/// - Are executed by the [`WorkerPool`](crate::WorkerPool), never during replay
/// - May fail and be retried under the scheduling workflow's retry policy
/// - Must tolerate being retried, since a retry re-invokes them
///
/// # Example
///
/// ```ignore
/// use reelflow_durable::prelude::*;
///
/// struct SendEmailStep;
///
/// #[async_trait]
/// impl Step for SendEmailStep {
///     const TYPE: &'static str = "send_email";
///     type Input = SendEmailInput;
///     type Output = SendEmailOutput;
///
///     async fn execute(
///         &self,
///         ctx: &StepContext,
///         input: Self::Input,
///     ) -> Result<Self::Output, StepError> {
///         // Send email...
///         Ok(SendEmailOutput { message_id: "..." })
///     }
/// }
/// ```
#[async_trait]
pub trait Step: Send + Sync + 'static {
    /// Unique type identifier used by the step registry
    const TYPE: &'static str;

    /// Input type for the step
    type Input: Serialize + DeserializeOwned + Send;

    /// Output type for the step
    type Output: Serialize + DeserializeOwned + Send;

    /// Execute the step
    ///
    /// # Errors
    ///
    /// Return `StepError::retryable()` for transient failures that should be retried.
    /// Return `StepError::non_retryable()` for permanent failures.
    async fn execute(&self, ctx: &StepContext, input: Self::Input)
        -> Result<Self::Output, StepError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_error_retryable() {
        let error = StepError::retryable("timeout");
        assert!(error.retryable);
        assert_eq!(error.to_string(), "timeout");
    }

    #[test]
    fn test_step_error_from_anyhow_keeps_context() {
        let err = anyhow::anyhow!("ffmpeg exited with 1").context("thumbnail extraction failed");
        let error = StepError::from(err);

        assert!(error.retryable);
        assert!(error.message.contains("thumbnail extraction failed"));
        assert!(error.message.contains("ffmpeg exited with 1"));
    }

    #[test]
    fn test_step_error_serialization() {
        let error = StepError::non_retryable("test error")
            .with_type("TEST")
            .with_details(serde_json::json!({"key": "value"}))
            .with_attempts(5);

        let json = serde_json::to_string(&error).unwrap();
        let parsed: StepError = serde_json::from_str(&json).unwrap();

        assert_eq!(error, parsed);
        assert_eq!(parsed.attempts, 5);
    }
}
