//! Reliability primitives
//!
//! - [`RetryPolicy`] for bounded step retries with optional backoff

mod retry;

pub use retry::RetryPolicy;
