//! Step abstractions
//!
//! Steps are the only place side effects happen. They:
//! - Run on the worker pool, outside workflow code
//! - May fail and be retried according to the scheduling retry policy
//! - Observe worker shutdown through a cancellation token

mod context;
mod definition;

pub use context::StepContext;
pub use definition::{Step, StepError};
