//! Workflow abstractions and types
//!
//! This module contains the core workflow primitives:
//! - [`Workflow`] trait for defining workflow state machines
//! - [`WorkflowAction`] enum for workflow commands
//! - [`WorkflowEvent`] / [`HistoryEvent`] for the persisted history
//! - [`WorkflowContext`] for deterministic time and randomness
//! - [`ExternalEvent`] for signals raised by callers
//! - [`FanIn`] and [`Race`] for await-all / await-any bookkeeping

mod action;
mod combinators;
mod context;
mod definition;
mod event;
mod external;

pub use action::{StepOptions, WorkflowAction};
pub use combinators::{FanIn, Race};
pub use context::{sub_workflow_id, WorkflowContext};
pub use definition::{Workflow, WorkflowError};
pub use event::{HistoryEvent, WorkflowEvent};
pub use external::{generate_correlation_code, ExternalEvent, CORRELATION_CODE_LEN};
