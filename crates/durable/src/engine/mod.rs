//! Workflow execution engine
//!
//! The engine module provides the [`DurableEngine`], which drives workflow
//! state machines through history replay and action recording, along with
//! the pieces it is built from: the workflow registry, the replay pass and
//! the in-process timer service.

mod clock;
mod executor;
mod registry;
mod replay;
mod timer;

pub use clock::EngineClock;
pub use executor::{DurableEngine, ExecutorConfig, ExecutorError, RecoveryReport, OUTCOME_LOST};
pub use registry::{AnyWorkflow, RegistryError, WorkflowFactory, WorkflowRegistry};
pub use replay::{
    replay, ReplayError, ReplayOutcome, ReplayState, StepRecord, SubWorkflowRecord, TimerRecord,
    TimerState, WaitRecord, INVALID_ACTION,
};
pub use timer::{TimerKey, TimerService};
