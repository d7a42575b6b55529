//! # Durable Execution Engine
//!
//! A replay-based workflow orchestration engine for long-running, multi-step
//! processes that must survive restarts.
//!
//! ## Features
//!
//! - **Event-sourced workflows**: every decision and outcome is appended to a
//!   per-instance history, and workflow state is rebuilt by replaying it
//! - **Bounded retries**: steps are retried per their `RetryPolicy`, with the
//!   attempt count kept in the durable task record
//! - **Durable timers**: cancellable, re-armed from history after a restart
//! - **External events**: buffered per generation and delivered in arrival
//!   order, addressable by short correlation codes
//! - **Composition**: sub-workflows and continue-as-new
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       DurableEngine                          │
//! │  (replays workflow state machines, records new decisions,   │
//! │   arms timers, delivers events, starts sub-workflows)       │
//! └─────────────────────────────────────────────────────────────┘
//!            │                                  ▲
//!            ▼                                  │ StepOutcomeSink
//! ┌──────────────────────────────┐   ┌──────────────────────────┐
//! │      WorkflowEventStore      │◄──│        WorkerPool         │
//! │ (history, task queue, event  │   │ (claims tasks, runs steps │
//! │  buffer, correlation codes)  │   │  with bounded concurrency)│
//! └──────────────────────────────┘   └──────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use reelflow_durable::prelude::*;
//!
//! struct GreetWorkflow {
//!     name: String,
//! }
//!
//! impl Workflow for GreetWorkflow {
//!     const TYPE: &'static str = "greet";
//!     type Input = GreetInput;
//!     type Output = String;
//!
//!     fn new(input: Self::Input) -> Self {
//!         Self { name: input.name }
//!     }
//!
//!     fn on_start(&mut self, _ctx: &WorkflowContext) -> Vec<WorkflowAction> {
//!         vec![WorkflowAction::schedule_step(
//!             "greet",
//!             "format_greeting",
//!             json!({ "name": self.name }),
//!         )]
//!     }
//!
//!     fn on_step_completed(
//!         &mut self,
//!         _ctx: &WorkflowContext,
//!         _step_id: &str,
//!         result: Value,
//!     ) -> Vec<WorkflowAction> {
//!         vec![WorkflowAction::complete(result)]
//!     }
//!
//!     // ... implement other trait methods
//! }
//! ```

pub mod engine;
pub mod persistence;
pub mod reliability;
pub mod step;
pub mod worker;
pub mod workflow;

/// Prelude for common imports
pub mod prelude {
    pub use crate::engine::{
        DurableEngine, ExecutorConfig, ExecutorError, RecoveryReport, WorkflowRegistry,
    };
    pub use crate::persistence::{
        ClaimedTask, InMemoryWorkflowEventStore, StoreError, WorkflowEventStore,
        WorkflowInstance, WorkflowStatus,
    };
    pub use crate::reliability::RetryPolicy;
    pub use crate::step::{Step, StepContext, StepError};
    pub use crate::worker::{StepRegistry, WorkerPool, WorkerPoolConfig, WorkerPoolError};
    pub use crate::workflow::{
        ExternalEvent, FanIn, Race, StepOptions, Workflow, WorkflowAction, WorkflowContext,
        WorkflowError, WorkflowEvent,
    };
}

// Re-export key types at crate root
pub use engine::{
    DurableEngine, EngineClock, ExecutorConfig, ExecutorError, RecoveryReport, RegistryError,
    WorkflowRegistry, INVALID_ACTION, OUTCOME_LOST,
};
pub use persistence::{
    ClaimedTask, CorrelationRecord, InMemoryWorkflowEventStore, StoreError, WorkflowEventStore,
    WorkflowInstance, WorkflowStatus,
};
pub use reliability::RetryPolicy;
pub use step::{Step, StepContext, StepError};
pub use worker::{
    StepOutcomeSink, StepRegistry, WorkerPool, WorkerPoolConfig, WorkerPoolError,
};
pub use workflow::{
    generate_correlation_code, ExternalEvent, FanIn, HistoryEvent, Race, StepOptions, Workflow,
    WorkflowAction, WorkflowContext, WorkflowError, WorkflowEvent,
};
