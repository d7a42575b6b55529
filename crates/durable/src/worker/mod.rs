//! Worker pool for step execution
//!
//! This module provides:
//! - [`WorkerPool`] - Main worker pool with concurrent step execution
//! - [`StepRegistry`] - Type-erased step handlers by step type
//! - [`StepOutcomeSink`] - Where step outcomes are reported (the engine)
//! - [`TaskPoller`] - Claims due tasks into free concurrency slots
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       WorkerPool                             │
//! │  ┌─────────────┐                                             │
//! │  │ TaskPoller  │  reserves a slot, then claims a due task    │
//! │  │             │  sleeps until the next retry is due         │
//! │  └──────┬──────┘                                             │
//! │         │                                                    │
//! │         ▼                                                    │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │         Step Executor (Semaphore-limited)           │    │
//! │  │  [Step 1] [Step 2] [Step 3] ... [Step N]            │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! │         │                                                    │
//! │         ▼                                                    │
//! │  StepOutcomeSink (engine) ──► complete_task / fail_task      │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod poller;
mod pool;

pub use poller::{ClaimedSlot, PollerConfig, PollerError, TaskPoller, Wake};
pub use pool::{
    StepHandler, StepOutcomeSink, StepRegistry, StepResult, WorkerPool, WorkerPoolConfig,
    WorkerPoolError, WorkerPoolStatus,
};
