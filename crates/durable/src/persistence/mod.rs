//! Persistence layer for durable execution
//!
//! This module provides:
//! - [`WorkflowEventStore`] trait for history, tasks, external events and
//!   correlation codes
//! - [`InMemoryWorkflowEventStore`], the process-lifetime implementation

mod memory;
mod store;

pub use memory::InMemoryWorkflowEventStore;
pub use store::{
    ClaimedTask, CorrelationRecord, DiscardedExternalEvent, GenerationRecord, ParentLink,
    PendingExternalEvent, StoreError, TaskDefinition, TaskFailureOutcome, TaskStatus,
    WorkflowEventStore, WorkflowInstance, WorkflowStatus,
};
