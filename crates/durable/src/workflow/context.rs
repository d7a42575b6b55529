//! Deterministic primitives available to workflow code

use std::cell::Cell;

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Derive the instance id of a sub-workflow from its parent
///
/// The id is stable across replays and restarts, so callers that know the
/// parent id can address the child without a lookup.
pub fn sub_workflow_id(parent_id: Uuid, generation: u32, step_id: &str) -> Uuid {
    Uuid::new_v5(&parent_id, format!("{generation}/{step_id}").as_bytes())
}

/// Context passed to every workflow handler
///
/// Everything here is derived from history, so a handler that only uses
/// the context (and never the wall clock or a RNG) replays identically.
#[derive(Debug)]
pub struct WorkflowContext {
    instance_id: Uuid,
    generation: u32,
    sequence: u64,
    now: DateTime<Utc>,
    replaying: bool,
    counter: Cell<u64>,
}

impl WorkflowContext {
    /// Context for one handler call
    ///
    /// The engine builds these during replay; workflow crates use it to
    /// drive handlers directly in unit tests.
    pub fn new(
        instance_id: Uuid,
        generation: u32,
        sequence: u64,
        now: DateTime<Utc>,
        replaying: bool,
    ) -> Self {
        Self {
            instance_id,
            generation,
            sequence,
            now,
            replaying,
            counter: Cell::new(0),
        }
    }

    /// Workflow instance id
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Current generation (incremented by continue-as-new)
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Recorded time of the history event being handled
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// True when the actions produced by this handler are already in history
    ///
    /// Useful to keep log output from repeating on every replay.
    pub fn is_replaying(&self) -> bool {
        self.replaying
    }

    /// A UUID that is identical on every replay of this handler call
    pub fn new_uuid(&self) -> Uuid {
        let n = self.counter.get();
        self.counter.set(n + 1);
        Uuid::new_v5(
            &self.instance_id,
            format!("{}:{}:{}", self.generation, self.sequence, n).as_bytes(),
        )
    }

    /// A random number that is identical on every replay of this handler call
    pub fn random_u64(&self) -> u64 {
        let (hi, lo) = self.new_uuid().as_u64_pair();
        hi ^ lo
    }

    /// Instance id a sub-workflow scheduled under `step_id` will receive
    pub fn sub_workflow_id(&self, step_id: &str) -> Uuid {
        sub_workflow_id(self.instance_id, self.generation, step_id)
    }
}
