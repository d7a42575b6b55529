use std::time::Duration;

use reelflow_durable::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{complete_with, encode, or_fail};
use crate::models::PeriodicInput;

const TICK: &str = "tick";
const SLEEP: &str = "sleep";

/// Result of a periodic loop that was given an iteration limit
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeriodicSummary {
    pub iterations: u64,
}

/// Runs `periodic_tick`, sleeps, and continues as new
///
/// Each cycle is one generation, so history never grows past a single
/// tick, timer and hand-off. The completed-cycle counter travels in the
/// input of the next generation.
pub struct PeriodicWorkflow {
    input: PeriodicInput,
}

impl PeriodicWorkflow {
    fn completed(&self) -> u64 {
        self.input.iteration + 1
    }
}

impl Workflow for PeriodicWorkflow {
    const TYPE: &'static str = "periodic";
    type Input = PeriodicInput;
    type Output = PeriodicSummary;

    fn new(input: Self::Input) -> Self {
        Self { input }
    }

    fn on_start(&mut self, _ctx: &WorkflowContext) -> Vec<WorkflowAction> {
        vec![WorkflowAction::schedule_step(
            TICK,
            "periodic_tick",
            json!({ "iteration": self.completed() }),
        )]
    }

    fn on_step_completed(
        &mut self,
        _ctx: &WorkflowContext,
        step_id: &str,
        _result: Value,
    ) -> Vec<WorkflowAction> {
        if step_id != TICK {
            return vec![];
        }
        let completed = self.completed();
        if self.input.max_iterations.is_some_and(|max| completed >= max) {
            return vec![complete_with(&PeriodicSummary {
                iterations: completed,
            })];
        }
        vec![WorkflowAction::timer(
            SLEEP,
            Duration::from_secs(self.input.interval_seconds),
        )]
    }

    fn on_step_failed(
        &mut self,
        _ctx: &WorkflowContext,
        _step_id: &str,
        error: &StepError,
    ) -> Vec<WorkflowAction> {
        vec![WorkflowAction::fail(WorkflowError::from(error))]
    }

    fn on_timer_fired(&mut self, _ctx: &WorkflowContext, timer_id: &str) -> Vec<WorkflowAction> {
        if timer_id != SLEEP {
            return vec![];
        }
        let next = PeriodicInput {
            iteration: self.completed(),
            ..self.input.clone()
        };
        or_fail(encode(&next).map(|input| vec![WorkflowAction::continue_as_new(input)]))
    }
}
