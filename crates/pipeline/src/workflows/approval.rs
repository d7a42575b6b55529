use std::time::Duration;

use reelflow_durable::prelude::*;
use serde_json::Value;

use super::{complete_with, decode, encode, or_fail};
use crate::models::{
    ApprovalInput, ApprovalOutcome, ApprovalRequest, ApprovalTicket, APPROVAL_RESULT_EVENT,
};

const SEND_REQUEST: &str = "send_request";
const DECISION: &str = "decision";
const DEADLINE: &str = "deadline";

/// Asks a human to approve a video and waits for the answer
///
/// The `ApprovalResult` event races a timer; whichever resolves first
/// decides the outcome, and an event that wins cancels the timer.
/// The correlation code handed to the approver points at this instance.
pub struct ApprovalWorkflow {
    input: ApprovalInput,
    ticket: Option<ApprovalTicket>,
    race: Race,
}

impl ApprovalWorkflow {
    fn arm(&mut self, ticket: Value) -> Result<Vec<WorkflowAction>, WorkflowError> {
        if self.ticket.is_some() {
            return Ok(vec![]);
        }
        let ticket: ApprovalTicket = decode("approval ticket", ticket)?;
        let deadline = Duration::from_secs(ticket.timeout_seconds);
        self.ticket = Some(ticket);

        Ok(vec![
            WorkflowAction::timer(DEADLINE, deadline),
            WorkflowAction::wait_for_event(DECISION, APPROVAL_RESULT_EVENT),
        ])
    }
}

impl Workflow for ApprovalWorkflow {
    const TYPE: &'static str = "approval";
    type Input = ApprovalInput;
    type Output = ApprovalOutcome;

    fn new(input: Self::Input) -> Self {
        Self {
            input,
            ticket: None,
            race: Race::new([DECISION, DEADLINE]),
        }
    }

    fn on_start(&mut self, ctx: &WorkflowContext) -> Vec<WorkflowAction> {
        let request = ApprovalRequest {
            instance_id: ctx.instance_id(),
            video_location: self.input.video_location.clone(),
            timeout_seconds: self.input.timeout_seconds,
        };
        or_fail(encode(&request).map(|input| {
            vec![WorkflowAction::schedule_step(
                SEND_REQUEST,
                "send_approval_request",
                input,
            )]
        }))
    }

    fn on_step_completed(
        &mut self,
        _ctx: &WorkflowContext,
        step_id: &str,
        result: Value,
    ) -> Vec<WorkflowAction> {
        match step_id {
            SEND_REQUEST => or_fail(self.arm(result)),
            _ => vec![],
        }
    }

    fn on_step_failed(
        &mut self,
        _ctx: &WorkflowContext,
        _step_id: &str,
        error: &StepError,
    ) -> Vec<WorkflowAction> {
        let mut failure = WorkflowError::from(error);
        failure.message = format!("approval request could not be sent: {}", error.message);
        vec![WorkflowAction::fail(failure)]
    }

    fn on_timer_fired(&mut self, _ctx: &WorkflowContext, timer_id: &str) -> Vec<WorkflowAction> {
        if timer_id != DEADLINE || !self.race.resolve(DEADLINE) {
            return vec![];
        }
        vec![complete_with(&ApprovalOutcome::TimedOut)]
    }

    fn on_event(
        &mut self,
        _ctx: &WorkflowContext,
        wait_id: &str,
        event: &ExternalEvent,
    ) -> Vec<WorkflowAction> {
        if wait_id != DECISION || !self.race.resolve(DECISION) {
            return vec![];
        }
        let outcome = ApprovalOutcome::from_payload(&event.payload);
        vec![
            WorkflowAction::cancel_timer(DEADLINE),
            complete_with(&outcome),
        ]
    }
}
