//! Deterministic replay of a generation's history
//!
//! Replay rebuilds a workflow's in-memory state by feeding it the recorded
//! outcomes in order. Every decision event in history must line up with the
//! next action the workflow produced; any action left over once history is
//! exhausted is new and still has to be recorded.
//!
//! ```text
//!  history:  Started  StepScheduled(a)  StepCompleted(a)  TimerCreated(t)
//!              │            ▲                 │                ▲
//!              ▼            │                 ▼                │
//!           on_start ─► [ScheduleStep a]   on_step_completed ─► [StartTimer t, ...]
//!                                                                      │
//!                                                        leftover ─────┘ new decisions
//! ```

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::registry::AnyWorkflow;
use crate::workflow::{
    ExternalEvent, HistoryEvent, StepOptions, WorkflowAction, WorkflowContext, WorkflowEvent,
};

/// Error code of the failure the engine records in place of an action it
/// cannot carry out, such as a timer whose deadline is out of range.
///
/// Replay accepts this failure against whatever action the workflow produced
/// at that point.
pub const INVALID_ACTION: &str = "INVALID_ACTION";

/// Errors detected while replaying history
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReplayError {
    /// History is empty or does not begin with `WorkflowStarted`
    #[error("history must begin with workflow_started")]
    MissingStart,

    /// Recorded decision differs from what the workflow produced
    #[error("non-deterministic workflow at sequence {sequence}: recorded {recorded}, produced {produced}")]
    NonDeterminism {
        sequence: u64,
        recorded: String,
        produced: String,
    },

    /// Outcome references a decision that does not exist
    #[error("event at sequence {sequence} answers unknown decision {scheduled_seq}")]
    UnknownScheduledSeq { sequence: u64, scheduled_seq: u64 },
}

/// Lifecycle of a durable timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Open,
    Fired,
    Cancelled,
}

/// A scheduled step as recorded in history
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub step_id: String,
    pub step_type: String,
    pub input: serde_json::Value,
    pub options: StepOptions,
    pub resolved: bool,
}

/// A timer as recorded in history
#[derive(Debug, Clone)]
pub struct TimerRecord {
    pub timer_id: String,
    pub fire_at: DateTime<Utc>,
    pub state: TimerState,
}

/// An event wait as recorded in history
#[derive(Debug, Clone)]
pub struct WaitRecord {
    pub wait_id: String,
    pub event_name: String,
    pub satisfied: bool,
}

/// A sub-workflow as recorded in history
#[derive(Debug, Clone)]
pub struct SubWorkflowRecord {
    pub step_id: String,
    pub workflow_type: String,
    pub instance_id: Uuid,
    pub input: serde_json::Value,
    pub resolved: bool,
}

/// Bookkeeping derived from a generation's history
///
/// Maps each decision's sequence number to what it scheduled, and tracks
/// which of them are still waiting for an outcome.
#[derive(Debug, Clone, Default)]
pub struct ReplayState {
    steps: BTreeMap<u64, StepRecord>,
    timers: BTreeMap<u64, TimerRecord>,
    waits: BTreeMap<u64, WaitRecord>,
    sub_workflows: BTreeMap<u64, SubWorkflowRecord>,
    terminal: Option<WorkflowEvent>,
    next_sequence: u64,
}

impl ReplayState {
    /// Build the bookkeeping without running any workflow code
    pub fn from_history(history: &[HistoryEvent]) -> Result<Self, ReplayError> {
        let mut state = Self::default();
        for entry in history {
            state.observe(entry)?;
        }
        Ok(state)
    }

    /// Apply one history entry
    pub fn observe(&mut self, entry: &HistoryEvent) -> Result<(), ReplayError> {
        if entry.event.is_decision() {
            self.record_decision(entry.sequence, &entry.event);
        } else if let Some(scheduled_seq) = entry.event.scheduled_seq() {
            if !self.resolve(scheduled_seq, &entry.event) {
                return Err(ReplayError::UnknownScheduledSeq {
                    sequence: entry.sequence,
                    scheduled_seq,
                });
            }
        }
        self.next_sequence = entry.sequence + 1;
        Ok(())
    }

    /// Record a decision event at `sequence`
    pub fn record_decision(&mut self, sequence: u64, event: &WorkflowEvent) {
        match event {
            WorkflowEvent::StepScheduled {
                step_id,
                step_type,
                input,
                options,
            } => {
                self.steps.insert(
                    sequence,
                    StepRecord {
                        step_id: step_id.clone(),
                        step_type: step_type.clone(),
                        input: input.clone(),
                        options: options.clone(),
                        resolved: false,
                    },
                );
            }
            WorkflowEvent::TimerCreated { timer_id, fire_at } => {
                self.timers.insert(
                    sequence,
                    TimerRecord {
                        timer_id: timer_id.clone(),
                        fire_at: *fire_at,
                        state: TimerState::Open,
                    },
                );
            }
            WorkflowEvent::TimerCancelled {
                scheduled_seq: Some(timer_seq),
                ..
            } => {
                if let Some(timer) = self.timers.get_mut(timer_seq) {
                    if timer.state == TimerState::Open {
                        timer.state = TimerState::Cancelled;
                    }
                }
            }
            WorkflowEvent::EventWaitStarted {
                wait_id,
                event_name,
            } => {
                self.waits.insert(
                    sequence,
                    WaitRecord {
                        wait_id: wait_id.clone(),
                        event_name: event_name.clone(),
                        satisfied: false,
                    },
                );
            }
            WorkflowEvent::SubWorkflowScheduled {
                step_id,
                workflow_type,
                instance_id,
                input,
            } => {
                self.sub_workflows.insert(
                    sequence,
                    SubWorkflowRecord {
                        step_id: step_id.clone(),
                        workflow_type: workflow_type.clone(),
                        instance_id: *instance_id,
                        input: input.clone(),
                        resolved: false,
                    },
                );
            }
            WorkflowEvent::WorkflowCompleted { .. }
            | WorkflowEvent::WorkflowFailed { .. }
            | WorkflowEvent::WorkflowContinuedAsNew { .. } => {
                self.terminal = Some(event.clone());
            }
            _ => {}
        }
        self.next_sequence = self.next_sequence.max(sequence + 1);
    }

    /// Mark the decision at `scheduled_seq` as answered; false if unknown
    fn resolve(&mut self, scheduled_seq: u64, outcome: &WorkflowEvent) -> bool {
        match outcome {
            WorkflowEvent::StepCompleted { .. } | WorkflowEvent::StepFailed { .. } => self
                .steps
                .get_mut(&scheduled_seq)
                .map(|s| s.resolved = true)
                .is_some(),
            WorkflowEvent::TimerFired { .. } => self
                .timers
                .get_mut(&scheduled_seq)
                .map(|t| t.state = TimerState::Fired)
                .is_some(),
            WorkflowEvent::EventReceived { .. } => self
                .waits
                .get_mut(&scheduled_seq)
                .map(|w| w.satisfied = true)
                .is_some(),
            WorkflowEvent::SubWorkflowCompleted { .. } | WorkflowEvent::SubWorkflowFailed { .. } => {
                self.sub_workflows
                    .get_mut(&scheduled_seq)
                    .map(|s| s.resolved = true)
                    .is_some()
            }
            _ => false,
        }
    }

    /// Sequence number the next appended event will receive
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// The terminal event, if the generation has ended
    pub fn terminal(&self) -> Option<&WorkflowEvent> {
        self.terminal.as_ref()
    }

    /// Look up a recorded step
    pub fn step(&self, sequence: u64) -> Option<&StepRecord> {
        self.steps.get(&sequence)
    }

    /// Look up a recorded timer
    pub fn timer(&self, sequence: u64) -> Option<&TimerRecord> {
        self.timers.get(&sequence)
    }

    /// Whether the decision at `sequence` still awaits its outcome
    pub fn is_open(&self, sequence: u64) -> bool {
        self.steps.get(&sequence).is_some_and(|s| !s.resolved)
            || self
                .timers
                .get(&sequence)
                .is_some_and(|t| t.state == TimerState::Open)
            || self.waits.get(&sequence).is_some_and(|w| !w.satisfied)
            || self.sub_workflows.get(&sequence).is_some_and(|s| !s.resolved)
    }

    /// Most recent open timer with `timer_id`
    pub fn open_timer_seq(&self, timer_id: &str) -> Option<u64> {
        self.timers
            .iter()
            .rev()
            .find(|(_, t)| t.state == TimerState::Open && t.timer_id == timer_id)
            .map(|(seq, _)| *seq)
    }

    /// Steps scheduled but not yet answered
    pub fn open_steps(&self) -> impl Iterator<Item = (u64, &StepRecord)> {
        self.steps
            .iter()
            .filter(|(_, s)| !s.resolved)
            .map(|(seq, s)| (*seq, s))
    }

    /// Timers neither fired nor cancelled
    pub fn open_timers(&self) -> impl Iterator<Item = (u64, &TimerRecord)> {
        self.timers
            .iter()
            .filter(|(_, t)| t.state == TimerState::Open)
            .map(|(seq, t)| (*seq, t))
    }

    /// Unsatisfied waits, oldest first
    pub fn open_waits(&self) -> impl Iterator<Item = (u64, &WaitRecord)> {
        self.waits
            .iter()
            .filter(|(_, w)| !w.satisfied)
            .map(|(seq, w)| (*seq, w))
    }

    /// Sub-workflows still running
    pub fn open_sub_workflows(&self) -> impl Iterator<Item = (u64, &SubWorkflowRecord)> {
        self.sub_workflows
            .iter()
            .filter(|(_, s)| !s.resolved)
            .map(|(seq, s)| (*seq, s))
    }
}

/// Result of replaying a history
#[derive(Debug)]
pub struct ReplayOutcome {
    /// Bookkeeping after the last recorded event
    pub state: ReplayState,

    /// Actions produced but not yet recorded, in order
    pub new_actions: Vec<WorkflowAction>,
}

/// Replay `history` through `workflow`
///
/// Pure with respect to the outside world: the workflow sees only history,
/// and nothing is written.
pub fn replay(
    workflow: &mut dyn AnyWorkflow,
    instance_id: Uuid,
    generation: u32,
    history: &[HistoryEvent],
) -> Result<ReplayOutcome, ReplayError> {
    let first = history.first().ok_or(ReplayError::MissingStart)?;
    if !matches!(first.event, WorkflowEvent::WorkflowStarted { .. }) {
        return Err(ReplayError::MissingStart);
    }

    let last_index = history.len() - 1;
    let context = |index: usize, entry: &HistoryEvent| {
        WorkflowContext::new(
            instance_id,
            generation,
            entry.sequence,
            entry.recorded_at,
            index < last_index,
        )
    };

    let mut state = ReplayState::default();
    state.next_sequence = first.sequence + 1;

    let mut queue: VecDeque<WorkflowAction> = VecDeque::new();
    queue.extend(workflow.on_start(&context(0, first)));

    for (index, entry) in history.iter().enumerate().skip(1) {
        let event = &entry.event;

        if event.is_decision() {
            let produced = next_action(&mut queue);
            match produced {
                Some(action) if decision_matches(&action, event) => {}
                Some(_) if is_rejected_action(event) => {}
                other => {
                    return Err(ReplayError::NonDeterminism {
                        sequence: entry.sequence,
                        recorded: event.kind().to_string(),
                        produced: other
                            .as_ref()
                            .map(describe_action)
                            .unwrap_or_else(|| "nothing".to_string()),
                    });
                }
            }
            state.observe(entry)?;
            if state.terminal.is_some() {
                break;
            }
            continue;
        }

        let Some(scheduled_seq) = event.scheduled_seq() else {
            state.observe(entry)?;
            continue;
        };

        let ctx = context(index, entry);
        let actions = match event {
            WorkflowEvent::StepCompleted { result, .. } => {
                let step_id = lookup(&state.steps, scheduled_seq, entry)?.step_id.clone();
                workflow.on_step_completed(&ctx, &step_id, result.clone())
            }
            WorkflowEvent::StepFailed { error, .. } => {
                let step_id = lookup(&state.steps, scheduled_seq, entry)?.step_id.clone();
                workflow.on_step_failed(&ctx, &step_id, error)
            }
            WorkflowEvent::TimerFired { .. } => {
                let timer_id = lookup(&state.timers, scheduled_seq, entry)?.timer_id.clone();
                workflow.on_timer_fired(&ctx, &timer_id)
            }
            WorkflowEvent::EventReceived {
                event_name,
                payload,
                ..
            } => {
                let wait_id = lookup(&state.waits, scheduled_seq, entry)?.wait_id.clone();
                let external = ExternalEvent {
                    name: event_name.clone(),
                    payload: payload.clone(),
                    received_at: entry.recorded_at,
                };
                workflow.on_event(&ctx, &wait_id, &external)
            }
            WorkflowEvent::SubWorkflowCompleted { result, .. } => {
                let step_id = lookup(&state.sub_workflows, scheduled_seq, entry)?
                    .step_id
                    .clone();
                workflow.on_sub_workflow_completed(&ctx, &step_id, result.clone())
            }
            WorkflowEvent::SubWorkflowFailed { error, .. } => {
                let step_id = lookup(&state.sub_workflows, scheduled_seq, entry)?
                    .step_id
                    .clone();
                workflow.on_sub_workflow_failed(&ctx, &step_id, error)
            }
            _ => vec![],
        };
        state.observe(entry)?;
        queue.extend(actions);
    }

    let new_actions = if state.terminal.is_some() {
        vec![]
    } else {
        truncate_after_terminal(queue)
    };

    Ok(ReplayOutcome { state, new_actions })
}

fn lookup<'a, T>(
    records: &'a BTreeMap<u64, T>,
    scheduled_seq: u64,
    entry: &HistoryEvent,
) -> Result<&'a T, ReplayError> {
    records
        .get(&scheduled_seq)
        .ok_or(ReplayError::UnknownScheduledSeq {
            sequence: entry.sequence,
            scheduled_seq,
        })
}

fn next_action(queue: &mut VecDeque<WorkflowAction>) -> Option<WorkflowAction> {
    while let Some(action) = queue.pop_front() {
        if action != WorkflowAction::None {
            return Some(action);
        }
    }
    None
}

fn truncate_after_terminal(queue: VecDeque<WorkflowAction>) -> Vec<WorkflowAction> {
    let mut actions = Vec::with_capacity(queue.len());
    for action in queue {
        if action == WorkflowAction::None {
            continue;
        }
        let terminal = action.is_terminal();
        actions.push(action);
        if terminal {
            break;
        }
    }
    actions
}

fn is_rejected_action(event: &WorkflowEvent) -> bool {
    matches!(
        event,
        WorkflowEvent::WorkflowFailed { error } if error.code.as_deref() == Some(INVALID_ACTION)
    )
}

/// Whether a recorded decision corresponds to a produced action
fn decision_matches(action: &WorkflowAction, event: &WorkflowEvent) -> bool {
    match (action, event) {
        (
            WorkflowAction::ScheduleStep {
                step_id, step_type, ..
            },
            WorkflowEvent::StepScheduled {
                step_id: recorded_id,
                step_type: recorded_type,
                ..
            },
        ) => step_id == recorded_id && step_type == recorded_type,
        (
            WorkflowAction::StartTimer { timer_id, .. },
            WorkflowEvent::TimerCreated {
                timer_id: recorded, ..
            },
        )
        | (
            WorkflowAction::CancelTimer { timer_id },
            WorkflowEvent::TimerCancelled {
                timer_id: recorded, ..
            },
        ) => timer_id == recorded,
        (
            WorkflowAction::WaitForEvent {
                wait_id,
                event_name,
            },
            WorkflowEvent::EventWaitStarted {
                wait_id: recorded_id,
                event_name: recorded_name,
            },
        ) => wait_id == recorded_id && event_name == recorded_name,
        (
            WorkflowAction::ScheduleSubWorkflow {
                step_id,
                workflow_type,
                ..
            },
            WorkflowEvent::SubWorkflowScheduled {
                step_id: recorded_id,
                workflow_type: recorded_type,
                ..
            },
        ) => step_id == recorded_id && workflow_type == recorded_type,
        (WorkflowAction::CompleteWorkflow { .. }, WorkflowEvent::WorkflowCompleted { .. })
        | (WorkflowAction::FailWorkflow { .. }, WorkflowEvent::WorkflowFailed { .. })
        | (WorkflowAction::ContinueAsNew { .. }, WorkflowEvent::WorkflowContinuedAsNew { .. }) => {
            true
        }
        _ => false,
    }
}

fn describe_action(action: &WorkflowAction) -> String {
    match action {
        WorkflowAction::ScheduleStep {
            step_id, step_type, ..
        } => format!("schedule_step({step_id}, {step_type})"),
        WorkflowAction::StartTimer { timer_id, .. } => format!("start_timer({timer_id})"),
        WorkflowAction::CancelTimer { timer_id } => format!("cancel_timer({timer_id})"),
        WorkflowAction::WaitForEvent {
            wait_id,
            event_name,
        } => format!("wait_for_event({wait_id}, {event_name})"),
        WorkflowAction::ScheduleSubWorkflow {
            step_id,
            workflow_type,
            ..
        } => format!("schedule_sub_workflow({step_id}, {workflow_type})"),
        WorkflowAction::CompleteWorkflow { .. } => "complete_workflow".to_string(),
        WorkflowAction::FailWorkflow { .. } => "fail_workflow".to_string(),
        WorkflowAction::ContinueAsNew { .. } => "continue_as_new".to_string(),
        WorkflowAction::None => "none".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::registry::WorkflowRegistry;
    use crate::step::StepError;
    use crate::workflow::{Workflow, WorkflowError};
    use serde::{Deserialize, Serialize};
    use serde_json::{json, Value};
    use std::time::Duration;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct PairInput {
        #[serde(default)]
        skip_second: bool,
    }

    /// Two parallel steps, then a timer, then completion
    struct PairWorkflow {
        input: PairInput,
        done: Vec<String>,
    }

    impl Workflow for PairWorkflow {
        const TYPE: &'static str = "pair";
        type Input = PairInput;
        type Output = Value;

        fn new(input: Self::Input) -> Self {
            Self {
                input,
                done: vec![],
            }
        }

        fn on_start(&mut self, _ctx: &WorkflowContext) -> Vec<WorkflowAction> {
            let mut actions = vec![WorkflowAction::schedule_step("a", "work", json!(1))];
            if !self.input.skip_second {
                actions.push(WorkflowAction::schedule_step("b", "work", json!(2)));
            }
            actions
        }

        fn on_step_completed(
            &mut self,
            _ctx: &WorkflowContext,
            step_id: &str,
            _result: Value,
        ) -> Vec<WorkflowAction> {
            self.done.push(step_id.to_string());
            if self.done.len() == 2 {
                vec![WorkflowAction::timer("cooldown", Duration::from_secs(1))]
            } else {
                vec![]
            }
        }

        fn on_step_failed(
            &mut self,
            _ctx: &WorkflowContext,
            _step_id: &str,
            error: &StepError,
        ) -> Vec<WorkflowAction> {
            vec![WorkflowAction::fail(WorkflowError::from(error))]
        }

        fn on_timer_fired(&mut self, _ctx: &WorkflowContext, _timer_id: &str) -> Vec<WorkflowAction> {
            vec![WorkflowAction::complete(json!(self.done))]
        }
    }

    fn workflow(input: Value) -> Box<dyn AnyWorkflow> {
        let mut registry = WorkflowRegistry::new();
        registry.register::<PairWorkflow>();
        registry.create("pair", input).unwrap()
    }

    fn history(events: Vec<WorkflowEvent>) -> Vec<HistoryEvent> {
        let now = Utc::now();
        events
            .into_iter()
            .enumerate()
            .map(|(i, event)| HistoryEvent {
                sequence: i as u64,
                recorded_at: now,
                event,
            })
            .collect()
    }

    fn started() -> WorkflowEvent {
        WorkflowEvent::WorkflowStarted {
            input: json!({}),
            generation: 0,
        }
    }

    fn scheduled(step_id: &str) -> WorkflowEvent {
        WorkflowEvent::StepScheduled {
            step_id: step_id.to_string(),
            step_type: "work".to_string(),
            input: json!(null),
            options: StepOptions::default(),
        }
    }

    fn completed(seq: u64) -> WorkflowEvent {
        WorkflowEvent::StepCompleted {
            scheduled_seq: seq,
            result: json!(null),
        }
    }

    #[test]
    fn test_fresh_history_yields_start_actions() {
        let mut wf = workflow(json!({}));
        let outcome = replay(&mut *wf, Uuid::now_v7(), 0, &history(vec![started()])).unwrap();

        assert_eq!(outcome.new_actions.len(), 2);
        assert_eq!(outcome.state.next_sequence(), 1);
    }

    #[test]
    fn test_recorded_decisions_are_not_repeated() {
        let events = history(vec![started(), scheduled("a"), scheduled("b")]);
        let mut wf = workflow(json!({}));
        let outcome = replay(&mut *wf, Uuid::now_v7(), 0, &events).unwrap();

        assert!(outcome.new_actions.is_empty());
        assert_eq!(outcome.state.open_steps().count(), 2);
    }

    #[test]
    fn test_outcomes_in_any_order_drive_the_workflow() {
        let events = history(vec![
            started(),
            scheduled("a"),
            scheduled("b"),
            completed(2),
            completed(1),
        ]);
        let mut wf = workflow(json!({}));
        let outcome = replay(&mut *wf, Uuid::now_v7(), 0, &events).unwrap();

        assert_eq!(
            outcome.new_actions,
            vec![WorkflowAction::timer("cooldown", Duration::from_secs(1))]
        );
        assert_eq!(outcome.state.open_steps().count(), 0);
    }

    #[test]
    fn test_replay_is_repeatable() {
        let events = history(vec![started(), scheduled("a"), scheduled("b"), completed(1)]);

        let first = replay(&mut *workflow(json!({})), Uuid::nil(), 0, &events).unwrap();
        let second = replay(&mut *workflow(json!({})), Uuid::nil(), 0, &events).unwrap();

        assert_eq!(first.new_actions, second.new_actions);
        assert_eq!(first.state.next_sequence(), second.state.next_sequence());
    }

    #[test]
    fn test_divergent_decision_is_non_deterministic() {
        let events = history(vec![started(), scheduled("x")]);
        let mut wf = workflow(json!({}));
        let err = replay(&mut *wf, Uuid::now_v7(), 0, &events).unwrap_err();

        assert!(matches!(err, ReplayError::NonDeterminism { sequence: 1, .. }));
    }

    #[test]
    fn test_extra_recorded_decision_is_non_deterministic() {
        let events = history(vec![started(), scheduled("a"), scheduled("b")]);
        let mut wf = workflow(json!({"skip_second": true}));
        let err = replay(&mut *wf, Uuid::now_v7(), 0, &events).unwrap_err();

        match err {
            ReplayError::NonDeterminism { produced, .. } => assert_eq!(produced, "nothing"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_missing_start() {
        let mut wf = workflow(json!({}));
        assert_eq!(
            replay(&mut *wf, Uuid::now_v7(), 0, &[]).unwrap_err(),
            ReplayError::MissingStart
        );

        let events = history(vec![scheduled("a")]);
        assert_eq!(
            replay(&mut *wf, Uuid::now_v7(), 0, &events).unwrap_err(),
            ReplayError::MissingStart
        );
    }

    #[test]
    fn test_outcome_for_unknown_decision() {
        let events = history(vec![started(), scheduled("a"), scheduled("b"), completed(7)]);
        let mut wf = workflow(json!({}));
        let err = replay(&mut *wf, Uuid::now_v7(), 0, &events).unwrap_err();

        assert_eq!(
            err,
            ReplayError::UnknownScheduledSeq {
                sequence: 3,
                scheduled_seq: 7
            }
        );
    }

    #[test]
    fn test_timer_bookkeeping() {
        let fire_at = Utc::now();
        let events = history(vec![
            started(),
            scheduled("a"),
            scheduled("b"),
            completed(1),
            completed(2),
            WorkflowEvent::TimerCreated {
                timer_id: "cooldown".to_string(),
                fire_at,
            },
        ]);
        let mut wf = workflow(json!({}));
        let outcome = replay(&mut *wf, Uuid::now_v7(), 0, &events).unwrap();

        assert_eq!(outcome.state.open_timer_seq("cooldown"), Some(5));
        assert_eq!(outcome.state.timer(5).unwrap().fire_at, fire_at);

        let mut fired = events.clone();
        fired.push(HistoryEvent {
            sequence: 6,
            recorded_at: Utc::now(),
            event: WorkflowEvent::TimerFired { scheduled_seq: 5 },
        });
        let outcome = replay(&mut *workflow(json!({})), Uuid::now_v7(), 0, &fired).unwrap();
        assert_eq!(outcome.state.timer(5).unwrap().state, TimerState::Fired);
        assert!(matches!(
            outcome.new_actions.as_slice(),
            [WorkflowAction::CompleteWorkflow { .. }]
        ));
    }

    #[test]
    fn test_terminal_history_produces_nothing_new() {
        let events = history(vec![
            started(),
            scheduled("a"),
            scheduled("b"),
            WorkflowEvent::StepFailed {
                scheduled_seq: 1,
                error: StepError::non_retryable("boom"),
            },
            WorkflowEvent::WorkflowFailed {
                error: WorkflowError::new("boom"),
            },
        ]);
        let mut wf = workflow(json!({}));
        let outcome = replay(&mut *wf, Uuid::now_v7(), 0, &events).unwrap();
        assert!(outcome.new_actions.is_empty());
        assert!(matches!(
            outcome.state.terminal(),
            Some(WorkflowEvent::WorkflowFailed { .. })
        ));
    }

    #[test]
    fn test_is_replaying_flag() {
        struct Probe {
            seen: std::sync::Arc<parking_lot::Mutex<Vec<bool>>>,
        }

        impl AnyWorkflow for Probe {
            fn workflow_type(&self) -> &'static str {
                "probe"
            }
            fn on_start(&mut self, ctx: &WorkflowContext) -> Vec<WorkflowAction> {
                self.seen.lock().push(ctx.is_replaying());
                vec![WorkflowAction::schedule_step("a", "work", json!(null))]
            }
            fn on_step_completed(
                &mut self,
                ctx: &WorkflowContext,
                _step_id: &str,
                _result: Value,
            ) -> Vec<WorkflowAction> {
                self.seen.lock().push(ctx.is_replaying());
                vec![]
            }
            fn on_step_failed(
                &mut self,
                _ctx: &WorkflowContext,
                _step_id: &str,
                _error: &StepError,
            ) -> Vec<WorkflowAction> {
                vec![]
            }
            fn on_timer_fired(&mut self, _ctx: &WorkflowContext, _timer_id: &str) -> Vec<WorkflowAction> {
                vec![]
            }
            fn on_event(
                &mut self,
                _ctx: &WorkflowContext,
                _wait_id: &str,
                _event: &ExternalEvent,
            ) -> Vec<WorkflowAction> {
                vec![]
            }
            fn on_sub_workflow_completed(
                &mut self,
                _ctx: &WorkflowContext,
                _step_id: &str,
                _result: Value,
            ) -> Vec<WorkflowAction> {
                vec![]
            }
            fn on_sub_workflow_failed(
                &mut self,
                _ctx: &WorkflowContext,
                _step_id: &str,
                _error: &WorkflowError,
            ) -> Vec<WorkflowAction> {
                vec![]
            }
        }

        let seen = std::sync::Arc::new(parking_lot::Mutex::new(vec![]));
        let mut probe = Probe { seen: seen.clone() };
        let events = history(vec![started(), scheduled("a"), completed(1)]);
        replay(&mut probe, Uuid::now_v7(), 0, &events).unwrap();

        assert_eq!(*seen.lock(), vec![true, false]);
    }
}
