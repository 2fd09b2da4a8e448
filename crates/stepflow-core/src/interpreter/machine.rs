//! Pure execution core.
//!
//! [`apply`] takes a Job, the state machine it runs, and one [`Signal`],
//! mutates the Job in memory and returns the side effects the caller must
//! perform. It never touches storage, workers or clocks: the current time
//! comes in through [`StepContext`]. Because all progress is derived from the
//! persisted cursor and attempt list, applying the same signal to the same
//! Job twice never dispatches twice.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use stepflow_types::definition::{State, StateMachine, Transition};
use stepflow_types::execution::{Frame, Phase, SleepReason};
use stepflow_types::job::{Attempt, AttemptOutcome, Job, JobStatus};
use thiserror::Error;
use uuid::Uuid;

use super::choice::choose;
use super::dispatcher::Completion;
use super::retry::{
    decide, FailureAction, ERROR_CANCELLED, ERROR_FAIL, ERROR_NO_CHOICE_MATCHED, ERROR_RUNTIME,
    ERROR_TASK_FAILED, ERROR_TIMEOUT,
};

// ---------------------------------------------------------------------------
// Signals and effects
// ---------------------------------------------------------------------------

/// Something that happened to a Job.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    /// First evaluation after the Job was created.
    Start,
    /// Re-evaluate without new information.
    Step,
    /// The dispatcher accepted an attempt.
    AttemptStarted { attempt_id: Uuid, worker_id: String },
    /// A worker reported the end of an attempt.
    AttemptFinished(Completion),
    /// A scheduled timer fired.
    Wake,
    Cancel,
    /// The dispatcher stopped an attempt we asked it to cancel.
    CancelConfirmed { attempt_id: Uuid },
    /// Re-entry after a restart: re-dispatch attempts no worker picked up.
    Recover,
}

/// Work the caller performs after persisting the Job.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Dispatch {
        attempt_id: Uuid,
        state: String,
        resource: String,
        input: Value,
    },
    CancelAttempt {
        attempt_id: Uuid,
        worker_id: Option<String>,
    },
    /// Ask the worker whether an attempt started before a restart is still
    /// running. A lost attempt comes back as a `States.WorkerLost` failure.
    PollAttempt {
        attempt_id: Uuid,
        worker_id: String,
    },
    ScheduleWake { at: DateTime<Utc> },
}

#[derive(Debug, Clone, Copy)]
pub struct StepContext {
    pub now: DateTime<Utc>,
    /// State entries allowed in one `apply`.
    pub max_transitions: u32,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InterpreterError {
    #[error("state '{0}' is not defined")]
    UnknownState(String),

    #[error("state '{0}' has no unconditional transition")]
    NoTransition(String),

    #[error("state '{state}' has no branch {index}")]
    UnknownBranch { state: String, index: usize },

    #[error("state '{0}' is forked but is not a parallel state")]
    NotParallel(String),

    #[error("attempt {0} referenced by the cursor does not exist")]
    UnknownAttempt(Uuid),

    #[error("exceeded {0} state transitions in a single step")]
    TransitionLimit(u32),
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Apply `signal` to `job`. Terminal jobs ignore every signal.
pub fn apply(
    machine: &StateMachine,
    job: &mut Job,
    signal: Signal,
    ctx: &StepContext,
) -> Result<Vec<Effect>, InterpreterError> {
    if job.is_terminal() {
        return Ok(Vec::new());
    }

    let mut run = Run {
        job,
        now: ctx.now,
        max_transitions: ctx.max_transitions,
        transitions: 0,
        redispatch: false,
        effects: Vec::new(),
    };

    match signal {
        Signal::Start | Signal::Step | Signal::Wake => {}
        Signal::Recover => run.redispatch = true,
        Signal::AttemptStarted {
            attempt_id,
            worker_id,
        } => run.record_started(attempt_id, worker_id),
        Signal::AttemptFinished(completion) => run.record_finished(completion),
        Signal::Cancel => run.request_cancel(),
        Signal::CancelConfirmed { attempt_id } => {
            run.stop_attempt(attempt_id, AttemptOutcome::failure(ERROR_CANCELLED, "cancelled"));
        }
    }

    run.drive(machine)?;
    run.job.last_updated = ctx.now;
    Ok(run.effects)
}

/// Outcome of [`apply_guarded`].
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    pub effects: Vec<Effect>,
    /// Set when the interpreter faulted and the Job was failed instead.
    pub fault: Option<String>,
}

/// [`apply`] with internal faults contained.
///
/// An `InterpreterError` or a panic leaves the Job as it was before the
/// signal, then fails it with `States.Runtime` and cancels its open attempts.
pub fn apply_guarded(machine: &StateMachine, job: &mut Job, signal: Signal, ctx: &StepContext) -> Applied {
    let mut working = job.clone();
    let result = catch_unwind(AssertUnwindSafe(|| apply(machine, &mut working, signal, ctx)));
    let message = match result {
        Ok(Ok(effects)) => {
            *job = working;
            return Applied { effects, fault: None };
        }
        Ok(Err(err)) => err.to_string(),
        Err(panic) => panic_message(&*panic),
    };

    let effects = fail_job(job, &message, ctx.now);
    Applied {
        effects,
        fault: Some(message),
    }
}

fn fail_job(job: &mut Job, message: &str, now: DateTime<Utc>) -> Vec<Effect> {
    let open: Vec<Uuid> = job
        .attempts()
        .iter()
        .filter(|a| a.is_open())
        .map(|a| a.id)
        .collect();

    let mut effects = Vec::new();
    for attempt_id in open {
        if let Some(attempt) = job.attempt_mut(attempt_id) {
            let worker_id = attempt.worker_id.clone();
            if attempt
                .stop(AttemptOutcome::failure(ERROR_RUNTIME, message), now)
                .is_ok()
            {
                effects.push(Effect::CancelAttempt {
                    attempt_id,
                    worker_id,
                });
            }
        }
    }
    job.set_status(JobStatus::Failed, Some(format!("{ERROR_RUNTIME}: {message}")), now);
    job.last_updated = now;
    effects
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

/// Status reason for a failed frame.
pub fn failure_reason(error: &str, cause: &str) -> String {
    if cause.is_empty() {
        error.to_string()
    } else {
        format!("{error}: {cause}")
    }
}

// ---------------------------------------------------------------------------
// Run: one apply in progress
// ---------------------------------------------------------------------------

struct Run<'a> {
    job: &'a mut Job,
    now: DateTime<Utc>,
    max_transitions: u32,
    transitions: u32,
    redispatch: bool,
    effects: Vec<Effect>,
}

impl Run<'_> {
    fn record_started(&mut self, attempt_id: Uuid, worker_id: String) {
        match self.job.attempt_mut(attempt_id) {
            Some(attempt) => {
                if attempt.mark_started(worker_id, self.now).is_err() {
                    tracing::debug!(%attempt_id, "start reported for a stopped attempt");
                }
            }
            None => tracing::warn!(job_id = %self.job.id, %attempt_id, "start reported for unknown attempt"),
        }
    }

    fn record_finished(&mut self, completion: Completion) {
        let attempt_id = completion.attempt_id;
        match self.job.attempt_mut(attempt_id) {
            Some(attempt) => {
                if attempt.stop(completion.outcome, self.now).is_err() {
                    tracing::debug!(%attempt_id, "ignoring completion for a stopped attempt");
                }
            }
            None => tracing::warn!(job_id = %self.job.id, %attempt_id, "completion for unknown attempt"),
        }
    }

    /// Stop an attempt if it is still open. Returns whether it was.
    fn stop_attempt(&mut self, attempt_id: Uuid, outcome: AttemptOutcome) -> bool {
        let now = self.now;
        self.job
            .attempt_mut(attempt_id)
            .is_some_and(|attempt| attempt.stop(outcome, now).is_ok())
    }

    fn request_cancel(&mut self) {
        self.job.cancel_requested = true;
        let open = self
            .job
            .cursor
            .as_ref()
            .map(Frame::open_attempts)
            .unwrap_or_default();
        for attempt_id in open {
            if let Some(attempt) = self.job.attempt(attempt_id).filter(|a| a.is_open()) {
                self.effects.push(Effect::CancelAttempt {
                    attempt_id,
                    worker_id: attempt.worker_id.clone(),
                });
            }
        }
    }

    fn drive(&mut self, machine: &StateMachine) -> Result<(), InterpreterError> {
        let mut root = match self.job.cursor.take() {
            Some(root) => root,
            None if self.job.cancel_requested => {
                self.job
                    .set_status(JobStatus::Cancelled, Some("cancelled before start".to_string()), self.now);
                return Ok(());
            }
            None => {
                self.job.set_status(JobStatus::Running, None, self.now);
                Frame::new(&machine.start_at, self.job.input.clone(), self.now)
            }
        };

        let result = self.advance(&mut root, machine, &mut Vec::new());
        if result.is_ok() {
            self.settle(&root);
        }
        self.job.cursor = Some(root);
        result
    }

    /// Map the root frame onto the Job status.
    fn settle(&mut self, root: &Frame) {
        match &root.phase {
            Phase::Done { output } => {
                self.job.output = Some(output.clone());
                self.job.set_status(JobStatus::Succeeded, None, self.now);
            }
            Phase::Failed { error, cause } => {
                self.job
                    .set_status(JobStatus::Failed, Some(failure_reason(error, cause)), self.now);
            }
            Phase::Cancelled => {
                self.job
                    .set_status(JobStatus::Cancelled, Some("cancelled".to_string()), self.now);
            }
            _ => {
                if let Some(at) = root.next_wake() {
                    self.effects.push(Effect::ScheduleWake { at });
                }
            }
        }
    }

    /// Drive `frame` until it settles or blocks on a worker or timer.
    fn advance(
        &mut self,
        frame: &mut Frame,
        machine: &StateMachine,
        path: &mut Vec<usize>,
    ) -> Result<(), InterpreterError> {
        loop {
            if self.job.cancel_requested && matches!(frame.phase, Phase::Ready | Phase::Sleeping { .. }) {
                frame.phase = Phase::Cancelled;
            }

            match &frame.phase {
                Phase::Done { .. } | Phase::Failed { .. } | Phase::Cancelled => return Ok(()),
                Phase::Ready => self.enter(frame, machine, path)?,
                Phase::Running {
                    attempt_id,
                    deadline,
                } => {
                    let (attempt_id, deadline) = (*attempt_id, *deadline);
                    if !self.resume_running(frame, machine, attempt_id, deadline)? {
                        return Ok(());
                    }
                }
                Phase::Sleeping { until, reason } => {
                    let (until, reason) = (*until, *reason);
                    // An override set while waiting releases the wait now
                    let overridden =
                        reason == SleepReason::Wait && self.job.active_override(&frame.state).is_some();
                    if until > self.now && !overridden {
                        return Ok(());
                    }
                    match reason {
                        SleepReason::Retry => frame.phase = Phase::Ready,
                        SleepReason::Wait if overridden => frame.phase = Phase::Ready,
                        SleepReason::Wait => {
                            let transition = transition_of(machine, &frame.state)?;
                            let data = frame.data.clone();
                            self.follow(frame, transition, data);
                        }
                    }
                }
                Phase::Forked { .. } => {
                    if !self.advance_parallel(frame, machine, path)? {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Evaluate the state a Ready frame sits in.
    fn enter(
        &mut self,
        frame: &mut Frame,
        machine: &StateMachine,
        path: &[usize],
    ) -> Result<(), InterpreterError> {
        self.transitions += 1;
        if self.transitions > self.max_transitions {
            return Err(InterpreterError::TransitionLimit(self.max_transitions));
        }
        let state = machine
            .state(&frame.state)
            .ok_or_else(|| InterpreterError::UnknownState(frame.state.clone()))?;
        let now = self.now;

        match state {
            State::Task(task) => {
                // Re-attach to an attempt that is still out with a worker
                if let Some(open) = self.job.open_attempt(&frame.state, path) {
                    frame.phase = Phase::Running {
                        attempt_id: open.id,
                        deadline: deadline_after(task.timeout_seconds, open.created_at),
                    };
                    return Ok(());
                }

                let attempt = Attempt::new(frame.state.clone(), path.to_vec(), now);
                let attempt_id = attempt.id;
                self.job.push_attempt(attempt);
                self.effects.push(Effect::Dispatch {
                    attempt_id,
                    state: frame.state.clone(),
                    resource: task.resource.clone(),
                    input: frame.data.clone(),
                });
                frame.phase = Phase::Running {
                    attempt_id,
                    deadline: deadline_after(task.timeout_seconds, now),
                };
            }
            State::Choice(choice) => {
                let target = match self.job.active_override(&frame.state) {
                    Some(manual) => manual.next.clone().or_else(|| choice.default.clone()),
                    None => choose(choice, &frame.data).map(str::to_string),
                };
                match target {
                    Some(next) => {
                        let data = frame.data.clone();
                        frame.enter(next, data, now);
                    }
                    None => {
                        frame.phase = Phase::Failed {
                            error: ERROR_NO_CHOICE_MATCHED.to_string(),
                            cause: format!("no rule matched in choice state '{}'", frame.state),
                        };
                    }
                }
            }
            State::Wait(wait) => {
                let manual_next = self
                    .job
                    .active_override(&frame.state)
                    .map(|manual| manual.next.clone());
                let data = frame.data.clone();
                match manual_next {
                    Some(Some(next)) => frame.enter(next, data, now),
                    Some(None) => self.follow(frame, &wait.transition, data),
                    None => {
                        let until = wait.duration.deadline(frame.entered_at);
                        if until <= now {
                            self.follow(frame, &wait.transition, data);
                        } else {
                            frame.phase = Phase::Sleeping {
                                until,
                                reason: SleepReason::Wait,
                            };
                        }
                    }
                }
            }
            State::Succeed(_) => {
                frame.phase = Phase::Done {
                    output: frame.data.clone(),
                };
            }
            State::Fail(fail) => {
                frame.phase = Phase::Failed {
                    error: fail.error.clone().unwrap_or_else(|| ERROR_FAIL.to_string()),
                    cause: fail.cause.clone().unwrap_or_default(),
                };
            }
            State::Parallel(parallel) => {
                let branches = parallel
                    .branches
                    .iter()
                    .map(|branch| Frame::new(&branch.start_at, frame.data.clone(), now))
                    .collect();
                frame.phase = Phase::Forked { branches };
            }
        }
        Ok(())
    }

    /// Handle a Running frame. Returns `true` if the frame moved on.
    fn resume_running(
        &mut self,
        frame: &mut Frame,
        machine: &StateMachine,
        attempt_id: Uuid,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<bool, InterpreterError> {
        let (is_open, worker_id) = match self.job.attempt(attempt_id) {
            Some(attempt) => (attempt.is_open(), attempt.worker_id.clone()),
            None => return Err(InterpreterError::UnknownAttempt(attempt_id)),
        };

        if is_open {
            if !deadline.is_some_and(|d| d <= self.now) {
                if self.redispatch {
                    self.reattach(frame, machine, attempt_id, worker_id);
                }
                return Ok(false);
            }
            tracing::debug!(job_id = %self.job.id, %attempt_id, state = %frame.state, "attempt timed out");
            self.stop_attempt(attempt_id, AttemptOutcome::failure(ERROR_TIMEOUT, "timed out"));
            self.effects.push(Effect::CancelAttempt {
                attempt_id,
                worker_id,
            });
        }

        let outcome = self
            .job
            .attempt(attempt_id)
            .and_then(Attempt::outcome)
            .cloned()
            .unwrap_or_default();

        if outcome.succeeded() {
            let output = outcome.output.unwrap_or_else(|| frame.data.clone());
            let transition = transition_of(machine, &frame.state)?;
            self.follow(frame, transition, output);
            return Ok(true);
        }

        let error = outcome
            .error
            .unwrap_or_else(|| ERROR_TASK_FAILED.to_string());
        let cause = match (outcome.reason, outcome.exit_code) {
            (Some(reason), _) => reason,
            (None, Some(code)) => format!("exit code {code}"),
            (None, None) => String::new(),
        };

        if self.job.cancel_requested && error == ERROR_CANCELLED {
            frame.phase = Phase::Cancelled;
            return Ok(true);
        }
        self.handle_failure(frame, machine, error, cause)?;
        Ok(true)
    }

    /// Re-entry for an attempt that was open when the engine stopped.
    ///
    /// A pending cancel is re-sent. Otherwise an attempt no worker accepted is
    /// submitted again under the same id, and an accepted one is polled.
    fn reattach(&mut self, frame: &Frame, machine: &StateMachine, attempt_id: Uuid, worker_id: Option<String>) {
        if self.job.cancel_requested {
            self.effects.push(Effect::CancelAttempt {
                attempt_id,
                worker_id,
            });
            return;
        }
        match worker_id {
            Some(worker_id) => self.effects.push(Effect::PollAttempt {
                attempt_id,
                worker_id,
            }),
            None => {
                if let Some(State::Task(task)) = machine.state(&frame.state) {
                    self.effects.push(Effect::Dispatch {
                        attempt_id,
                        state: frame.state.clone(),
                        resource: task.resource.clone(),
                        input: frame.data.clone(),
                    });
                }
            }
        }
    }

    /// Advance every branch of a Forked frame and join them.
    /// Returns `true` if the Parallel state resolved.
    fn advance_parallel(
        &mut self,
        frame: &mut Frame,
        machine: &StateMachine,
        path: &mut Vec<usize>,
    ) -> Result<bool, InterpreterError> {
        let name = frame.state.clone();
        let Some(State::Parallel(parallel)) = machine.state(&name) else {
            return Err(InterpreterError::NotParallel(name));
        };
        let Phase::Forked { branches } = &mut frame.phase else {
            return Ok(true);
        };

        let mut failure = None;
        for (index, branch) in branches.iter_mut().enumerate() {
            let sub = parallel
                .branches
                .get(index)
                .ok_or_else(|| InterpreterError::UnknownBranch {
                    state: name.clone(),
                    index,
                })?;
            path.push(index);
            let result = self.advance(branch, sub, path);
            path.pop();
            result?;

            if let Phase::Failed { error, cause } = &branch.phase {
                failure = Some((index, error.clone(), cause.clone()));
                break;
            }
        }

        if let Some((failed, error, cause)) = failure {
            for (index, branch) in branches.iter_mut().enumerate() {
                if index == failed || branch.is_settled() {
                    continue;
                }
                for attempt_id in branch.open_attempts() {
                    let worker_id = self.job.attempt(attempt_id).and_then(|a| a.worker_id.clone());
                    let outcome = AttemptOutcome::failure(ERROR_CANCELLED, "cancelled: sibling branch failed");
                    if self.stop_attempt(attempt_id, outcome) {
                        self.effects.push(Effect::CancelAttempt {
                            attempt_id,
                            worker_id,
                        });
                    }
                }
                branch.phase = Phase::Cancelled;
            }
            tracing::debug!(job_id = %self.job.id, state = %name, branch = failed, %error, "parallel branch failed");
            self.handle_failure(frame, machine, error, cause)?;
            return Ok(true);
        }

        if branches.iter().all(|b| matches!(b.phase, Phase::Done { .. })) {
            let outputs = branches
                .iter()
                .filter_map(|b| match &b.phase {
                    Phase::Done { output } => Some(output.clone()),
                    _ => None,
                })
                .collect();
            self.follow(frame, &parallel.transition, Value::Array(outputs));
            return Ok(true);
        }

        if branches.iter().all(Frame::is_settled) {
            frame.phase = Phase::Cancelled;
            return Ok(true);
        }
        Ok(false)
    }

    /// Apply the state's Retry/Catch policy to a failure.
    fn handle_failure(
        &mut self,
        frame: &mut Frame,
        machine: &StateMachine,
        error: String,
        cause: String,
    ) -> Result<(), InterpreterError> {
        let state = machine
            .state(&frame.state)
            .ok_or_else(|| InterpreterError::UnknownState(frame.state.clone()))?;

        match decide(state, &frame.retry_counts, &error) {
            FailureAction::Retry { .. } | FailureAction::Catch { .. } if self.job.cancel_requested => {
                frame.phase = Phase::Cancelled;
            }
            FailureAction::Retry { retrier, delay } => {
                *frame.retry_counts.entry(retrier).or_insert(0) += 1;
                let until = chrono::Duration::from_std(delay)
                    .ok()
                    .and_then(|delta| self.now.checked_add_signed(delta))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                tracing::debug!(
                    job_id = %self.job.id,
                    state = %frame.state,
                    %error,
                    delay_secs = delay.as_secs_f64(),
                    "scheduling retry"
                );
                frame.phase = Phase::Sleeping {
                    until,
                    reason: SleepReason::Retry,
                };
            }
            FailureAction::Catch { next } => {
                frame.enter(next, json!({"Error": error, "Cause": cause}), self.now);
            }
            FailureAction::Fail => {
                frame.phase = Phase::Failed { error, cause };
            }
        }
        Ok(())
    }

    fn follow(&self, frame: &mut Frame, transition: &Transition, output: Value) {
        match transition {
            Transition::Next(next) => frame.enter(next.clone(), output, self.now),
            Transition::End => frame.phase = Phase::Done { output },
        }
    }
}

fn transition_of<'m>(machine: &'m StateMachine, name: &str) -> Result<&'m Transition, InterpreterError> {
    machine
        .state(name)
        .ok_or_else(|| InterpreterError::UnknownState(name.to_string()))?
        .transition()
        .ok_or_else(|| InterpreterError::NoTransition(name.to_string()))
}

fn deadline_after(seconds: Option<u64>, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let seconds = i64::try_from(seconds?).ok()?;
    chrono::Duration::try_seconds(seconds).and_then(|delta| from.checked_add_signed(delta))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use stepflow_types::job::{DefinitionRef, StateOverride};

    fn parse(value: Value) -> StateMachine {
        serde_json::from_value(value).unwrap()
    }

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn at(seconds: i64) -> StepContext {
        StepContext {
            now: t0() + chrono::Duration::seconds(seconds),
            max_transitions: 64,
        }
    }

    fn job(input: Value) -> Job {
        Job::new(
            DefinitionRef {
                name: "test".to_string(),
                version: 0,
            },
            input,
            "default",
        )
    }

    fn dispatches(effects: &[Effect]) -> Vec<(Uuid, String, Value)> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Dispatch {
                    attempt_id,
                    state,
                    input,
                    ..
                } => Some((*attempt_id, state.clone(), input.clone())),
                _ => None,
            })
            .collect()
    }

    fn cancels(effects: &[Effect]) -> Vec<Uuid> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::CancelAttempt { attempt_id, .. } => Some(*attempt_id),
                _ => None,
            })
            .collect()
    }

    fn wakes(effects: &[Effect]) -> Vec<DateTime<Utc>> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::ScheduleWake { at } => Some(*at),
                _ => None,
            })
            .collect()
    }

    fn complete(
        machine: &StateMachine,
        job: &mut Job,
        attempt_id: Uuid,
        outcome: AttemptOutcome,
        ctx: StepContext,
    ) -> Vec<Effect> {
        let signal = Signal::AttemptFinished(Completion::new(job.id, attempt_id, outcome));
        apply(machine, job, signal, &ctx).unwrap()
    }

    fn single_dispatch(effects: &[Effect]) -> Uuid {
        let sent = dispatches(effects);
        assert_eq!(sent.len(), 1, "expected exactly one dispatch in {effects:?}");
        sent[0].0
    }

    fn two_tasks() -> StateMachine {
        parse(json!({
            "startAt": "fetch",
            "states": {
                "fetch": {"type": "task", "resource": "fetcher", "next": "store"},
                "store": {"type": "task", "resource": "storer", "end": true}
            }
        }))
    }

    fn retrying_task(catch: bool) -> StateMachine {
        let mut task = json!({
            "type": "task",
            "resource": "flaky",
            "end": true,
            "retry": [{"errorPatterns": ["States.ALL"], "intervalSeconds": 1, "maxAttempts": 3, "backoffRate": 2.0}]
        });
        if catch {
            task["catch"] = json!([{"errorPatterns": ["States.ALL"], "next": "handler"}]);
        }
        parse(json!({
            "startAt": "work",
            "states": {"work": task, "handler": {"type": "succeed"}}
        }))
    }

    fn two_branches(catch: bool) -> StateMachine {
        let mut parallel = json!({
            "type": "parallel",
            "end": true,
            "branches": [
                {"startAt": "left", "states": {"left": {"type": "task", "resource": "l", "end": true}}},
                {"startAt": "right", "states": {"right": {"type": "task", "resource": "r", "end": true}}}
            ]
        });
        if catch {
            parallel["catch"] = json!([{"errorPatterns": ["States.ALL"], "next": "cleanup"}]);
        }
        parse(json!({
            "startAt": "fan",
            "states": {"fan": parallel, "cleanup": {"type": "fail", "error": "Cleaned", "cause": "after branch failure"}}
        }))
    }

    #[test]
    fn test_linear_success() {
        let machine = two_tasks();
        let mut job = job(json!({"id": 7}));

        let effects = apply(&machine, &mut job, Signal::Start, &at(0)).unwrap();
        assert_eq!(job.status(), Some(JobStatus::Running));
        let sent = dispatches(&effects);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, "fetch");
        assert_eq!(sent[0].2, json!({"id": 7}));

        let effects = complete(&machine, &mut job, sent[0].0, AttemptOutcome::success(Some(json!({"rows": 3}))), at(1));
        let sent = dispatches(&effects);
        assert_eq!(sent[0].1, "store");
        assert_eq!(sent[0].2, json!({"rows": 3}));

        complete(&machine, &mut job, sent[0].0, AttemptOutcome::success(None), at(2));
        assert_eq!(job.status(), Some(JobStatus::Succeeded));
        assert_eq!(job.output, Some(json!({"rows": 3})));
        assert_eq!(job.attempts().len(), 2);
        assert!(job.attempts().iter().all(|a| !a.is_open()));
    }

    #[test]
    fn test_stepping_twice_never_dispatches_twice() {
        let machine = two_tasks();
        let mut job = job(json!({}));
        let first = apply(&machine, &mut job, Signal::Start, &at(0)).unwrap();
        assert_eq!(dispatches(&first).len(), 1);

        for _ in 0..2 {
            let again = apply(&machine, &mut job, Signal::Step, &at(1)).unwrap();
            assert!(dispatches(&again).is_empty());
        }
        assert_eq!(job.attempts().len(), 1);
    }

    #[test]
    fn test_open_attempt_is_reused_after_cursor_reset() {
        let machine = two_tasks();
        let mut job = job(json!({}));
        let effects = apply(&machine, &mut job, Signal::Start, &at(0)).unwrap();
        let attempt_id = single_dispatch(&effects);

        // A re-entry that lost the Running phase must not dispatch again
        job.cursor = Some(Frame::new("fetch", json!({}), t0()));
        let effects = apply(&machine, &mut job, Signal::Step, &at(1)).unwrap();
        assert!(dispatches(&effects).is_empty());
        assert_eq!(job.attempts().len(), 1);
        assert_eq!(
            job.cursor.as_ref().unwrap().phase,
            Phase::Running {
                attempt_id,
                deadline: None
            }
        );
    }

    #[test]
    fn test_retry_backoff_then_catch() {
        let machine = retrying_task(true);
        let mut job = job(json!({}));
        let mut now = 0;
        let mut attempt_id = single_dispatch(&apply(&machine, &mut job, Signal::Start, &at(now)).unwrap());

        for expected_delay in [1, 2, 4] {
            let effects = complete(&machine, &mut job, attempt_id, AttemptOutcome::failure("Worker.Crashed", "boom"), at(now));
            assert_eq!(wakes(&effects), vec![at(now + expected_delay).now]);
            assert!(dispatches(&effects).is_empty());

            // An early wake does nothing
            let early = apply(&machine, &mut job, Signal::Wake, &at(now + expected_delay - 1)).unwrap();
            assert!(dispatches(&early).is_empty());

            now += expected_delay;
            attempt_id = single_dispatch(&apply(&machine, &mut job, Signal::Wake, &at(now)).unwrap());
        }

        complete(&machine, &mut job, attempt_id, AttemptOutcome::failure("Worker.Crashed", "boom"), at(now));
        assert_eq!(job.attempts().len(), 4);
        assert_eq!(job.status(), Some(JobStatus::Succeeded));
        assert_eq!(job.output, Some(json!({"Error": "Worker.Crashed", "Cause": "boom"})));
    }

    #[test]
    fn test_retry_exhausted_without_catch_fails() {
        let machine = retrying_task(false);
        let mut job = job(json!({}));
        let mut now = 0;
        let mut attempt_id = single_dispatch(&apply(&machine, &mut job, Signal::Start, &at(now)).unwrap());
        for delay in [1, 2, 4] {
            complete(&machine, &mut job, attempt_id, AttemptOutcome::failure("E", "bad"), at(now));
            now += delay;
            attempt_id = single_dispatch(&apply(&machine, &mut job, Signal::Wake, &at(now)).unwrap());
        }
        complete(&machine, &mut job, attempt_id, AttemptOutcome::failure("E", "bad"), at(now));
        assert_eq!(job.status(), Some(JobStatus::Failed));
        assert_eq!(job.status_reason.as_deref(), Some("E: bad"));
    }

    #[test]
    fn test_unmatched_error_skips_retry() {
        let machine = parse(json!({
            "startAt": "work",
            "states": {
                "work": {
                    "type": "task", "resource": "r", "end": true,
                    "retry": [{"errorPatterns": ["Custom.Retryable"]}]
                }
            }
        }));
        let mut job = job(json!({}));
        let attempt_id = single_dispatch(&apply(&machine, &mut job, Signal::Start, &at(0)).unwrap());
        let outcome = AttemptOutcome {
            exit_code: Some(3),
            ..AttemptOutcome::default()
        };
        complete(&machine, &mut job, attempt_id, outcome, at(1));
        assert_eq!(job.status(), Some(JobStatus::Failed));
        assert_eq!(job.status_reason.as_deref(), Some("States.TaskFailed: exit code 3"));
    }

    #[test]
    fn test_dispatch_failure_is_retried() {
        let machine = retrying_task(false);
        let mut job = job(json!({}));
        let attempt_id = single_dispatch(&apply(&machine, &mut job, Signal::Start, &at(0)).unwrap());
        let outcome = AttemptOutcome::failure(crate::interpreter::retry::ERROR_DISPATCH_FAILED, "no such resource");
        let effects = complete(&machine, &mut job, attempt_id, outcome, at(0));
        assert_eq!(wakes(&effects), vec![at(1).now]);
        assert_eq!(job.status(), Some(JobStatus::Running));
    }

    #[test]
    fn test_task_timeout() {
        let machine = parse(json!({
            "startAt": "slow",
            "states": {
                "slow": {
                    "type": "task", "resource": "r", "next": "after", "timeoutSeconds": 5,
                    "catch": [{"errorPatterns": ["States.Timeout"], "next": "timed-out"}]
                },
                "after": {"type": "succeed"},
                "timed-out": {"type": "fail", "error": "TooSlow"}
            }
        }));
        let mut job = job(json!({}));
        let effects = apply(&machine, &mut job, Signal::Start, &at(0)).unwrap();
        let attempt_id = single_dispatch(&effects);
        assert_eq!(wakes(&effects), vec![at(5).now]);

        let early = apply(&machine, &mut job, Signal::Wake, &at(4)).unwrap();
        assert!(cancels(&early).is_empty());
        assert_eq!(job.status(), Some(JobStatus::Running));

        let effects = apply(&machine, &mut job, Signal::Wake, &at(5)).unwrap();
        assert_eq!(cancels(&effects), vec![attempt_id]);
        assert_eq!(job.attempt(attempt_id).unwrap().reason(), Some("timed out"));
        assert_eq!(job.status(), Some(JobStatus::Failed));
        assert_eq!(job.status_reason.as_deref(), Some("TooSlow"));

        // The worker's late success changes nothing
        complete(&machine, &mut job, attempt_id, AttemptOutcome::success(None), at(6));
        assert_eq!(job.status(), Some(JobStatus::Failed));
    }

    fn routing_machine() -> StateMachine {
        parse(json!({
            "startAt": "route",
            "states": {
                "route": {
                    "type": "choice",
                    "choices": [
                        {"stringEquals": {"variable": "$.kind", "value": "csv"}, "next": "csv"},
                        {"numericGreaterThan": {"variable": "$.size", "value": 100}, "next": "big"}
                    ],
                    "default": "other"
                },
                "csv": {"type": "succeed"},
                "big": {"type": "succeed"},
                "other": {"type": "fail", "error": "Unroutable", "cause": "nothing matched"}
            }
        }))
    }

    #[test]
    fn test_choice_routes_on_data() {
        let machine = routing_machine();
        for (input, expected) in [
            (json!({"kind": "csv"}), JobStatus::Succeeded),
            (json!({"kind": "xml", "size": 500}), JobStatus::Succeeded),
            (json!({"kind": "xml", "size": 5}), JobStatus::Failed),
        ] {
            let mut job = job(input);
            apply(&machine, &mut job, Signal::Start, &at(0)).unwrap();
            assert_eq!(job.status(), Some(expected));
        }

        let mut job = job(json!({"kind": "xml", "size": 500}));
        apply(&machine, &mut job, Signal::Start, &at(0)).unwrap();
        assert_eq!(job.cursor.as_ref().unwrap().state, "big");
    }

    #[test]
    fn test_choice_without_match_or_default_fails() {
        let machine = parse(json!({
            "startAt": "route",
            "states": {
                "route": {"type": "choice", "choices": [{"booleanEquals": {"variable": "$.ok", "value": true}, "next": "done"}]},
                "done": {"type": "succeed"}
            }
        }));
        let mut job = job(json!({"ok": false}));
        apply(&machine, &mut job, Signal::Start, &at(0)).unwrap();
        assert_eq!(job.status(), Some(JobStatus::Failed));
        assert!(job.status_reason.as_deref().unwrap().starts_with(ERROR_NO_CHOICE_MATCHED));
    }

    #[test]
    fn test_choice_override_takes_precedence() {
        let machine = routing_machine();
        let mut job = job(json!({"kind": "csv"}));
        job.overrides.insert(
            "route".to_string(),
            StateOverride {
                is_set: true,
                next: Some("big".to_string()),
            },
        );
        apply(&machine, &mut job, Signal::Start, &at(0)).unwrap();
        assert_eq!(job.cursor.as_ref().unwrap().state, "big");

        // Set without a target: take the default
        let mut job = self::job(json!({"kind": "csv"}));
        job.overrides.insert(
            "route".to_string(),
            StateOverride {
                is_set: true,
                next: None,
            },
        );
        apply(&machine, &mut job, Signal::Start, &at(0)).unwrap();
        assert_eq!(job.cursor.as_ref().unwrap().state, "other");

        // Present but unset overrides are ignored
        let mut job = self::job(json!({"kind": "csv"}));
        job.overrides.insert("route".to_string(), StateOverride::default());
        apply(&machine, &mut job, Signal::Start, &at(0)).unwrap();
        assert_eq!(job.cursor.as_ref().unwrap().state, "csv");
    }

    fn waiting_machine() -> StateMachine {
        parse(json!({
            "startAt": "pause",
            "states": {
                "pause": {"type": "wait", "seconds": 30, "next": "done"},
                "done": {"type": "succeed"},
                "skipped-to": {"type": "succeed"}
            }
        }))
    }

    #[test]
    fn test_wait_sleeps_until_deadline() {
        let machine = waiting_machine();
        let mut job = job(json!({"v": 1}));
        let effects = apply(&machine, &mut job, Signal::Start, &at(0)).unwrap();
        assert_eq!(wakes(&effects), vec![at(30).now]);
        assert_eq!(job.status(), Some(JobStatus::Running));

        apply(&machine, &mut job, Signal::Wake, &at(29)).unwrap();
        assert_eq!(job.status(), Some(JobStatus::Running));

        apply(&machine, &mut job, Signal::Wake, &at(30)).unwrap();
        assert_eq!(job.status(), Some(JobStatus::Succeeded));
        assert_eq!(job.output, Some(json!({"v": 1})));
    }

    #[test]
    fn test_wait_with_past_timestamp_proceeds() {
        let machine = parse(json!({
            "startAt": "pause",
            "states": {
                "pause": {"type": "wait", "timestamp": "2020-01-01T00:00:00Z", "end": true}
            }
        }));
        let mut job = job(json!({}));
        let effects = apply(&machine, &mut job, Signal::Start, &at(0)).unwrap();
        assert!(wakes(&effects).is_empty());
        assert_eq!(job.status(), Some(JobStatus::Succeeded));
    }

    #[test]
    fn test_wait_override_skips_timer() {
        let machine = waiting_machine();
        let mut job = job(json!({}));
        apply(&machine, &mut job, Signal::Start, &at(0)).unwrap();
        assert_eq!(job.status(), Some(JobStatus::Running));

        job.overrides.insert(
            "pause".to_string(),
            StateOverride {
                is_set: true,
                next: Some("skipped-to".to_string()),
            },
        );
        apply(&machine, &mut job, Signal::Step, &at(1)).unwrap();
        assert_eq!(job.status(), Some(JobStatus::Succeeded));
        assert_eq!(job.cursor.as_ref().unwrap().state, "skipped-to");

        let mut job = self::job(json!({}));
        job.overrides.insert(
            "pause".to_string(),
            StateOverride {
                is_set: true,
                next: None,
            },
        );
        apply(&machine, &mut job, Signal::Start, &at(0)).unwrap();
        assert_eq!(job.cursor.as_ref().unwrap().state, "done");
    }

    #[test]
    fn test_parallel_joins_exactly_once() {
        let machine = two_branches(false);
        let mut job = job(json!({"n": 1}));
        let effects = apply(&machine, &mut job, Signal::Start, &at(0)).unwrap();
        let sent = dispatches(&effects);
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|(_, _, input)| *input == json!({"n": 1})));
        let left = sent.iter().find(|(_, s, _)| s == "left").unwrap().0;
        let right = sent.iter().find(|(_, s, _)| s == "right").unwrap().0;
        assert_eq!(job.attempt(left).unwrap().branch_path, vec![0]);
        assert_eq!(job.attempt(right).unwrap().branch_path, vec![1]);

        complete(&machine, &mut job, right, AttemptOutcome::success(Some(json!("R"))), at(1));
        assert_eq!(job.status(), Some(JobStatus::Running));
        assert!(job.output.is_none());

        complete(&machine, &mut job, left, AttemptOutcome::success(Some(json!("L"))), at(2));
        assert_eq!(job.status(), Some(JobStatus::Succeeded));
        assert_eq!(job.output, Some(json!(["L", "R"])));

        // A duplicate completion after the join is ignored
        let effects = complete(&machine, &mut job, left, AttemptOutcome::success(Some(json!("again"))), at(3));
        assert!(effects.is_empty());
        assert_eq!(job.output, Some(json!(["L", "R"])));
    }

    #[test]
    fn test_parallel_branch_failure_cancels_siblings() {
        let machine = two_branches(false);
        let mut job = job(json!({}));
        let sent = dispatches(&apply(&machine, &mut job, Signal::Start, &at(0)).unwrap());
        let left = sent[0].0;
        let right = sent[1].0;

        let effects = complete(&machine, &mut job, left, AttemptOutcome::failure("Branch.Error", "left broke"), at(1));
        assert_eq!(cancels(&effects), vec![right]);
        assert!(dispatches(&effects).is_empty());
        assert_eq!(
            job.attempt(right).unwrap().reason(),
            Some("cancelled: sibling branch failed")
        );
        assert_eq!(job.status(), Some(JobStatus::Failed));
        assert_eq!(job.status_reason.as_deref(), Some("Branch.Error: left broke"));

        complete(&machine, &mut job, right, AttemptOutcome::success(None), at(2));
        assert_eq!(job.status(), Some(JobStatus::Failed));
    }

    #[test]
    fn test_parallel_failure_goes_through_catch() {
        let machine = two_branches(true);
        let mut job = job(json!({}));
        let sent = dispatches(&apply(&machine, &mut job, Signal::Start, &at(0)).unwrap());
        complete(&machine, &mut job, sent[1].0, AttemptOutcome::failure("Branch.Error", "right broke"), at(1));
        assert_eq!(job.status(), Some(JobStatus::Failed));
        assert_eq!(job.status_reason.as_deref(), Some("Cleaned: after branch failure"));
        assert!(!job.attempt(sent[0].0).unwrap().is_open());
    }

    #[test]
    fn test_cancel_waits_for_confirmation() {
        let machine = two_tasks();
        let mut job = job(json!({}));
        let attempt_id = single_dispatch(&apply(&machine, &mut job, Signal::Start, &at(0)).unwrap());
        apply(
            &machine,
            &mut job,
            Signal::AttemptStarted {
                attempt_id,
                worker_id: "pid-42".to_string(),
            },
            &at(0),
        )
        .unwrap();

        let effects = apply(&machine, &mut job, Signal::Cancel, &at(1)).unwrap();
        assert_eq!(
            effects,
            vec![Effect::CancelAttempt {
                attempt_id,
                worker_id: Some("pid-42".to_string())
            }]
        );
        assert!(job.cancel_requested);
        assert_eq!(job.status(), Some(JobStatus::Running));

        apply(&machine, &mut job, Signal::CancelConfirmed { attempt_id }, &at(2)).unwrap();
        assert_eq!(job.status(), Some(JobStatus::Cancelled));
        assert_eq!(job.attempt(attempt_id).unwrap().reason(), Some("cancelled"));
    }

    #[test]
    fn test_natural_completion_beats_pending_cancel() {
        let machine = retrying_task(false);
        let mut job = job(json!({}));
        let attempt_id = single_dispatch(&apply(&machine, &mut job, Signal::Start, &at(0)).unwrap());
        apply(&machine, &mut job, Signal::Cancel, &at(1)).unwrap();

        complete(&machine, &mut job, attempt_id, AttemptOutcome::success(Some(json!("done"))), at(2));
        assert_eq!(job.status(), Some(JobStatus::Succeeded));

        apply(&machine, &mut job, Signal::CancelConfirmed { attempt_id }, &at(3)).unwrap();
        assert_eq!(job.status(), Some(JobStatus::Succeeded));
    }

    #[test]
    fn test_no_dispatch_after_cancel_requested() {
        let machine = two_tasks();
        let mut job = job(json!({}));
        let attempt_id = single_dispatch(&apply(&machine, &mut job, Signal::Start, &at(0)).unwrap());
        apply(&machine, &mut job, Signal::Cancel, &at(1)).unwrap();

        let effects = complete(&machine, &mut job, attempt_id, AttemptOutcome::success(None), at(2));
        assert!(dispatches(&effects).is_empty());
        assert_eq!(job.status(), Some(JobStatus::Cancelled));
    }

    #[test]
    fn test_cancel_without_open_attempt_is_immediate() {
        let machine = waiting_machine();
        let mut job = job(json!({}));
        apply(&machine, &mut job, Signal::Start, &at(0)).unwrap();
        let effects = apply(&machine, &mut job, Signal::Cancel, &at(1)).unwrap();
        assert!(effects.is_empty());
        assert_eq!(job.status(), Some(JobStatus::Cancelled));

        let mut unstarted = self::job(json!({}));
        apply(&machine, &mut unstarted, Signal::Cancel, &at(0)).unwrap();
        assert_eq!(unstarted.status(), Some(JobStatus::Cancelled));
        assert!(unstarted.cursor.is_none());
    }

    #[test]
    fn test_recover_redispatches_unstarted_attempts() {
        let machine = two_tasks();
        let mut job = job(json!({"x": 1}));
        let attempt_id = single_dispatch(&apply(&machine, &mut job, Signal::Start, &at(0)).unwrap());

        let effects = apply(&machine, &mut job, Signal::Recover, &at(1)).unwrap();
        assert_eq!(single_dispatch(&effects), attempt_id);
        assert_eq!(job.attempts().len(), 1);

        apply(
            &machine,
            &mut job,
            Signal::AttemptStarted {
                attempt_id,
                worker_id: "w".to_string(),
            },
            &at(1),
        )
        .unwrap();
        let effects = apply(&machine, &mut job, Signal::Recover, &at(2)).unwrap();
        assert!(dispatches(&effects).is_empty());
        assert_eq!(
            effects,
            vec![Effect::PollAttempt {
                attempt_id,
                worker_id: "w".to_string()
            }]
        );
    }

    #[test]
    fn test_lost_attempt_goes_through_retry() {
        let machine = retrying_task(false);
        let mut job = job(json!({}));
        let attempt_id = single_dispatch(&apply(&machine, &mut job, Signal::Start, &at(0)).unwrap());
        apply(
            &machine,
            &mut job,
            Signal::AttemptStarted {
                attempt_id,
                worker_id: "pid-7".to_string(),
            },
            &at(0),
        )
        .unwrap();

        let effects = complete(
            &machine,
            &mut job,
            attempt_id,
            AttemptOutcome::failure(crate::interpreter::retry::ERROR_WORKER_LOST, "worker restarted"),
            at(1),
        );
        assert!(matches!(effects.as_slice(), [Effect::ScheduleWake { .. }]));
        assert_eq!(job.status(), Some(JobStatus::Running));
        assert!(!job.attempt(attempt_id).unwrap().is_open());
    }

    #[test]
    fn test_recover_resends_pending_cancel() {
        let machine = two_tasks();
        let mut job = job(json!({}));
        let attempt_id = single_dispatch(&apply(&machine, &mut job, Signal::Start, &at(0)).unwrap());
        apply(&machine, &mut job, Signal::Cancel, &at(1)).unwrap();

        let effects = apply(&machine, &mut job, Signal::Recover, &at(2)).unwrap();
        assert_eq!(effects, vec![Effect::CancelAttempt { attempt_id, worker_id: None }]);
        assert!(dispatches(&effects).is_empty());

        apply(&machine, &mut job, Signal::CancelConfirmed { attempt_id }, &at(3)).unwrap();
        assert_eq!(job.status(), Some(JobStatus::Cancelled));
    }

    #[test]
    fn test_terminal_status_is_sticky() {
        let machine = parse(json!({
            "startAt": "boom",
            "states": {"boom": {"type": "fail", "error": "Custom", "cause": "why"}}
        }));
        let mut job = job(json!({}));
        apply(&machine, &mut job, Signal::Start, &at(0)).unwrap();
        assert_eq!(job.status(), Some(JobStatus::Failed));
        assert_eq!(job.status_reason.as_deref(), Some("Custom: why"));

        for signal in [Signal::Step, Signal::Cancel, Signal::Recover, Signal::Wake] {
            assert!(apply(&machine, &mut job, signal, &at(1)).unwrap().is_empty());
            assert_eq!(job.status(), Some(JobStatus::Failed));
        }
        assert!(!job.cancel_requested);
    }

    #[test]
    fn test_transition_limit_fails_job() {
        let machine = parse(json!({
            "startAt": "check",
            "states": {
                "check": {"type": "choice", "choices": [{"booleanEquals": {"variable": "$.done", "value": true}, "next": "end"}], "default": "spin"},
                "spin": {"type": "wait", "seconds": 0, "next": "check"},
                "end": {"type": "succeed"}
            }
        }));
        let mut job = job(json!({"done": false}));
        let applied = apply_guarded(&machine, &mut job, Signal::Start, &at(0));
        assert!(applied.fault.is_some());
        assert_eq!(job.status(), Some(JobStatus::Failed));
        assert!(job.status_reason.as_deref().unwrap().starts_with("States.Runtime: exceeded 64"));
    }

    #[test]
    fn test_fault_cancels_open_attempts() {
        let machine = two_tasks();
        let mut job = job(json!({}));
        let attempt_id = single_dispatch(&apply(&machine, &mut job, Signal::Start, &at(0)).unwrap());

        // Cursor pointing at a state the machine lacks is an internal fault
        let mut broken = job.cursor.clone().unwrap();
        broken.state = "vanished".to_string();
        broken.phase = Phase::Ready;
        job.cursor = Some(broken);

        let applied = apply_guarded(&machine, &mut job, Signal::Step, &at(1));
        assert_eq!(applied.fault.as_deref(), Some("state 'vanished' is not defined"));
        assert_eq!(applied.effects, vec![Effect::CancelAttempt { attempt_id, worker_id: None }]);
        assert_eq!(job.status(), Some(JobStatus::Failed));
        assert!(!job.attempt(attempt_id).unwrap().is_open());
    }

    #[test]
    fn test_guarded_apply_passes_through_success() {
        let machine = two_tasks();
        let mut job = job(json!({}));
        let applied = apply_guarded(&machine, &mut job, Signal::Start, &at(0));
        assert!(applied.fault.is_none());
        assert_eq!(dispatches(&applied.effects).len(), 1);
        assert_eq!(job.attempts().len(), 1);
    }
}
