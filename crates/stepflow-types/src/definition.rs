//! Workflow definition types for Stepflow.
//!
//! A `WorkflowDefinition` is a named, versioned state machine. Definitions are
//! authored as JSON or YAML documents with camelCase fields and are immutable
//! once stored: editing a definition produces a new version.
//!
//! States form an exhaustive tagged union so that invalid field combinations
//! (a Choice carrying a resource, a Succeed carrying a Next) cannot be expressed.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Error pattern that matches every failure.
pub const ERROR_ALL: &str = "States.ALL";

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// A stored, versioned workflow definition.
///
/// `(name, version)` is unique across the store. Versions start at 0 and grow
/// monotonically per name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    /// UUIDv7 allocated per stored row.
    pub id: Uuid,
    /// Logical workflow name shared by all versions.
    pub name: String,
    /// Version number within `name`.
    pub version: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Backend that executes Task states.
    #[serde(default)]
    pub manager: Manager,
    pub state_machine: StateMachine,
}

/// Worker backend that executes a definition's Task states.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Manager {
    #[default]
    StepFunctions,
    Batch,
}

impl fmt::Display for Manager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Manager::StepFunctions => write!(f, "step-functions"),
            Manager::Batch => write!(f, "batch"),
        }
    }
}

impl FromStr for Manager {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "step-functions" => Ok(Manager::StepFunctions),
            "batch" => Ok(Manager::Batch),
            other => Err(format!("unknown manager: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// State Machine
// ---------------------------------------------------------------------------

/// A start state plus the named states reachable from it.
///
/// States are kept in a `BTreeMap` so every traversal observes them in name
/// order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateMachine {
    pub start_at: String,
    pub states: BTreeMap<String, State>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// Upper bound on a whole execution, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

impl StateMachine {
    /// Build a machine from a start state and `(name, state)` pairs.
    pub fn new(start_at: impl Into<String>, states: impl IntoIterator<Item = (String, State)>) -> Self {
        Self {
            start_at: start_at.into(),
            states: states.into_iter().collect(),
            comment: None,
            timeout_seconds: None,
        }
    }

    /// Look up a state by name.
    pub fn state(&self, name: &str) -> Option<&State> {
        self.states.get(name)
    }
}

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

/// One node of a state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum State {
    Task(TaskState),
    Choice(ChoiceState),
    Wait(WaitState),
    Succeed(SucceedState),
    Fail(FailState),
    Parallel(ParallelState),
}

/// Discriminant of a [`State`], used for logging and display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateKind {
    Task,
    Choice,
    Wait,
    Succeed,
    Fail,
    Parallel,
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StateKind::Task => "task",
            StateKind::Choice => "choice",
            StateKind::Wait => "wait",
            StateKind::Succeed => "succeed",
            StateKind::Fail => "fail",
            StateKind::Parallel => "parallel",
        };
        f.write_str(name)
    }
}

impl State {
    pub fn kind(&self) -> StateKind {
        match self {
            State::Task(_) => StateKind::Task,
            State::Choice(_) => StateKind::Choice,
            State::Wait(_) => StateKind::Wait,
            State::Succeed(_) => StateKind::Succeed,
            State::Fail(_) => StateKind::Fail,
            State::Parallel(_) => StateKind::Parallel,
        }
    }

    /// The unconditional transition of this state, if it has one.
    ///
    /// Choice routes through its rules, and Succeed/Fail are terminal, so
    /// those return `None`.
    pub fn transition(&self) -> Option<&Transition> {
        match self {
            State::Task(task) => Some(&task.transition),
            State::Wait(wait) => Some(&wait.transition),
            State::Parallel(parallel) => Some(&parallel.transition),
            State::Choice(_) | State::Succeed(_) | State::Fail(_) => None,
        }
    }

    /// Successor named by an unconditional `next`, if any.
    pub fn next(&self) -> Option<&str> {
        self.transition().and_then(Transition::next)
    }

    /// Every state name a running instance could move to from this state:
    /// `next`, Choice targets, the Choice default, and Catch targets.
    pub fn targets(&self) -> Vec<&str> {
        let mut targets = Vec::new();
        if let Some(next) = self.next() {
            targets.push(next);
        }
        if let State::Choice(choice) = self {
            targets.extend(choice.choices.iter().map(|rule| rule.next.as_str()));
            if let Some(default) = &choice.default {
                targets.push(default.as_str());
            }
        }
        targets.extend(self.catch().iter().map(|catcher| catcher.next.as_str()));
        targets
    }

    /// Ordered retry policy (empty for states that cannot fail over).
    pub fn retry(&self) -> &[Retrier] {
        match self {
            State::Task(task) => &task.retry,
            State::Parallel(parallel) => &parallel.retry,
            _ => &[],
        }
    }

    /// Ordered catch policy (empty for states that cannot fail over).
    pub fn catch(&self) -> &[Catcher] {
        match self {
            State::Task(task) => &task.catch,
            State::Parallel(parallel) => &parallel.catch,
            _ => &[],
        }
    }

    /// Resource identifier of a Task state.
    pub fn resource(&self) -> Option<&str> {
        match self {
            State::Task(task) => Some(task.resource.as_str()),
            _ => None,
        }
    }

    /// True for Succeed and Fail, which end execution on entry.
    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Succeed(_) | State::Fail(_))
    }
}

/// How a non-terminal state leaves: to a named successor, or by ending the
/// enclosing machine.
///
/// On the wire this is `next: "<name>"` or `end: true`; exactly one must be
/// present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "TransitionFields", into = "TransitionFields")]
pub enum Transition {
    Next(String),
    End,
}

impl Transition {
    pub fn next(&self) -> Option<&str> {
        match self {
            Transition::Next(name) => Some(name.as_str()),
            Transition::End => None,
        }
    }

    pub fn is_end(&self) -> bool {
        matches!(self, Transition::End)
    }
}

/// Wire form of [`Transition`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub end: bool,
}

impl TryFrom<TransitionFields> for Transition {
    type Error = String;

    fn try_from(fields: TransitionFields) -> Result<Self, Self::Error> {
        match (fields.next, fields.end) {
            (Some(next), false) if !next.is_empty() => Ok(Transition::Next(next)),
            (Some(_), false) => Err("next must not be empty".to_string()),
            (None, true) => Ok(Transition::End),
            (Some(next), true) => Err(format!("state sets both next ('{next}') and end")),
            (None, false) => Err("state must set either next or end".to_string()),
        }
    }
}

impl From<Transition> for TransitionFields {
    fn from(transition: Transition) -> Self {
        match transition {
            Transition::Next(next) => Self {
                next: Some(next),
                end: false,
            },
            Transition::End => Self {
                next: None,
                end: true,
            },
        }
    }
}

/// Dispatches work to an external worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskState {
    /// Name of the state resource resolved at dispatch time.
    pub resource: String,
    #[serde(flatten)]
    pub transition: Transition,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retry: Vec<Retrier>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub catch: Vec<Catcher>,
    /// Per-attempt deadline, in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// Routes to the first rule whose condition holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChoiceState {
    pub choices: Vec<ChoiceRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// Suspends the execution for a duration or until a timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitState {
    #[serde(flatten)]
    pub duration: WaitDuration,
    #[serde(flatten)]
    pub transition: Transition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WaitDuration {
    Seconds(u64),
    Timestamp(DateTime<Utc>),
}

impl WaitDuration {
    /// Instant at which a wait entered at `entered_at` elapses.
    pub fn deadline(&self, entered_at: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            WaitDuration::Seconds(seconds) => i64::try_from(*seconds)
                .ok()
                .and_then(chrono::Duration::try_seconds)
                .and_then(|delta| entered_at.checked_add_signed(delta))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            WaitDuration::Timestamp(at) => *at,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SucceedState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// Runs every branch concurrently and joins on all of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParallelState {
    /// Independent sub-machines; each receives the state's input.
    pub branches: Vec<StateMachine>,
    #[serde(flatten)]
    pub transition: Transition,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retry: Vec<Retrier>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub catch: Vec<Catcher>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

// ---------------------------------------------------------------------------
// Failure handling
// ---------------------------------------------------------------------------

/// Retries a failed state in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Retrier {
    pub error_patterns: Vec<String>,
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_rate")]
    pub backoff_rate: f64,
}

fn default_interval_seconds() -> u64 {
    1
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_rate() -> f64 {
    2.0
}

impl Retrier {
    /// A retrier matching `patterns` with the default interval, attempts and rate.
    pub fn new(patterns: &[&str]) -> Self {
        Self {
            error_patterns: patterns.iter().map(|p| p.to_string()).collect(),
            interval_seconds: default_interval_seconds(),
            max_attempts: default_max_attempts(),
            backoff_rate: default_backoff_rate(),
        }
    }

    pub fn matches(&self, error: &str) -> bool {
        matches_error(&self.error_patterns, error)
    }

    /// Delay before retry number `retry_index` (0-based):
    /// `interval * backoff_rate^retry_index`.
    pub fn delay_for(&self, retry_index: u32) -> Duration {
        let exponent = i32::try_from(retry_index).unwrap_or(i32::MAX);
        let seconds = self.interval_seconds as f64 * self.backoff_rate.powi(exponent);
        Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX)
    }
}

/// Redirects a failed state to a recovery state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Catcher {
    pub error_patterns: Vec<String>,
    pub next: String,
}

impl Catcher {
    pub fn matches(&self, error: &str) -> bool {
        matches_error(&self.error_patterns, error)
    }
}

fn matches_error(patterns: &[String], error: &str) -> bool {
    patterns
        .iter()
        .any(|pattern| pattern == ERROR_ALL || pattern == error)
}

// ---------------------------------------------------------------------------
// Choice rules
// ---------------------------------------------------------------------------

/// A condition and the state to take when it holds.
///
/// The condition is flattened next to `next`:
/// `{"stringEquals": {"variable": "$.kind", "value": "x"}, "next": "handle-x"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChoiceRule {
    #[serde(flatten)]
    pub condition: Condition,
    pub next: String,
}

/// Predicate over the execution's current data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Condition {
    StringEquals(Comparison<String>),
    NumericEquals(Comparison<f64>),
    NumericLessThan(Comparison<f64>),
    NumericLessThanEquals(Comparison<f64>),
    NumericGreaterThan(Comparison<f64>),
    NumericGreaterThanEquals(Comparison<f64>),
    BooleanEquals(Comparison<bool>),
    /// Holds when presence of `variable` equals `value`.
    IsPresent(Comparison<bool>),
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Not(Box<Condition>),
}

/// A `$.path` into the current data and the value it is compared to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comparison<T> {
    pub variable: String,
    pub value: T,
}
