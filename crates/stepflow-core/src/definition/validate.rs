//! Definition validation.
//!
//! Validation runs at authoring time, before anything is persisted. It prunes
//! unreachable states, orders the remainder to prove acyclicity along `next`
//! edges, and checks per-state invariants. The caller gets back the
//! normalized machine; the input is never modified.

use stepflow_types::definition::{State, StateMachine};
use thiserror::Error;

use super::graph::{ordered_states, pruned, GraphError};

/// A definition that must not be stored.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("invalid state graph: {0}")]
    Graph(#[from] GraphError),

    #[error("definition name must not be empty")]
    EmptyName,

    #[error("state '{state}': {message}")]
    InvalidState { state: String, message: String },
}

impl ValidationError {
    fn state(state: &str, message: impl Into<String>) -> Self {
        ValidationError::InvalidState {
            state: state.to_string(),
            message: message.into(),
        }
    }
}

/// Validate `machine` and return its pruned, normalized form.
pub fn validate_state_machine(machine: &StateMachine) -> Result<StateMachine, ValidationError> {
    let normalized = pruned(machine)?;
    ordered_states(&normalized.states)?;

    for (name, state) in &normalized.states {
        validate_state(name, state)?;
    }

    Ok(normalized)
}

fn validate_state(name: &str, state: &State) -> Result<(), ValidationError> {
    for retrier in state.retry() {
        if retrier.error_patterns.is_empty() {
            return Err(ValidationError::state(name, "retry entry has no error patterns"));
        }
        if retrier.interval_seconds == 0 {
            return Err(ValidationError::state(name, "retry intervalSeconds must be at least 1"));
        }
        if !(retrier.backoff_rate.is_finite() && retrier.backoff_rate >= 1.0) {
            return Err(ValidationError::state(
                name,
                format!("retry backoffRate must be >= 1.0, got {}", retrier.backoff_rate),
            ));
        }
    }
    for catcher in state.catch() {
        if catcher.error_patterns.is_empty() {
            return Err(ValidationError::state(name, "catch entry has no error patterns"));
        }
    }

    match state {
        State::Task(task) if task.resource.is_empty() => {
            Err(ValidationError::state(name, "task resource must not be empty"))
        }
        State::Task(task) if task.timeout_seconds == Some(0) => {
            Err(ValidationError::state(name, "timeoutSeconds must be at least 1"))
        }
        State::Choice(choice) if choice.choices.is_empty() => {
            Err(ValidationError::state(name, "choice state needs at least one rule"))
        }
        State::Parallel(parallel) => {
            if parallel.branches.is_empty() {
                return Err(ValidationError::state(name, "parallel state needs at least one branch"));
            }
            for (index, branch) in parallel.branches.iter().enumerate() {
                validate_state_machine(branch)
                    .map_err(|e| ValidationError::state(name, format!("branch {index}: {e}")))?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}
