//! Failure handling for Task and Parallel states.
//!
//! Stateless: the decision depends only on the state's Retry/Catch lists,
//! the retries already consumed in the current state, and the error name.

use std::collections::BTreeMap;
use std::time::Duration;

use stepflow_types::definition::State;

/// Error name when a worker reports failure without naming one.
pub const ERROR_TASK_FAILED: &str = "States.TaskFailed";
/// Attempt exceeded its state's `timeoutSeconds`.
pub const ERROR_TIMEOUT: &str = "States.Timeout";
/// The attempt could not be handed to a worker.
pub const ERROR_DISPATCH_FAILED: &str = "States.DispatchFailed";
/// The worker lost track of an accepted attempt (typically across a restart).
pub const ERROR_WORKER_LOST: &str = "States.WorkerLost";
/// A Fail state without an explicit error.
pub const ERROR_FAIL: &str = "States.Fail";
/// A Choice state where neither a rule nor a default applied.
pub const ERROR_NO_CHOICE_MATCHED: &str = "States.NoChoiceMatched";
/// The attempt was cancelled on request.
pub const ERROR_CANCELLED: &str = "States.Cancelled";
/// Internal interpreter fault.
pub const ERROR_RUNTIME: &str = "States.Runtime";

/// What to do with a failed state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureAction {
    /// Re-run the state after `delay`, charging retrier `retrier`.
    Retry { retrier: usize, delay: Duration },
    /// Continue at `next` with the error as data.
    Catch { next: String },
    /// Nothing handles the error.
    Fail,
}

/// Decide how `state` handles `error`.
///
/// Only the first retrier whose patterns match is considered. While its
/// count is below `maxAttempts` the state is retried with delay
/// `intervalSeconds * backoffRate^count`. Once exhausted (or if no retrier
/// matches) the first matching catcher applies.
pub fn decide(state: &State, retry_counts: &BTreeMap<usize, u32>, error: &str) -> FailureAction {
    if let Some((index, retrier)) = state
        .retry()
        .iter()
        .enumerate()
        .find(|(_, retrier)| retrier.matches(error))
    {
        let used = retry_counts.get(&index).copied().unwrap_or(0);
        if used < retrier.max_attempts {
            return FailureAction::Retry {
                retrier: index,
                delay: retrier.delay_for(used),
            };
        }
    }

    match state.catch().iter().find(|catcher| catcher.matches(error)) {
        Some(catcher) => FailureAction::Catch {
            next: catcher.next.clone(),
        },
        None => FailureAction::Fail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepflow_types::definition::{Catcher, Retrier, TaskState, Transition};

    fn task(retry: Vec<Retrier>, catch: Vec<Catcher>) -> State {
        State::Task(TaskState {
            resource: "r".to_string(),
            transition: Transition::End,
            retry,
            catch,
            timeout_seconds: None,
            comment: None,
        })
    }

    fn catcher(patterns: &[&str], next: &str) -> Catcher {
        Catcher {
            error_patterns: patterns.iter().map(|p| p.to_string()).collect(),
            next: next.to_string(),
        }
    }

    #[test]
    fn test_retry_then_catch() {
        let state = task(vec![Retrier::new(&["States.ALL"])], vec![catcher(&["States.ALL"], "recover")]);
        let mut counts = BTreeMap::new();
        let mut delays = Vec::new();
        loop {
            match decide(&state, &counts, ERROR_TASK_FAILED) {
                FailureAction::Retry { retrier, delay } => {
                    delays.push(delay.as_secs());
                    *counts.entry(retrier).or_insert(0) += 1;
                }
                other => {
                    assert_eq!(
                        other,
                        FailureAction::Catch {
                            next: "recover".to_string()
                        }
                    );
                    break;
                }
            }
        }
        assert_eq!(delays, vec![1, 2, 4]);
    }

    #[test]
    fn test_only_first_matching_retrier_counts() {
        let exhausted = Retrier {
            max_attempts: 0,
            ..Retrier::new(&["Custom.Error"])
        };
        let state = task(vec![exhausted, Retrier::new(&["States.ALL"])], vec![]);
        assert_eq!(decide(&state, &BTreeMap::new(), "Custom.Error"), FailureAction::Fail);
        assert!(matches!(
            decide(&state, &BTreeMap::new(), "Other.Error"),
            FailureAction::Retry { retrier: 1, .. }
        ));
    }

    #[test]
    fn test_catch_order_and_no_match() {
        let state = task(
            vec![],
            vec![catcher(&["States.Timeout"], "slow"), catcher(&["States.ALL"], "any")],
        );
        assert_eq!(
            decide(&state, &BTreeMap::new(), ERROR_TIMEOUT),
            FailureAction::Catch { next: "slow".to_string() }
        );
        assert_eq!(
            decide(&state, &BTreeMap::new(), "X"),
            FailureAction::Catch { next: "any".to_string() }
        );
        assert_eq!(decide(&task(vec![], vec![]), &BTreeMap::new(), "X"), FailureAction::Fail);
    }
}
