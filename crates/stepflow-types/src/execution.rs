//! Persisted execution cursor of a Job.
//!
//! A Job's position in its state machine is a tree of [`Frame`]s: the root
//! frame walks the top-level machine, and a Parallel state forks one child
//! frame per branch. Everything the interpreter needs to resume after a
//! restart lives here, so re-evaluating a Job never depends on process memory.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Position of one (sub-)execution inside a state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Name of the current state within this frame's machine.
    pub state: String,
    /// Data flowing into the current state.
    pub data: serde_json::Value,
    pub phase: Phase,
    /// Retries consumed per retrier index for the current state.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub retry_counts: BTreeMap<usize, u32>,
    pub entered_at: DateTime<Utc>,
}

/// What a frame is doing in its current state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Phase {
    /// The state has been entered but not yet evaluated.
    Ready,
    /// A Task attempt is outstanding.
    Running {
        attempt_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        deadline: Option<DateTime<Utc>>,
    },
    /// Suspended until a scheduled wake-up.
    Sleeping {
        until: DateTime<Utc>,
        reason: SleepReason,
    },
    /// A Parallel state waiting on its branches.
    Forked { branches: Vec<Frame> },
    /// The frame's machine ended successfully.
    Done { output: serde_json::Value },
    /// The frame's machine ended with an unhandled error.
    Failed { error: String, cause: String },
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SleepReason {
    /// A Wait state.
    Wait,
    /// Backoff before re-running a failed state.
    Retry,
}

impl Frame {
    pub fn new(state: impl Into<String>, data: serde_json::Value, now: DateTime<Utc>) -> Self {
        Self {
            state: state.into(),
            data,
            phase: Phase::Ready,
            retry_counts: BTreeMap::new(),
            entered_at: now,
        }
    }

    /// Move to `state` with fresh retry bookkeeping.
    pub fn enter(&mut self, state: impl Into<String>, data: serde_json::Value, now: DateTime<Utc>) {
        self.state = state.into();
        self.data = data;
        self.phase = Phase::Ready;
        self.retry_counts.clear();
        self.entered_at = now;
    }

    /// True once the frame reached Done, Failed or Cancelled.
    pub fn is_settled(&self) -> bool {
        matches!(
            self.phase,
            Phase::Done { .. } | Phase::Failed { .. } | Phase::Cancelled
        )
    }

    /// Find the frame (this one or a descendant) whose open attempt is `attempt_id`.
    pub fn frame_for_attempt_mut(&mut self, attempt_id: Uuid) -> Option<&mut Frame> {
        if matches!(self.phase, Phase::Running { attempt_id: id, .. } if id == attempt_id) {
            return Some(self);
        }
        match &mut self.phase {
            Phase::Forked { branches } => branches
                .iter_mut()
                .find_map(|branch| branch.frame_for_attempt_mut(attempt_id)),
            _ => None,
        }
    }

    /// Attempt ids of every Running frame in this subtree.
    pub fn open_attempts(&self) -> Vec<Uuid> {
        let mut ids = Vec::new();
        self.collect_open_attempts(&mut ids);
        ids
    }

    fn collect_open_attempts(&self, ids: &mut Vec<Uuid>) {
        match &self.phase {
            Phase::Running { attempt_id, .. } => ids.push(*attempt_id),
            Phase::Forked { branches } => {
                for branch in branches {
                    branch.collect_open_attempts(ids);
                }
            }
            _ => {}
        }
    }

    /// Earliest pending wake-up in this subtree: sleep deadlines and attempt
    /// timeouts.
    pub fn next_wake(&self) -> Option<DateTime<Utc>> {
        match &self.phase {
            Phase::Sleeping { until, .. } => Some(*until),
            Phase::Running { deadline, .. } => *deadline,
            Phase::Forked { branches } => branches.iter().filter_map(Frame::next_wake).min(),
            _ => None,
        }
    }
}
