//! Job and Attempt domain types.
//!
//! A `Job` is one execution of a stored workflow definition. It owns its
//! append-only list of `Attempt`s, the operator overrides for individual
//! states, and the persisted execution cursor.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AttemptError;
use crate::execution::Frame;

/// Upper bound on [`JobQuery::limit`].
pub const MAX_QUERY_LIMIT: u32 = 10_000;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle of a Job: Queued -> Running -> {Succeeded, Failed, Cancelled}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(format!("invalid job status: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Attempt
// ---------------------------------------------------------------------------

/// How an attempt ended, as reported by the worker dispatcher.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttemptOutcome {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Error name used for retry/catch matching.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Human-readable failure reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
}

impl AttemptOutcome {
    /// Successful completion carrying `output`.
    pub fn success(output: Option<serde_json::Value>) -> Self {
        Self {
            exit_code: Some(0),
            output,
            ..Self::default()
        }
    }

    /// Failed completion with an error name and reason.
    pub fn failure(error: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            reason: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none() && self.exit_code.is_none_or(|code| code == 0)
    }
}

/// One execution of a Task (or Parallel branch task) against a worker.
///
/// Stop fields are written exactly once through [`Attempt::stop`]; after that
/// the attempt is permanently immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    /// Also the idempotency key handed to the worker dispatcher.
    pub id: Uuid,
    pub state_name: String,
    /// Branch indices from the root frame down to the frame that dispatched.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branch_path: Vec<usize>,
    /// Worker-side identity (task ARN, process id).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_instance: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stopped_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    outcome: Option<AttemptOutcome>,
}

impl Attempt {
    pub fn new(state_name: impl Into<String>, branch_path: Vec<usize>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            state_name: state_name.into(),
            branch_path,
            worker_id: None,
            container_instance: None,
            created_at: now,
            started_at: None,
            stopped_at: None,
            outcome: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.stopped_at.is_none()
    }

    /// Record the worker identity once the dispatcher accepted the attempt.
    pub fn mark_started(&mut self, worker_id: impl Into<String>, at: DateTime<Utc>) -> Result<(), AttemptError> {
        if !self.is_open() {
            return Err(AttemptError::AlreadyStopped(self.id));
        }
        self.worker_id = Some(worker_id.into());
        self.started_at.get_or_insert(at);
        Ok(())
    }

    /// Set the stop fields. Fails if the attempt was already stopped.
    pub fn stop(&mut self, outcome: AttemptOutcome, at: DateTime<Utc>) -> Result<(), AttemptError> {
        if !self.is_open() {
            return Err(AttemptError::AlreadyStopped(self.id));
        }
        self.stopped_at = Some(at);
        self.outcome = Some(outcome);
        Ok(())
    }

    pub fn stopped_at(&self) -> Option<DateTime<Utc>> {
        self.stopped_at
    }

    pub fn outcome(&self) -> Option<&AttemptOutcome> {
        self.outcome.as_ref()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.outcome.as_ref().and_then(|o| o.exit_code)
    }

    pub fn reason(&self) -> Option<&str> {
        self.outcome.as_ref().and_then(|o| o.reason.as_deref())
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// Reference to a stored definition version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DefinitionRef {
    pub name: String,
    pub version: u32,
}

impl fmt::Display for DefinitionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// Operator-set override for a single state.
///
/// When `is_set` is true it takes precedence over automatic Choice/Wait
/// evaluation. `next` names the state to continue with; when absent a Choice
/// takes its default and a Wait takes its own transition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateOverride {
    pub is_set: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
}

/// One execution of a workflow definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    /// Workflow aggregate this job belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<Uuid>,
    pub definition: DefinitionRef,
    /// Namespace used to resolve Task state resources.
    pub namespace: String,
    pub input: serde_json::Value,
    #[serde(default)]
    status: Option<JobStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    attempts: Vec<Attempt>,
    /// Per-state manual resolution, keyed by state name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub overrides: BTreeMap<String, StateOverride>,
    /// Execution cursor; `None` until the job is first stepped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<Frame>,
    #[serde(default)]
    pub cancel_requested: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    /// Optimistic concurrency counter, bumped by the store on every update.
    #[serde(default)]
    pub revision: u64,
}

impl Job {
    /// A queued job for `definition` with the given input.
    pub fn new(definition: DefinitionRef, input: serde_json::Value, namespace: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            workflow_id: None,
            definition,
            namespace: namespace.into(),
            input,
            status: Some(JobStatus::Queued),
            status_reason: None,
            created_at: now,
            last_updated: now,
            attempts: Vec::new(),
            overrides: BTreeMap::new(),
            cursor: None,
            cancel_requested: false,
            output: None,
            revision: 0,
        }
    }

    pub fn status(&self) -> Option<JobStatus> {
        self.status
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_some_and(|s| s.is_terminal())
    }

    /// Transition to `status` unless the job is already terminal.
    ///
    /// Returns `true` when the status actually changed. Terminal statuses are
    /// sticky, so the first terminal write wins. `now` stamps `last_updated`.
    pub fn set_status(&mut self, status: JobStatus, reason: Option<String>, now: DateTime<Utc>) -> bool {
        if self.is_terminal() || self.status == Some(status) {
            return false;
        }
        self.status = Some(status);
        if reason.is_some() {
            self.status_reason = reason;
        }
        self.last_updated = now;
        true
    }

    pub fn attempts(&self) -> &[Attempt] {
        &self.attempts
    }

    pub fn push_attempt(&mut self, attempt: Attempt) {
        self.attempts.push(attempt);
    }

    pub fn attempt(&self, id: Uuid) -> Option<&Attempt> {
        self.attempts.iter().find(|a| a.id == id)
    }

    /// Mutable access for recording start/stop through the attempt's own guards.
    pub fn attempt_mut(&mut self, id: Uuid) -> Option<&mut Attempt> {
        self.attempts.iter_mut().find(|a| a.id == id)
    }

    /// Open attempt dispatched for `state_name` from the frame at `branch_path`.
    pub fn open_attempt(&self, state_name: &str, branch_path: &[usize]) -> Option<&Attempt> {
        self.attempts
            .iter()
            .rev()
            .find(|a| a.is_open() && a.state_name == state_name && a.branch_path == branch_path)
    }

    /// Override for `state_name`, only when it is set.
    pub fn active_override(&self, state_name: &str) -> Option<&StateOverride> {
        self.overrides.get(state_name).filter(|o| o.is_set)
    }
}

// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

/// Filter for listing jobs of one definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobQuery {
    pub definition_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    #[serde(default = "default_query_limit")]
    pub limit: u32,
    #[serde(default)]
    pub oldest_first: bool,
}

fn default_query_limit() -> u32 {
    10
}

impl JobQuery {
    pub fn new(definition_name: impl Into<String>) -> Self {
        Self {
            definition_name: definition_name.into(),
            status: None,
            limit: default_query_limit(),
            oldest_first: false,
        }
    }

    /// `limit` clamped to `1..=MAX_QUERY_LIMIT`.
    pub fn effective_limit(&self) -> u32 {
        self.limit.clamp(1, MAX_QUERY_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job() -> Job {
        Job::new(
            DefinitionRef {
                name: "nightly".to_string(),
                version: 0,
            },
            json!({"n": 1}),
            "default",
        )
    }

    #[test]
    fn test_new_job_is_queued() {
        let job = job();
        assert_eq!(job.status(), Some(JobStatus::Queued));
        assert!(!job.is_terminal());
        assert!(job.attempts().is_empty());
    }

    #[test]
    fn test_default_job_has_no_status() {
        assert_eq!(Job::default().status(), None);
    }

    #[test]
    fn test_terminal_status_is_sticky() {
        let mut job = job();
        let now = job.created_at + chrono::Duration::seconds(5);
        assert!(job.set_status(JobStatus::Running, None, now));
        assert!(job.set_status(JobStatus::Succeeded, None, now));
        assert_eq!(job.last_updated, now);
        assert!(!job.set_status(JobStatus::Cancelled, Some("late cancel".to_string()), now));
        assert!(!job.set_status(JobStatus::Running, None, now));
        assert_eq!(job.status(), Some(JobStatus::Succeeded));
        assert_eq!(job.status_reason, None);
    }

    #[test]
    fn test_attempt_stops_exactly_once() {
        let mut attempt = Attempt::new("fetch", vec![], Utc::now());
        assert!(attempt.is_open());

        attempt
            .stop(AttemptOutcome::failure("States.TaskFailed", "exit 1"), Utc::now())
            .unwrap();
        assert!(!attempt.is_open());
        assert_eq!(attempt.reason(), Some("exit 1"));

        let err = attempt.stop(AttemptOutcome::success(None), Utc::now()).unwrap_err();
        assert!(matches!(err, AttemptError::AlreadyStopped(id) if id == attempt.id));
        assert_eq!(attempt.reason(), Some("exit 1"));
        assert!(attempt.mark_started("late", Utc::now()).is_err());
    }

    #[test]
    fn test_open_attempt_matches_state_and_branch() {
        let mut job = job();
        job.push_attempt(Attempt::new("fetch", vec![1], Utc::now()));
        assert!(job.open_attempt("fetch", &[1]).is_some());
        assert!(job.open_attempt("fetch", &[]).is_none());
        assert!(job.open_attempt("other", &[1]).is_none());
    }

    #[test]
    fn test_outcome_success_rules() {
        assert!(AttemptOutcome::success(None).succeeded());
        assert!(AttemptOutcome::default().succeeded());
        let nonzero = AttemptOutcome {
            exit_code: Some(2),
            ..AttemptOutcome::default()
        };
        assert!(!nonzero.succeeded());
        assert!(!AttemptOutcome::failure("E", "r").succeeded());
    }

    #[test]
    fn test_active_override_requires_is_set() {
        let mut job = job();
        job.overrides.insert(
            "gate".to_string(),
            StateOverride {
                is_set: false,
                next: Some("b".to_string()),
            },
        );
        assert!(job.active_override("gate").is_none());
        job.overrides.get_mut("gate").unwrap().is_set = true;
        assert_eq!(job.active_override("gate").unwrap().next.as_deref(), Some("b"));
    }

    #[test]
    fn test_job_serde_round_trip() {
        let mut job = job();
        job.push_attempt(Attempt::new("fetch", vec![], Utc::now()));
        let json = serde_json::to_string(&job).unwrap();
        let parsed: Job = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, job);
    }

    #[test]
    fn test_query_limit_is_clamped() {
        let mut query = JobQuery::new("nightly");
        assert_eq!(query.effective_limit(), 10);
        query.limit = 50_000;
        assert_eq!(query.effective_limit(), MAX_QUERY_LIMIT);
        query.limit = 0;
        assert_eq!(query.effective_limit(), 1);
    }

    #[test]
    fn test_job_status_parse() {
        assert_eq!("Running".parse::<JobStatus>().unwrap(), JobStatus::Running);
        assert!("paused".parse::<JobStatus>().is_err());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
    }
}
