//! Workflow execution aggregate.
//!
//! A `Workflow` is a top-level run tracking one or more Jobs of a single
//! definition. Its status is derived from its jobs' statuses.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::definition::WorkflowDefinition;
use crate::job::JobStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Succeeded | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Queued => "queued",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Succeeded => "succeeded",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
        }
    }

    /// Aggregate status of a set of job statuses.
    ///
    /// Running dominates, then Failed, then Cancelled; all-succeeded yields
    /// Succeeded, and anything else (including no jobs) is Queued.
    pub fn aggregate<I>(statuses: I) -> WorkflowStatus
    where
        I: IntoIterator<Item = Option<JobStatus>>,
    {
        let statuses: Vec<Option<JobStatus>> = statuses.into_iter().collect();
        let any = |wanted: JobStatus| statuses.contains(&Some(wanted));

        if any(JobStatus::Running) {
            WorkflowStatus::Running
        } else if any(JobStatus::Failed) {
            WorkflowStatus::Failed
        } else if any(JobStatus::Cancelled) {
            WorkflowStatus::Cancelled
        } else if !statuses.is_empty() && statuses.iter().all(|s| *s == Some(JobStatus::Succeeded)) {
            WorkflowStatus::Succeeded
        } else {
            WorkflowStatus::Queued
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A top-level run of a workflow definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    status: Option<WorkflowStatus>,
    /// Constituent jobs in creation order.
    #[serde(default)]
    pub job_ids: Vec<Uuid>,
    pub definition: Option<WorkflowDefinition>,
    #[serde(default)]
    pub revision: u64,
}

impl Workflow {
    pub fn new(definition: WorkflowDefinition) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            created_at: now,
            last_updated: now,
            status: Some(WorkflowStatus::Queued),
            job_ids: Vec::new(),
            definition: Some(definition),
            revision: 0,
        }
    }

    pub fn status(&self) -> Option<WorkflowStatus> {
        self.status
    }

    /// Move to `status` unless already there or already terminal.
    ///
    /// Returns `true` when the status changed.
    pub fn set_status(&mut self, status: WorkflowStatus) -> bool {
        if self.status.is_some_and(|s| s.is_terminal()) || self.status == Some(status) {
            return false;
        }
        self.status = Some(status);
        self.last_updated = Utc::now();
        true
    }

    pub fn definition_name(&self) -> Option<&str> {
        self.definition.as_ref().map(|d| d.name.as_str())
    }
}
