//! Execution events published on the engine's event bus.
//!
//! Observers (the CLI, tests) subscribe to follow jobs as they progress.
//! Events are informational only: dropping them never affects execution.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::JobStatus;
use crate::workflow::WorkflowStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    StatusChanged {
        job_id: Uuid,
        status: JobStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    AttemptDispatched {
        job_id: Uuid,
        attempt_id: Uuid,
        state: String,
    },
    AttemptFinished {
        job_id: Uuid,
        attempt_id: Uuid,
        succeeded: bool,
    },
    WorkflowStatusChanged {
        workflow_id: Uuid,
        status: WorkflowStatus,
    },
}

impl JobEvent {
    /// Job this event concerns, if any.
    pub fn job_id(&self) -> Option<Uuid> {
        match self {
            JobEvent::StatusChanged { job_id, .. }
            | JobEvent::AttemptDispatched { job_id, .. }
            | JobEvent::AttemptFinished { job_id, .. } => Some(*job_id),
            JobEvent::WorkflowStatusChanged { .. } => None,
        }
    }
}
