//! Worker dispatcher port.
//!
//! The interpreter hands Task attempts to a `WorkerDispatcher` and learns
//! about their outcome asynchronously through a [`CompletionSender`].
//! Implementations live in the infrastructure layer (`ProcessDispatcher`) and
//! in tests.

use serde::{Deserialize, Serialize};
use stepflow_types::job::AttemptOutcome;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// One attempt to run, fully resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub job_id: Uuid,
    /// Idempotency key: submitting the same attempt twice must not start two
    /// workers.
    pub attempt_id: Uuid,
    pub state: String,
    /// Concrete target from the state resource.
    pub target: String,
    pub input: serde_json::Value,
}

/// Worker-side identity of an accepted attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptHandle {
    pub attempt_id: Uuid,
    pub worker_id: String,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("worker rejected attempt: {0}")]
    Rejected(String),

    #[error("worker unavailable: {0}")]
    Unavailable(String),

    #[error("unknown attempt: {0}")]
    UnknownAttempt(Uuid),
}

/// What a backend knows about an attempt it was handed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    /// Still running; a completion will follow.
    Running,
    /// The backend has no record of the attempt (lost in a restart, or
    /// already reported). No completion will follow from it.
    Unknown,
}

/// Terminal report for an attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub job_id: Uuid,
    pub attempt_id: Uuid,
    #[serde(flatten)]
    pub outcome: AttemptOutcome,
}

impl Completion {
    pub fn new(job_id: Uuid, attempt_id: Uuid, outcome: AttemptOutcome) -> Self {
        Self {
            job_id,
            attempt_id,
            outcome,
        }
    }
}

pub type CompletionSender = mpsc::UnboundedSender<Completion>;
pub type CompletionReceiver = mpsc::UnboundedReceiver<Completion>;

/// Channel on which dispatchers report completions to the engine.
pub fn completion_channel() -> (CompletionSender, CompletionReceiver) {
    mpsc::unbounded_channel()
}

/// Runs Task attempts on some worker backend.
///
/// Uses RPITIT (return-position `impl Trait` in traits) for async methods.
pub trait WorkerDispatcher: Send + Sync {
    /// Start `request`. Idempotent per `attempt_id`: a repeated submit
    /// returns the existing handle.
    fn submit(
        &self,
        request: DispatchRequest,
    ) -> impl std::future::Future<Output = Result<AttemptHandle, DispatchError>> + Send;

    /// Stop a running attempt. Cancelling a finished attempt succeeds.
    fn cancel(
        &self,
        handle: &AttemptHandle,
    ) -> impl std::future::Future<Output = Result<(), DispatchError>> + Send;

    /// Ask whether an accepted attempt is still out with a worker. Used on
    /// recovery for attempts started before a restart.
    fn status(
        &self,
        handle: &AttemptHandle,
    ) -> impl std::future::Future<Output = Result<AttemptStatus, DispatchError>> + Send;
}

// ---------------------------------------------------------------------------
// Test dispatcher
// ---------------------------------------------------------------------------
