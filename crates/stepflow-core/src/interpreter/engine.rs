//! Long-running execution engine.
//!
//! `Engine` owns the [`Interpreter`] and a background loop that turns worker
//! completions and fired timers into signals. Each signal is handled on its
//! own task; the interpreter's per-job lock keeps handling of one job
//! sequential while different jobs progress concurrently.

use std::sync::Arc;

use stepflow_types::config::EngineConfig;
use stepflow_types::error::RepositoryError;
use stepflow_types::event::JobEvent;
use stepflow_types::job::{DefinitionRef, Job, StateOverride};
use stepflow_types::workflow::Workflow;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::clock::Clock;
use super::dispatcher::{CompletionReceiver, WorkerDispatcher};
use super::machine::Signal;
use super::scheduler::{wake_channel, Scheduler};
use super::shell::Interpreter;
use crate::event::EventBus;
use crate::repository::WorkflowStore;
use crate::status::StatusReporter;

// ---------------------------------------------------------------------------
// EngineError
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("definition '{name}' not found{}", .version.map(|v| format!(" at version {v}")).unwrap_or_default())]
    DefinitionNotFound { name: String, version: Option<u32> },

    #[error("job not found: {0}")]
    JobNotFound(Uuid),

    #[error("job {job_id} kept conflicting after {attempts} attempts")]
    Conflict { job_id: Uuid, attempts: u32 },

    #[error("invalid override: {0}")]
    InvalidOverride(String),

    #[error("engine stopped")]
    Stopped,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct Engine<S: WorkflowStore + 'static, D: WorkerDispatcher + 'static> {
    interpreter: Arc<Interpreter<S, D>>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl<S: WorkflowStore + 'static, D: WorkerDispatcher + 'static> Engine<S, D> {
    /// Build the interpreter and spawn the completion/wake loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        store: Arc<S>,
        dispatcher: Arc<D>,
        mut completions: CompletionReceiver,
        reporter: StatusReporter,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (wake_tx, mut wakes) = wake_channel();
        let scheduler = Scheduler::new(wake_tx, Arc::clone(&clock));
        let events = EventBus::new(config.event_bus_capacity);
        let interpreter = Arc::new(Interpreter::new(
            store, dispatcher, reporter, events, scheduler, clock, config,
        ));

        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let looped = Arc::clone(&interpreter);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    Some(completion) = completions.recv() => {
                        let job_id = completion.job_id;
                        spawn_signal(&looped, job_id, Signal::AttemptFinished(completion));
                    }
                    Some(job_id) = wakes.recv() => spawn_signal(&looped, job_id, Signal::Wake),
                    else => break,
                }
            }
            tracing::info!("engine loop stopped");
        });

        tracing::info!("engine started");
        Self {
            interpreter,
            shutdown,
            task,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        self.interpreter.store()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.interpreter.events().subscribe()
    }

    /// Start a job of `name` (latest version unless `version` is given).
    pub async fn submit(
        &self,
        name: &str,
        version: Option<u32>,
        input: serde_json::Value,
        namespace: Option<&str>,
    ) -> Result<Job, EngineError> {
        let store = self.interpreter.store();
        let found = match version {
            Some(version) => store.get_definition(name, version).await,
            None => store.latest_definition(name).await,
        };
        let definition = found.map_err(|e| match e {
            RepositoryError::NotFound => EngineError::DefinitionNotFound {
                name: name.to_string(),
                version,
            },
            other => other.into(),
        })?;

        let namespace = namespace
            .map(str::to_string)
            .unwrap_or_else(|| self.interpreter.config().default_namespace.clone());
        let mut job = Job::new(
            DefinitionRef {
                name: definition.name.clone(),
                version: definition.version,
            },
            input,
            namespace,
        );
        let mut workflow = Workflow::new(definition);
        workflow.job_ids.push(job.id);
        job.workflow_id = Some(workflow.id);

        store.create_workflow(&workflow).await?;
        store.create_job(&job).await?;
        tracing::info!(
            job_id = %job.id,
            workflow_id = %workflow.id,
            definition = %job.definition.name,
            version = job.definition.version,
            "job submitted"
        );

        self.interpreter.handle(job.id, Signal::Start).await
    }

    /// Request cancellation. Returns once the request is recorded; the job
    /// turns Cancelled when its open attempts confirm.
    pub async fn cancel(&self, job_id: Uuid) -> Result<Job, EngineError> {
        tracing::info!(%job_id, "cancellation requested");
        self.interpreter.handle(job_id, Signal::Cancel).await
    }

    /// Re-enter every non-terminal job after a restart. Returns how many
    /// were resumed.
    pub async fn recover(&self) -> Result<usize, EngineError> {
        let active = self.interpreter.store().list_active_jobs().await?;
        let mut resumed = 0;
        for job in active {
            match self.interpreter.handle(job.id, Signal::Recover).await {
                Ok(_) => resumed += 1,
                Err(e) => tracing::warn!(job_id = %job.id, error = %e, "could not recover job"),
            }
        }
        tracing::info!(resumed, "recovered active jobs");
        Ok(resumed)
    }

    pub async fn set_override(
        &self,
        job_id: Uuid,
        state: &str,
        manual: StateOverride,
    ) -> Result<Job, EngineError> {
        self.interpreter.set_override(job_id, state, manual).await
    }

    /// Re-evaluate a job now.
    pub async fn step(&self, job_id: Uuid) -> Result<Job, EngineError> {
        self.interpreter.handle(job_id, Signal::Step).await
    }

    /// Wait until `job_id` reaches a terminal status.
    pub async fn wait_for_terminal(&self, job_id: Uuid) -> Result<Job, EngineError> {
        let mut events = self.subscribe();
        loop {
            let job = self
                .interpreter
                .store()
                .get_job(job_id)
                .await
                .map_err(|e| match e {
                    RepositoryError::NotFound => EngineError::JobNotFound(job_id),
                    other => other.into(),
                })?;
            if job.is_terminal() {
                return Ok(job);
            }

            loop {
                match events.recv().await {
                    Ok(JobEvent::StatusChanged { job_id: id, status, .. })
                        if id == job_id && status.is_terminal() =>
                    {
                        break;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(%job_id, skipped, "event subscriber lagged, re-reading job");
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => return Err(EngineError::Stopped),
                }
            }
        }
    }

    /// Stop the background loop and drop pending timers.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.interpreter.scheduler().clear();
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "engine loop ended abnormally");
        }
    }
}

fn spawn_signal<S, D>(interpreter: &Arc<Interpreter<S, D>>, job_id: Uuid, signal: Signal)
where
    S: WorkflowStore + 'static,
    D: WorkerDispatcher + 'static,
{
    let interpreter = Arc::clone(interpreter);
    tokio::spawn(async move {
        if let Err(e) = interpreter.handle(job_id, signal).await {
            tracing::warn!(%job_id, error = %e, "signal handling failed");
        }
    });
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
