//! Effectful shell around the pure interpreter.
//!
//! [`Interpreter::handle`] is the only path that mutates a stored Job. It
//! serializes signals per job, applies them with [`apply_guarded`], persists
//! the result under the job's revision check, and then performs the effects:
//! dispatching attempts, cancelling them and arming wake timers. Feedback from
//! those effects (accepted, rejected, cancelled) is fed back as further
//! signals before the per-job lock is released.

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::join_all;
use serde_json::Value;
use stepflow_types::config::EngineConfig;
use stepflow_types::definition::{State, StateMachine};
use stepflow_types::error::RepositoryError;
use stepflow_types::event::JobEvent;
use stepflow_types::job::{AttemptOutcome, Job, StateOverride};
use stepflow_types::workflow::{Workflow, WorkflowStatus};
use uuid::Uuid;

use super::clock::Clock;
use super::dispatcher::{AttemptHandle, AttemptStatus, Completion, DispatchRequest, WorkerDispatcher};
use super::engine::EngineError;
use super::machine::{apply_guarded, Applied, Effect, Signal, StepContext};
use super::retry::{ERROR_DISPATCH_FAILED, ERROR_WORKER_LOST};
use super::scheduler::Scheduler;
use crate::event::EventBus;
use crate::repository::WorkflowStore;
use crate::status::StatusReporter;

pub struct Interpreter<S: WorkflowStore, D: WorkerDispatcher> {
    store: Arc<S>,
    dispatcher: Arc<D>,
    reporter: StatusReporter,
    events: EventBus,
    scheduler: Scheduler,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    /// One async mutex per job serializes every signal for that job.
    locks: DashMap<Uuid, Arc<tokio::sync::Mutex<()>>>,
    /// Parsed machines keyed by (definition name, version). Definitions are
    /// immutable, so entries never go stale.
    machines: DashMap<(String, u32), Arc<StateMachine>>,
    /// Worker handles of accepted attempts.
    handles: DashMap<Uuid, AttemptHandle>,
}

impl<S: WorkflowStore, D: WorkerDispatcher> Interpreter<S, D> {
    pub fn new(
        store: Arc<S>,
        dispatcher: Arc<D>,
        reporter: StatusReporter,
        events: EventBus,
        scheduler: Scheduler,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            reporter,
            events,
            scheduler,
            clock,
            config,
            locks: DashMap::new(),
            machines: DashMap::new(),
            handles: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Number of attempts whose worker handle is still held.
    pub fn tracked_attempts(&self) -> usize {
        self.handles.len()
    }

    fn lock_for(&self, job_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.locks.entry(job_id).or_default().value())
    }

    /// Apply `signal` and everything it causes, then return the stored job.
    #[tracing::instrument(skip(self, signal))]
    pub async fn handle(&self, job_id: Uuid, signal: Signal) -> Result<Job, EngineError> {
        let lock = self.lock_for(job_id);
        let _guard = lock.lock().await;

        let mut queue = VecDeque::from([signal]);
        let mut job = None;
        while let Some(signal) = queue.pop_front() {
            let (current, effects) = self.apply_persisted(job_id, signal).await?;
            queue.extend(self.perform(&current, effects).await);
            job = Some(current);
        }

        let job = match job {
            Some(job) => job,
            None => self.load_job(job_id).await?,
        };
        if job.is_terminal() {
            // Nobody else holds or waits on this lock
            self.locks
                .remove_if(&job_id, |_, lock| Arc::strong_count(lock) == 2);
        }
        Ok(job)
    }

    /// Set or clear a manual override on a Choice or Wait state, then step.
    pub async fn set_override(
        &self,
        job_id: Uuid,
        state: &str,
        manual: StateOverride,
    ) -> Result<Job, EngineError> {
        {
            let lock = self.lock_for(job_id);
            let _guard = lock.lock().await;
            let mut persisted = false;

            for _ in 0..=self.config.conflict_retries {
                let mut job = self.load_job(job_id).await?;
                let machine = self.machine_for(&job).await?;
                check_override(&machine, state, &manual)?;
                if job.is_terminal() {
                    return Ok(job);
                }

                job.overrides.insert(state.to_string(), manual.clone());
                job.last_updated = self.clock.now();
                match self.store.update_job(&job, job.revision).await {
                    Ok(_) => {
                        tracing::info!(%job_id, state, is_set = manual.is_set, next = ?manual.next, "override updated");
                        persisted = true;
                        break;
                    }
                    Err(e) if e.is_conflict() => continue,
                    Err(e) => return Err(e.into()),
                }
            }

            if !persisted {
                return Err(EngineError::Conflict {
                    job_id,
                    attempts: self.config.conflict_retries + 1,
                });
            }
        }
        self.handle(job_id, Signal::Step).await
    }

    // -----------------------------------------------------------------------
    // Apply and persist
    // -----------------------------------------------------------------------

    async fn apply_persisted(&self, job_id: Uuid, signal: Signal) -> Result<(Job, Vec<Effect>), EngineError> {
        // The worker is done with the attempt even when the job no longer cares
        match &signal {
            Signal::AttemptFinished(completion) => {
                self.handles.remove(&completion.attempt_id);
            }
            Signal::CancelConfirmed { attempt_id } => {
                self.handles.remove(attempt_id);
            }
            _ => {}
        }

        for round in 0..=self.config.conflict_retries {
            let mut job = self.load_job(job_id).await?;
            let machine = self.machine_for(&job).await?;
            let before = job.clone();
            let ctx = StepContext {
                now: self.clock.now(),
                max_transitions: self.config.max_transitions_per_step,
            };

            let Applied { effects, fault } = apply_guarded(&machine, &mut job, signal.clone(), &ctx);
            if let Some(fault) = &fault {
                tracing::error!(%job_id, %fault, "interpreter fault, job failed");
            }
            if job == before {
                return Ok((job, effects));
            }

            match self.store.update_job(&job, before.revision).await {
                Ok(revision) => {
                    job.revision = revision;
                    self.after_persist(&before, &job, &signal).await;
                    return Ok((job, effects));
                }
                Err(e) if e.is_conflict() => {
                    tracing::debug!(%job_id, round, "job revision conflict, re-applying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(EngineError::Conflict {
            job_id,
            attempts: self.config.conflict_retries + 1,
        })
    }

    async fn after_persist(&self, before: &Job, job: &Job, signal: &Signal) {
        if let Signal::AttemptFinished(completion) = signal {
            self.events.publish(JobEvent::AttemptFinished {
                job_id: job.id,
                attempt_id: completion.attempt_id,
                succeeded: completion.outcome.succeeded(),
            });
        }

        if job.status() == before.status() {
            return;
        }
        let workflow = self.refresh_workflow(job).await;
        self.reporter.report_job(job, workflow.as_ref());
        if let Some(status) = job.status() {
            self.events.publish(JobEvent::StatusChanged {
                job_id: job.id,
                status,
                reason: job.status_reason.clone(),
            });
            if status.is_terminal() {
                self.scheduler.cancel(job.id);
                tracing::info!(job_id = %job.id, status = status.as_str(), reason = ?job.status_reason, "job finished");
            } else {
                tracing::debug!(job_id = %job.id, status = status.as_str(), "job status changed");
            }
        }
    }

    /// Recompute the owning workflow's aggregate status from its jobs.
    async fn refresh_workflow(&self, job: &Job) -> Option<Workflow> {
        let workflow_id = job.workflow_id?;

        for _ in 0..=self.config.conflict_retries {
            let mut workflow = match self.store.get_workflow(workflow_id).await {
                Ok(workflow) => workflow,
                Err(e) => {
                    tracing::warn!(%workflow_id, error = %e, "could not load workflow for status refresh");
                    return None;
                }
            };

            let mut statuses = Vec::with_capacity(workflow.job_ids.len());
            for id in &workflow.job_ids {
                if *id == job.id {
                    statuses.push(job.status());
                    continue;
                }
                match self.store.get_job(*id).await {
                    Ok(other) => statuses.push(other.status()),
                    Err(e) => {
                        tracing::warn!(%workflow_id, job_id = %id, error = %e, "skipping unreadable job in aggregate");
                    }
                }
            }

            let status = WorkflowStatus::aggregate(statuses);
            if !workflow.set_status(status) {
                return Some(workflow);
            }
            match self.store.update_workflow(&workflow, workflow.revision).await {
                Ok(revision) => {
                    workflow.revision = revision;
                    self.reporter.report_workflow_change(&workflow, status);
                    self.events.publish(JobEvent::WorkflowStatusChanged {
                        workflow_id,
                        status,
                    });
                    return Some(workflow);
                }
                Err(e) if e.is_conflict() => continue,
                Err(e) => {
                    tracing::warn!(%workflow_id, error = %e, "could not store workflow status");
                    return Some(workflow);
                }
            }
        }
        tracing::warn!(%workflow_id, "gave up refreshing workflow status after repeated conflicts");
        None
    }

    // -----------------------------------------------------------------------
    // Effects
    // -----------------------------------------------------------------------

    /// Perform effects and collect the signals they produce.
    async fn perform(&self, job: &Job, effects: Vec<Effect>) -> Vec<Signal> {
        let mut followups = Vec::new();
        let mut dispatches = Vec::new();

        for effect in effects {
            match effect {
                Effect::Dispatch {
                    attempt_id,
                    state,
                    resource,
                    input,
                } => dispatches.push((attempt_id, state, resource, input)),
                Effect::CancelAttempt {
                    attempt_id,
                    worker_id,
                } => followups.extend(self.cancel_attempt(job.id, attempt_id, worker_id).await),
                Effect::PollAttempt {
                    attempt_id,
                    worker_id,
                } => followups.extend(self.poll_attempt(job.id, attempt_id, worker_id).await),
                Effect::ScheduleWake { at } => self.scheduler.schedule(job.id, at),
            }
        }

        let submitted = join_all(
            dispatches
                .into_iter()
                .map(|(attempt_id, state, resource, input)| self.dispatch(job, attempt_id, state, resource, input)),
        )
        .await;
        followups.extend(submitted);
        followups
    }

    async fn dispatch(
        &self,
        job: &Job,
        attempt_id: Uuid,
        state: String,
        resource: String,
        input: Value,
    ) -> Signal {
        self.events.publish(JobEvent::AttemptDispatched {
            job_id: job.id,
            attempt_id,
            state: state.clone(),
        });

        let namespace = if job.namespace.is_empty() {
            self.config.default_namespace.as_str()
        } else {
            job.namespace.as_str()
        };
        let target = match self.store.get_state_resource(namespace, &resource).await {
            Ok(found) => found.target,
            Err(e) => {
                tracing::warn!(job_id = %job.id, %attempt_id, namespace, %resource, error = %e, "state resource lookup failed");
                return dispatch_failed(
                    job.id,
                    attempt_id,
                    format!("state resource '{resource}' in namespace '{namespace}': {e}"),
                );
            }
        };

        let request = DispatchRequest {
            job_id: job.id,
            attempt_id,
            state,
            target,
            input,
        };
        match self.dispatcher.submit(request).await {
            Ok(handle) => {
                tracing::debug!(job_id = %job.id, %attempt_id, worker_id = %handle.worker_id, "attempt accepted");
                let worker_id = handle.worker_id.clone();
                self.handles.insert(attempt_id, handle);
                Signal::AttemptStarted {
                    attempt_id,
                    worker_id,
                }
            }
            Err(e) => {
                tracing::warn!(job_id = %job.id, %attempt_id, error = %e, "dispatch failed");
                dispatch_failed(job.id, attempt_id, e.to_string())
            }
        }
    }

    async fn cancel_attempt(&self, job_id: Uuid, attempt_id: Uuid, worker_id: Option<String>) -> Option<Signal> {
        let handle = self
            .handles
            .get(&attempt_id)
            .map(|entry| entry.value().clone())
            .or_else(|| worker_id.map(|worker_id| AttemptHandle { attempt_id, worker_id }));

        // Never accepted by a worker, so there is nothing to stop
        let Some(handle) = handle else {
            return Some(Signal::CancelConfirmed { attempt_id });
        };

        match self.dispatcher.cancel(&handle).await {
            Ok(()) => {
                tracing::debug!(%job_id, %attempt_id, "attempt cancelled");
                Some(Signal::CancelConfirmed { attempt_id })
            }
            Err(e) => {
                tracing::warn!(%job_id, %attempt_id, error = %e, "attempt cancellation failed");
                None
            }
        }
    }

    /// Re-attach to an attempt a worker accepted before the engine restarted.
    async fn poll_attempt(&self, job_id: Uuid, attempt_id: Uuid, worker_id: String) -> Option<Signal> {
        let handle = AttemptHandle { attempt_id, worker_id };
        match self.dispatcher.status(&handle).await {
            Ok(AttemptStatus::Running) => {
                tracing::debug!(%job_id, %attempt_id, worker_id = %handle.worker_id, "re-attached to running attempt");
                self.handles.insert(attempt_id, handle);
                None
            }
            Ok(AttemptStatus::Unknown) => {
                tracing::warn!(%job_id, %attempt_id, worker_id = %handle.worker_id, "worker lost attempt");
                let outcome = AttemptOutcome::failure(
                    ERROR_WORKER_LOST,
                    format!("worker '{}' has no record of the attempt", handle.worker_id),
                );
                Some(Signal::AttemptFinished(Completion::new(job_id, attempt_id, outcome)))
            }
            Err(e) => {
                // Left open; the next recovery or the state timeout resolves it
                tracing::warn!(%job_id, %attempt_id, error = %e, "attempt status check failed");
                None
            }
        }
    }

    // -----------------------------------------------------------------------
    // Loading
    // -----------------------------------------------------------------------

    async fn load_job(&self, job_id: Uuid) -> Result<Job, EngineError> {
        self.store.get_job(job_id).await.map_err(|e| match e {
            RepositoryError::NotFound => EngineError::JobNotFound(job_id),
            other => other.into(),
        })
    }

    async fn machine_for(&self, job: &Job) -> Result<Arc<StateMachine>, EngineError> {
        let key = (job.definition.name.clone(), job.definition.version);
        if let Some(machine) = self.machines.get(&key).map(|entry| Arc::clone(entry.value())) {
            return Ok(machine);
        }

        let definition = self
            .store
            .get_definition(&key.0, key.1)
            .await
            .map_err(|e| match e {
                RepositoryError::NotFound => EngineError::DefinitionNotFound {
                    name: key.0.clone(),
                    version: Some(key.1),
                },
                other => other.into(),
            })?;
        let machine = Arc::new(definition.state_machine);
        self.machines.insert(key, Arc::clone(&machine));
        Ok(machine)
    }
}

fn dispatch_failed(job_id: Uuid, attempt_id: Uuid, reason: String) -> Signal {
    Signal::AttemptFinished(Completion::new(
        job_id,
        attempt_id,
        AttemptOutcome::failure(ERROR_DISPATCH_FAILED, reason),
    ))
}

/// Overrides apply to top-level Choice and Wait states, and must name an
/// existing successor.
fn check_override(machine: &StateMachine, state: &str, manual: &StateOverride) -> Result<(), EngineError> {
    match machine.state(state) {
        Some(State::Choice(_) | State::Wait(_)) => {}
        Some(other) => {
            return Err(EngineError::InvalidOverride(format!(
                "state '{state}' is a {} state; only choice and wait states can be overridden",
                other.kind()
            )));
        }
        None => return Err(EngineError::InvalidOverride(format!("state '{state}' is not defined"))),
    }
    match &manual.next {
        Some(next) if machine.state(next).is_none() => Err(EngineError::InvalidOverride(format!(
            "override target '{next}' is not defined"
        ))),
        _ => Ok(()),
    }
}
