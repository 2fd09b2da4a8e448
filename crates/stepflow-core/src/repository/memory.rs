//! In-process `WorkflowStore` backed by `DashMap`.
//!
//! Used by tests and by `stepflow run` for one-off runs. Revision checks behave
//! exactly like the SQLite store so interpreter tests exercise the same
//! conflict paths.

use std::collections::BTreeMap;

use dashmap::DashMap;
use stepflow_types::definition::WorkflowDefinition;
use stepflow_types::error::RepositoryError;
use stepflow_types::job::{Job, JobQuery};
use stepflow_types::resource::StateResource;
use stepflow_types::workflow::Workflow;
use uuid::Uuid;

use super::store::WorkflowStore;

#[derive(Debug, Default)]
pub struct MemoryStore {
    definitions: DashMap<String, BTreeMap<u32, WorkflowDefinition>>,
    jobs: DashMap<Uuid, Job>,
    workflows: DashMap<Uuid, Workflow>,
    resources: DashMap<(String, String), StateResource>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WorkflowStore for MemoryStore {
    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        let mut versions = self.definitions.entry(def.name.clone()).or_default();
        if versions.contains_key(&def.version) {
            return Err(RepositoryError::Conflict(format!(
                "definition {}@{} already exists",
                def.name, def.version
            )));
        }
        versions.insert(def.version, def.clone());
        Ok(())
    }

    async fn get_definition(&self, name: &str, version: u32) -> Result<WorkflowDefinition, RepositoryError> {
        self.definitions
            .get(name)
            .and_then(|versions| versions.get(&version).cloned())
            .ok_or(RepositoryError::NotFound)
    }

    async fn latest_definition(&self, name: &str) -> Result<WorkflowDefinition, RepositoryError> {
        self.definitions
            .get(name)
            .and_then(|versions| versions.values().next_back().cloned())
            .ok_or(RepositoryError::NotFound)
    }

    async fn list_definition_versions(&self, name: &str) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        Ok(self
            .definitions
            .get(name)
            .map(|versions| versions.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn list_latest_definitions(&self) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let mut latest: Vec<WorkflowDefinition> = self
            .definitions
            .iter()
            .filter_map(|entry| entry.value().values().next_back().cloned())
            .collect();
        latest.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(latest)
    }

    async fn create_job(&self, job: &Job) -> Result<(), RepositoryError> {
        match self.jobs.entry(job.id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(RepositoryError::Conflict(format!("job {} already exists", job.id)))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(job.clone());
                Ok(())
            }
        }
    }

    async fn get_job(&self, id: Uuid) -> Result<Job, RepositoryError> {
        self.jobs
            .get(&id)
            .map(|job| job.clone())
            .ok_or(RepositoryError::NotFound)
    }

    async fn update_job(&self, job: &Job, expected_revision: u64) -> Result<u64, RepositoryError> {
        let mut stored = self.jobs.get_mut(&job.id).ok_or(RepositoryError::NotFound)?;
        if stored.revision != expected_revision {
            return Err(RepositoryError::Conflict(format!(
                "job {} is at revision {}, expected {}",
                job.id, stored.revision, expected_revision
            )));
        }
        let revision = expected_revision + 1;
        let mut updated = job.clone();
        updated.revision = revision;
        *stored = updated;
        Ok(revision)
    }

    async fn query_jobs(&self, query: &JobQuery) -> Result<Vec<Job>, RepositoryError> {
        let mut jobs: Vec<Job> = self
            .jobs
            .iter()
            .filter(|entry| entry.definition.name == query.definition_name)
            .filter(|entry| query.status.is_none() || entry.status() == query.status)
            .map(|entry| entry.value().clone())
            .collect();
        jobs.sort_by_key(|job| (job.created_at, job.id));
        if !query.oldest_first {
            jobs.reverse();
        }
        jobs.truncate(query.effective_limit() as usize);
        Ok(jobs)
    }

    async fn list_active_jobs(&self) -> Result<Vec<Job>, RepositoryError> {
        let mut jobs: Vec<Job> = self
            .jobs
            .iter()
            .filter(|entry| !entry.is_terminal())
            .map(|entry| entry.value().clone())
            .collect();
        jobs.sort_by_key(|job| (job.created_at, job.id));
        Ok(jobs)
    }

    async fn create_workflow(&self, workflow: &Workflow) -> Result<(), RepositoryError> {
        match self.workflows.entry(workflow.id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(RepositoryError::Conflict(format!(
                "workflow {} already exists",
                workflow.id
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(workflow.clone());
                Ok(())
            }
        }
    }

    async fn get_workflow(&self, id: Uuid) -> Result<Workflow, RepositoryError> {
        self.workflows
            .get(&id)
            .map(|wf| wf.clone())
            .ok_or(RepositoryError::NotFound)
    }

    async fn update_workflow(&self, workflow: &Workflow, expected_revision: u64) -> Result<u64, RepositoryError> {
        let mut stored = self
            .workflows
            .get_mut(&workflow.id)
            .ok_or(RepositoryError::NotFound)?;
        if stored.revision != expected_revision {
            return Err(RepositoryError::Conflict(format!(
                "workflow {} is at revision {}, expected {}",
                workflow.id, stored.revision, expected_revision
            )));
        }
        let revision = expected_revision + 1;
        let mut updated = workflow.clone();
        updated.revision = revision;
        *stored = updated;
        Ok(revision)
    }

    async fn put_state_resource(&self, resource: &StateResource) -> Result<(), RepositoryError> {
        self.resources.insert(
            (resource.namespace.clone(), resource.name.clone()),
            resource.clone(),
        );
        Ok(())
    }

    async fn get_state_resource(&self, namespace: &str, name: &str) -> Result<StateResource, RepositoryError> {
        self.resources
            .get(&(namespace.to_string(), name.to_string()))
            .map(|r| r.clone())
            .ok_or(RepositoryError::NotFound)
    }

    async fn delete_state_resource(&self, namespace: &str, name: &str) -> Result<(), RepositoryError> {
        self.resources
            .remove(&(namespace.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or(RepositoryError::NotFound)
    }
}
