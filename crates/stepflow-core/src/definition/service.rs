//! Definition management service.
//!
//! Validates machines before they are stored and allocates version numbers.
//! Definitions are immutable once saved; "updating" one stores the next
//! version under the same name.

use std::sync::Arc;

use stepflow_types::definition::{Manager, StateMachine, WorkflowDefinition};
use stepflow_types::error::RepositoryError;
use thiserror::Error;

use super::validate::{validate_state_machine, ValidationError};
use super::versioning::{new_workflow_definition, new_workflow_definition_version};
use crate::repository::store::WorkflowStore;

#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("invalid definition: {0}")]
    Validation(#[from] ValidationError),

    #[error("definition '{0}' already exists")]
    AlreadyExists(String),

    #[error("definition '{0}' not found")]
    NotFound(String),

    #[error("could not allocate a version for '{name}' after {attempts} attempts")]
    VersionConflict { name: String, attempts: u32 },

    #[error("storage error: {0}")]
    Repository(#[from] RepositoryError),
}

/// Service for registering and versioning workflow definitions.
///
/// Generic over `S: WorkflowStore` so the same logic runs on SQLite and on
/// the in-memory store.
pub struct DefinitionService<S: WorkflowStore> {
    store: Arc<S>,
    max_retries: u32,
}

impl<S: WorkflowStore> DefinitionService<S> {
    /// `max_retries` bounds re-reads when a concurrent writer takes the
    /// version number we computed.
    pub fn new(store: Arc<S>, max_retries: u32) -> Self {
        Self { store, max_retries }
    }

    /// Register a brand-new definition at version 0.
    pub async fn create(
        &self,
        name: &str,
        manager: Manager,
        description: Option<String>,
        machine: &StateMachine,
    ) -> Result<WorkflowDefinition, DefinitionError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ValidationError::EmptyName.into());
        }
        let normalized = validate_state_machine(machine)?;

        match self.store.latest_definition(name).await {
            Ok(_) => return Err(DefinitionError::AlreadyExists(name.to_string())),
            Err(RepositoryError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }

        let mut def = new_workflow_definition(name, manager, normalized);
        def.description = description;

        self.store.save_definition(&def).await.map_err(|e| match e {
            RepositoryError::Conflict(_) => DefinitionError::AlreadyExists(name.to_string()),
            other => other.into(),
        })?;

        tracing::info!(name = %def.name, version = def.version, id = %def.id, "registered workflow definition");
        Ok(def)
    }

    /// Store `machine` as the next version of `name`.
    ///
    /// Manager and description carry over from the latest version unless
    /// `description` is given.
    pub async fn new_version(
        &self,
        name: &str,
        machine: &StateMachine,
        description: Option<String>,
    ) -> Result<WorkflowDefinition, DefinitionError> {
        let normalized = validate_state_machine(machine)?;

        for attempt in 0..=self.max_retries {
            let latest = self.latest(name).await?;
            let mut def = new_workflow_definition_version(&latest, latest.version + 1);
            def.state_machine = normalized.clone();
            if description.is_some() {
                def.description = description.clone();
            }

            match self.store.save_definition(&def).await {
                Ok(()) => {
                    tracing::info!(name = %def.name, version = def.version, "stored new definition version");
                    return Ok(def);
                }
                Err(RepositoryError::Conflict(msg)) => {
                    tracing::debug!(name, attempt, %msg, "definition version taken, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(DefinitionError::VersionConflict {
            name: name.to_string(),
            attempts: self.max_retries + 1,
        })
    }

    /// A specific version, or the latest when `version` is `None`.
    pub async fn get(&self, name: &str, version: Option<u32>) -> Result<WorkflowDefinition, DefinitionError> {
        let result = match version {
            Some(version) => self.store.get_definition(name, version).await,
            None => self.store.latest_definition(name).await,
        };
        result.map_err(|e| not_found_as(name, e))
    }

    pub async fn latest(&self, name: &str) -> Result<WorkflowDefinition, DefinitionError> {
        self.get(name, None).await
    }

    pub async fn versions(&self, name: &str) -> Result<Vec<WorkflowDefinition>, DefinitionError> {
        let versions = self.store.list_definition_versions(name).await?;
        if versions.is_empty() {
            return Err(DefinitionError::NotFound(name.to_string()));
        }
        Ok(versions)
    }

    pub async fn list_latest(&self) -> Result<Vec<WorkflowDefinition>, DefinitionError> {
        Ok(self.store.list_latest_definitions().await?)
    }
}

fn not_found_as(name: &str, err: RepositoryError) -> DefinitionError {
    match err {
        RepositoryError::NotFound => DefinitionError::NotFound(name.to_string()),
        other => other.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::MemoryStore;
    use stepflow_types::definition::{State, SucceedState, TaskState, Transition};

    fn machine(resource: &str) -> StateMachine {
        StateMachine::new(
            "work",
            [
                (
                    "work".to_string(),
                    State::Task(TaskState {
                        resource: resource.to_string(),
                        transition: Transition::Next("done".to_string()),
                        retry: vec![],
                        catch: vec![],
                        timeout_seconds: None,
                        comment: None,
                    }),
                ),
                ("done".to_string(), State::Succeed(SucceedState::default())),
                ("orphan".to_string(), State::Succeed(SucceedState::default())),
            ],
        )
    }

    fn service() -> DefinitionService<MemoryStore> {
        DefinitionService::new(Arc::new(MemoryStore::new()), 3)
    }

    #[tokio::test]
    async fn test_create_stores_pruned_version_zero() {
        let svc = service();
        let def = svc
            .create("nightly", Manager::Batch, Some("nightly run".to_string()), &machine("r"))
            .await
            .unwrap();
        assert_eq!(def.version, 0);
        assert_eq!(def.manager, Manager::Batch);
        assert!(!def.state_machine.states.contains_key("orphan"));

        let stored = svc.latest("nightly").await.unwrap();
        assert_eq!(stored, def);
    }

    #[tokio::test]
    async fn test_create_rejects_existing_name() {
        let svc = service();
        svc.create("nightly", Manager::default(), None, &machine("r")).await.unwrap();
        let err = svc
            .create("nightly", Manager::default(), None, &machine("r"))
            .await
            .unwrap_err();
        assert!(matches!(err, DefinitionError::AlreadyExists(name) if name == "nightly"));
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_machine() {
        let svc = service();
        let mut bad = machine("r");
        bad.start_at = "missing".to_string();
        let err = svc.create("bad", Manager::default(), None, &bad).await.unwrap_err();
        assert!(matches!(err, DefinitionError::Validation(_)));
        assert!(matches!(svc.latest("bad").await, Err(DefinitionError::NotFound(_))));

        let err = svc.create("  ", Manager::default(), None, &machine("r")).await.unwrap_err();
        assert!(matches!(err, DefinitionError::Validation(ValidationError::EmptyName)));
    }

    #[tokio::test]
    async fn test_new_version_increments() {
        let svc = service();
        let v0 = svc
            .create("nightly", Manager::Batch, Some("first".to_string()), &machine("r"))
            .await
            .unwrap();
        let v1 = svc.new_version("nightly", &machine("r2"), None).await.unwrap();
        let v2 = svc
            .new_version("nightly", &machine("r3"), Some("third".to_string()))
            .await
            .unwrap();

        assert_eq!(v1.version, 1);
        assert_eq!(v2.version, 2);
        assert_eq!(v1.manager, Manager::Batch);
        assert_eq!(v1.description.as_deref(), Some("first"));
        assert_eq!(v2.description.as_deref(), Some("third"));
        assert_ne!(v1.id, v0.id);

        let versions: Vec<u32> = svc.versions("nightly").await.unwrap().iter().map(|d| d.version).collect();
        assert_eq!(versions, vec![0, 1, 2]);
        assert_eq!(
            svc.get("nightly", Some(1)).await.unwrap().state_machine.states["work"].resource(),
            Some("r2")
        );
    }

    #[tokio::test]
    async fn test_new_version_of_unknown_name() {
        let svc = service();
        let err = svc.new_version("ghost", &machine("r"), None).await.unwrap_err();
        assert!(matches!(err, DefinitionError::NotFound(name) if name == "ghost"));
    }

    #[tokio::test]
    async fn test_concurrent_new_versions_get_distinct_numbers() {
        let svc = Arc::new(service());
        svc.create("nightly", Manager::default(), None, &machine("r")).await.unwrap();

        let a = {
            let svc = svc.clone();
            tokio::spawn(async move { svc.new_version("nightly", &machine("a"), None).await })
        };
        let b = {
            let svc = svc.clone();
            tokio::spawn(async move { svc.new_version("nightly", &machine("b"), None).await })
        };
        let mut got = vec![a.await.unwrap().unwrap().version, b.await.unwrap().unwrap().version];
        got.sort();
        assert_eq!(got, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_list_latest() {
        let svc = service();
        svc.create("b-flow", Manager::default(), None, &machine("r")).await.unwrap();
        svc.create("a-flow", Manager::default(), None, &machine("r")).await.unwrap();
        svc.new_version("b-flow", &machine("r"), None).await.unwrap();

        let latest = svc.list_latest().await.unwrap();
        let summary: Vec<(String, u32)> = latest.into_iter().map(|d| (d.name, d.version)).collect();
        assert_eq!(summary, vec![("a-flow".to_string(), 0), ("b-flow".to_string(), 1)]);
    }
}
