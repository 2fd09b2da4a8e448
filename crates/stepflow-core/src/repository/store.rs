//! Workflow store trait definition.
//!
//! Defines the persistence interface for definitions, jobs, workflow
//! aggregates and state resources. The infrastructure layer (stepflow-infra)
//! implements it with SQLite; [`MemoryStore`](super::memory::MemoryStore)
//! implements it in process.

use stepflow_types::definition::WorkflowDefinition;
use stepflow_types::error::RepositoryError;
use stepflow_types::job::{Job, JobQuery};
use stepflow_types::resource::StateResource;
use stepflow_types::workflow::Workflow;
use uuid::Uuid;

/// Storage interface for Stepflow.
///
/// Covers four entity families:
/// - **Definitions:** immutable rows keyed by `(name, version)`.
/// - **Jobs:** created once, then updated under optimistic revision checks.
/// - **Workflows:** aggregates over jobs, also revision-checked.
/// - **State resources:** `(namespace, name)` keyed worker targets.
///
/// Missing entities are reported as [`RepositoryError::NotFound`]; lost
/// races as [`RepositoryError::Conflict`].
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait WorkflowStore: Send + Sync {
    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Insert a definition. Fails with `Conflict` if `(name, version)` exists.
    fn save_definition(
        &self,
        def: &WorkflowDefinition,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a definition by name and version.
    fn get_definition(
        &self,
        name: &str,
        version: u32,
    ) -> impl std::future::Future<Output = Result<WorkflowDefinition, RepositoryError>> + Send;

    /// Get the highest version of a definition.
    fn latest_definition(
        &self,
        name: &str,
    ) -> impl std::future::Future<Output = Result<WorkflowDefinition, RepositoryError>> + Send;

    /// All versions of a definition, ascending by version.
    fn list_definition_versions(
        &self,
        name: &str,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowDefinition>, RepositoryError>> + Send;

    /// Latest version of every definition, ordered by name.
    fn list_latest_definitions(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowDefinition>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Jobs
    // -----------------------------------------------------------------------

    /// Insert a new job. Fails with `Conflict` if the id exists.
    fn create_job(
        &self,
        job: &Job,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_job(
        &self,
        id: Uuid,
    ) -> impl std::future::Future<Output = Result<Job, RepositoryError>> + Send;

    /// Replace a job if its stored revision is still `expected_revision`.
    ///
    /// Returns the new revision. Fails with `Conflict` when another writer got
    /// there first.
    fn update_job(
        &self,
        job: &Job,
        expected_revision: u64,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;

    /// Jobs of one definition, newest first unless `oldest_first`.
    fn query_jobs(
        &self,
        query: &JobQuery,
    ) -> impl std::future::Future<Output = Result<Vec<Job>, RepositoryError>> + Send;

    /// Jobs whose status is not terminal (crash recovery).
    fn list_active_jobs(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<Job>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Workflows
    // -----------------------------------------------------------------------

    fn create_workflow(
        &self,
        workflow: &Workflow,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_workflow(
        &self,
        id: Uuid,
    ) -> impl std::future::Future<Output = Result<Workflow, RepositoryError>> + Send;

    /// Replace a workflow if its stored revision is still `expected_revision`.
    fn update_workflow(
        &self,
        workflow: &Workflow,
        expected_revision: u64,
    ) -> impl std::future::Future<Output = Result<u64, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // State resources
    // -----------------------------------------------------------------------

    /// Insert or replace a state resource.
    fn put_state_resource(
        &self,
        resource: &StateResource,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_state_resource(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl std::future::Future<Output = Result<StateResource, RepositoryError>> + Send;

    fn delete_state_resource(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
}
