//! SQLite workflow store implementation.
//!
//! Implements `WorkflowStore` from `stepflow-core` using sqlx with split
//! read/write pools. Definitions, jobs and workflows are stored as JSON
//! bodies next to the handful of columns that queries filter and sort on.
//! Jobs and workflows carry a `revision` column; updates only land when the
//! caller's expected revision still matches.

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::Row;
use stepflow_core::repository::WorkflowStore;
use stepflow_types::definition::WorkflowDefinition;
use stepflow_types::error::RepositoryError;
use stepflow_types::job::{Job, JobQuery, JobStatus};
use stepflow_types::resource::StateResource;
use stepflow_types::workflow::Workflow;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `WorkflowStore`.
#[derive(Clone)]
pub struct SqliteWorkflowStore {
    pool: DatabasePool,
}

impl SqliteWorkflowStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct BodyRow {
    body: String,
    revision: i64,
}

impl BodyRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            body: row.try_get("body")?,
            revision: row.try_get("revision")?,
        })
    }

    fn into_job(self) -> Result<Job, RepositoryError> {
        let mut job: Job = serde_json::from_str(&self.body)
            .map_err(|e| RepositoryError::Query(format!("invalid job JSON: {e}")))?;
        job.revision = self.revision as u64;
        Ok(job)
    }

    fn into_workflow(self) -> Result<Workflow, RepositoryError> {
        let mut workflow: Workflow = serde_json::from_str(&self.body)
            .map_err(|e| RepositoryError::Query(format!("invalid workflow JSON: {e}")))?;
        workflow.revision = self.revision as u64;
        Ok(workflow)
    }
}

struct DefinitionRow {
    body: String,
}

impl DefinitionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            body: row.try_get("body")?,
        })
    }

    fn into_definition(self) -> Result<WorkflowDefinition, RepositoryError> {
        serde_json::from_str(&self.body)
            .map_err(|e| RepositoryError::Query(format!("invalid workflow definition JSON: {e}")))
    }
}

struct ResourceRow {
    namespace: String,
    name: String,
    target: String,
    last_updated: String,
}

impl ResourceRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            namespace: row.try_get("namespace")?,
            name: row.try_get("name")?,
            target: row.try_get("target")?,
            last_updated: row.try_get("last_updated")?,
        })
    }

    fn into_resource(self) -> Result<StateResource, RepositoryError> {
        Ok(StateResource {
            namespace: self.namespace,
            name: self.name,
            target: self.target,
            last_updated: parse_datetime(&self.last_updated)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

/// Fixed-width UTC timestamps so that text ordering matches time ordering.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn to_json<T: serde::Serialize>(value: &T, what: &str) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(format!("serialize {what}: {e}")))
}

fn status_column(status: Option<JobStatus>) -> Option<&'static str> {
    status.map(|s| s.as_str())
}

/// Unique violations become `Conflict`; everything else is a query error.
fn insert_error(e: sqlx::Error, conflict: impl FnOnce() -> String) -> RepositoryError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => RepositoryError::Conflict(conflict()),
        _ => RepositoryError::Query(e.to_string()),
    }
}

fn bodies_into_jobs(rows: &[sqlx::sqlite::SqliteRow]) -> Result<Vec<Job>, RepositoryError> {
    let mut jobs = Vec::with_capacity(rows.len());
    for row in rows {
        let r = BodyRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
        jobs.push(r.into_job()?);
    }
    Ok(jobs)
}

fn rows_into_definitions(rows: &[sqlx::sqlite::SqliteRow]) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
    let mut defs = Vec::with_capacity(rows.len());
    for row in rows {
        let r = DefinitionRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
        defs.push(r.into_definition()?);
    }
    Ok(defs)
}

impl SqliteWorkflowStore {
    /// After an update touched no rows: was the record missing, or was the
    /// revision stale?
    async fn missed_update(
        &self,
        table: &'static str,
        id: Uuid,
        expected_revision: u64,
    ) -> RepositoryError {
        let sql = format!("SELECT revision FROM {table} WHERE id = ?");
        let current = sqlx::query_scalar::<_, i64>(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool.writer)
            .await;
        match current {
            Ok(Some(revision)) => RepositoryError::Conflict(format!(
                "{table} row {id} is at revision {revision}, expected {expected_revision}"
            )),
            Ok(None) => RepositoryError::NotFound,
            Err(e) => RepositoryError::Query(e.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowStore impl
// ---------------------------------------------------------------------------

impl WorkflowStore for SqliteWorkflowStore {
    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        let body = to_json(def, "definition")?;

        sqlx::query(
            r#"INSERT INTO workflow_definitions (id, name, version, manager, body, created_at)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(def.id.to_string())
        .bind(&def.name)
        .bind(def.version as i64)
        .bind(def.manager.to_string())
        .bind(&body)
        .bind(format_datetime(&def.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| insert_error(e, || format!("definition {}@{} already exists", def.name, def.version)))?;

        Ok(())
    }

    async fn get_definition(&self, name: &str, version: u32) -> Result<WorkflowDefinition, RepositoryError> {
        let row = sqlx::query("SELECT body FROM workflow_definitions WHERE name = ? AND version = ?")
            .bind(name)
            .bind(version as i64)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?
            .ok_or(RepositoryError::NotFound)?;

        DefinitionRow::from_row(&row)
            .map_err(|e| RepositoryError::Query(e.to_string()))?
            .into_definition()
    }

    async fn latest_definition(&self, name: &str) -> Result<WorkflowDefinition, RepositoryError> {
        let row = sqlx::query(
            "SELECT body FROM workflow_definitions WHERE name = ? ORDER BY version DESC LIMIT 1",
        )
        .bind(name)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?
        .ok_or(RepositoryError::NotFound)?;

        DefinitionRow::from_row(&row)
            .map_err(|e| RepositoryError::Query(e.to_string()))?
            .into_definition()
    }

    async fn list_definition_versions(&self, name: &str) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let rows = sqlx::query("SELECT body FROM workflow_definitions WHERE name = ? ORDER BY version ASC")
            .bind(name)
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows_into_definitions(&rows)
    }

    async fn list_latest_definitions(&self) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT d.body FROM workflow_definitions d
               JOIN (SELECT name, MAX(version) AS version FROM workflow_definitions GROUP BY name) latest
                 ON d.name = latest.name AND d.version = latest.version
               ORDER BY d.name ASC"#,
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows_into_definitions(&rows)
    }

    async fn create_job(&self, job: &Job) -> Result<(), RepositoryError> {
        let body = to_json(job, "job")?;

        sqlx::query(
            r#"INSERT INTO jobs
               (id, workflow_id, definition_name, definition_version, namespace, status,
                body, revision, created_at, last_updated)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(job.id.to_string())
        .bind(job.workflow_id.map(|id| id.to_string()))
        .bind(&job.definition.name)
        .bind(job.definition.version as i64)
        .bind(&job.namespace)
        .bind(status_column(job.status()))
        .bind(&body)
        .bind(job.revision as i64)
        .bind(format_datetime(&job.created_at))
        .bind(format_datetime(&job.last_updated))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| insert_error(e, || format!("job {} already exists", job.id)))?;

        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Job, RepositoryError> {
        let row = sqlx::query("SELECT body, revision FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?
            .ok_or(RepositoryError::NotFound)?;

        BodyRow::from_row(&row)
            .map_err(|e| RepositoryError::Query(e.to_string()))?
            .into_job()
    }

    async fn update_job(&self, job: &Job, expected_revision: u64) -> Result<u64, RepositoryError> {
        let revision = expected_revision + 1;
        let mut stored = job.clone();
        stored.revision = revision;
        let body = to_json(&stored, "job")?;

        let result = sqlx::query(
            r#"UPDATE jobs SET workflow_id = ?, status = ?, body = ?, revision = ?, last_updated = ?
               WHERE id = ? AND revision = ?"#,
        )
        .bind(job.workflow_id.map(|id| id.to_string()))
        .bind(status_column(job.status()))
        .bind(&body)
        .bind(revision as i64)
        .bind(format_datetime(&job.last_updated))
        .bind(job.id.to_string())
        .bind(expected_revision as i64)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(self.missed_update("jobs", job.id, expected_revision).await);
        }
        Ok(revision)
    }

    async fn query_jobs(&self, query: &JobQuery) -> Result<Vec<Job>, RepositoryError> {
        let order = if query.oldest_first { "ASC" } else { "DESC" };
        let sql = format!(
            "SELECT body, revision FROM jobs WHERE definition_name = ? AND (? IS NULL OR status = ?) \
             ORDER BY created_at {order}, id {order} LIMIT ?"
        );
        let status = status_column(query.status);

        let rows = sqlx::query(&sql)
            .bind(&query.definition_name)
            .bind(status)
            .bind(status)
            .bind(query.effective_limit() as i64)
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        bodies_into_jobs(&rows)
    }

    async fn list_active_jobs(&self) -> Result<Vec<Job>, RepositoryError> {
        let rows = sqlx::query(
            r#"SELECT body, revision FROM jobs
               WHERE status IS NULL OR status NOT IN ('succeeded', 'failed', 'cancelled')
               ORDER BY created_at ASC, id ASC"#,
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        bodies_into_jobs(&rows)
    }

    async fn create_workflow(&self, workflow: &Workflow) -> Result<(), RepositoryError> {
        let body = to_json(workflow, "workflow")?;

        sqlx::query(
            r#"INSERT INTO workflows (id, definition_name, status, body, revision, created_at, last_updated)
               VALUES (?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(workflow.id.to_string())
        .bind(workflow.definition_name())
        .bind(workflow.status().map(|s| s.as_str()))
        .bind(&body)
        .bind(workflow.revision as i64)
        .bind(format_datetime(&workflow.created_at))
        .bind(format_datetime(&workflow.last_updated))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| insert_error(e, || format!("workflow {} already exists", workflow.id)))?;

        Ok(())
    }

    async fn get_workflow(&self, id: Uuid) -> Result<Workflow, RepositoryError> {
        let row = sqlx::query("SELECT body, revision FROM workflows WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?
            .ok_or(RepositoryError::NotFound)?;

        BodyRow::from_row(&row)
            .map_err(|e| RepositoryError::Query(e.to_string()))?
            .into_workflow()
    }

    async fn update_workflow(&self, workflow: &Workflow, expected_revision: u64) -> Result<u64, RepositoryError> {
        let revision = expected_revision + 1;
        let mut stored = workflow.clone();
        stored.revision = revision;
        let body = to_json(&stored, "workflow")?;

        let result = sqlx::query(
            r#"UPDATE workflows SET status = ?, body = ?, revision = ?, last_updated = ?
               WHERE id = ? AND revision = ?"#,
        )
        .bind(workflow.status().map(|s| s.as_str()))
        .bind(&body)
        .bind(revision as i64)
        .bind(format_datetime(&workflow.last_updated))
        .bind(workflow.id.to_string())
        .bind(expected_revision as i64)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(self.missed_update("workflows", workflow.id, expected_revision).await);
        }
        Ok(revision)
    }

    async fn put_state_resource(&self, resource: &StateResource) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO state_resources (namespace, name, target, last_updated)
               VALUES (?, ?, ?, ?)
               ON CONFLICT(namespace, name) DO UPDATE SET
                 target = excluded.target,
                 last_updated = excluded.last_updated"#,
        )
        .bind(&resource.namespace)
        .bind(&resource.name)
        .bind(&resource.target)
        .bind(format_datetime(&resource.last_updated))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn get_state_resource(&self, namespace: &str, name: &str) -> Result<StateResource, RepositoryError> {
        let row = sqlx::query(
            "SELECT namespace, name, target, last_updated FROM state_resources WHERE namespace = ? AND name = ?",
        )
        .bind(namespace)
        .bind(name)
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?
        .ok_or(RepositoryError::NotFound)?;

        ResourceRow::from_row(&row)
            .map_err(|e| RepositoryError::Query(e.to_string()))?
            .into_resource()
    }

    async fn delete_state_resource(&self, namespace: &str, name: &str) -> Result<(), RepositoryError> {
        let result = sqlx::query("DELETE FROM state_resources WHERE namespace = ? AND name = ?")
            .bind(namespace)
            .bind(name)
            .execute(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }
}
