//! Application state wiring the store, config and engine together.
//!
//! `AppState` pins the core services to the SQLite store in the data
//! directory. Engines are started on demand: only commands that execute
//! jobs need one.

use std::path::PathBuf;
use std::sync::Arc;

use stepflow_core::definition::service::DefinitionService;
use stepflow_core::interpreter::{completion_channel, Engine, SystemClock};
use stepflow_core::repository::WorkflowStore;
use stepflow_core::status::{RoutingTable, StatusReporter, TracingSink};
use stepflow_infra::config::{load_config, load_routing_table, resolve_data_dir};
use stepflow_infra::dispatcher::process::ProcessDispatcher;
use stepflow_infra::sqlite::pool::DatabasePool;
use stepflow_infra::sqlite::store::SqliteWorkflowStore;
use stepflow_types::config::StepflowConfig;

/// Engine over any store, running Task attempts as local processes.
pub type ProcessEngine<S> = Engine<S, ProcessDispatcher>;

/// Shared state for CLI commands backed by the data directory.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<SqliteWorkflowStore>,
    pub config: StepflowConfig,
    pub routing: RoutingTable,
    pub data_dir: PathBuf,
}

impl AppState {
    /// Create the data directory if needed, open the database and load config.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = resolve_data_dir();
        tokio::fs::create_dir_all(&data_dir).await?;

        let config = load_config(&data_dir).await;
        let routing = load_routing_table(&config, &data_dir).await;

        let db_url = format!(
            "sqlite://{}?mode=rwc",
            data_dir.join("stepflow.db").display()
        );
        let pool = DatabasePool::new(&db_url).await?;

        Ok(Self {
            store: Arc::new(SqliteWorkflowStore::new(pool)),
            config,
            routing,
            data_dir,
        })
    }

    pub fn definitions(&self) -> DefinitionService<SqliteWorkflowStore> {
        DefinitionService::new(Arc::clone(&self.store), self.config.engine.definition_retries)
    }

    pub fn start_engine(&self) -> ProcessEngine<SqliteWorkflowStore> {
        start_engine(Arc::clone(&self.store), &self.config, self.routing.clone())
    }
}

/// Start an engine in this process with status records going to the log.
pub fn start_engine<S: WorkflowStore + 'static>(
    store: Arc<S>,
    config: &StepflowConfig,
    routing: RoutingTable,
) -> ProcessEngine<S> {
    let (completions_tx, completions_rx) = completion_channel();
    let dispatcher = Arc::new(ProcessDispatcher::new(completions_tx));
    let reporter = StatusReporter::new(routing, Arc::new(TracingSink));
    Engine::start(
        store,
        dispatcher,
        completions_rx,
        reporter,
        config.engine.clone(),
        Arc::new(SystemClock),
    )
}
