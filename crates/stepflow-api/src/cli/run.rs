//! `stepflow run`: execute a definition file once against an in-memory store.
//!
//! Nothing is read from or written to the data directory. Task resources
//! are supplied on the command line as `name=command` pairs.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::Args;

use stepflow_core::definition::service::DefinitionService;
use stepflow_core::repository::{MemoryStore, WorkflowStore};
use stepflow_core::status::RoutingTable;
use stepflow_types::config::StepflowConfig;
use stepflow_types::resource::StateResource;

use super::definition::load;
use super::job::{print_job, submit_and_wait};
use super::parse_input;
use crate::state::start_engine;

#[derive(Args)]
pub struct RunArgs {
    /// JSON or YAML definition document.
    pub file: PathBuf,

    /// Job input as a JSON document.
    #[arg(long)]
    pub input: Option<String>,

    /// Map a Task resource to a command (repeatable), e.g. `--resource fetch='curl -s $URL'`.
    #[arg(long = "resource", value_name = "NAME=COMMAND")]
    pub resources: Vec<String>,
}

/// Split `name=command` at the first `=`.
fn parse_resource(raw: &str) -> Result<(String, String)> {
    let Some((name, target)) = raw.split_once('=') else {
        bail!("--resource '{raw}' must look like NAME=COMMAND");
    };
    let name = name.trim();
    if name.is_empty() || target.trim().is_empty() {
        bail!("--resource '{raw}' needs both a name and a command");
    }
    Ok((name.to_string(), target.to_string()))
}

pub async fn handle_run(args: RunArgs, json: bool, quiet: bool) -> Result<()> {
    let doc = load(&args.file)?;
    let input = parse_input(args.input.as_deref())?;
    let config = StepflowConfig::default();
    let namespace = config.engine.default_namespace.clone();

    let store = Arc::new(MemoryStore::new());
    for raw in &args.resources {
        let (name, target) = parse_resource(raw)?;
        store
            .put_state_resource(&StateResource::new(&namespace, name, target))
            .await?;
    }

    let service = DefinitionService::new(Arc::clone(&store), config.engine.definition_retries);
    let def = service
        .create(&doc.name, doc.manager, doc.description.clone(), &doc.state_machine)
        .await?;
    tracing::debug!(name = %def.name, states = def.state_machine.states.len(), "registered ephemeral definition");

    let engine = start_engine(store, &config, RoutingTable::default());
    let job = submit_and_wait(&engine, &def.name, Some(def.version), input, None, json || quiet).await;
    engine.shutdown().await;
    print_job(&job?, json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_resource_splits_at_first_equals() {
        let (name, target) = parse_resource("sum=jq -n '1 + 2 == 3'").unwrap();
        assert_eq!(name, "sum");
        assert_eq!(target, "jq -n '1 + 2 == 3'");
    }

    #[test]
    fn test_parse_resource_rejects_malformed_pairs() {
        assert!(parse_resource("no-separator").is_err());
        assert!(parse_resource("=cat").is_err());
        assert!(parse_resource("name=  ").is_err());
    }
}
