//! CLI state resource subcommands.
//!
//! A state resource maps a Task's `resource` name, within a namespace, to the
//! shell command the process worker runs.

use anyhow::Result;
use clap::Subcommand;
use console::style;

use stepflow_core::repository::WorkflowStore;
use stepflow_types::error::RepositoryError;
use stepflow_types::resource::StateResource;

use crate::state::AppState;

#[derive(Subcommand)]
pub enum ResourceCommand {
    /// Point a resource name at a command.
    Set {
        name: String,

        /// Command run as `sh -c <target>`, with the attempt input on stdin.
        target: String,

        /// Namespace (config default when omitted).
        #[arg(long)]
        namespace: Option<String>,
    },

    /// Show where a resource name points.
    Get {
        name: String,

        #[arg(long)]
        namespace: Option<String>,
    },

    /// Remove a resource.
    #[command(alias = "rm")]
    Delete {
        name: String,

        #[arg(long)]
        namespace: Option<String>,
    },
}

/// Handle a resource subcommand.
pub async fn handle_resource_command(cmd: ResourceCommand, state: &AppState, json: bool) -> Result<()> {
    let default_ns = state.config.engine.default_namespace.as_str();

    match cmd {
        ResourceCommand::Set {
            name,
            target,
            namespace,
        } => {
            let resource = StateResource::new(namespace.as_deref().unwrap_or(default_ns), name, target);
            state.store.put_state_resource(&resource).await?;
            print_resource(&resource, json)
        }
        ResourceCommand::Get { name, namespace } => {
            let ns = namespace.as_deref().unwrap_or(default_ns);
            let resource = state
                .store
                .get_state_resource(ns, &name)
                .await
                .map_err(|e| not_found(e, ns, &name))?;
            print_resource(&resource, json)
        }
        ResourceCommand::Delete { name, namespace } => {
            let ns = namespace.as_deref().unwrap_or(default_ns);
            state
                .store
                .delete_state_resource(ns, &name)
                .await
                .map_err(|e| not_found(e, ns, &name))?;
            if json {
                let out = serde_json::json!({ "namespace": ns, "name": name, "deleted": true });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                println!();
                println!("  {} Deleted {}/{}", style("*").green().bold(), ns, style(&name).cyan());
                println!();
            }
            Ok(())
        }
    }
}

fn not_found(err: RepositoryError, namespace: &str, name: &str) -> anyhow::Error {
    match err {
        RepositoryError::NotFound => anyhow::anyhow!("Resource '{name}' not found in namespace '{namespace}'"),
        other => other.into(),
    }
}

fn print_resource(resource: &StateResource, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(resource)?);
    } else {
        println!();
        println!(
            "  {}/{} -> {}",
            resource.namespace,
            style(&resource.name).cyan(),
            style(&resource.target).yellow()
        );
        println!("  Updated: {}", resource.last_updated.format("%Y-%m-%d %H:%M:%S"));
        println!();
    }
    Ok(())
}
