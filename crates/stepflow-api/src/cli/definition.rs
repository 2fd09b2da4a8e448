//! CLI definition subcommands.
//!
//! Validate documents locally, register them (first version or next
//! version), and inspect what is stored.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Subcommand, ValueEnum};
use comfy_table::{presets, Cell, Color, ContentArrangement, Table};
use console::style;

use stepflow_core::definition::document::{load_document, render_document, DefinitionDocument, DocumentFormat};
use stepflow_core::definition::graph::ordered_states;
use stepflow_core::definition::validate::validate_state_machine;
use stepflow_core::definition::versioning::copy_workflow_definition;
use stepflow_types::definition::{StateMachine, WorkflowDefinition};

use crate::state::AppState;

#[derive(Subcommand)]
pub enum DefinitionCommand {
    /// Check a definition file without storing it.
    Validate {
        /// JSON or YAML definition document.
        file: PathBuf,
    },

    /// Register a new definition (version 0) from a file.
    Create {
        file: PathBuf,
    },

    /// Store a file as the next version of an existing definition.
    Update {
        file: PathBuf,
    },

    /// Register the latest version of a definition under a new name.
    Copy {
        /// Existing definition name.
        source: String,

        /// Name for the copy.
        name: String,
    },

    /// Print a stored definition as a document.
    #[command(disable_version_flag = true)]
    Show {
        name: String,

        /// Version to show (latest when omitted).
        #[arg(long)]
        version: Option<u32>,

        /// Document format.
        #[arg(long, value_enum, default_value = "yaml")]
        format: Format,
    },

    /// List the latest version of every definition.
    #[command(alias = "ls")]
    List,

    /// List every stored version of a definition.
    Versions {
        name: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
pub enum Format {
    Json,
    Yaml,
}

impl From<Format> for DocumentFormat {
    fn from(format: Format) -> Self {
        match format {
            Format::Json => DocumentFormat::Json,
            Format::Yaml => DocumentFormat::Yaml,
        }
    }
}

/// Handle a definition subcommand.
pub async fn handle_definition_command(cmd: DefinitionCommand, json: bool) -> Result<()> {
    // Validation is local; everything else needs the data directory.
    match cmd {
        DefinitionCommand::Validate { file } => handle_validate(&file, json),
        DefinitionCommand::Create { file } => handle_create(&file, &AppState::init().await?, json).await,
        DefinitionCommand::Update { file } => handle_update(&file, &AppState::init().await?, json).await,
        DefinitionCommand::Copy { source, name } => {
            handle_copy(&source, &name, &AppState::init().await?, json).await
        }
        DefinitionCommand::Show {
            name,
            version,
            format,
        } => handle_show(&name, version, format, &AppState::init().await?).await,
        DefinitionCommand::List => handle_list(&AppState::init().await?, json).await,
        DefinitionCommand::Versions { name } => handle_versions(&name, &AppState::init().await?, json).await,
    }
}

pub fn load(file: &Path) -> Result<DefinitionDocument> {
    load_document(file).with_context(|| format!("Failed to load definition {}", file.display()))
}

// ---------------------------------------------------------------------------
// Validate
// ---------------------------------------------------------------------------

/// States of `original` that `normalized` no longer contains.
fn pruned_names(original: &StateMachine, normalized: &StateMachine) -> Vec<String> {
    let kept: BTreeSet<&String> = normalized.states.keys().collect();
    original
        .states
        .keys()
        .filter(|name| !kept.contains(name))
        .cloned()
        .collect()
}

fn handle_validate(file: &Path, json: bool) -> Result<()> {
    let doc = load(file)?;
    let normalized = validate_state_machine(&doc.state_machine)
        .map_err(|e| anyhow::anyhow!("Definition '{}' is invalid: {e}", doc.name))?;
    let order: Vec<String> = ordered_states(&normalized.states)?
        .into_iter()
        .map(|s| s.name.to_string())
        .collect();
    let pruned = pruned_names(&doc.state_machine, &normalized);

    if json {
        let out = serde_json::json!({
            "name": doc.name,
            "valid": true,
            "order": order,
            "pruned": pruned,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} '{}' is valid ({} states)",
        style("✓").green().bold(),
        style(&doc.name).cyan(),
        order.len()
    );
    println!("  Order: {}", order.join(" -> "));
    if !pruned.is_empty() {
        println!(
            "  {} unreachable, dropped on store: {}",
            style("!").yellow().bold(),
            pruned.join(", ")
        );
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Create / Update / Copy
// ---------------------------------------------------------------------------

fn print_stored(verb: &str, def: &WorkflowDefinition, json: bool) -> Result<()> {
    if json {
        let out = serde_json::json!({
            "id": def.id.to_string(),
            "name": def.name,
            "version": def.version,
            "manager": def.manager.to_string(),
            "states": def.state_machine.states.len(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!();
        println!(
            "  {} {verb} '{}' version {}",
            style("*").green().bold(),
            style(&def.name).cyan(),
            def.version
        );
        println!("  ID: {}", def.id);
        println!("  Manager: {}", def.manager);
        println!("  States: {}", def.state_machine.states.len());
        println!();
    }
    Ok(())
}

async fn handle_create(file: &Path, state: &AppState, json: bool) -> Result<()> {
    let doc = load(file)?;
    let def = state
        .definitions()
        .create(&doc.name, doc.manager, doc.description.clone(), &doc.state_machine)
        .await?;
    print_stored("Created", &def, json)
}

async fn handle_update(file: &Path, state: &AppState, json: bool) -> Result<()> {
    let doc = load(file)?;
    let def = state
        .definitions()
        .new_version(&doc.name, &doc.state_machine, doc.description.clone())
        .await?;
    print_stored("Stored", &def, json)
}

async fn handle_copy(source: &str, name: &str, state: &AppState, json: bool) -> Result<()> {
    let service = state.definitions();
    let copy = copy_workflow_definition(&service.latest(source).await?);
    let def = service
        .create(name, copy.manager, copy.description, &copy.state_machine)
        .await?;
    print_stored("Copied into", &def, json)
}

// ---------------------------------------------------------------------------
// Show / List / Versions
// ---------------------------------------------------------------------------

async fn handle_show(name: &str, version: Option<u32>, format: Format, state: &AppState) -> Result<()> {
    let def = state.definitions().get(name, version).await?;
    let doc = DefinitionDocument {
        name: def.name,
        description: def.description,
        manager: def.manager,
        state_machine: def.state_machine,
    };
    print!("{}", render_document(&doc, format.into())?);
    if matches!(format, Format::Json) {
        println!();
    }
    Ok(())
}

fn definitions_table(defs: &[WorkflowDefinition]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Name").fg(Color::Cyan),
            Cell::new("Version"),
            Cell::new("Manager"),
            Cell::new("States"),
            Cell::new("Created"),
        ]);

    for d in defs {
        table.add_row(vec![
            Cell::new(&d.name),
            Cell::new(d.version),
            Cell::new(d.manager),
            Cell::new(d.state_machine.states.len()),
            Cell::new(d.created_at.format("%Y-%m-%d %H:%M:%S")),
        ]);
    }
    table
}

fn print_definitions(defs: &[WorkflowDefinition], json: bool) -> Result<()> {
    if json {
        let out: Vec<_> = defs
            .iter()
            .map(|d| {
                serde_json::json!({
                    "id": d.id.to_string(),
                    "name": d.name,
                    "version": d.version,
                    "manager": d.manager.to_string(),
                    "states": d.state_machine.states.len(),
                    "created_at": d.created_at.to_rfc3339(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!("{}", definitions_table(defs));
    println!();
    Ok(())
}

async fn handle_list(state: &AppState, json: bool) -> Result<()> {
    let defs = state.definitions().list_latest().await?;
    if defs.is_empty() && !json {
        println!();
        println!("  No definitions registered.");
        println!(
            "  Create one with: {}",
            style("stepflow definition create <file.yaml>").dim()
        );
        println!();
        return Ok(());
    }
    print_definitions(&defs, json)
}

async fn handle_versions(name: &str, state: &AppState, json: bool) -> Result<()> {
    let defs = state.definitions().versions(name).await?;
    print_definitions(&defs, json)
}
