//! CLI command definitions and dispatch for the `stepflow` binary.
//!
//! Uses clap derive macros for argument parsing. Commands are grouped by
//! noun (`stepflow definition create`, `stepflow job run`). Commands that
//! execute jobs run the engine in the foreground until the job settles.

pub mod definition;
pub mod job;
pub mod resource;
pub mod run;

use clap::{Parser, Subcommand};

/// Run versioned state-machine workflows.
#[derive(Parser)]
#[command(name = "stepflow", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for info, -vv for debug, -vvv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true, env = "STEPFLOW_OTEL")]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate, register and inspect workflow definitions.
    #[command(alias = "def")]
    Definition {
        #[command(subcommand)]
        action: definition::DefinitionCommand,
    },

    /// Run, inspect, cancel and resume jobs.
    Job {
        #[command(subcommand)]
        action: job::JobCommand,
    },

    /// Manage state resources (Task resource name -> command).
    Resource {
        #[command(subcommand)]
        action: resource::ResourceCommand,
    },

    /// Run a definition file once, in memory, without touching the data directory.
    Run(run::RunArgs),
}

impl Cli {
    /// Log filter implied by `--quiet` / `-v`.
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 if self.quiet => "error",
            0 => "warn",
            1 => "info",
            2 => "info,stepflow_core=debug,stepflow_infra=debug",
            _ => "trace",
        }
    }
}

/// Parse a `--input` argument as JSON. A missing input is `{}`.
pub fn parse_input(raw: Option<&str>) -> anyhow::Result<serde_json::Value> {
    match raw {
        None => Ok(serde_json::json!({})),
        Some(raw) => serde_json::from_str(raw)
            .map_err(|e| anyhow::anyhow!("--input is not valid JSON: {e}")),
    }
}
