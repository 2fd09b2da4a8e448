//! Stepflow CLI entry point.
//!
//! Binary name: `stepflow`
//!
//! Parses CLI arguments, sets up tracing, opens the data directory when the
//! command needs it, and dispatches to the command handler.

mod cli;
mod state;

use clap::Parser;

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    stepflow_observe::tracing_setup::init_tracing(cli.otel, cli.log_filter())
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;

    let result = dispatch(cli).await;
    stepflow_observe::tracing_setup::shutdown_tracing();
    result
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let (json, quiet) = (cli.json, cli.quiet);

    match cli.command {
        // Definition commands open the data directory themselves (validate doesn't).
        Commands::Definition { action } => cli::definition::handle_definition_command(action, json).await,

        // Ephemeral run never touches the data directory.
        Commands::Run(args) => cli::run::handle_run(args, json, quiet).await,

        Commands::Job { action } => {
            let state = AppState::init().await?;
            cli::job::handle_job_command(action, &state, json, quiet).await
        }

        Commands::Resource { action } => {
            let state = AppState::init().await?;
            cli::resource::handle_resource_command(action, &state, json).await
        }
    }
}
