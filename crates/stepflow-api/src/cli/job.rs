//! CLI job subcommands.
//!
//! `run`, `cancel`, `override` and `resume` start an engine in this process
//! and stay in the foreground until the affected jobs settle, since Task
//! attempts run as children of this process. Ctrl+C while waiting requests
//! cancellation and keeps waiting for it to land.

use anyhow::{Context, Result};
use clap::{Subcommand, ValueEnum};
use comfy_table::{presets, Cell, Color, ContentArrangement, Table};
use console::style;
use tokio::sync::broadcast;
use uuid::Uuid;

use stepflow_core::interpreter::EngineError;
use stepflow_core::repository::WorkflowStore;
use stepflow_types::event::JobEvent;
use stepflow_types::job::{Attempt, Job, JobQuery, JobStatus, StateOverride};

use super::parse_input;
use crate::state::{AppState, ProcessEngine};

#[derive(Subcommand)]
pub enum JobCommand {
    /// Start a job and run it to completion.
    #[command(disable_version_flag = true)]
    Run {
        /// Definition name.
        name: String,

        /// Definition version (latest when omitted).
        #[arg(long)]
        version: Option<u32>,

        /// Job input as a JSON document.
        #[arg(long)]
        input: Option<String>,

        /// Namespace for resolving state resources.
        #[arg(long)]
        namespace: Option<String>,
    },

    /// Show a job with its attempts.
    Show {
        id: Uuid,
    },

    /// List jobs of a definition, newest first.
    #[command(alias = "ls")]
    List {
        /// Definition name.
        name: String,

        #[arg(long, value_enum)]
        status: Option<StatusArg>,

        #[arg(long, default_value = "10")]
        limit: u32,

        #[arg(long)]
        oldest_first: bool,
    },

    /// List jobs that have not reached a terminal status.
    Active,

    /// Cancel a job and wait until it is cancelled.
    Cancel {
        id: Uuid,
    },

    /// Resolve a Choice or Wait state manually, then keep running the job.
    Override {
        id: Uuid,

        /// Choice or Wait state to resolve.
        state: String,

        /// State to continue with (Choice default / Wait next when omitted).
        #[arg(long)]
        next: Option<String>,

        /// Remove the override instead of setting it.
        #[arg(long, conflicts_with = "next")]
        clear: bool,
    },

    /// Re-enter every active job (after a crash) and run them to completion.
    Resume,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum StatusArg {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl From<StatusArg> for JobStatus {
    fn from(status: StatusArg) -> Self {
        match status {
            StatusArg::Queued => JobStatus::Queued,
            StatusArg::Running => JobStatus::Running,
            StatusArg::Succeeded => JobStatus::Succeeded,
            StatusArg::Failed => JobStatus::Failed,
            StatusArg::Cancelled => JobStatus::Cancelled,
        }
    }
}

/// Handle a job subcommand.
pub async fn handle_job_command(cmd: JobCommand, state: &AppState, json: bool, quiet: bool) -> Result<()> {
    match cmd {
        JobCommand::Run {
            name,
            version,
            input,
            namespace,
        } => {
            let input = parse_input(input.as_deref())?;
            let engine = state.start_engine();
            let job = submit_and_wait(&engine, &name, version, input, namespace.as_deref(), json || quiet).await;
            engine.shutdown().await;
            print_job(&job?, json)
        }
        JobCommand::Show { id } => {
            let job = state.store.get_job(id).await.map_err(|e| job_not_found(e.into(), id))?;
            print_job(&job, json)
        }
        JobCommand::List {
            name,
            status,
            limit,
            oldest_first,
        } => {
            let query = JobQuery {
                definition_name: name,
                status: status.map(Into::into),
                limit,
                oldest_first,
            };
            let jobs = state.store.query_jobs(&query).await?;
            print_jobs(&jobs, json)
        }
        JobCommand::Active => {
            let jobs = state.store.list_active_jobs().await?;
            print_jobs(&jobs, json)
        }
        JobCommand::Cancel { id } => {
            let engine = state.start_engine();
            let result = async {
                engine.cancel(id).await?;
                engine.wait_for_terminal(id).await
            }
            .await;
            engine.shutdown().await;
            print_job(&result.map_err(|e| job_not_found(e, id))?, json)
        }
        JobCommand::Override {
            id,
            state: state_name,
            next,
            clear,
        } => {
            let manual = StateOverride {
                is_set: !clear,
                next,
            };
            let engine = state.start_engine();
            let follower = follow_events(&engine, json || quiet);
            let result = async {
                engine.set_override(id, &state_name, manual).await?;
                wait_or_cancel(&engine, id).await
            }
            .await;
            follower.abort();
            engine.shutdown().await;
            print_job(&result.map_err(|e| job_not_found(e, id))?, json)
        }
        JobCommand::Resume => {
            let engine = state.start_engine();
            let follower = follow_events(&engine, json || quiet);
            let result = resume_all(&engine).await;
            follower.abort();
            engine.shutdown().await;
            print_jobs(&result?, json)
        }
    }
}

fn job_not_found(err: EngineError, id: Uuid) -> anyhow::Error {
    match err {
        EngineError::JobNotFound(_) | EngineError::Repository(stepflow_types::error::RepositoryError::NotFound) => {
            anyhow::anyhow!("Job {id} not found")
        }
        other => other.into(),
    }
}

// ---------------------------------------------------------------------------
// Running
// ---------------------------------------------------------------------------

/// Submit a job, print its progress unless `silent`, and wait for it to end.
pub async fn submit_and_wait<S: WorkflowStore + 'static>(
    engine: &ProcessEngine<S>,
    name: &str,
    version: Option<u32>,
    input: serde_json::Value,
    namespace: Option<&str>,
    silent: bool,
) -> Result<Job> {
    let follower = follow_events(engine, silent);
    let result = async {
        let job = engine.submit(name, version, input, namespace).await?;
        if !silent {
            println!(
                "  {} Job {} ({})",
                style("*").green().bold(),
                style(job.id).cyan(),
                job.definition
            );
        }
        wait_or_cancel(engine, job.id).await
    }
    .await;
    follower.abort();
    result.context("Job did not complete")
}

/// Wait for `job_id` to settle. The first Ctrl+C requests cancellation.
async fn wait_or_cancel<S: WorkflowStore + 'static>(
    engine: &ProcessEngine<S>,
    job_id: Uuid,
) -> Result<Job, EngineError> {
    tokio::select! {
        done = engine.wait_for_terminal(job_id) => return done,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("  {} Interrupted, cancelling job {job_id}...", style("!").yellow().bold());
        }
    }
    engine.cancel(job_id).await?;
    engine.wait_for_terminal(job_id).await
}

async fn resume_all<S: WorkflowStore + 'static>(engine: &ProcessEngine<S>) -> Result<Vec<Job>> {
    let active = engine.store().list_active_jobs().await?;
    let resumed = engine.recover().await?;
    tracing::info!(resumed, "waiting for resumed jobs");

    let mut finished = Vec::with_capacity(active.len());
    for job in active {
        finished.push(wait_or_cancel(engine, job.id).await?);
    }
    Ok(finished)
}

/// Print attempt and status events as they happen. Abort the returned task
/// when done.
fn follow_events<S: WorkflowStore + 'static>(
    engine: &ProcessEngine<S>,
    silent: bool,
) -> tokio::task::JoinHandle<()> {
    let mut events = engine.subscribe();
    tokio::spawn(async move {
        if silent {
            return;
        }
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(line) = describe_event(&event) {
                        println!("{line}");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn describe_event(event: &JobEvent) -> Option<String> {
    match event {
        JobEvent::AttemptDispatched { state, attempt_id, .. } => Some(format!(
            "    {} {} {}",
            style("→").dim(),
            style(state).cyan(),
            style(attempt_id).dim()
        )),
        JobEvent::AttemptFinished { succeeded, attempt_id, .. } => {
            let mark = if *succeeded {
                style("✓").green()
            } else {
                style("✗").red()
            };
            Some(format!("    {mark} attempt {}", style(attempt_id).dim()))
        }
        JobEvent::StatusChanged { job_id, status, reason } => Some(format!(
            "  {} {job_id} {}{}",
            style("•").bold(),
            styled_status(Some(*status)),
            reason.as_deref().map(|r| format!(" ({r})")).unwrap_or_default()
        )),
        JobEvent::WorkflowStatusChanged { .. } => None,
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

fn styled_status(status: Option<JobStatus>) -> String {
    match status {
        Some(JobStatus::Succeeded) => style("succeeded").green().to_string(),
        Some(JobStatus::Failed) => style("failed").red().to_string(),
        Some(JobStatus::Cancelled) => style("cancelled").yellow().to_string(),
        Some(other) => other.to_string(),
        None => "-".to_string(),
    }
}

fn attempt_outcome(attempt: &Attempt) -> String {
    match attempt.outcome() {
        None => "open".to_string(),
        Some(outcome) if outcome.succeeded() => "ok".to_string(),
        Some(outcome) => {
            let mut parts = Vec::new();
            if let Some(error) = &outcome.error {
                parts.push(error.clone());
            }
            if let Some(code) = outcome.exit_code {
                parts.push(format!("exit {code}"));
            }
            if let Some(reason) = &outcome.reason {
                parts.push(reason.clone());
            }
            parts.join(": ")
        }
    }
}

pub fn print_job(job: &Job, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(job)?);
        return Ok(());
    }

    println!();
    println!("  Job {}", style(job.id).cyan().bold());
    println!("  Definition: {}", job.definition);
    println!("  Namespace: {}", job.namespace);
    println!("  Status: {}", styled_status(job.status()));
    if let Some(reason) = &job.status_reason {
        println!("  Reason: {reason}");
    }
    if job.cancel_requested && !job.is_terminal() {
        println!("  {}", style("Cancellation requested").yellow());
    }
    if let Some(output) = &job.output {
        println!("  Output: {}", serde_json::to_string(output)?);
    }

    if !job.attempts().is_empty() {
        let mut table = Table::new();
        table
            .load_preset(presets::UTF8_FULL_CONDENSED)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                Cell::new("State").fg(Color::Cyan),
                Cell::new("Branch"),
                Cell::new("Worker"),
                Cell::new("Created"),
                Cell::new("Outcome"),
            ]);
        for attempt in job.attempts() {
            let branch = attempt
                .branch_path
                .iter()
                .map(|i| i.to_string())
                .collect::<Vec<_>>()
                .join(".");
            table.add_row(vec![
                Cell::new(&attempt.state_name),
                Cell::new(branch),
                Cell::new(attempt.worker_id.as_deref().unwrap_or("-")),
                Cell::new(attempt.created_at.format("%H:%M:%S")),
                Cell::new(attempt_outcome(attempt)),
            ]);
        }
        println!();
        println!("{table}");
    }
    println!();
    Ok(())
}

fn print_jobs(jobs: &[Job], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(jobs)?);
        return Ok(());
    }

    if jobs.is_empty() {
        println!();
        println!("  No jobs.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Job").fg(Color::Cyan),
            Cell::new("Definition"),
            Cell::new("Status"),
            Cell::new("Attempts"),
            Cell::new("Created"),
        ]);
    for job in jobs {
        table.add_row(vec![
            Cell::new(job.id),
            Cell::new(&job.definition),
            Cell::new(job.status().map(|s| s.as_str()).unwrap_or("-")),
            Cell::new(job.attempts().len()),
            Cell::new(job.created_at.format("%Y-%m-%d %H:%M:%S")),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}
