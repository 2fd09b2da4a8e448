//! Local process worker.
//!
//! Each Task attempt runs its resolved target as `sh -c <target>`. The
//! attempt input is written to stdin as JSON; stdout becomes the output
//! (parsed as JSON when it parses, otherwise kept as a string). A non-zero
//! exit is reported with the exit code and trimmed stderr as the reason.
//!
//! An attempt is tracked only while its child runs. Once it finishes or is
//! killed its id is forgotten, and a status check reports it as unknown.

use std::process::Stdio;
use std::sync::Arc;

use dashmap::DashMap;
use stepflow_core::interpreter::dispatcher::{
    AttemptHandle, AttemptStatus, Completion, CompletionSender, DispatchError, DispatchRequest, WorkerDispatcher,
};
use stepflow_core::interpreter::retry::ERROR_TASK_FAILED;
use stepflow_types::job::AttemptOutcome;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdout};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Longest stderr excerpt carried into a failure reason.
const MAX_REASON_LEN: usize = 2_000;

struct RunningAttempt {
    worker_id: String,
    token: CancellationToken,
}

/// `WorkerDispatcher` that runs attempts as child processes of this one.
pub struct ProcessDispatcher {
    completions: CompletionSender,
    shell: String,
    /// Attempts whose child is still running, keyed by attempt id.
    attempts: Arc<DashMap<Uuid, RunningAttempt>>,
}

impl ProcessDispatcher {
    pub fn new(completions: CompletionSender) -> Self {
        Self::with_shell(completions, "sh")
    }

    /// Use `shell` (invoked as `<shell> -c <target>`) instead of `sh`.
    pub fn with_shell(completions: CompletionSender, shell: impl Into<String>) -> Self {
        Self {
            completions,
            shell: shell.into(),
            attempts: Arc::new(DashMap::new()),
        }
    }

    fn spawn_child(&self, request: &DispatchRequest) -> Result<Child, DispatchError> {
        tokio::process::Command::new(&self.shell)
            .arg("-c")
            .arg(&request.target)
            .env("STEPFLOW_JOB_ID", request.job_id.to_string())
            .env("STEPFLOW_ATTEMPT_ID", request.attempt_id.to_string())
            .env("STEPFLOW_STATE", &request.state)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DispatchError::Unavailable(format!("failed to spawn '{}': {e}", request.target)))
    }
}

impl WorkerDispatcher for ProcessDispatcher {
    async fn submit(&self, request: DispatchRequest) -> Result<AttemptHandle, DispatchError> {
        if request.target.trim().is_empty() {
            return Err(DispatchError::Rejected(format!(
                "state '{}' resolved to an empty command",
                request.state
            )));
        }
        let payload = serde_json::to_vec(&request.input)
            .map_err(|e| DispatchError::Rejected(format!("input is not serializable: {e}")))?;

        let (mut child, token, worker_id) = match self.attempts.entry(request.attempt_id) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                tracing::debug!(attempt_id = %request.attempt_id, "attempt already submitted");
                return Ok(AttemptHandle {
                    attempt_id: request.attempt_id,
                    worker_id: existing.get().worker_id.clone(),
                });
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let child = self.spawn_child(&request)?;
                let worker_id = match child.id() {
                    Some(pid) => format!("pid-{pid}"),
                    None => format!("process-{}", request.attempt_id),
                };
                let token = CancellationToken::new();
                slot.insert(RunningAttempt {
                    worker_id: worker_id.clone(),
                    token: token.clone(),
                });
                (child, token, worker_id)
            }
        };

        tracing::info!(
            job_id = %request.job_id,
            attempt_id = %request.attempt_id,
            state = %request.state,
            %worker_id,
            "attempt process started"
        );

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let completions = self.completions.clone();
        let attempts = Arc::clone(&self.attempts);
        let DispatchRequest {
            job_id, attempt_id, ..
        } = request;

        tokio::spawn(async move {
            let write_input = async move {
                if let Some(mut stdin) = stdin {
                    if let Err(e) = stdin.write_all(&payload).await {
                        tracing::debug!(%attempt_id, error = %e, "worker closed stdin early");
                    }
                    // Dropping stdin closes the pipe and signals EOF.
                }
            };
            let run = async {
                let ((), outcome) = tokio::join!(write_input, collect_outcome(&mut child, stdout, stderr));
                outcome
            };

            let finished = tokio::select! {
                _ = token.cancelled() => None,
                outcome = run => Some(outcome),
            };

            let Some(outcome) = finished else {
                if let Err(e) = child.kill().await {
                    tracing::warn!(%attempt_id, error = %e, "failed to kill cancelled attempt");
                }
                tracing::info!(%job_id, %attempt_id, "attempt process killed");
                attempts.remove(&attempt_id);
                return;
            };

            tracing::info!(
                %job_id,
                %attempt_id,
                succeeded = outcome.succeeded(),
                exit_code = ?outcome.exit_code,
                "attempt process finished"
            );
            if completions.send(Completion::new(job_id, attempt_id, outcome)).is_err() {
                tracing::debug!(%attempt_id, "completion dropped: engine stopped");
            }
            attempts.remove(&attempt_id);
        });

        Ok(AttemptHandle {
            attempt_id,
            worker_id,
        })
    }

    /// Attempts this dispatcher never started have no live child here (their
    /// process died with the one that spawned it), so they cancel trivially.
    async fn cancel(&self, handle: &AttemptHandle) -> Result<(), DispatchError> {
        match self.attempts.get(&handle.attempt_id) {
            // Cancelling a finished attempt is a no-op.
            Some(attempt) => attempt.token.cancel(),
            None => tracing::debug!(
                attempt_id = %handle.attempt_id,
                worker_id = %handle.worker_id,
                "cancel for attempt not started by this process"
            ),
        }
        Ok(())
    }

    async fn status(&self, handle: &AttemptHandle) -> Result<AttemptStatus, DispatchError> {
        Ok(match self.attempts.get(&handle.attempt_id) {
            Some(_) => AttemptStatus::Running,
            None => AttemptStatus::Unknown,
        })
    }
}

async fn collect_outcome(
    child: &mut Child,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
) -> AttemptOutcome {
    let (status, stdout, stderr) = tokio::join!(child.wait(), drain(stdout, "stdout"), drain(stderr, "stderr"));
    let status = match status {
        Ok(status) => status,
        Err(e) => return AttemptOutcome::failure(ERROR_TASK_FAILED, format!("failed to wait for worker: {e}")),
    };

    if status.success() {
        return AttemptOutcome::success(parse_output(&stdout));
    }

    let stderr = String::from_utf8_lossy(&stderr);
    let reason = excerpt(stderr.trim());
    match status.code() {
        Some(code) => AttemptOutcome {
            exit_code: Some(code),
            reason,
            ..AttemptOutcome::default()
        },
        None => AttemptOutcome::failure(
            ERROR_TASK_FAILED,
            reason.unwrap_or_else(|| "worker terminated by signal".to_string()),
        ),
    }
}

/// Read a pipe to EOF. A read error keeps whatever arrived before it.
async fn drain<R: AsyncRead + Unpin>(pipe: Option<R>, stream: &'static str) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        if let Err(e) = pipe.read_to_end(&mut buf).await {
            tracing::warn!(stream, error = %e, read = buf.len(), "failed to read worker output");
        }
    }
    buf
}

/// JSON when stdout parses as JSON, the trimmed text otherwise, and nothing
/// for empty output.
fn parse_output(stdout: &[u8]) -> Option<serde_json::Value> {
    let text = String::from_utf8_lossy(stdout);
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    Some(serde_json::from_str(text).unwrap_or_else(|_| serde_json::Value::String(text.to_string())))
}

fn excerpt(text: &str) -> Option<String> {
    if text.is_empty() {
        return None;
    }
    let mut end = text.len().min(MAX_REASON_LEN);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    Some(text[..end].to_string())
}
