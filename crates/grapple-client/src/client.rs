//! The orchestration state machine that turns transport primitives into a
//! reliable remote-execution protocol: submit with bounded retry, poll with
//! backoff, collect logs incrementally, cancel cooperatively.

use crate::channel::RequestChannel;
use crate::sink::LogSink;
use grapple_proto::{RequestBody, ResponseBody, RunId, ScriptSpec, ScriptState, StatusUpdate};
use grapple_transport::{CappedExponentialBackoff, PollBackoff, TransportError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Terminal failure classifications surfaced to the caller. The remote
/// script's own failure is not here: that arrives as a [`ScriptResult`]
/// with a `Failed` state and whatever exit code the agent reported.
#[derive(Error, Debug)]
pub enum ExecutionError {
    /// The agent's identity did not match the pinned thumbprint. Never
    /// transient, so never retried.
    #[error("agent authentication failed: {0}")]
    Authentication(String),

    /// The agent stayed unreachable for longer than the retry budget.
    #[error("agent unreachable beyond the retry budget ({0:?} without contact)")]
    Connectivity(Duration),

    /// Cancelled by the caller before a terminal state was observed.
    #[error("execution cancelled by caller")]
    Cancelled,

    /// The agent answered outside the wire contract.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

/// Retry and polling policy. All ceilings are wall-clock durations, not
/// attempt counts, so behavior stays correct under variable per-attempt
/// latency.
#[derive(Clone)]
pub struct ExecutionOptions {
    /// Overall ceiling on time spent unreachable, both while submitting and
    /// while polling. Default 2 minutes.
    pub retry_budget: Duration,
    /// Pause between submit attempts. Default 1s.
    pub retry_pause: Duration,
    /// Per-request deadline. Default 10s.
    pub attempt_timeout: Duration,
    /// How long to wait for the agent to acknowledge a cancellation before
    /// giving up on it. Default 30s.
    pub cancel_grace: Duration,
    /// Delay curve between status polls.
    pub backoff: Arc<dyn PollBackoff>,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            retry_budget: Duration::from_secs(120),
            retry_pause: Duration::from_secs(1),
            attempt_timeout: Duration::from_secs(10),
            cancel_grace: Duration::from_secs(30),
            backoff: Arc::new(CappedExponentialBackoff::standard()),
        }
    }
}

/// Final outcome of one remote script run.
#[derive(Debug, Clone)]
pub struct ScriptResult {
    pub run_id: RunId,
    pub state: ScriptState,
    pub exit_code: Option<i32>,
    /// Full concatenated log, gap-free in cursor order.
    pub log: String,
}

/// Handle to one in-flight run started with
/// [`ScriptExecutionClient::submit_script`].
pub struct RunHandle {
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<Result<ScriptResult, ExecutionError>>,
}

impl RunHandle {
    /// Signal cooperative cancellation. Best-effort: the agent is told, and
    /// the run settles as `Cancelled` once acknowledged or after the grace
    /// period.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn await_result(self) -> Result<ScriptResult, ExecutionError> {
        self.task.await.unwrap_or_else(|e| {
            Err(ExecutionError::Protocol(format!(
                "execution task failed: {e}"
            )))
        })
    }
}

pub struct ScriptExecutionClient {
    transport: Arc<dyn RequestChannel>,
    options: ExecutionOptions,
    sink: Arc<dyn LogSink>,
}

impl ScriptExecutionClient {
    pub fn new(
        transport: Arc<dyn RequestChannel>,
        options: ExecutionOptions,
        sink: Arc<dyn LogSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            options,
            sink,
        })
    }

    /// Start a run on its own task and hand back a handle.
    pub fn submit_script(self: &Arc<Self>, script: ScriptSpec) -> RunHandle {
        let cancel = CancellationToken::new();
        let client = self.clone();
        let token = cancel.clone();
        RunHandle {
            cancel,
            task: tokio::spawn(async move { client.execute(script, token).await }),
        }
    }

    /// Drive one script run to a terminal state, inline on this task.
    pub async fn execute(
        &self,
        script: ScriptSpec,
        cancel: CancellationToken,
    ) -> Result<ScriptResult, ExecutionError> {
        let run_id = self.submit(script, &cancel).await?;
        self.poll_to_completion(run_id, &cancel).await
    }

    /// Submit step: retry network failures under the wall-clock budget,
    /// re-checked before every retry. Authentication failures abort on the
    /// first attempt.
    async fn submit(
        &self,
        script: ScriptSpec,
        cancel: &CancellationToken,
    ) -> Result<RunId, ExecutionError> {
        let started = Instant::now();
        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(ExecutionError::Cancelled);
            }
            let deadline = Instant::now() + self.options.attempt_timeout;
            let body = RequestBody::StartScript {
                script: script.clone(),
            };
            match self.transport.request(body, deadline, cancel).await {
                Ok(ResponseBody::ScriptStarted { run_id }) => {
                    info!(run = %run_id, "script submitted");
                    return Ok(run_id);
                }
                Ok(other) => {
                    return Err(ExecutionError::Protocol(format!(
                        "unexpected reply to start request: {other:?}"
                    )));
                }
                Err(TransportError::Authentication(message)) => {
                    return Err(ExecutionError::Authentication(message));
                }
                Err(TransportError::Cancelled) => return Err(ExecutionError::Cancelled),
                Err(TransportError::Protocol(message)) => {
                    return Err(ExecutionError::Protocol(message));
                }
                Err(e) => {
                    attempt += 1;
                    let elapsed = started.elapsed();
                    if elapsed >= self.options.retry_budget {
                        warn!(err = %e, ?elapsed, "submit retry budget exhausted");
                        return Err(ExecutionError::Connectivity(elapsed));
                    }
                    debug!(attempt, err = %e, "submit failed, will retry");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(ExecutionError::Cancelled),
                        _ = tokio::time::sleep(self.options.retry_pause) => {}
                    }
                }
            }
        }
    }

    async fn poll_to_completion(
        &self,
        run_id: RunId,
        cancel: &CancellationToken,
    ) -> Result<ScriptResult, ExecutionError> {
        // Polls issued after cancellation must not themselves be cancelled,
        // or the acknowledgment could never be observed.
        let detached = CancellationToken::new();
        let mut cursor: u64 = 0;
        let mut log = String::new();
        let mut attempt: u32 = 0;
        let mut last_contact = Instant::now();
        let mut cancel_grace: Option<Instant> = None;

        loop {
            let delay = self.options.backoff.delay(attempt);
            if !delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled(), if cancel_grace.is_none() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            if cancel.is_cancelled() && cancel_grace.is_none() {
                cancel_grace = Some(Instant::now() + self.options.cancel_grace);
                info!(run = %run_id, "cancellation requested, notifying agent");
                let deadline = Instant::now() + self.options.attempt_timeout;
                let body = RequestBody::CancelScript {
                    run_id: run_id.clone(),
                };
                // Best effort: an unreachable agent is handled by the grace
                // period below.
                let _ = self.transport.request(body, deadline, &detached).await;
            }
            if let Some(grace) = cancel_grace
                && Instant::now() >= grace
            {
                warn!(run = %run_id, "cancellation unacknowledged within grace period");
                return Err(ExecutionError::Cancelled);
            }

            let poll_cancel = if cancel_grace.is_some() {
                &detached
            } else {
                cancel
            };
            let deadline = Instant::now() + self.options.attempt_timeout;
            let body = RequestBody::ScriptStatus {
                run_id: run_id.clone(),
                after_cursor: cursor,
            };
            attempt += 1;
            match self.transport.request(body, deadline, poll_cancel).await {
                Ok(ResponseBody::Status(update)) => {
                    last_contact = Instant::now();
                    self.apply_chunk(&run_id, &mut log, &mut cursor, &update);
                    if update.state.is_terminal() {
                        self.release_run(&run_id, &detached).await;
                        info!(
                            run = %run_id,
                            state = ?update.state,
                            exit_code = ?update.exit_code,
                            "run reached terminal state"
                        );
                        return Ok(ScriptResult {
                            run_id,
                            state: update.state,
                            exit_code: update.exit_code,
                            log,
                        });
                    }
                }
                Ok(ResponseBody::Error { message, .. }) => {
                    return Err(ExecutionError::Protocol(format!(
                        "agent rejected status poll: {message}"
                    )));
                }
                Ok(other) => {
                    return Err(ExecutionError::Protocol(format!(
                        "unexpected reply to status poll: {other:?}"
                    )));
                }
                Err(TransportError::Authentication(message)) => {
                    return Err(ExecutionError::Authentication(message));
                }
                Err(TransportError::Cancelled) => {
                    // Cancellation is handled at the top of the loop.
                }
                Err(TransportError::Protocol(message)) => {
                    return Err(ExecutionError::Protocol(message));
                }
                Err(e) => {
                    let unreachable_for = last_contact.elapsed();
                    if unreachable_for >= self.options.retry_budget {
                        warn!(run = %run_id, err = %e, ?unreachable_for, "connectivity budget exhausted");
                        return Err(ExecutionError::Connectivity(unreachable_for));
                    }
                    debug!(run = %run_id, err = %e, attempt, "status poll failed, backing off");
                }
            }
        }
    }

    /// Append only log content beyond the last-seen cursor. Idempotent under
    /// duplicate or overlapping delivery.
    fn apply_chunk(&self, run_id: &str, log: &mut String, cursor: &mut u64, update: &StatusUpdate) {
        if update.next_cursor <= *cursor {
            if !update.log_chunk.is_empty() {
                debug!(run = %run_id, cursor = update.next_cursor, "duplicate log chunk ignored");
            }
            return;
        }
        let fresh_bytes = (update.next_cursor - *cursor) as usize;
        let chunk = update.log_chunk.as_str();
        let fresh = if fresh_bytes < chunk.len() {
            // Overlapping redelivery: keep only the tail we have not seen.
            chunk.get(chunk.len() - fresh_bytes..).unwrap_or(chunk)
        } else {
            chunk
        };
        log.push_str(fresh);
        self.sink.append(run_id, fresh);
        *cursor = update.next_cursor;
    }

    /// Tell the agent the terminal state was observed so it can drop the run.
    async fn release_run(&self, run_id: &str, detached: &CancellationToken) {
        let deadline = Instant::now() + self.options.attempt_timeout;
        let body = RequestBody::CompleteScript {
            run_id: run_id.to_string(),
        };
        if let Err(e) = self.transport.request(body, deadline, detached).await {
            debug!(run = %run_id, err = %e, "complete notification failed");
        }
    }
}
