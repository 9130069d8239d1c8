//! In-memory registry of script runs, each with a cursored log buffer.

use dashmap::DashMap;
use grapple_proto::{RunId, ScriptState, StatusUpdate, new_run_id};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

struct RunRecord {
    state: ScriptState,
    log: String,
    exit_code: Option<i32>,
}

struct RunSlot {
    record: Mutex<RunRecord>,
    cancel: CancellationToken,
}

/// How a run ended, as reported by its executor.
#[derive(Debug)]
pub enum RunOutcome {
    /// The process ran to completion with this exit code (zero or not).
    Completed(i32),
    /// The run's cancellation token fired and the process was stopped.
    Cancelled,
    /// The script could not be run at all (spawn failure, I/O error).
    Failed(String),
}

/// Writer handle owned by the executor task for one run.
#[derive(Clone)]
pub struct RunLog {
    run_id: RunId,
    slot: Arc<RunSlot>,
}

impl RunLog {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.slot.cancel.clone()
    }

    pub fn append(&self, text: &str) {
        let mut record = self.slot.record.lock().expect("run lock");
        record.log.push_str(text);
    }

    pub fn set_running(&self) {
        let mut record = self.slot.record.lock().expect("run lock");
        if record.state == ScriptState::Submitted {
            record.state = ScriptState::Running;
        }
    }

    /// Record the terminal state exactly once; later calls are ignored.
    pub fn finish(&self, outcome: RunOutcome) {
        let mut record = self.slot.record.lock().expect("run lock");
        if record.state.is_terminal() {
            return;
        }
        match outcome {
            RunOutcome::Completed(code) => {
                record.state = ScriptState::Complete;
                record.exit_code = Some(code);
            }
            RunOutcome::Cancelled => {
                record.state = ScriptState::Cancelled;
            }
            RunOutcome::Failed(message) => {
                record.log.push_str(&message);
                record.log.push('\n');
                record.state = ScriptState::Failed;
            }
        }
    }
}

/// All runs the agent currently tracks, keyed by run id.
#[derive(Default)]
pub struct ScriptRunRegistry {
    runs: DashMap<RunId, Arc<RunSlot>>,
}

impl ScriptRunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self) -> RunLog {
        let run_id = new_run_id();
        let slot = Arc::new(RunSlot {
            record: Mutex::new(RunRecord {
                state: ScriptState::Submitted,
                log: String::new(),
                exit_code: None,
            }),
            cancel: CancellationToken::new(),
        });
        self.runs.insert(run_id.clone(), slot.clone());
        RunLog { run_id, slot }
    }

    /// Status snapshot with the log slice strictly beyond `after_cursor`.
    /// The cursor is a byte offset into the full log; out-of-range or stale
    /// cursors yield the safe tail (or nothing) rather than an error.
    pub fn status(&self, run_id: &str, after_cursor: u64) -> Option<StatusUpdate> {
        let slot = self.runs.get(run_id)?.clone();
        let record = slot.record.lock().expect("run lock");
        let total = record.log.len() as u64;
        let mut from = after_cursor.min(total) as usize;
        // Cursors always come from previous snapshots, but never split a
        // UTF-8 sequence even on a bogus one.
        while from > 0 && !record.log.is_char_boundary(from) {
            from -= 1;
        }
        Some(StatusUpdate {
            run_id: run_id.to_string(),
            state: record.state,
            next_cursor: total,
            log_chunk: record.log[from..].to_string(),
            exit_code: record.exit_code,
        })
    }

    /// Trigger the run's cancellation token and report current status. The
    /// state flips to `Cancelled` once the executor stops the process.
    pub fn cancel(&self, run_id: &str) -> Option<StatusUpdate> {
        let slot = self.runs.get(run_id)?.clone();
        slot.cancel.cancel();
        let cursor = {
            let record = slot.record.lock().expect("run lock");
            record.log.len() as u64
        };
        self.status(run_id, cursor)
    }

    /// Drop a run whose terminal state the caller has observed.
    pub fn complete(&self, run_id: &str) -> bool {
        self.runs.remove(run_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}
