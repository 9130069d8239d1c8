//! Script executors. The transport does not care what a script *is*; the
//! default executor spawns the command as a child process and streams its
//! output into the run's log buffer.

use crate::registry::{RunLog, RunOutcome};
use async_trait::async_trait;
use grapple_proto::ScriptSpec;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

#[async_trait]
pub trait ScriptExecutor: Send + Sync {
    async fn run(&self, script: ScriptSpec, log: RunLog) -> RunOutcome;
}

/// Runs the script as a child process under `workspace`. A non-empty script
/// body is written to a per-run file and appended as the final argument.
pub struct ProcessExecutor {
    workspace: PathBuf,
}

impl ProcessExecutor {
    pub fn new(workspace: PathBuf) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl ScriptExecutor for ProcessExecutor {
    async fn run(&self, script: ScriptSpec, log: RunLog) -> RunOutcome {
        let mut command = Command::new(&script.command);
        command.args(&script.args);
        if let Some(dir) = &script.working_dir {
            command.current_dir(dir);
        }

        let mut script_file = None;
        if !script.script_body.is_empty() {
            if let Err(e) = tokio::fs::create_dir_all(&self.workspace).await {
                return RunOutcome::Failed(format!(
                    "create workspace {}: {e}",
                    self.workspace.display()
                ));
            }
            let path = self.workspace.join(format!("{}.script", log.run_id()));
            if let Err(e) = tokio::fs::write(&path, &script.script_body).await {
                return RunOutcome::Failed(format!("write script body: {e}"));
            }
            command.arg(&path);
            script_file = Some(path);
        }

        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so cancellation can take out the whole tree
        // rather than just the shell.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                return RunOutcome::Failed(format!("spawn {}: {e}", script.command));
            }
        };
        log.set_running();
        debug!(run = %log.run_id(), command = %script.command, "child process started");

        let stdout = child.stdout.take().map(|out| stream_lines(out, log.clone()));
        let stderr = child.stderr.take().map(|err| stream_lines(err, log.clone()));

        let cancel = log.cancel_token();
        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                kill_run(&mut child, log.run_id());
                let _ = child.wait().await;
                RunOutcome::Cancelled
            }
            status = child.wait() => match status {
                Ok(status) => RunOutcome::Completed(status.code().unwrap_or(-1)),
                Err(e) => RunOutcome::Failed(format!("wait for child: {e}")),
            }
        };

        // Drain output readers before the terminal state is recorded so the
        // final log is complete.
        if let Some(task) = stdout {
            let _ = task.await;
        }
        if let Some(task) = stderr {
            let _ = task.await;
        }
        if let Some(path) = script_file {
            let _ = tokio::fs::remove_file(path).await;
        }
        outcome
    }
}

/// Kill the run's entire process group. A lone `kill` on the shell would
/// orphan its descendants, which keep running and hold the output pipes
/// open past the cancellation.
#[cfg(unix)]
fn kill_run(child: &mut tokio::process::Child, run_id: &str) {
    let Some(pid) = child.id() else {
        return;
    };
    let killed = unsafe { libc::kill(-(pid as i32), libc::SIGKILL) } == 0;
    if !killed {
        warn!(run = %run_id, pid, "failed to kill process group");
        if let Err(e) = child.start_kill() {
            warn!(run = %run_id, err = %e, "failed to kill child");
        }
    }
}

#[cfg(not(unix))]
fn kill_run(child: &mut tokio::process::Child, run_id: &str) {
    if let Err(e) = child.start_kill() {
        warn!(run = %run_id, err = %e, "failed to kill child");
    }
}

fn stream_lines<R>(reader: R, log: RunLog) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            log.append(&line);
            log.append("\n");
        }
    })
}
