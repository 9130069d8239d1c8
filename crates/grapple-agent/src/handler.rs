//! Maps request envelopes onto the run registry and executor.

use crate::executor::ScriptExecutor;
use crate::registry::ScriptRunRegistry;
use grapple_proto::{
    RemoteErrorKind, RequestBody, RequestEnvelope, ResponseBody, ResponseEnvelope,
};
use std::sync::Arc;
use tracing::info;

pub struct AgentService {
    registry: ScriptRunRegistry,
    executor: Arc<dyn ScriptExecutor>,
}

impl AgentService {
    pub fn new(executor: Arc<dyn ScriptExecutor>) -> Self {
        Self {
            registry: ScriptRunRegistry::new(),
            executor,
        }
    }

    pub fn registry(&self) -> &ScriptRunRegistry {
        &self.registry
    }

    pub async fn handle(&self, request: RequestEnvelope) -> ResponseEnvelope {
        let body = self.dispatch(&request.body).await;
        ResponseEnvelope::reply_to(&request, body)
    }

    async fn dispatch(&self, body: &RequestBody) -> ResponseBody {
        match body {
            RequestBody::StartScript { script } => {
                let log = self.registry.create();
                let run_id = log.run_id().clone();
                info!(run = %run_id, command = %script.command, "starting script");
                let executor = Arc::clone(&self.executor);
                let script = script.clone();
                tokio::spawn(async move {
                    let outcome = executor.run(script, log.clone()).await;
                    log.finish(outcome);
                });
                ResponseBody::ScriptStarted { run_id }
            }
            RequestBody::ScriptStatus { run_id, after_cursor } => {
                match self.registry.status(run_id, *after_cursor) {
                    Some(status) => ResponseBody::Status(status),
                    None => unknown_run(run_id),
                }
            }
            RequestBody::CancelScript { run_id } => {
                info!(run = %run_id, "cancel requested");
                match self.registry.cancel(run_id) {
                    Some(status) => ResponseBody::Status(status),
                    None => unknown_run(run_id),
                }
            }
            RequestBody::CompleteScript { run_id } => {
                // Idempotent; completing an already-released run is fine.
                if self.registry.complete(run_id) {
                    info!(run = %run_id, "run released");
                }
                ResponseBody::Acknowledged
            }
        }
    }
}

fn unknown_run(run_id: &str) -> ResponseBody {
    ResponseBody::Error {
        kind: RemoteErrorKind::UnknownRun,
        message: format!("no run with id {run_id}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ProcessExecutor;
    use grapple_proto::{ScriptSpec, ScriptState};
    use std::time::Duration;

    fn service() -> AgentService {
        let dir = std::env::temp_dir().join("grapple-handler-tests");
        AgentService::new(Arc::new(ProcessExecutor::new(dir)))
    }

    async fn start(service: &AgentService, script: ScriptSpec) -> String {
        let request = RequestEnvelope::new(RequestBody::StartScript { script });
        let response = service.handle(request).await;
        match response.body {
            ResponseBody::ScriptStarted { run_id } => run_id,
            other => panic!("unexpected response {other:?}"),
        }
    }

    async fn poll_until_terminal(service: &AgentService, run_id: &str) -> grapple_proto::StatusUpdate {
        let mut cursor = 0u64;
        let mut log = String::new();
        for _ in 0..200 {
            let request = RequestEnvelope::new(RequestBody::ScriptStatus {
                run_id: run_id.to_string(),
                after_cursor: cursor,
            });
            let response = service.handle(request).await;
            let mut status = match response.body {
                ResponseBody::Status(status) => status,
                other => panic!("unexpected response {other:?}"),
            };
            cursor = status.next_cursor;
            log.push_str(&status.log_chunk);
            if status.state.is_terminal() {
                status.log_chunk = log;
                return status;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("run {run_id} never reached a terminal state");
    }

    #[tokio::test]
    async fn full_run_lifecycle() {
        let service = service();
        let run_id = start(
            &service,
            ScriptSpec::command("/bin/sh", vec!["-c".to_string(), "echo done".to_string()]),
        )
        .await;

        let status = poll_until_terminal(&service, &run_id).await;
        assert_eq!(status.state, ScriptState::Complete);
        assert_eq!(status.exit_code, Some(0));
        assert!(status.log_chunk.contains("done"));

        let response = service
            .handle(RequestEnvelope::new(RequestBody::CompleteScript {
                run_id: run_id.clone(),
            }))
            .await;
        assert!(matches!(response.body, ResponseBody::Acknowledged));
        assert!(service.registry().is_empty());

        // Released runs are gone.
        let response = service
            .handle(RequestEnvelope::new(RequestBody::ScriptStatus {
                run_id,
                after_cursor: 0,
            }))
            .await;
        assert!(matches!(
            response.body,
            ResponseBody::Error { kind: RemoteErrorKind::UnknownRun, .. }
        ));
    }

    #[tokio::test]
    async fn cancel_stops_a_running_script() {
        let service = service();
        let run_id = start(
            &service,
            ScriptSpec::command("/bin/sh", vec!["-c".to_string(), "sleep 30".to_string()]),
        )
        .await;

        // Let the child spawn before cancelling.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let response = service
            .handle(RequestEnvelope::new(RequestBody::CancelScript {
                run_id: run_id.clone(),
            }))
            .await;
        assert!(matches!(response.body, ResponseBody::Status(_)));

        let status = poll_until_terminal(&service, &run_id).await;
        assert_eq!(status.state, ScriptState::Cancelled);
    }

    #[tokio::test]
    async fn unknown_run_is_reported() {
        let service = service();
        let response = service
            .handle(RequestEnvelope::new(RequestBody::CancelScript {
                run_id: "nope".to_string(),
            }))
            .await;
        assert!(matches!(
            response.body,
            ResponseBody::Error { kind: RemoteErrorKind::UnknownRun, .. }
        ));
    }

    #[tokio::test]
    async fn complete_is_idempotent() {
        let service = service();
        for _ in 0..2 {
            let response = service
                .handle(RequestEnvelope::new(RequestBody::CompleteScript {
                    run_id: "already-gone".to_string(),
                }))
                .await;
            assert!(matches!(response.body, ResponseBody::Acknowledged));
        }
    }
}
