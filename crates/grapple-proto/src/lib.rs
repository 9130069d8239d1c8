use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Correlation id for one request/response pair. Unique within a queue.
pub type RequestId = String;

/// Identifier of one remote script run, assigned by the agent.
pub type RunId = String;

pub fn new_request_id() -> RequestId {
    uuid::Uuid::new_v4().to_string()
}

pub fn new_run_id() -> RunId {
    uuid::Uuid::new_v4().to_string()
}

/// What to execute on the agent. The command is spawned as a process; an
/// optional script body is written to the agent's workspace and appended as
/// the final argument.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ScriptSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default, with = "base64_bytes", skip_serializing_if = "Vec::is_empty")]
    pub script_body: Vec<u8>,
}

impl ScriptSpec {
    pub fn command(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            working_dir: None,
            script_body: Vec::new(),
        }
    }
}

/// A request in flight, sent as one JSON line over a secure channel.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RequestEnvelope {
    pub id: RequestId,
    pub body: RequestBody,
}

impl RequestEnvelope {
    pub fn new(body: RequestBody) -> Self {
        Self {
            id: new_request_id(),
            body,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RequestBody {
    StartScript {
        script: ScriptSpec,
    },
    /// Poll for status and log content strictly beyond `after_cursor`.
    ScriptStatus {
        run_id: RunId,
        after_cursor: u64,
    },
    CancelScript {
        run_id: RunId,
    },
    /// The caller has observed a terminal state; the agent may drop the run.
    CompleteScript {
        run_id: RunId,
    },
}

/// A response, referencing the originating correlation id.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ResponseEnvelope {
    pub in_reply_to: RequestId,
    pub body: ResponseBody,
}

impl ResponseEnvelope {
    pub fn reply_to(request: &RequestEnvelope, body: ResponseBody) -> Self {
        Self {
            in_reply_to: request.id.clone(),
            body,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ResponseBody {
    ScriptStarted { run_id: RunId },
    Status(StatusUpdate),
    Acknowledged,
    Error { kind: RemoteErrorKind, message: String },
}

/// One poll response: state tag plus the log slice after the requested cursor.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StatusUpdate {
    pub run_id: RunId,
    pub state: ScriptState,
    /// Byte offset into the run's full log after `log_chunk` is applied.
    pub next_cursor: u64,
    #[serde(default)]
    pub log_chunk: String,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScriptState {
    Submitted,
    Running,
    Complete,
    Cancelled,
    Failed,
}

impl ScriptState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ScriptState::Complete | ScriptState::Cancelled | ScriptState::Failed
        )
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrorKind {
    UnknownRun,
    Internal,
}

mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_script_roundtrip() {
        let req = RequestEnvelope::new(RequestBody::StartScript {
            script: ScriptSpec {
                command: "/bin/sh".to_string(),
                args: vec!["-e".to_string()],
                working_dir: Some(PathBuf::from("/tmp")),
                script_body: b"echo hello".to_vec(),
            },
        });
        let json = serde_json::to_string(&req).unwrap();
        let back: RequestEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, req.id);
        match back.body {
            RequestBody::StartScript { script } => {
                assert_eq!(script.command, "/bin/sh");
                assert_eq!(script.script_body, b"echo hello");
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn status_response_roundtrip() {
        let resp = ResponseEnvelope {
            in_reply_to: "abc".to_string(),
            body: ResponseBody::Status(StatusUpdate {
                run_id: "run-1".to_string(),
                state: ScriptState::Running,
                next_cursor: 5,
                log_chunk: "ABCDE".to_string(),
                exit_code: None,
            }),
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"result\":\"status\""));
        let back: ResponseEnvelope = serde_json::from_str(&json).unwrap();
        match back.body {
            ResponseBody::Status(update) => {
                assert_eq!(update.state, ScriptState::Running);
                assert_eq!(update.next_cursor, 5);
                assert_eq!(update.log_chunk, "ABCDE");
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn terminal_states() {
        assert!(!ScriptState::Submitted.is_terminal());
        assert!(!ScriptState::Running.is_terminal());
        assert!(ScriptState::Complete.is_terminal());
        assert!(ScriptState::Cancelled.is_terminal());
        assert!(ScriptState::Failed.is_terminal());
    }

    #[test]
    fn missing_optional_fields_default() {
        let json = r#"{"in_reply_to":"x","body":{"result":"status","run_id":"r","state":"complete","next_cursor":0}}"#;
        let back: ResponseEnvelope = serde_json::from_str(json).unwrap();
        match back.body {
            ResponseBody::Status(update) => {
                assert_eq!(update.log_chunk, "");
                assert_eq!(update.exit_code, None);
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }
}
