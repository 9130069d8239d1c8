//! Destinations for incremental script log output.

use std::io::Write;
use tokio::sync::mpsc;

/// Accepts ordered text chunks per run id as they arrive from status polls.
pub trait LogSink: Send + Sync {
    fn append(&self, run_id: &str, chunk: &str);
}

/// Discards everything.
pub struct NullSink;

impl LogSink for NullSink {
    fn append(&self, _run_id: &str, _chunk: &str) {}
}

/// Writes chunks straight to stdout, as the server binary does.
pub struct StdoutSink;

impl LogSink for StdoutSink {
    fn append(&self, _run_id: &str, chunk: &str) {
        let mut out = std::io::stdout().lock();
        let _ = out.write_all(chunk.as_bytes());
        let _ = out.flush();
    }
}

/// One forwarded log fragment.
#[derive(Debug, Clone)]
pub struct LogChunk {
    pub run_id: String,
    pub text: String,
}

/// Forwards chunks over an unbounded channel to whoever wants to observe
/// the run live.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<LogChunk>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LogChunk>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl LogSink for ChannelSink {
    fn append(&self, run_id: &str, chunk: &str) {
        let _ = self.tx.send(LogChunk {
            run_id: run_id.to_string(),
            text: chunk.to_string(),
        });
    }
}
