pub mod channel;
pub mod client;
pub mod sink;

pub use channel::{RequestChannel, RuntimeChannel};
pub use client::{ExecutionError, ExecutionOptions, RunHandle, ScriptExecutionClient, ScriptResult};
pub use sink::{ChannelSink, LogChunk, LogSink, NullSink, StdoutSink};
