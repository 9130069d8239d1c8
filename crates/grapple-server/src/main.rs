mod config;

use anyhow::{Context, Result, bail};
use clap::Parser;
use config::ServerConfig;
use grapple_client::{ExecutionOptions, RuntimeChannel, ScriptExecutionClient, StdoutSink};
use grapple_proto::{ScriptSpec, ScriptState};
use grapple_transport::{RuntimeConfig, TlsIdentity, TransportRuntime};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;

#[derive(Parser, Debug)]
#[command(author, version, about = "grapple control plane: run a script on an agent")]
struct Args {
    /// Path to the server's TOML configuration.
    #[arg(long, default_value = "/etc/grapple/server.toml")]
    config: PathBuf,
    /// Name of the agent (from config) to run against.
    #[arg(long)]
    agent: String,
    /// Overall retry budget in seconds for transient connectivity failures.
    #[arg(long, default_value = "120")]
    retry_budget_secs: u64,
    /// Command to execute on the agent, followed by its arguments.
    #[arg(required = true, trailing_var_arg = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "grapple_server=info,grapple_transport=info".into()),
        )
        .init();

    let args = Args::parse();
    let config = ServerConfig::load(&args.config)?;
    let entry = config.agent(&args.agent)?;
    let thumbprint = entry.thumbprint()?;

    let identity = TlsIdentity::load_or_create(&config.state_dir, "grapple-server")
        .context("load server identity")?;
    tracing::info!(thumbprint = %identity.thumbprint(), "server identity ready");

    let runtime = TransportRuntime::new(identity, RuntimeConfig::default());
    match entry.endpoint()? {
        Some(endpoint) => runtime.start_listening(endpoint),
        None => {
            let Some(bind) = &config.poll_bind else {
                bail!("agent {:?} polls in but no poll_bind is configured", args.agent);
            };
            let listener = TcpListener::bind(bind)
                .await
                .with_context(|| format!("bind {bind}"))?;
            tokio::spawn(runtime.clone().serve_polling(listener));
        }
    }

    let mut options = ExecutionOptions::default();
    options.retry_budget = std::time::Duration::from_secs(args.retry_budget_secs);
    let channel = RuntimeChannel::new(runtime.clone(), thumbprint);
    let client = ScriptExecutionClient::new(Arc::new(channel), options, Arc::new(StdoutSink));

    let mut command = args.command.into_iter();
    let program = command.next().context("empty command")?;
    let script = ScriptSpec::command(program, command.collect());

    // Ctrl-c cancels the run server-side; the client then asks the agent to
    // stop the script and waits out the grace period.
    let cancel = tokio_util::sync::CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("cancellation requested");
            signal_token.cancel();
        }
    });

    let result = client.execute(script, cancel).await;
    runtime.shutdown();

    let result = result.map_err(|e| anyhow::anyhow!("script execution failed: {e}"))?;
    tracing::info!(run = %result.run_id, state = ?result.state, code = ?result.exit_code, "script finished");
    match result.state {
        ScriptState::Complete => std::process::exit(result.exit_code.unwrap_or(0)),
        _ => std::process::exit(1),
    }
}
