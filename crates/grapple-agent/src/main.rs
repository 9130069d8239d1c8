use anyhow::{Context, Result};
use clap::Parser;
use grapple_agent::config::{AgentConfig, TopologyMode};
use grapple_agent::executor::ProcessExecutor;
use grapple_agent::handler::AgentService;
use grapple_agent::service::{self, PollingOptions};
use grapple_transport::{ProxyEndpoint, ServiceEndpoint, Thumbprint, TlsIdentity};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(author, version, about = "grapple deployment agent")]
struct Args {
    /// Path to the agent's TOML configuration.
    #[arg(long, default_value = "/etc/grapple/agent.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "grapple_agent=info,grapple_transport=info".into()),
        )
        .init();

    let args = Args::parse();
    let config = AgentConfig::load(&args.config)?;

    let identity = TlsIdentity::load_or_create(&config.state_dir, "grapple-agent")
        .context("load agent identity")?;
    tracing::info!(
        thumbprint = %identity.thumbprint(),
        mode = ?config.mode,
        "agent identity ready"
    );

    let trusted = Thumbprint::parse(&config.trusted_thumbprint)
        .context("invalid trusted_thumbprint in config")?;
    let executor = Arc::new(ProcessExecutor::new(config.workspace_dir()));
    let service = AgentService::new(executor);

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown requested");
            signal_token.cancel();
        }
    });

    match config.mode {
        TopologyMode::Polling => {
            let mut endpoint = ServiceEndpoint::new(config.address.clone(), trusted)
                .context("invalid control-plane address")?;
            if let Some(proxy) = &config.proxy {
                endpoint = endpoint.with_proxy(ProxyEndpoint {
                    address: proxy.clone(),
                });
            }
            let options = PollingOptions {
                poll_interval: config.poll_interval(),
                connect_timeout: config.connect_timeout(),
            };
            service::run_polling(endpoint, identity, service, options, shutdown).await
        }
        TopologyMode::Listening => {
            service::run_listening(&config.address, identity, trusted, service, shutdown).await
        }
    }
}
