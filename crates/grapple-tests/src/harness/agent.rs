//! In-process deployment agent for integration tests.

use anyhow::Result;
use grapple_agent::{AgentService, ProcessExecutor};
use grapple_agent::service::{self, PollingOptions};
use grapple_transport::{ServiceEndpoint, Thumbprint, TlsIdentity};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub struct TestAgent {
    identity: TlsIdentity,
    workspace: TempDir,
    shutdown: CancellationToken,
}

impl TestAgent {
    pub fn new() -> Result<Self> {
        Ok(Self {
            identity: TlsIdentity::generate("test-agent")?,
            workspace: tempfile::tempdir()?,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn thumbprint(&self) -> Thumbprint {
        self.identity.thumbprint().clone()
    }

    fn service(&self) -> AgentService {
        AgentService::new(Arc::new(ProcessExecutor::new(
            self.workspace.path().to_path_buf(),
        )))
    }

    /// Start polling the given control plane with a short redial interval.
    pub fn start_polling(&self, server: SocketAddr, server_thumbprint: Thumbprint) -> Result<()> {
        let endpoint = ServiceEndpoint::new(server.to_string(), server_thumbprint)?;
        let identity = self.identity.clone();
        let service = self.service();
        let shutdown = self.shutdown.clone();
        let options = PollingOptions {
            poll_interval: Duration::from_millis(100),
            connect_timeout: Duration::from_secs(5),
        };
        tokio::spawn(async move {
            let _ = service::run_polling(endpoint, identity, service, options, shutdown).await;
        });
        Ok(())
    }

    /// Bind a loopback listener and serve connections from `trusted`.
    pub async fn start_listening(&self, trusted: Thumbprint) -> Result<SocketAddr> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        drop(listener);

        let bind = addr.to_string();
        let identity = self.identity.clone();
        let service = self.service();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let _ = service::run_listening(&bind, identity, trusted, service, shutdown).await;
        });

        // Wait for the rebind to come up before handing the address out.
        for _ in 0..100 {
            if tokio::net::TcpStream::connect(addr).await.is_ok() {
                return Ok(addr);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        anyhow::bail!("agent listener failed to start at {addr}");
    }

    /// Stop all of this agent's connection loops.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}
