//! In-process control plane for integration tests.

use anyhow::Result;
use grapple_client::{LogSink, RuntimeChannel, ScriptExecutionClient};
use grapple_transport::{
    RuntimeConfig, ServiceEndpoint, Thumbprint, TlsIdentity, TransportRuntime,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

pub struct TestServer {
    runtime: Arc<TransportRuntime>,
    poll_addr: Option<SocketAddr>,
}

impl TestServer {
    /// A server with no listener; use [`TestServer::dial`] for listening
    /// agents or [`TestServer::start_polling`] first for polling agents.
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        let identity = TlsIdentity::generate("test-server")?;
        Ok(Self {
            runtime: TransportRuntime::new(identity, config),
            poll_addr: None,
        })
    }

    pub fn thumbprint(&self) -> Thumbprint {
        self.runtime.identity().thumbprint().clone()
    }

    pub fn runtime(&self) -> Arc<TransportRuntime> {
        self.runtime.clone()
    }

    /// Bind a loopback listener for polling agents and start serving it.
    pub async fn start_polling(&mut self) -> Result<SocketAddr> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(self.runtime.clone().serve_polling(listener));
        self.poll_addr = Some(addr);
        Ok(addr)
    }

    pub fn poll_addr(&self) -> SocketAddr {
        self.poll_addr.expect("start_polling was not called")
    }

    /// Maintain an outbound channel to a listening agent.
    pub fn dial(&self, addr: SocketAddr, agent: Thumbprint) -> Result<()> {
        let endpoint = ServiceEndpoint::new(addr.to_string(), agent)?;
        self.runtime.start_listening(endpoint);
        Ok(())
    }

    /// An execution client bound to one agent identity.
    pub fn client_for(
        &self,
        agent: Thumbprint,
        options: grapple_client::ExecutionOptions,
        sink: Arc<dyn LogSink>,
    ) -> Arc<ScriptExecutionClient> {
        let channel = RuntimeChannel::new(self.runtime.clone(), agent);
        ScriptExecutionClient::new(Arc::new(channel), options, sink)
    }

    pub fn shutdown(&self) {
        self.runtime.shutdown();
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.runtime.shutdown();
    }
}
