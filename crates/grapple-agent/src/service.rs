//! Connection loops for the two topologies. A polling agent dials the
//! control plane and serves whatever arrives over the channel; a listening
//! agent binds a socket and serves inbound connections from the pinned peer.

use crate::handler::AgentService;
use anyhow::{Context, Result, bail};
use grapple_transport::{SecureChannel, ServiceEndpoint, Thumbprint, TlsIdentity, TransportError};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct PollingOptions {
    /// Pause between redials after the channel drops.
    pub poll_interval: Duration,
    pub connect_timeout: Duration,
}

impl Default for PollingOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Serve requests off one channel until it closes or the agent shuts down.
async fn serve_channel(
    mut channel: SecureChannel,
    service: &AgentService,
    shutdown: &CancellationToken,
) -> Result<(), TransportError> {
    loop {
        let request = tokio::select! {
            _ = shutdown.cancelled() => {
                channel.shutdown().await;
                return Ok(());
            }
            request = channel.recv() => request?,
        };
        let Some(request) = request else {
            debug!("channel closed by peer");
            return Ok(());
        };
        let response = service.handle(request).await;
        channel.send(&response).await?;
    }
}

/// Polling topology: dial the control plane and hold the channel open,
/// redialing after transient failures. A pin mismatch is fatal; retrying
/// against the wrong identity would never succeed.
pub async fn run_polling(
    endpoint: ServiceEndpoint,
    identity: TlsIdentity,
    service: AgentService,
    options: PollingOptions,
    shutdown: CancellationToken,
) -> Result<()> {
    info!(peer = %endpoint.address, "polling control plane");
    loop {
        if shutdown.is_cancelled() {
            return Ok(());
        }
        match SecureChannel::connect(&endpoint, &identity, options.connect_timeout).await {
            Ok(channel) => {
                info!(peer = %endpoint.address, "channel established");
                match serve_channel(channel, &service, &shutdown).await {
                    Ok(()) => {
                        if shutdown.is_cancelled() {
                            return Ok(());
                        }
                        debug!("channel ended, redialing");
                    }
                    Err(TransportError::Authentication(reason)) => {
                        bail!("control plane rejected our session: {reason}");
                    }
                    Err(e) => warn!(err = %e, "channel failed, redialing"),
                }
            }
            Err(TransportError::Authentication(reason)) => {
                bail!("control plane presented an untrusted certificate: {reason}");
            }
            Err(e) => warn!(peer = %endpoint.address, err = %e, "dial failed"),
        }
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = tokio::time::sleep(options.poll_interval) => {}
        }
    }
}

const MAX_INBOUND: usize = 32;

/// Listening topology: accept connections and serve any peer whose
/// certificate matches the trusted thumbprint. Others are dropped.
pub async fn run_listening(
    bind: &str,
    identity: TlsIdentity,
    trusted: Thumbprint,
    service: AgentService,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    info!(addr = %listener.local_addr().context("local addr")?, "listening for control plane");

    let service = Arc::new(service);
    let limit = Arc::new(Semaphore::new(MAX_INBOUND));
    loop {
        let (tcp, remote) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted.context("accept")?,
        };
        let Ok(permit) = Arc::clone(&limit).try_acquire_owned() else {
            debug!(%remote, "inbound connection limit reached, dropping");
            continue;
        };
        let identity = identity.clone();
        let trusted = trusted.clone();
        let service = Arc::clone(&service);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let channel =
                match SecureChannel::accept(tcp, &identity, Duration::from_secs(10)).await {
                    Ok(channel) => channel,
                    Err(e) => {
                        debug!(%remote, err = %e, "handshake failed");
                        return;
                    }
                };
            if *channel.peer() != trusted {
                warn!(%remote, peer = ?channel.peer(), "untrusted peer rejected");
                channel.shutdown().await;
                return;
            }
            if let Err(e) = serve_channel(channel, &service, &shutdown).await {
                debug!(%remote, err = %e, "channel ended with error");
            }
        });
    }
}
