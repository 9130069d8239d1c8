//! Owns the live secure channels and marries them to the pending queues.
//!
//! Listening topology: the runtime dials the agent and keeps one channel per
//! endpoint alive, reconnecting on a timer after network failures.
//! Polling topology: the runtime accepts inbound dials, resolves the queue
//! for the observed peer identity, and drains it over the new channel.

use crate::channel::SecureChannel;
use crate::endpoint::{ServiceEndpoint, Thumbprint};
use crate::error::TransportError;
use crate::queue::{ClaimedRequest, PendingRequests, RequestHandle};
use crate::tls::TlsIdentity;
use dashmap::DashMap;
use grapple_proto::{RequestBody, ResponseBody, ResponseEnvelope};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Knobs the original system leaves open; defaults documented per field.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// TCP connect + TLS handshake ceiling. Default 10s.
    pub connect_timeout: Duration,
    /// Pause before re-dialing a persistent channel after a network failure.
    /// Default 5s.
    pub reconnect_interval: Duration,
    /// How long a deliverer waits for the response to one delivered request
    /// before declaring the channel suspect. Default 60s.
    pub reply_timeout: Duration,
    /// How long an idle inbound polling connection is held open before it is
    /// released, so agents do not busy-loop. Default 30s.
    pub long_poll_window: Duration,
    /// Keep an inbound connection for further requests after a delivery
    /// instead of closing per poll. Default true.
    pub keep_alive: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            reconnect_interval: Duration::from_secs(5),
            reply_timeout: Duration::from_secs(60),
            long_poll_window: Duration::from_secs(30),
            keep_alive: true,
        }
    }
}

pub struct TransportRuntime {
    identity: TlsIdentity,
    pending: Arc<PendingRequests>,
    config: RuntimeConfig,
    shutdown: CancellationToken,
    /// Endpoints with an active persistent-dial loop.
    dialers: DashMap<Thumbprint, ()>,
}

impl TransportRuntime {
    pub fn new(identity: TlsIdentity, config: RuntimeConfig) -> Arc<Self> {
        Arc::new(Self {
            identity,
            pending: Arc::new(PendingRequests::new()),
            config,
            shutdown: CancellationToken::new(),
            dialers: DashMap::new(),
        })
    }

    pub fn identity(&self) -> &TlsIdentity {
        &self.identity
    }

    pub fn pending(&self) -> &Arc<PendingRequests> {
        &self.pending
    }

    /// Queue a request for `destination` without waiting for the result.
    pub fn enqueue(
        &self,
        destination: &Thumbprint,
        body: RequestBody,
        deadline: Instant,
    ) -> RequestHandle {
        self.pending.enqueue(destination, body, deadline)
    }

    /// Queue a request and wait for its single outcome.
    pub async fn submit(
        &self,
        destination: &Thumbprint,
        body: RequestBody,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<ResponseBody, TransportError> {
        self.enqueue(destination, body, deadline)
            .await_result(cancel)
            .await
    }

    /// Listening topology: keep a persistent channel to `endpoint`, dialing
    /// out and reconnecting on a timer. Authentication failures are not
    /// retried: all pending requests for the identity are failed and the
    /// dial loop stops.
    pub fn start_listening(self: &Arc<Self>, endpoint: ServiceEndpoint) {
        use dashmap::mapref::entry::Entry;
        match self.dialers.entry(endpoint.thumbprint.clone()) {
            Entry::Occupied(_) => {
                debug!(identity = %endpoint.thumbprint, "channel already maintained");
            }
            Entry::Vacant(slot) => {
                slot.insert(());
                let runtime = self.clone();
                tokio::spawn(async move { runtime.maintain_channel(endpoint).await });
            }
        }
    }

    async fn maintain_channel(self: Arc<Self>, endpoint: ServiceEndpoint) {
        let identity = endpoint.thumbprint.clone();
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            match SecureChannel::connect(&endpoint, &self.identity, self.config.connect_timeout)
                .await
            {
                Ok(channel) => {
                    info!(address = %endpoint.address, identity = %identity, "channel established");
                    match self.service_outbound(channel, &identity).await {
                        Ok(()) => break, // shutdown
                        Err(e) => {
                            warn!(identity = %identity, err = %e, "channel failed, will reconnect");
                        }
                    }
                }
                Err(e @ TransportError::Authentication(_)) => {
                    warn!(address = %endpoint.address, err = %e, "peer identity rejected, not retrying");
                    self.pending.fail_all(&identity, &e);
                    break;
                }
                Err(e) => {
                    warn!(address = %endpoint.address, err = %e, "dial failed, will reconnect");
                }
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.reconnect_interval) => {}
            }
        }
        self.dialers.remove(&identity);
    }

    /// Drain the identity's queue over one established outbound channel until
    /// the channel errors or the runtime shuts down.
    async fn service_outbound(
        &self,
        mut channel: SecureChannel,
        identity: &Thumbprint,
    ) -> Result<(), TransportError> {
        loop {
            let Some(claimed) = self.pending.next_for(identity, &self.shutdown).await else {
                channel.shutdown().await;
                return Ok(());
            };
            deliver(&mut channel, claimed, self.config.reply_timeout).await?;
        }
    }

    /// Polling topology: accept inbound agent dials until shutdown.
    pub async fn serve_polling(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        let local = listener.local_addr()?;
        info!(addr = %local, "listening for agent polls");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok((tcp, peer_addr)) => {
                        let runtime = self.clone();
                        tokio::spawn(async move { runtime.handle_inbound(tcp, peer_addr).await });
                    }
                    Err(e) => {
                        warn!(err = %e, "accept error");
                    }
                }
            }
        }
    }

    async fn handle_inbound(self: Arc<Self>, tcp: TcpStream, peer_addr: SocketAddr) {
        let mut channel =
            match SecureChannel::accept(tcp, &self.identity, self.config.connect_timeout).await {
                Ok(channel) => channel,
                Err(e) => {
                    warn!(%peer_addr, err = %e, "inbound handshake rejected");
                    return;
                }
            };
        let peer = channel.peer().clone();
        // The handshake accepts any self-signed certificate, so an identity
        // no caller has queued work for is a stranger: drop it before it can
        // occupy a long-poll slot or grow the queue map.
        if !self.pending.is_known(&peer) {
            debug!(%peer_addr, identity = %peer, "unknown identity polled in, releasing");
            channel.shutdown().await;
            return;
        }
        debug!(%peer_addr, identity = %peer, "agent polled in");

        let window = tokio::time::sleep(self.config.long_poll_window);
        tokio::pin!(window);
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = &mut window => {
                    debug!(identity = %peer, "long-poll window elapsed, releasing connection");
                    break;
                }
                claimed = self.pending.next_for(&peer, &self.shutdown) => {
                    let Some(claimed) = claimed else { break };
                    if let Err(e) = deliver(&mut channel, claimed, self.config.reply_timeout).await {
                        warn!(identity = %peer, err = %e, "delivery over polled channel failed");
                        return;
                    }
                    if !self.config.keep_alive {
                        break;
                    }
                    // The window bounds *idle* time, not connection lifetime.
                    window.as_mut().reset(Instant::now() + self.config.long_poll_window);
                }
            }
        }
        channel.shutdown().await;
    }

    /// Stop all channel maintenance and release every waiting claimant.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// Send one claimed request down a channel and route the correlated response
/// into its result slot. Any failure is recorded on the request *and*
/// propagated so the channel can be torn down.
async fn deliver(
    channel: &mut SecureChannel,
    claimed: ClaimedRequest,
    reply_timeout: Duration,
) -> Result<(), TransportError> {
    let request_id = claimed.id().clone();
    if let Err(e) = channel.send(&claimed.envelope).await {
        claimed.fulfill(Err(e.clone()));
        return Err(e);
    }
    let wait_until = claimed.deadline.min(Instant::now() + reply_timeout);
    match tokio::time::timeout_at(wait_until, channel.recv::<ResponseEnvelope>()).await {
        Err(_) => {
            let e = TransportError::network("peer did not answer within the reply window");
            claimed.fulfill(Err(e.clone()));
            Err(e)
        }
        Ok(Err(e)) => {
            claimed.fulfill(Err(e.clone()));
            Err(e)
        }
        Ok(Ok(None)) => {
            let e = TransportError::network("channel closed before the response arrived");
            claimed.fulfill(Err(e.clone()));
            Err(e)
        }
        Ok(Ok(Some(response))) => {
            if response.in_reply_to != request_id {
                let e = TransportError::Protocol(format!(
                    "response correlates to {} but {} was in flight",
                    response.in_reply_to, request_id
                ));
                claimed.fulfill(Err(e.clone()));
                return Err(e);
            }
            debug!(request = %request_id, "response delivered");
            claimed.fulfill(Ok(response.body));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grapple_proto::{RequestEnvelope, ScriptState, StatusUpdate};

    fn status_reply(request: &RequestEnvelope) -> ResponseEnvelope {
        ResponseEnvelope::reply_to(
            request,
            ResponseBody::Status(StatusUpdate {
                run_id: "run-1".to_string(),
                state: ScriptState::Running,
                next_cursor: 0,
                log_chunk: String::new(),
                exit_code: None,
            }),
        )
    }

    #[tokio::test]
    async fn polling_agent_claims_queued_request() {
        let server_id = TlsIdentity::generate("server").unwrap();
        let agent_id = TlsIdentity::generate("agent").unwrap();
        let runtime = TransportRuntime::new(server_id.clone(), RuntimeConfig::default());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_endpoint = ServiceEndpoint::new(
            format!("127.0.0.1:{}", listener.local_addr().unwrap().port()),
            server_id.thumbprint().clone(),
        )
        .unwrap();
        tokio::spawn(runtime.clone().serve_polling(listener));

        // Request queued before the agent has ever connected.
        let handle = runtime.enqueue(
            agent_id.thumbprint(),
            RequestBody::ScriptStatus {
                run_id: "run-1".to_string(),
                after_cursor: 0,
            },
            Instant::now() + Duration::from_secs(10),
        );

        // Agent polls in and answers whatever it is handed.
        tokio::spawn(async move {
            let mut channel =
                SecureChannel::connect(&server_endpoint, &agent_id, Duration::from_secs(5))
                    .await
                    .unwrap();
            let request: RequestEnvelope = channel.recv().await.unwrap().unwrap();
            channel.send(&status_reply(&request)).await.unwrap();
        });

        let cancel = CancellationToken::new();
        let outcome = handle.await_result(&cancel).await.unwrap();
        assert!(matches!(outcome, ResponseBody::Status(_)));
        runtime.shutdown();
    }

    #[tokio::test]
    async fn unknown_polling_identity_is_released_without_tracking() {
        let server_id = TlsIdentity::generate("server").unwrap();
        let stranger = TlsIdentity::generate("stranger").unwrap();
        let runtime = TransportRuntime::new(server_id.clone(), RuntimeConfig::default());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = ServiceEndpoint::new(
            format!("127.0.0.1:{}", listener.local_addr().unwrap().port()),
            server_id.thumbprint().clone(),
        )
        .unwrap();
        tokio::spawn(runtime.clone().serve_polling(listener));

        // No work was ever queued for this identity: the connection is
        // closed immediately instead of being held for the long-poll window.
        let mut channel = SecureChannel::connect(&endpoint, &stranger, Duration::from_secs(5))
            .await
            .unwrap();
        let next: Option<RequestEnvelope> = channel.recv().await.unwrap();
        assert!(next.is_none());
        assert_eq!(runtime.pending().tracked_identities(), 0);
        runtime.shutdown();
    }

    #[tokio::test]
    async fn long_poll_window_releases_idle_connection() {
        let server_id = TlsIdentity::generate("server").unwrap();
        let agent_id = TlsIdentity::generate("agent").unwrap();
        let config = RuntimeConfig {
            long_poll_window: Duration::from_millis(250),
            ..RuntimeConfig::default()
        };
        let runtime = TransportRuntime::new(server_id.clone(), config);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = ServiceEndpoint::new(
            format!("127.0.0.1:{}", listener.local_addr().unwrap().port()),
            server_id.thumbprint().clone(),
        )
        .unwrap();
        tokio::spawn(runtime.clone().serve_polling(listener));

        let handle = runtime.enqueue(
            agent_id.thumbprint(),
            RequestBody::ScriptStatus {
                run_id: "run-1".to_string(),
                after_cursor: 0,
            },
            Instant::now() + Duration::from_secs(10),
        );

        let mut channel = SecureChannel::connect(&endpoint, &agent_id, Duration::from_secs(5))
            .await
            .unwrap();
        let request: RequestEnvelope = channel.recv().await.unwrap().unwrap();
        channel.send(&status_reply(&request)).await.unwrap();
        let cancel = CancellationToken::new();
        handle.await_result(&cancel).await.unwrap();

        // Nothing else queued: the server releases the connection once the
        // window elapses, and the agent observes a clean close.
        let idle_from = std::time::Instant::now();
        let next: Option<RequestEnvelope> = channel.recv().await.unwrap();
        assert!(next.is_none());
        let idle = idle_from.elapsed();
        assert!(idle >= Duration::from_millis(150), "{idle:?}");
        assert!(idle < Duration::from_secs(5), "{idle:?}");

        // A fresh poll re-establishes delivery.
        let handle = runtime.enqueue(
            agent_id.thumbprint(),
            RequestBody::ScriptStatus {
                run_id: "run-1".to_string(),
                after_cursor: 0,
            },
            Instant::now() + Duration::from_secs(10),
        );
        let mut channel = SecureChannel::connect(&endpoint, &agent_id, Duration::from_secs(5))
            .await
            .unwrap();
        let request: RequestEnvelope = channel.recv().await.unwrap().unwrap();
        channel.send(&status_reply(&request)).await.unwrap();
        handle.await_result(&cancel).await.unwrap();
        runtime.shutdown();
    }

    #[tokio::test]
    async fn busy_polled_channel_outlives_the_window() {
        let server_id = TlsIdentity::generate("server").unwrap();
        let agent_id = TlsIdentity::generate("agent").unwrap();
        let config = RuntimeConfig {
            long_poll_window: Duration::from_millis(200),
            ..RuntimeConfig::default()
        };
        let runtime = TransportRuntime::new(server_id.clone(), config);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = ServiceEndpoint::new(
            format!("127.0.0.1:{}", listener.local_addr().unwrap().port()),
            server_id.thumbprint().clone(),
        )
        .unwrap();
        tokio::spawn(runtime.clone().serve_polling(listener));

        // Seed the queue so the first poll is accepted, then serve every
        // request over the one connection.
        let agent = agent_id.thumbprint().clone();
        let first = runtime.enqueue(
            &agent,
            RequestBody::ScriptStatus {
                run_id: "run-1".to_string(),
                after_cursor: 0,
            },
            Instant::now() + Duration::from_secs(10),
        );
        tokio::spawn(async move {
            let mut channel =
                SecureChannel::connect(&endpoint, &agent_id, Duration::from_secs(5))
                    .await
                    .unwrap();
            while let Ok(Some(request)) = channel.recv::<RequestEnvelope>().await {
                channel.send(&status_reply(&request)).await.unwrap();
            }
        });

        let cancel = CancellationToken::new();
        first.await_result(&cancel).await.unwrap();

        // Deliveries spaced inside the window but summing past it: the
        // window bounds idle time, so the channel must survive them all.
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(150)).await;
            let handle = runtime.enqueue(
                &agent,
                RequestBody::ScriptStatus {
                    run_id: "run-1".to_string(),
                    after_cursor: 0,
                },
                Instant::now() + Duration::from_secs(2),
            );
            handle.await_result(&cancel).await.unwrap();
        }
        runtime.shutdown();
    }

    #[tokio::test]
    async fn listening_dial_rejects_wrong_thumbprint_without_retry() {
        let server_id = TlsIdentity::generate("server").unwrap();
        let agent_id = TlsIdentity::generate("agent").unwrap();
        let impostor = TlsIdentity::generate("impostor").unwrap();
        let runtime = TransportRuntime::new(server_id, RuntimeConfig::default());

        // The "agent" answers the TLS handshake with its real certificate,
        // but the endpoint pins a different identity.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = ServiceEndpoint::new(
            format!("127.0.0.1:{}", listener.local_addr().unwrap().port()),
            impostor.thumbprint().clone(),
        )
        .unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((tcp, _)) = listener.accept().await else {
                    break;
                };
                let _ = SecureChannel::accept(tcp, &agent_id, Duration::from_secs(5)).await;
            }
        });

        let handle = runtime.enqueue(
            &endpoint.thumbprint.clone(),
            RequestBody::ScriptStatus {
                run_id: "run-1".to_string(),
                after_cursor: 0,
            },
            Instant::now() + Duration::from_secs(30),
        );
        runtime.start_listening(endpoint);

        let cancel = CancellationToken::new();
        let err = handle.await_result(&cancel).await.unwrap_err();
        assert!(matches!(err, TransportError::Authentication(_)), "{err}");
        runtime.shutdown();
    }
}
