//! A mutually-authenticated channel carrying JSON-lines frames.

use crate::endpoint::{ServiceEndpoint, Thumbprint};
use crate::error::TransportError;
use crate::tls::{TlsIdentity, server_name_for};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};

const MAX_PROXY_RESPONSE: usize = 8 * 1024;

/// One live TLS connection to a peer whose certificate thumbprint has been
/// observed. Owned by the transport runtime (or an agent connection driver);
/// callers never hold one directly.
pub struct SecureChannel {
    peer: Thumbprint,
    reader: tokio::io::Lines<BufReader<ReadHalf<TlsStream<TcpStream>>>>,
    writer: WriteHalf<TlsStream<TcpStream>>,
}

impl std::fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannel")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl SecureChannel {
    /// Dial `endpoint`, handshake, and verify the peer presented exactly the
    /// pinned thumbprint. A mismatch closes the connection and reports
    /// `Authentication`; no payload is ever written to an unverified peer.
    pub async fn connect(
        endpoint: &ServiceEndpoint,
        identity: &TlsIdentity,
        connect_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let tcp = timeout(connect_timeout, dial(endpoint))
            .await
            .map_err(|_| TransportError::network(format!("connect to {} timed out", endpoint.address)))??;
        tcp.set_nodelay(true).map_err(TransportError::network)?;

        let connector = TlsConnector::from(identity.client_config());
        let name = server_name_for(endpoint.host())?;
        let tls = timeout(connect_timeout, connector.connect(name, tcp))
            .await
            .map_err(|_| TransportError::network("tls handshake timed out"))?
            .map_err(|e| TransportError::Authentication(format!("tls handshake failed: {e}")))?;

        let channel = Self::from_stream(TlsStream::from(tls))?;
        if channel.peer != endpoint.thumbprint {
            let observed = channel.peer.clone();
            channel.shutdown().await;
            return Err(TransportError::Authentication(format!(
                "peer at {} presented thumbprint {observed} but {} was pinned",
                endpoint.address, endpoint.thumbprint
            )));
        }
        Ok(channel)
    }

    /// Accept one inbound connection. The caller decides what the observed
    /// `peer()` thumbprint is allowed to do before sending anything.
    pub async fn accept(
        tcp: TcpStream,
        identity: &TlsIdentity,
        handshake_timeout: Duration,
    ) -> Result<Self, TransportError> {
        tcp.set_nodelay(true).map_err(TransportError::network)?;
        let acceptor = TlsAcceptor::from(identity.server_config());
        let tls = timeout(handshake_timeout, acceptor.accept(tcp))
            .await
            .map_err(|_| TransportError::network("tls handshake timed out"))?
            .map_err(|e| TransportError::Authentication(format!("tls handshake failed: {e}")))?;
        Self::from_stream(TlsStream::from(tls))
    }

    fn from_stream(stream: TlsStream<TcpStream>) -> Result<Self, TransportError> {
        let (_, common) = stream.get_ref();
        let peer = common
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|cert| Thumbprint::of_cert_der(cert))
            .ok_or_else(|| {
                TransportError::Authentication("peer presented no certificate".to_string())
            })?;
        let (read_half, write_half) = tokio::io::split(stream);
        Ok(Self {
            peer,
            reader: BufReader::new(read_half).lines(),
            writer: write_half,
        })
    }

    /// Thumbprint observed during the handshake.
    pub fn peer(&self) -> &Thumbprint {
        &self.peer
    }

    pub async fn send<T: Serialize>(&mut self, msg: &T) -> Result<(), TransportError> {
        let mut line = serde_json::to_string(msg)
            .map_err(|e| TransportError::Protocol(format!("encode frame: {e}")))?;
        line.push('\n');
        self.writer
            .write_all(line.as_bytes())
            .await
            .map_err(TransportError::network)?;
        self.writer.flush().await.map_err(TransportError::network)
    }

    /// Next frame, or `None` on clean close.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<Option<T>, TransportError> {
        loop {
            match self.reader.next_line().await {
                Ok(None) => return Ok(None),
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => {
                    return serde_json::from_str(&line)
                        .map(Some)
                        .map_err(|e| TransportError::Protocol(format!("invalid frame: {e}")));
                }
                Err(e) => return Err(TransportError::network(e)),
            }
        }
    }

    pub async fn shutdown(mut self) {
        let _ = self.writer.shutdown().await;
    }
}

async fn dial(endpoint: &ServiceEndpoint) -> Result<TcpStream, TransportError> {
    match &endpoint.proxy {
        None => TcpStream::connect(&endpoint.address)
            .await
            .map_err(TransportError::network),
        Some(proxy) => {
            let mut tcp = TcpStream::connect(&proxy.address)
                .await
                .map_err(|e| TransportError::network(format!("proxy {}: {e}", proxy.address)))?;
            let request = format!(
                "CONNECT {addr} HTTP/1.1\r\nHost: {addr}\r\n\r\n",
                addr = endpoint.address
            );
            tcp.write_all(request.as_bytes())
                .await
                .map_err(TransportError::network)?;
            read_proxy_response(&mut tcp).await?;
            Ok(tcp)
        }
    }
}

/// Consume the CONNECT response headers and require a 2xx status.
async fn read_proxy_response(tcp: &mut TcpStream) -> Result<(), TransportError> {
    let mut response = Vec::new();
    while !response.ends_with(b"\r\n\r\n") {
        if response.len() >= MAX_PROXY_RESPONSE {
            return Err(TransportError::network("proxy response too large"));
        }
        response.push(tcp.read_u8().await.map_err(TransportError::network)?);
    }
    let status_line = response
        .split(|&b| b == b'\r')
        .next()
        .map(String::from_utf8_lossy)
        .unwrap_or_default()
        .into_owned();
    let ok = status_line
        .split_whitespace()
        .nth(1)
        .is_some_and(|code| code.starts_with('2'));
    if !ok {
        return Err(TransportError::network(format!(
            "proxy refused CONNECT: {status_line}"
        )));
    }
    Ok(())
}
