use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Hex-encoded SHA-256 fingerprint of a peer certificate (DER).
///
/// This is the only peer identity the transport trusts; no certificate
/// authority is ever consulted. Stored lowercase so comparisons are exact.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Thumbprint(String);

impl Thumbprint {
    /// Parse a configured thumbprint. Empty thumbprints are rejected:
    /// a remote peer without a pinned identity is a misconfiguration.
    pub fn parse(hex_digest: impl Into<String>) -> Result<Self> {
        let normalized = hex_digest.into().trim().to_ascii_lowercase();
        if normalized.is_empty() {
            bail!("thumbprint must not be empty");
        }
        if normalized.len() != 64 || !normalized.bytes().all(|b| b.is_ascii_hexdigit()) {
            bail!("thumbprint must be 64 hex characters, got {normalized:?}");
        }
        Ok(Self(normalized))
    }

    /// Fingerprint of a certificate in DER form.
    pub fn of_cert_der(der: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(der)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Thumbprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Thumbprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form for logs; full digest is rarely useful on one line.
        write!(f, "Thumbprint({}..)", &self.0[..12.min(self.0.len())])
    }
}

/// An HTTP proxy to tunnel through (CONNECT) before the TLS handshake.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyEndpoint {
    pub address: String,
}

/// Immutable description of a remote peer: where to reach it and which
/// certificate identity to expect once we get there.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    /// `host:port` the transport dials (listening topology) or the agent
    /// dials in from (polling topology, informational).
    pub address: String,
    pub thumbprint: Thumbprint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyEndpoint>,
}

impl ServiceEndpoint {
    pub fn new(address: impl Into<String>, thumbprint: Thumbprint) -> Result<Self> {
        let address = address.into();
        if address.is_empty() {
            bail!("endpoint address must not be empty");
        }
        Ok(Self {
            address,
            thumbprint,
            proxy: None,
        })
    }

    pub fn with_proxy(mut self, proxy: ProxyEndpoint) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Host portion of `address`, used as the TLS server name.
    pub fn host(&self) -> &str {
        self.address
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(&self.address)
    }
}

/// Two endpoints are the same peer iff address and pinned identity match.
impl PartialEq for ServiceEndpoint {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address && self.thumbprint == other.thumbprint
    }
}

impl Eq for ServiceEndpoint {}
