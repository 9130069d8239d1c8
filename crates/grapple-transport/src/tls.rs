//! Self-signed TLS identity material and the pinning-friendly rustls configs.
//!
//! Certificates here carry no chain of trust: both sides present a
//! self-signed certificate and the verifiers accept any cryptographically
//! sound presentation. Identity is established *after* the handshake by
//! comparing the observed certificate thumbprint against the expected one;
//! no payload crosses a channel before that check passes.

use crate::endpoint::Thumbprint;
use anyhow::{Context, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{WebPkiSupportedAlgorithms, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, SignatureScheme};
use std::path::Path;
use std::sync::Arc;

const CERT_FILE: &str = "identity.crt";
const KEY_FILE: &str = "identity.key";

fn ensure_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// A local certificate + private key pair plus the rustls configs built from
/// it. One identity serves both roles: TLS client when dialing out, TLS
/// server when accepting inbound polls.
#[derive(Clone)]
pub struct TlsIdentity {
    cert_der: Vec<u8>,
    key_der: Vec<u8>,
    thumbprint: Thumbprint,
    client_config: Arc<rustls::ClientConfig>,
    server_config: Arc<rustls::ServerConfig>,
}

impl TlsIdentity {
    /// Generate a fresh self-signed identity, in memory only.
    pub fn generate(common_name: &str) -> Result<Self> {
        let certified = rcgen::generate_simple_self_signed(vec![common_name.to_string()])
            .context("generate self-signed certificate")?;
        let cert_der = certified.cert.der().to_vec();
        let key_der = certified.key_pair.serialize_der();
        Self::from_der(cert_der, key_der)
    }

    /// Load the identity persisted under `state_dir`, or generate and persist
    /// a new one. The private key file is written with mode 0600.
    pub fn load_or_create(state_dir: &Path, common_name: &str) -> Result<Self> {
        std::fs::create_dir_all(state_dir)
            .with_context(|| format!("create {}", state_dir.display()))?;
        let cert_path = state_dir.join(CERT_FILE);
        let key_path = state_dir.join(KEY_FILE);

        if cert_path.exists() && key_path.exists() {
            let cert_der = std::fs::read(&cert_path)
                .with_context(|| format!("read {}", cert_path.display()))?;
            let key_der = std::fs::read(&key_path)
                .with_context(|| format!("read {}", key_path.display()))?;
            return Self::from_der(cert_der, key_der);
        }

        let identity = Self::generate(common_name)?;
        std::fs::write(&cert_path, &identity.cert_der)
            .with_context(|| format!("write {}", cert_path.display()))?;
        std::fs::write(&key_path, &identity.key_der)
            .with_context(|| format!("write {}", key_path.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))
                .with_context(|| format!("set permissions on {}", key_path.display()))?;
        }
        Ok(identity)
    }

    fn from_der(cert_der: Vec<u8>, key_der: Vec<u8>) -> Result<Self> {
        ensure_crypto_provider();
        let thumbprint = Thumbprint::of_cert_der(&cert_der);
        let algorithms = rustls::crypto::ring::default_provider().signature_verification_algorithms;

        let cert_chain = vec![CertificateDer::from(cert_der.clone())];
        let client_key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key_der.clone()));
        let client_config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert { algorithms }))
            .with_client_auth_cert(cert_chain.clone(), client_key)
            .context("build client tls config")?;

        let server_key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key_der.clone()));
        let server_config = rustls::ServerConfig::builder()
            .with_client_cert_verifier(Arc::new(RequireAnyClientCert { algorithms }))
            .with_single_cert(cert_chain, server_key)
            .context("build server tls config")?;

        Ok(Self {
            cert_der,
            key_der,
            thumbprint,
            client_config: Arc::new(client_config),
            server_config: Arc::new(server_config),
        })
    }

    /// Fingerprint other peers pin to reach this identity.
    pub fn thumbprint(&self) -> &Thumbprint {
        &self.thumbprint
    }

    pub fn cert_der(&self) -> &[u8] {
        &self.cert_der
    }

    pub(crate) fn client_config(&self) -> Arc<rustls::ClientConfig> {
        self.client_config.clone()
    }

    pub(crate) fn server_config(&self) -> Arc<rustls::ServerConfig> {
        self.server_config.clone()
    }
}

pub(crate) fn server_name_for(host: &str) -> Result<ServerName<'static>, crate::TransportError> {
    ServerName::try_from(host.to_string())
        .map_err(|e| crate::TransportError::network(format!("invalid server name {host:?}: {e}")))
}

/// Accepts any server certificate; the caller pins the observed thumbprint
/// immediately after the handshake. Handshake signatures are still verified
/// so the peer must actually hold the presented certificate's key.
#[derive(Debug)]
struct AcceptAnyServerCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Requires a client certificate but accepts any; inbound connections are
/// routed (or dropped) by observed thumbprint after the handshake.
#[derive(Debug)]
struct RequireAnyClientCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ClientCertVerifier for RequireAnyClientCert {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
