use thiserror::Error;

/// Transport-level failure classification.
///
/// Callers never see raw I/O errors: everything that can go wrong between
/// "request enqueued" and "response observed" collapses into one of these.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// Peer certificate thumbprint did not match the expected identity, or
    /// the TLS handshake itself failed. Fatal, never retried.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Connection refused/reset/timed out mid-exchange. Retryable by the
    /// caller under its own wall-clock budget.
    #[error("network failure: {0}")]
    Network(String),

    /// The request's deadline elapsed before any channel delivered it.
    /// Distinct from `Network`: the request never reached the peer.
    #[error("request deadline elapsed before a response arrived")]
    TimedOut,

    /// The caller's cancellation signal fired while waiting.
    #[error("cancelled by caller")]
    Cancelled,

    /// The peer answered with something that violates the wire contract,
    /// e.g. a response correlated to a different request.
    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Whether a caller's retry policy may try again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Network(_) | TransportError::TimedOut)
    }

    pub(crate) fn network(err: impl std::fmt::Display) -> Self {
        TransportError::Network(err.to_string())
    }
}
