pub mod backoff;
pub mod channel;
pub mod endpoint;
pub mod error;
pub mod queue;
pub mod runtime;
pub mod tls;

pub use backoff::{CappedExponentialBackoff, FixedBackoff, PollBackoff};
pub use channel::SecureChannel;
pub use endpoint::{ProxyEndpoint, ServiceEndpoint, Thumbprint};
pub use error::TransportError;
pub use queue::{ClaimedRequest, PendingRequests, RequestHandle};
pub use runtime::{RuntimeConfig, TransportRuntime};
pub use tls::TlsIdentity;
