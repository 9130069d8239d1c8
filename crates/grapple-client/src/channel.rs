//! The seam between orchestration and wire delivery.

use async_trait::async_trait;
use grapple_proto::{RequestBody, ResponseBody};
use grapple_transport::{Thumbprint, TransportError, TransportRuntime};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// One logical request/response exchange with a specific agent, however the
/// transport chooses to get it there.
#[async_trait]
pub trait RequestChannel: Send + Sync {
    async fn request(
        &self,
        body: RequestBody,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<ResponseBody, TransportError>;
}

/// Routes requests through the transport runtime's pending queues.
pub struct RuntimeChannel {
    runtime: Arc<TransportRuntime>,
    destination: Thumbprint,
}

impl RuntimeChannel {
    pub fn new(runtime: Arc<TransportRuntime>, destination: Thumbprint) -> Self {
        Self {
            runtime,
            destination,
        }
    }
}

#[async_trait]
impl RequestChannel for RuntimeChannel {
    async fn request(
        &self,
        body: RequestBody,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<ResponseBody, TransportError> {
        self.runtime
            .submit(&self.destination, body, deadline, cancel)
            .await
    }
}
