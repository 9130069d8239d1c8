//! Per-identity pending request queues.
//!
//! This is what makes the polling topology work: a caller can enqueue work
//! for an agent that has no live connection, and the request simply waits
//! until an inbound poll (or the persistent outbound channel) claims it.
//! Claims are atomic: a request removed for delivery is never visible to a
//! second claimant.

use crate::endpoint::Thumbprint;
use crate::error::TransportError;
use dashmap::DashMap;
use grapple_proto::{RequestBody, RequestEnvelope, RequestId, ResponseBody};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

type ReplySlot = oneshot::Sender<Result<ResponseBody, TransportError>>;

struct QueuedRequest {
    envelope: RequestEnvelope,
    deadline: Instant,
    reply: ReplySlot,
}

#[derive(Default)]
struct IdentityQueue {
    waiting: Mutex<VecDeque<QueuedRequest>>,
    notify: Notify,
}

/// The awaiter's side of one enqueued request.
pub struct RequestHandle {
    pub id: RequestId,
    deadline: Instant,
    rx: oneshot::Receiver<Result<ResponseBody, TransportError>>,
}

impl RequestHandle {
    /// Block until fulfillment, cancellation, or deadline expiry — whichever
    /// comes first. Exactly one outcome fires. A claimed request whose
    /// deliverer vanished before answering surfaces as `Network`.
    pub async fn await_result(
        mut self,
        cancel: &CancellationToken,
    ) -> Result<ResponseBody, TransportError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            res = &mut self.rx => match res {
                Ok(outcome) => outcome,
                Err(_) => Err(TransportError::Network(
                    "request was claimed for delivery but never answered".to_string(),
                )),
            },
            _ = tokio::time::sleep_until(self.deadline) => Err(TransportError::TimedOut),
        }
    }
}

/// A request removed from the queue for delivery. Dropping it without
/// calling [`ClaimedRequest::fulfill`] fails the awaiter with `Network`.
pub struct ClaimedRequest {
    pub envelope: RequestEnvelope,
    pub deadline: Instant,
    reply: ReplySlot,
}

impl ClaimedRequest {
    pub fn id(&self) -> &RequestId {
        &self.envelope.id
    }

    /// Record the single outcome for this request. The slot is consumed;
    /// a second fulfillment is unrepresentable.
    pub fn fulfill(self, outcome: Result<ResponseBody, TransportError>) {
        // The awaiter may have timed out or been cancelled already.
        let _ = self.reply.send(outcome);
    }
}

/// All pending requests, sharded by destination identity.
#[derive(Default)]
pub struct PendingRequests {
    queues: DashMap<Thumbprint, Arc<IdentityQueue>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the identity's queue if absent. Only paths that *intend* to
    /// track the identity may call this; read paths use [`lookup`] so an
    /// arbitrary observed thumbprint never grows the map.
    ///
    /// [`lookup`]: PendingRequests::lookup
    fn queue_for(&self, identity: &Thumbprint) -> Arc<IdentityQueue> {
        self.queues
            .entry(identity.clone())
            .or_default()
            .clone()
    }

    fn lookup(&self, identity: &Thumbprint) -> Option<Arc<IdentityQueue>> {
        self.queues.get(identity).map(|q| q.clone())
    }

    /// Whether any caller has ever queued work for `identity`.
    pub fn is_known(&self, identity: &Thumbprint) -> bool {
        self.queues.contains_key(identity)
    }

    /// Number of identities currently tracked.
    pub fn tracked_identities(&self) -> usize {
        self.queues.len()
    }

    /// Queue `body` for delivery to `identity`. Insertion order is dispatch
    /// order relative to other requests for the same identity.
    pub fn enqueue(
        &self,
        identity: &Thumbprint,
        body: RequestBody,
        deadline: Instant,
    ) -> RequestHandle {
        let envelope = RequestEnvelope::new(body);
        let id = envelope.id.clone();
        let (reply, rx) = oneshot::channel();
        let queue = self.queue_for(identity);
        queue.waiting.lock().expect("queue lock").push_back(QueuedRequest {
            envelope,
            deadline,
            reply,
        });
        queue.notify.notify_one();
        tracing::debug!(identity = %identity, request = %id, "request enqueued");
        RequestHandle { id, deadline, rx }
    }

    /// Claim the oldest unexpired request for `identity`, if any. Expired
    /// entries encountered on the way are dropped and their awaiters told
    /// `TimedOut`.
    pub fn try_dequeue_for(&self, identity: &Thumbprint) -> Option<ClaimedRequest> {
        let queue = self.lookup(identity)?;
        let mut waiting = queue.waiting.lock().expect("queue lock");
        let now = Instant::now();
        while let Some(request) = waiting.pop_front() {
            if request.deadline <= now {
                let _ = request.reply.send(Err(TransportError::TimedOut));
                continue;
            }
            return Some(ClaimedRequest {
                envelope: request.envelope,
                deadline: request.deadline,
                reply: request.reply,
            });
        }
        None
    }

    /// Wait until a request for `identity` can be claimed, or `cancel` fires.
    /// Tracks the identity: callers are channel maintainers for configured
    /// endpoints or inbound peers already vetted with [`is_known`].
    ///
    /// [`is_known`]: PendingRequests::is_known
    pub async fn next_for(
        &self,
        identity: &Thumbprint,
        cancel: &CancellationToken,
    ) -> Option<ClaimedRequest> {
        loop {
            let queue = self.queue_for(identity);
            let notified = queue.notify.notified();
            if let Some(claimed) = self.try_dequeue_for(identity) {
                return Some(claimed);
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = notified => {}
            }
        }
    }

    /// Fail every queued request for `identity` with `error`. Used when the
    /// peer's identity check fails: retrying cannot help, so every waiter
    /// learns immediately.
    pub fn fail_all(&self, identity: &Thumbprint, error: &TransportError) {
        let Some(queue) = self.lookup(identity) else {
            return;
        };
        let drained: Vec<QueuedRequest> = {
            let mut waiting = queue.waiting.lock().expect("queue lock");
            waiting.drain(..).collect()
        };
        for request in drained {
            let _ = request.reply.send(Err(error.clone()));
        }
    }

    /// Number of requests still waiting for `identity`.
    pub fn waiting_for(&self, identity: &Thumbprint) -> usize {
        self.queues
            .get(identity)
            .map(|q| q.waiting.lock().expect("queue lock").len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grapple_proto::ScriptState;
    use std::time::Duration;

    fn identity() -> Thumbprint {
        Thumbprint::of_cert_der(b"test-agent")
    }

    fn poll_body(run: &str) -> RequestBody {
        RequestBody::ScriptStatus {
            run_id: run.to_string(),
            after_cursor: 0,
        }
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(30)
    }

    #[tokio::test]
    async fn enqueue_then_dequeue_yields_same_request() {
        let pending = PendingRequests::new();
        let handle = pending.enqueue(&identity(), poll_body("r1"), far_deadline());
        let claimed = pending.try_dequeue_for(&identity()).unwrap();
        assert_eq!(claimed.id(), &handle.id);
        assert!(pending.try_dequeue_for(&identity()).is_none());
    }

    #[tokio::test]
    async fn claims_are_fifo_per_identity() {
        let pending = PendingRequests::new();
        let first = pending.enqueue(&identity(), poll_body("r1"), far_deadline());
        let second = pending.enqueue(&identity(), poll_body("r2"), far_deadline());
        assert_eq!(pending.try_dequeue_for(&identity()).unwrap().id(), &first.id);
        assert_eq!(pending.try_dequeue_for(&identity()).unwrap().id(), &second.id);
    }

    #[tokio::test]
    async fn second_claimant_never_sees_a_claimed_request() {
        let pending = Arc::new(PendingRequests::new());
        let _handle = pending.enqueue(&identity(), poll_body("r1"), far_deadline());
        let claims: Vec<bool> = (0..2)
            .map(|_| pending.try_dequeue_for(&identity()).is_some())
            .collect();
        assert_eq!(claims.iter().filter(|&&got| got).count(), 1);
    }

    #[tokio::test]
    async fn fulfilled_request_resolves_awaiter() {
        let pending = PendingRequests::new();
        let handle = pending.enqueue(&identity(), poll_body("r1"), far_deadline());
        let claimed = pending.try_dequeue_for(&identity()).unwrap();
        claimed.fulfill(Ok(ResponseBody::Status(grapple_proto::StatusUpdate {
            run_id: "r1".to_string(),
            state: ScriptState::Running,
            next_cursor: 0,
            log_chunk: String::new(),
            exit_code: None,
        })));
        let cancel = CancellationToken::new();
        let outcome = handle.await_result(&cancel).await.unwrap();
        assert!(matches!(outcome, ResponseBody::Status(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn unclaimed_request_times_out_at_deadline() {
        let pending = PendingRequests::new();
        let deadline = Instant::now() + Duration::from_millis(100);
        let handle = pending.enqueue(&identity(), poll_body("r1"), deadline);
        let cancel = CancellationToken::new();
        let err = handle.await_result(&cancel).await.unwrap_err();
        assert!(matches!(err, TransportError::TimedOut));
        // The entry is purged on the next claim attempt.
        assert!(pending.try_dequeue_for(&identity()).is_none());
        assert_eq!(pending.waiting_for(&identity()), 0);
    }

    #[tokio::test]
    async fn abandoned_claim_reports_network_error() {
        let pending = PendingRequests::new();
        let handle = pending.enqueue(&identity(), poll_body("r1"), far_deadline());
        let claimed = pending.try_dequeue_for(&identity()).unwrap();
        drop(claimed); // deliverer disappears before responding
        let cancel = CancellationToken::new();
        let err = handle.await_result(&cancel).await.unwrap_err();
        assert!(matches!(err, TransportError::Network(_)));
    }

    #[tokio::test]
    async fn cancellation_wins_over_waiting() {
        let pending = PendingRequests::new();
        let handle = pending.enqueue(&identity(), poll_body("r1"), far_deadline());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = handle.await_result(&cancel).await.unwrap_err();
        assert!(matches!(err, TransportError::Cancelled));
    }

    #[tokio::test]
    async fn next_for_wakes_on_enqueue() {
        let pending = Arc::new(PendingRequests::new());
        let cancel = CancellationToken::new();
        let waiter = {
            let pending = pending.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { pending.next_for(&identity(), &cancel).await })
        };
        tokio::task::yield_now().await;
        let handle = pending.enqueue(&identity(), poll_body("r1"), far_deadline());
        let claimed = waiter.await.unwrap().unwrap();
        assert_eq!(claimed.id(), &handle.id);
    }

    #[tokio::test]
    async fn fail_all_drains_the_queue() {
        let pending = PendingRequests::new();
        let handle = pending.enqueue(&identity(), poll_body("r1"), far_deadline());
        pending.fail_all(
            &identity(),
            &TransportError::Authentication("thumbprint mismatch".to_string()),
        );
        let cancel = CancellationToken::new();
        let err = handle.await_result(&cancel).await.unwrap_err();
        assert!(matches!(err, TransportError::Authentication(_)));
        assert_eq!(pending.waiting_for(&identity()), 0);
    }

    #[tokio::test]
    async fn read_paths_never_track_new_identities() {
        let pending = PendingRequests::new();
        // A flood of claim attempts from identities nobody queued work for
        // must leave no trace in the map.
        for i in 0..1000 {
            let stranger = Thumbprint::of_cert_der(format!("stranger-{i}").as_bytes());
            assert!(pending.try_dequeue_for(&stranger).is_none());
            pending.fail_all(&stranger, &TransportError::TimedOut);
            assert_eq!(pending.waiting_for(&stranger), 0);
            assert!(!pending.is_known(&stranger));
        }
        assert_eq!(pending.tracked_identities(), 0);

        let _handle = pending.enqueue(&identity(), poll_body("r1"), far_deadline());
        assert!(pending.is_known(&identity()));
        assert_eq!(pending.tracked_identities(), 1);
    }

    #[tokio::test]
    async fn no_ordering_across_identities() {
        let pending = PendingRequests::new();
        let other = Thumbprint::of_cert_der(b"other-agent");
        pending.enqueue(&identity(), poll_body("r1"), far_deadline());
        pending.enqueue(&other, poll_body("r2"), far_deadline());
        // A claim for one identity never observes the other's queue.
        assert!(pending.try_dequeue_for(&other).is_some());
        assert!(pending.try_dequeue_for(&other).is_none());
        assert!(pending.try_dequeue_for(&identity()).is_some());
    }
}
