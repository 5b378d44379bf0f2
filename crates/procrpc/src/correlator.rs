//! Call correlator - id allocation and the pending-call map.
//!
//! Results may arrive in any order, so outstanding calls are keyed by id
//! rather than queued. Each entry is removed exactly once: by the matching
//! result, or by the caller when the send itself failed.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::bridge::protocol::CallId;
use crate::error::RpcError;
use crate::remote_error::RemoteError;

type Outcome = std::result::Result<Value, RemoteError>;

#[derive(Default)]
pub struct Correlator {
    next_id: AtomicU64,
    pending: DashMap<CallId, oneshot::Sender<Outcome>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an id that is not currently pending and record the call.
    pub fn begin(&self) -> (CallId, PendingCall) {
        let (tx, rx) = oneshot::channel();
        loop {
            let id = CallId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
            if let Entry::Vacant(entry) = self.pending.entry(id) {
                entry.insert(tx);
                return (id, PendingCall { id, rx });
            }
            tracing::trace!(call_id = %id, "Call id still pending, skipping");
        }
    }

    /// Drop a pending entry without resolving it (the call never left).
    pub fn abandon(&self, id: CallId) -> bool {
        self.pending.remove(&id).is_some()
    }

    /// Deliver the outcome for `id`. Returns false if nothing was pending.
    pub fn resolve(&self, id: CallId, outcome: Outcome) -> bool {
        let Some((_, tx)) = self.pending.remove(&id) else {
            return false;
        };
        if tx.send(outcome).is_err() {
            tracing::debug!(call_id = %id, "Caller dropped before result arrived");
        }
        true
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, id: CallId) -> bool {
        self.pending.contains_key(&id)
    }

    #[cfg(test)]
    fn starting_at(next: u64) -> Self {
        Self {
            next_id: AtomicU64::new(next),
            pending: DashMap::new(),
        }
    }
}

/// Resolves once with the peer's result for one call.
///
/// Dropping it does not cancel the call; the eventual result is discarded.
#[must_use = "the result of a call is only observable by awaiting it"]
#[derive(Debug)]
pub struct PendingCall {
    id: CallId,
    rx: oneshot::Receiver<Outcome>,
}

impl PendingCall {
    pub fn id(&self) -> CallId {
        self.id
    }
}

impl Future for PendingCall {
    type Output = std::result::Result<Value, RpcError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(Ok(value))) => Poll::Ready(Ok(value)),
            Poll::Ready(Ok(Err(remote))) => Poll::Ready(Err(RpcError::Remote(remote))),
            Poll::Ready(Err(_)) => Poll::Ready(Err(RpcError::ChannelClosed)),
            Poll::Pending => Poll::Pending,
        }
    }
}
