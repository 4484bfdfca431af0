//! Request/reply correlation for one channel endpoint
//!
//! Every outgoing request is tagged with a correlation id that is unique among
//! the endpoint's outstanding requests. A reply carrying the same id settles
//! the waiting receiver exactly once: resolving, rejecting and expiring all
//! remove the entry, so a late second settlement finds nothing to settle.
//!
//! The correlator never runs timers itself. `arm_timeout` spawns a sleeper that
//! posts a caller-chosen message back into the owner's mailbox; the owner then
//! calls [`Correlator::expire`]. This keeps every mutation on the owning task.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::BrokerError;

/// Per-endpoint request identifier
pub type CorrelationId = u64;

/// Receiver side of a correlated request
pub type ReplyReceiver<T> = oneshot::Receiver<Result<T, BrokerError>>;

/// An outstanding request awaiting its reply
#[derive(Debug)]
pub struct PendingRequest<T> {
    pub correlation_id: CorrelationId,
    pub created_at: Instant,
    timeout: Option<Duration>,
    timer: Option<AbortHandle>,
    reply_tx: oneshot::Sender<Result<T, BrokerError>>,
}

impl<T> PendingRequest<T> {
    fn settle(mut self, result: Result<T, BrokerError>) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        // The requester may have stopped waiting
        let _ = self.reply_tx.send(result);
    }
}

/// Map of outstanding requests keyed by correlation id
#[derive(Debug)]
pub struct Correlator<T> {
    pending: HashMap<CorrelationId, PendingRequest<T>>,
    next_id: CorrelationId,
}

impl<T> Default for Correlator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Correlator<T> {
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
            next_id: 0,
        }
    }

    /// Allocate a fresh correlation id and record a pending request for it
    ///
    /// The caller transmits the request itself, tagged with the returned id.
    pub fn begin(&mut self) -> (CorrelationId, ReplyReceiver<T>) {
        let mut id = self.next_id;
        while self.pending.contains_key(&id) {
            id = id.wrapping_add(1);
        }
        self.next_id = id.wrapping_add(1);

        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.insert(
            id,
            PendingRequest {
                correlation_id: id,
                created_at: Instant::now(),
                timeout: None,
                timer: None,
                reply_tx,
            },
        );
        debug!(correlation_id = id, "Correlator::begin: pending request recorded");
        (id, reply_rx)
    }

    /// Schedule `expired` to be posted to `notify` once `timeout` elapses
    ///
    /// Returns false if `id` is not pending.
    pub fn arm_timeout<M>(&mut self, id: CorrelationId, timeout: Duration, notify: mpsc::Sender<M>, expired: M) -> bool
    where
        M: Send + 'static,
    {
        let Some(pending) = self.pending.get_mut(&id) else {
            return false;
        };

        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = notify.send(expired).await;
        });

        if let Some(previous) = pending.timer.replace(task.abort_handle()) {
            previous.abort();
        }
        pending.timeout = Some(timeout);
        true
    }

    /// Settle a pending request with its reply
    ///
    /// Returns false if no request with this id is outstanding.
    pub fn resolve(&mut self, id: CorrelationId, value: T) -> bool {
        match self.pending.remove(&id) {
            Some(pending) => {
                debug!(correlation_id = id, "Correlator::resolve: settled");
                pending.settle(Ok(value));
                true
            }
            None => {
                debug!(correlation_id = id, "Correlator::resolve: no pending request");
                false
            }
        }
    }

    /// Settle a pending request with an error
    pub fn reject(&mut self, id: CorrelationId, error: BrokerError) -> bool {
        match self.pending.remove(&id) {
            Some(pending) => {
                debug!(correlation_id = id, %error, "Correlator::reject: settled");
                pending.settle(Err(error));
                true
            }
            None => false,
        }
    }

    /// Reject a request whose timer fired
    ///
    /// A no-op if the reply won the race and already settled it.
    pub fn expire(&mut self, id: CorrelationId) -> bool {
        match self.pending.remove(&id) {
            Some(pending) => {
                let timeout = pending.timeout.unwrap_or_default();
                warn!(correlation_id = pending.correlation_id, ?timeout, "Request timed out");
                pending.settle(Err(BrokerError::RequestTimeout(timeout)));
                true
            }
            None => false,
        }
    }

    /// Reject every outstanding request, returning how many were settled
    pub fn reject_all(&mut self, error: BrokerError) -> usize {
        let count = self.pending.len();
        for (_, pending) in self.pending.drain() {
            pending.settle(Err(error.clone()));
        }
        if count > 0 {
            debug!(count, %error, "Correlator::reject_all: settled");
        }
        count
    }

    /// How long the oldest outstanding request has been waiting
    pub fn oldest_age(&self) -> Option<Duration> {
        self.pending.values().map(|p| p.created_at.elapsed()).max()
    }

    pub fn contains(&self, id: CorrelationId) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl<T> Drop for Correlator<T> {
    fn drop(&mut self) {
        for pending in self.pending.values_mut() {
            if let Some(timer) = pending.timer.take() {
                timer.abort();
            }
        }
    }
}
