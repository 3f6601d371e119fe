//! Message correlation.
//!
//! Assigns process-local message ids and routes inbound frames back to whoever
//! is waiting on them: a single-shot pending call, or a long-lived subscription.
//! Both share one id space. The correlator is owned by the worker and is never
//! shared, so nothing in here locks.

use crate::message::{Inbound, Request};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// What a subscription wants after handling one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Keep,
    /// Deregister the subscription.
    Dispose,
}

/// Handle used by subscription handlers to queue fire-and-forget messages.
///
/// Messages sent through it are picked up by the worker, assigned an id and
/// appended to the outbound queue in the order they were sent.
///
/// Work that will produce a reply later holds an [`InFlight`] guard until the
/// reply has been sent, so the worker can tell when nothing is outstanding.
#[derive(Debug, Clone)]
pub struct ReplySender {
    tx: mpsc::UnboundedSender<Request>,
    in_flight: Arc<AtomicUsize>,
}

impl ReplySender {
    pub fn new(tx: mpsc::UnboundedSender<Request>) -> Self {
        Self {
            tx,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Queue a message. Returns false once the worker is gone.
    pub fn send(&self, request: Request) -> bool {
        self.tx.send(request).is_ok()
    }

    /// Mark a reply as owed until the returned guard is dropped.
    pub fn track(&self) -> InFlight {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlight(self.in_flight.clone())
    }

    /// No tracked reply is outstanding.
    pub fn is_idle(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) == 0
    }
}

/// A reply still owed through a [`ReplySender`].
#[derive(Debug)]
pub struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Receiver of every inbound message bearing a subscription's id.
///
/// Handlers run on the worker, one message at a time, in arrival order.
pub trait SubscriptionHandler: Send {
    fn on_message(&mut self, message: Inbound, replies: &ReplySender) -> Disposition;

    /// Request to send again under the same id after a reconnect, if any.
    fn resubscribe_request(&self) -> Option<Request> {
        None
    }

    /// The client is closing for good and this subscription will see no more messages.
    fn on_close(&mut self) {}
}

/// Outcome of routing one inbound message.
#[derive(Debug)]
pub enum Routed<P> {
    /// A pending call was resolved and removed.
    Resolved(P, Inbound),
    /// Subscription `id` handled the message.
    Delivered { id: u64, disposed: bool },
    /// Nobody was waiting for this id; the message was dropped.
    Unmatched(u64),
}

/// Id allocator plus the pending-call and subscription tables.
///
/// `P` is whatever the owner needs to finish a call once its response arrives.
pub struct Correlator<P> {
    last_id: u64,
    pending: HashMap<u64, P>,
    subscriptions: HashMap<u64, Box<dyn SubscriptionHandler>>,
}

impl<P> Default for Correlator<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> Correlator<P> {
    pub fn new() -> Self {
        Self {
            last_id: 0,
            pending: HashMap::new(),
            subscriptions: HashMap::new(),
        }
    }

    /// Next id; strictly increasing, never zero, never reused.
    pub fn next_id(&mut self) -> u64 {
        self.last_id += 1;
        self.last_id
    }

    /// Allocate an id for a call and remember how to complete it.
    pub fn register_call(&mut self, pending: P) -> u64 {
        let id = self.next_id();
        self.pending.insert(id, pending);
        id
    }

    /// Allocate an id for a subscription.
    pub fn subscribe(&mut self, handler: Box<dyn SubscriptionHandler>) -> u64 {
        let id = self.next_id();
        self.subscriptions.insert(id, handler);
        id
    }

    pub fn unsubscribe(&mut self, id: u64) -> bool {
        self.subscriptions.remove(&id).is_some()
    }

    /// Remove a pending call without resolving it through a response.
    pub fn take_pending(&mut self, id: u64) -> Option<P> {
        self.pending.remove(&id)
    }

    /// Route an inbound message.
    ///
    /// Pending calls win over subscriptions and are removed the moment they
    /// resolve; subscriptions stay until their handler disposes them.
    pub fn route(&mut self, message: Inbound, replies: &ReplySender) -> Routed<P> {
        let id = message.id;

        if let Some(pending) = self.pending.remove(&id) {
            return Routed::Resolved(pending, message);
        }

        if let Some(handler) = self.subscriptions.get_mut(&id) {
            let disposed = handler.on_message(message, replies) == Disposition::Dispose;
            if disposed {
                self.subscriptions.remove(&id);
                debug!("Subscription {} disposed", id);
            }
            return Routed::Delivered { id, disposed };
        }

        debug!("Discarding message with unexpected id {}", id);
        Routed::Unmatched(id)
    }

    /// Requests that re-establish live subscriptions on a new session, in id order.
    pub fn resubscribe_requests(&self) -> Vec<(u64, Request)> {
        let mut requests: Vec<(u64, Request)> = self
            .subscriptions
            .iter()
            .filter_map(|(id, handler)| handler.resubscribe_request().map(|r| (*id, r)))
            .collect();
        requests.sort_by_key(|(id, _)| *id);
        requests
    }

    /// Empty the pending table, handing every unresolved call back to the owner.
    pub fn drain_pending(&mut self) -> Vec<P> {
        let mut entries: Vec<(u64, P)> = self.pending.drain().collect();
        entries.sort_by_key(|(id, _)| *id);
        entries.into_iter().map(|(_, p)| p).collect()
    }

    /// Notify and drop every subscription.
    pub fn close_subscriptions(&mut self) {
        for (_, mut handler) in self.subscriptions.drain() {
            handler.on_close();
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn subscription_len(&self) -> usize {
        self.subscriptions.len()
    }
}
