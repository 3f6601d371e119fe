//! Outbound dispatching.
//!
//! Holds the FIFO of messages waiting for the wire and the path-keyed patch
//! buffer. A flush drains the queue completely before a patch batch may go
//! out, so a patch never overtakes the message that created what it mutates.

use crate::correlator::Correlator;
use crate::error::Result;
use crate::message::{OutboundMessage, Request};
use crate::transport::SessionWriter;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, warn};

/// Ordered messages awaiting transmission.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    messages: VecDeque<OutboundMessage>,
}

impl OutboundQueue {
    pub fn push(&mut self, message: OutboundMessage) {
        self.messages.push_back(message);
    }

    /// Put messages ahead of everything already queued, keeping their order.
    pub fn push_front_all(&mut self, messages: Vec<OutboundMessage>) {
        for message in messages.into_iter().rev() {
            self.messages.push_front(message);
        }
    }

    pub fn front(&self) -> Option<&OutboundMessage> {
        self.messages.front()
    }

    pub fn pop_front(&mut self) -> Option<OutboundMessage> {
        self.messages.pop_front()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Immutable copy of the patch buffer taken for one batch.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PatchSnapshot(BTreeMap<String, Value>);

impl PatchSnapshot {
    pub fn get(&self, path: &str) -> Option<&Value> {
        self.0.get(path)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Flat `path -> value` object sent as the single `patchJob` argument.
    pub fn to_value(&self) -> Value {
        Value::Object(
            self.0
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<Map<String, Value>>(),
        )
    }
}

/// Latest value per dotted state path.
#[derive(Debug, Default)]
pub struct PatchSet {
    entries: BTreeMap<String, Value>,
}

impl PatchSet {
    /// Record a value; a later write to the same path replaces it.
    pub fn set(&mut self, path: impl Into<String>, value: Value) {
        self.entries.insert(path.into(), value);
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        self.entries.get(path)
    }

    pub fn snapshot(&self) -> PatchSnapshot {
        PatchSnapshot(self.entries.clone())
    }

    /// Drop every entry whose current value still equals the acknowledged one.
    ///
    /// Returns the number of entries removed.
    pub fn acknowledge(&mut self, snapshot: &PatchSnapshot) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|path, value| snapshot.get(path) != Some(value));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PatchState {
    Idle,
    /// A batch was sent under this id and awaits its acknowledgment.
    InFlight(u64),
    /// The service rejected a batch; no more batches this session.
    Disabled,
}

/// Queue, patch buffer and the patch flushing policy of one client.
#[derive(Debug)]
pub struct Dispatcher {
    queue: OutboundQueue,
    patches: PatchSet,
    patch_state: PatchState,
    action_timeout_secs: u64,
}

impl Dispatcher {
    pub fn new(action_timeout_secs: u64) -> Self {
        Self {
            queue: OutboundQueue::default(),
            patches: PatchSet::default(),
            patch_state: PatchState::Idle,
            action_timeout_secs,
        }
    }

    pub fn enqueue(&mut self, message: OutboundMessage) {
        self.queue.push(message);
    }

    pub fn enqueue_front(&mut self, messages: Vec<OutboundMessage>) {
        self.queue.push_front_all(messages);
    }

    pub fn patch(&mut self, path: impl Into<String>, value: Value) {
        self.patches.set(path, value);
    }

    pub fn queue(&self) -> &OutboundQueue {
        &self.queue
    }

    pub fn patches(&self) -> &PatchSet {
        &self.patches
    }

    pub fn patching_enabled(&self) -> bool {
        self.patch_state != PatchState::Disabled
    }

    /// Nothing left that this session can still deliver.
    pub fn is_drained(&self) -> bool {
        self.queue.is_empty()
            && (self.patches.is_empty() || self.patch_state == PatchState::Disabled)
    }

    /// Snapshot to send next, if a batch may go out now.
    fn next_patch_batch(&self) -> Option<PatchSnapshot> {
        if self.patch_state != PatchState::Idle || !self.queue.is_empty() || self.patches.is_empty()
        {
            return None;
        }
        Some(self.patches.snapshot())
    }

    /// The batch sent under `id` was acknowledged.
    pub fn patch_acknowledged(&mut self, id: u64, snapshot: &PatchSnapshot) {
        if self.patch_state == PatchState::InFlight(id) {
            self.patch_state = PatchState::Idle;
        }
        let removed = self.patches.acknowledge(snapshot);
        debug!(
            "Patch batch {} acknowledged: {} of {} paths settled",
            id,
            removed,
            snapshot.len()
        );
    }

    /// The service answered a batch with an error.
    pub fn patch_failed(&mut self, id: u64, message: &str) {
        warn!(
            "Patching failed ({}). Syncing job data disabled for this session.",
            message
        );
        debug!("Failed patch batch id {}", id);
        self.patch_state = PatchState::Disabled;
    }

    /// Forget per-session patch state before a new session starts.
    ///
    /// Returns the id of a batch that was still in flight; its entries stay in
    /// the buffer and will be sent again.
    pub fn reset_session(&mut self) -> Option<u64> {
        let in_flight = match self.patch_state {
            PatchState::InFlight(id) => Some(id),
            _ => None,
        };
        self.patch_state = PatchState::Idle;
        in_flight
    }

    /// Drain the queue onto the wire, then send one patch batch if allowed.
    ///
    /// A send failure stops the flush and leaves the failed message at the head
    /// of the queue. `pending` turns the batch snapshot into whatever the
    /// correlator stores for the `patchJob` call.
    pub async fn flush<P>(
        &mut self,
        writer: &mut SessionWriter,
        correlator: &mut Correlator<P>,
        pending: impl FnOnce(PatchSnapshot) -> P,
    ) -> Result<()> {
        while let Some(message) = self.queue.front() {
            let bytes = match message.encode() {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Dropping unencodable message {}: {}", message.id, e);
                    self.queue.pop_front();
                    continue;
                }
            };
            writer.send(&bytes).await?;
            self.queue.pop_front();
        }

        if let Some(snapshot) = self.next_patch_batch() {
            let request = Request::action(
                "job",
                "patchJob",
                vec![snapshot.to_value()],
                self.action_timeout_secs,
            );
            let paths = snapshot.len();
            let id = correlator.register_call(pending(snapshot));
            let bytes = request.into_message(id).encode()?;
            if let Err(e) = writer.send(&bytes).await {
                correlator.take_pending(id);
                return Err(e);
            }
            self.patch_state = PatchState::InFlight(id);
            debug!("Sent patch batch {} with {} paths", id, paths);
        }

        Ok(())
    }
}
