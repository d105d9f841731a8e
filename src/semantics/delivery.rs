//! Bookkeeping for messages delivered but not yet settled.
//!
//! Every transfer sent to a consumer (or pulled synchronously) produces a
//! [`DeliveryRecord`]. Records live in the session's [`UnackList`] until the
//! peer settles them: accept drops them, release puts the message back on
//! the queue, reject discards it. Range operations resolve the contiguous
//! span of records whose delivery-ids fall inside a closed interval; ids
//! that match no record are ignored, which makes re-settlement idempotent.

use std::ops::Range;
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::Mutex;

use crate::broker::{MessageStore, Queue, QueuedMessage};
use crate::protocol::message::MessageRef;
use crate::protocol::sequence::SequenceNumber;

/// Sender-assigned id of an outbound transfer.
pub type DeliveryId = SequenceNumber;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeliveryFlags: u8 {
        /// The receiver owns the message (may accept or reject it).
        const ACQUIRED = 1;
        const ACCEPTED = 1 << 1;
        /// Settled; kept only until removal.
        const ENDED = 1 << 2;
        /// Credit is restored when this record settles.
        const WINDOWING = 1 << 3;
        /// A message-unit of credit was charged for this delivery.
        const MSG_CHARGED = 1 << 4;
        const REDELIVERED = 1 << 5;
    }
}

pub struct DeliveryRecord {
    id: DeliveryId,
    tag: String,
    queue: Arc<dyn Queue>,
    queued: QueuedMessage,
    ack_expected: bool,
    flags: DeliveryFlags,
    byte_charge: u32,
}

impl DeliveryRecord {
    pub fn new(
        id: DeliveryId,
        tag: impl Into<String>,
        queue: Arc<dyn Queue>,
        queued: QueuedMessage,
        ack_expected: bool,
        flags: DeliveryFlags,
        byte_charge: u32,
    ) -> Self {
        Self {
            id,
            tag: tag.into(),
            queue,
            queued,
            ack_expected,
            flags,
            byte_charge,
        }
    }

    pub fn id(&self) -> DeliveryId {
        self.id
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn queue(&self) -> &Arc<dyn Queue> {
        &self.queue
    }

    pub fn message(&self) -> &MessageRef {
        &self.queued.message
    }

    pub fn ack_expected(&self) -> bool {
        self.ack_expected
    }

    pub fn is_acquired(&self) -> bool {
        self.flags.contains(DeliveryFlags::ACQUIRED)
    }

    pub fn is_accepted(&self) -> bool {
        self.flags.contains(DeliveryFlags::ACCEPTED)
    }

    pub fn is_ended(&self) -> bool {
        self.flags.contains(DeliveryFlags::ENDED)
    }

    pub fn is_windowing(&self) -> bool {
        self.flags.contains(DeliveryFlags::WINDOWING)
    }

    pub fn is_redelivered(&self) -> bool {
        self.flags.contains(DeliveryFlags::REDELIVERED)
    }

    /// Credit charged at delivery: (message unit charged, bytes charged).
    pub fn charge(&self) -> (bool, u32) {
        (
            self.flags.contains(DeliveryFlags::MSG_CHARGED),
            self.byte_charge,
        )
    }

    pub fn mark_redelivered(&mut self) {
        self.flags.insert(DeliveryFlags::REDELIVERED);
        self.queued.message.mark_redelivered();
    }

    /// Re-emission under `recover`: the record keeps its place in the list
    /// but carries the id of the fresh transfer.
    pub fn set_id(&mut self, id: DeliveryId) {
        self.id = id;
    }

    pub fn queued(&self) -> &QueuedMessage {
        &self.queued
    }

    /// Take ownership of the message for the receiver.
    pub fn acquire(&mut self) -> bool {
        if self.is_acquired() {
            return false;
        }
        if self.queue.acquire(&self.queued) {
            self.flags.insert(DeliveryFlags::ACQUIRED);
            true
        } else {
            false
        }
    }

    /// Journal the dequeue for a durable message (prepare phase of accept).
    pub fn journal_dequeue(&self, store: Option<&Arc<dyn MessageStore>>) {
        if self.queued.message.is_durable() {
            if let Some(store) = store {
                store.dequeue(&self.queued.message, self.queue.name());
            }
        }
    }

    /// Finalize the accept: remove the acquired message from the queue.
    pub fn accept(&mut self, store: Option<&Arc<dyn MessageStore>>) {
        if self.is_ended() {
            return;
        }
        self.journal_dequeue(store);
        self.queue.dequeue(&self.queued);
        self.flags
            .insert(DeliveryFlags::ACCEPTED | DeliveryFlags::ENDED);
    }

    /// Queue-side removal alone, for accepts whose journal write already
    /// happened in a transaction's prepare phase.
    pub fn finalize_dequeue(&mut self) {
        if self.is_ended() {
            return;
        }
        self.queue.dequeue(&self.queued);
        self.flags
            .insert(DeliveryFlags::ACCEPTED | DeliveryFlags::ENDED);
    }

    /// Give the message back to its queue.
    pub fn release(mut self, set_redelivered: bool) {
        if set_redelivered {
            self.mark_redelivered();
        }
        self.queue.requeue(self.queued.clone());
    }

    /// Discard the message. Dead-lettering is the queue's concern.
    pub fn reject(&mut self, store: Option<&Arc<dyn MessageStore>>) {
        if self.is_ended() {
            return;
        }
        self.journal_dequeue(store);
        self.queue.dequeue(&self.queued);
        self.flags.insert(DeliveryFlags::ENDED);
    }

    pub fn mark_ended(&mut self) {
        self.flags.insert(DeliveryFlags::ENDED);
    }
}

/// Insertion-ordered list of unsettled deliveries for one session.
///
/// Delivery-ids are strictly increasing; records for a single consumer may
/// be interleaved with records for others.
#[derive(Default)]
pub struct UnackList {
    records: Vec<DeliveryRecord>,
}

/// Shared handle: consumer slots append during queue dispatch while the
/// semantic state settles ranges.
pub type SharedUnacked = Arc<Mutex<UnackList>>;

impl UnackList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: DeliveryRecord) {
        debug_assert!(
            self.records.last().is_none_or(|last| last.id() < record.id()),
            "delivery ids must be strictly increasing"
        );
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeliveryRecord> {
        self.records.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut DeliveryRecord> {
        self.records.iter_mut()
    }

    /// Indices of the contiguous span whose ids fall in `[first, last]`.
    pub fn span(&self, first: DeliveryId, last: DeliveryId) -> Range<usize> {
        let start = self
            .records
            .iter()
            .position(|r| r.id() >= first)
            .unwrap_or(self.records.len());
        let mut end = start;
        while end < self.records.len() && self.records[end].id() <= last {
            end += 1;
        }
        start..end
    }

    /// Remove and return the records in `[first, last]` matching `keep_out`.
    pub fn extract(
        &mut self,
        first: DeliveryId,
        last: DeliveryId,
        mut keep_out: impl FnMut(&DeliveryRecord) -> bool,
    ) -> Vec<DeliveryRecord> {
        let span = self.span(first, last);
        let mut taken = Vec::new();
        let mut idx = span.start;
        let mut remaining = span.end - span.start;
        while remaining > 0 {
            if keep_out(&self.records[idx]) {
                taken.push(self.records.remove(idx));
            } else {
                idx += 1;
            }
            remaining -= 1;
        }
        taken
    }

    /// Mutable view of the contiguous span whose ids fall in `[first, last]`.
    pub fn span_mut(&mut self, first: DeliveryId, last: DeliveryId) -> &mut [DeliveryRecord] {
        let range = self.span(first, last);
        &mut self.records[range]
    }

    /// Remove and return every record matching `pred`, preserving order.
    pub fn take_where(
        &mut self,
        mut pred: impl FnMut(&DeliveryRecord) -> bool,
    ) -> Vec<DeliveryRecord> {
        let mut taken = Vec::new();
        let mut idx = 0;
        while idx < self.records.len() {
            if pred(&self.records[idx]) {
                taken.push(self.records.remove(idx));
            } else {
                idx += 1;
            }
        }
        taken
    }

    pub fn drain_all(&mut self) -> Vec<DeliveryRecord> {
        std::mem::take(&mut self.records)
    }
}
