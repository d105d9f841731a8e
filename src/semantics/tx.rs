//! Deferred transactional work.
//!
//! Under `tx.select`, routing and acknowledgement stop taking effect
//! immediately: each becomes an operation enlisted in the session's
//! [`TxBuffer`]. Completion is two-phase: every operation votes in
//! `prepare` (journal writes happen here), then the buffer commits or
//! rolls back as a unit.

use std::sync::Arc;

use crate::broker::{Deliverable, MessageStore, Queue};
use crate::protocol::message::MessageRef;
use crate::semantics::delivery::DeliveryRecord;

/// One deferred operation inside a transaction.
pub trait TxOp: Send {
    /// Vote on whether the operation can commit; journal writes land here.
    fn prepare(&mut self, store: Option<&Arc<dyn MessageStore>>) -> bool;

    fn commit(&mut self);

    fn rollback(&mut self);
}

/// Ordered list of deferred operations with two-phase completion.
#[derive(Default)]
pub struct TxBuffer {
    ops: Vec<Box<dyn TxOp>>,
}

impl TxBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enlist(&mut self, op: Box<dyn TxOp>) {
        self.ops.push(op);
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// First phase: all operations must vote yes.
    pub fn prepare(&mut self, store: Option<&Arc<dyn MessageStore>>) -> bool {
        self.ops.iter_mut().all(|op| op.prepare(store))
    }

    pub fn commit(&mut self) {
        for op in &mut self.ops {
            op.commit();
        }
        self.ops.clear();
    }

    pub fn rollback(&mut self) {
        for op in &mut self.ops {
            op.rollback();
        }
        self.ops.clear();
    }

    /// Single-session commit: prepare, then commit or roll back. Returns
    /// whether the transaction committed.
    pub fn commit_local(&mut self, store: Option<&Arc<dyn MessageStore>>) -> bool {
        if self.prepare(store) {
            if let Some(store) = store {
                store.commit(None);
            }
            self.commit();
            true
        } else {
            if let Some(store) = store {
                store.abort(None);
            }
            self.rollback();
            false
        }
    }
}

/// Routing deferred by a transaction: the exchange resolved its queues, the
/// enqueue waits for commit.
pub struct TxPublish {
    message: MessageRef,
    queues: Vec<Arc<dyn Queue>>,
}

impl TxPublish {
    pub fn new(message: MessageRef) -> Self {
        Self {
            message,
            queues: Vec::new(),
        }
    }

    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }
}

impl Deliverable for TxPublish {
    fn deliver_to(&mut self, queue: Arc<dyn Queue>) {
        self.queues.push(queue);
    }
}

impl TxOp for TxPublish {
    fn prepare(&mut self, store: Option<&Arc<dyn MessageStore>>) -> bool {
        if self.message.is_durable() {
            if let Some(store) = store {
                for queue in &self.queues {
                    // the transfer command already completed; the journal
                    // write is covered by the transaction record
                    store.enqueue(&self.message, queue.name(), Box::new(|| {}));
                }
            }
        }
        true
    }

    fn commit(&mut self) {
        for queue in &self.queues {
            queue.enqueue(self.message.clone());
            queue.dispatch();
        }
    }

    fn rollback(&mut self) {
        // never enqueued; dropping the reference is enough
    }
}

/// Acknowledgement deferred by a transaction. The records were pulled out
/// of the unacked list when the client accepted; the queue-side dequeue
/// waits for commit, rollback puts the messages back redelivered.
pub struct TxAccept {
    records: Vec<DeliveryRecord>,
}

impl TxAccept {
    pub fn new(records: Vec<DeliveryRecord>) -> Self {
        Self { records }
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }
}

impl TxOp for TxAccept {
    fn prepare(&mut self, store: Option<&Arc<dyn MessageStore>>) -> bool {
        for record in &self.records {
            record.journal_dequeue(store);
        }
        true
    }

    fn commit(&mut self) {
        for record in &mut self.records {
            record.finalize_dequeue();
        }
        self.records.clear();
    }

    fn rollback(&mut self) {
        for record in self.records.drain(..) {
            record.release(true);
        }
    }
}
