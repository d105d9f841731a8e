//! Per-subscription consumer state and credit accounting.
//!
//! A [`ConsumerSlot`] is shared between the semantic state (keyed by tag)
//! and the connection's output aggregation, so it is reference counted and
//! keeps its credit fields behind its own lock. Credit moves in two
//! disciplines: window mode restores credit when a delivery is accepted,
//! credit mode spends it permanently.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::broker::{Queue, QueuedMessage};
use crate::protocol::message::MessageRef;
use crate::semantics::delivery::{DeliveryFlags, DeliveryRecord, SharedUnacked};
use crate::session::outbound::SessionOutbound;

/// Sentinel for unbounded credit.
pub const INFINITE_CREDIT: u32 = u32::MAX;

struct CreditState {
    windowing: bool,
    msg_credit: u32,
    byte_credit: u32,
    /// Set when a delivery attempt was refused for lack of credit.
    blocked: bool,
    notify_enabled: bool,
}

pub struct ConsumerSlot {
    name: String,
    queue: Arc<dyn Queue>,
    ack_expected: bool,
    no_local: bool,
    acquire: bool,
    exclusive: bool,
    outbound: Arc<SessionOutbound>,
    unacked: SharedUnacked,
    credit: Mutex<CreditState>,
}

impl ConsumerSlot {
    pub fn new(
        name: impl Into<String>,
        queue: Arc<dyn Queue>,
        outbound: Arc<SessionOutbound>,
        unacked: SharedUnacked,
        ack_expected: bool,
        no_local: bool,
        acquire: bool,
        exclusive: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            queue,
            ack_expected,
            no_local,
            acquire,
            exclusive,
            outbound,
            unacked,
            credit: Mutex::new(CreditState {
                windowing: true,
                msg_credit: 0,
                byte_credit: 0,
                blocked: false,
                notify_enabled: true,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue(&self) -> &Arc<dyn Queue> {
        &self.queue
    }

    pub fn is_ack_expected(&self) -> bool {
        self.ack_expected
    }

    pub fn is_acquire(&self) -> bool {
        self.acquire
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    /// noLocal: refuse messages published on this session's own connection.
    pub fn filter(&self, message: &MessageRef) -> bool {
        !(self.no_local && message.is_local_to(self.outbound.local_connection()))
    }

    /// Attempt to deliver one queued message. Returns false when the slot
    /// has no credit for it (the slot marks itself blocked) or the session
    /// is detached.
    pub fn deliver(&self, msg: &QueuedMessage) -> bool {
        if !self.outbound.is_attached() {
            return false;
        }
        let size = msg.message.content_size();
        let (msg_charged, byte_charge, windowing) = {
            let mut credit = self.credit.lock();
            if credit.msg_credit == 0 {
                credit.blocked = true;
                return false;
            }
            if credit.byte_credit != INFINITE_CREDIT && credit.byte_credit < size {
                credit.blocked = true;
                return false;
            }
            let msg_charged = credit.msg_credit != INFINITE_CREDIT;
            if msg_charged {
                credit.msg_credit -= 1;
            }
            let byte_charge = if credit.byte_credit != INFINITE_CREDIT {
                credit.byte_credit -= size;
                size
            } else {
                0
            };
            (msg_charged, byte_charge, credit.windowing)
        };

        let redelivered = msg.message.is_redelivered();
        let id = self.outbound.deliver_transfer(&self.name, msg, redelivered);
        trace!(consumer = %self.name, delivery = %id, "delivered");

        if self.ack_expected || windowing {
            let mut flags = DeliveryFlags::empty();
            if self.acquire {
                flags.insert(DeliveryFlags::ACQUIRED);
            }
            if windowing {
                flags.insert(DeliveryFlags::WINDOWING);
            }
            if msg_charged {
                flags.insert(DeliveryFlags::MSG_CHARGED);
            }
            if redelivered {
                flags.insert(DeliveryFlags::REDELIVERED);
            }
            self.unacked.lock().push(DeliveryRecord::new(
                id,
                self.name.clone(),
                self.queue.clone(),
                msg.clone(),
                self.ack_expected,
                flags,
                byte_charge,
            ));
        } else if self.acquire {
            // nothing to wait for: the message is consumed outright
            self.queue.dequeue(msg);
        }
        true
    }

    pub fn set_window_mode(&self) {
        self.credit.lock().windowing = true;
    }

    pub fn set_credit_mode(&self) {
        self.credit.lock().windowing = false;
    }

    pub fn add_message_credit(&self, value: u32) {
        let mut credit = self.credit.lock();
        if value == INFINITE_CREDIT {
            credit.msg_credit = INFINITE_CREDIT;
        } else if credit.msg_credit != INFINITE_CREDIT {
            credit.msg_credit = credit.msg_credit.saturating_add(value);
        }
        credit.blocked = false;
    }

    pub fn add_byte_credit(&self, value: u32) {
        let mut credit = self.credit.lock();
        if value == INFINITE_CREDIT {
            credit.byte_credit = INFINITE_CREDIT;
        } else if credit.byte_credit != INFINITE_CREDIT {
            credit.byte_credit = credit.byte_credit.saturating_add(value);
        }
        credit.blocked = false;
    }

    /// Window-mode restoration when a delivery settles.
    pub fn restore_credit(&self, msg_charged: bool, bytes: u32) {
        let mut credit = self.credit.lock();
        if msg_charged && credit.msg_credit != INFINITE_CREDIT {
            credit.msg_credit = credit.msg_credit.saturating_add(1);
        }
        if bytes > 0 && credit.byte_credit != INFINITE_CREDIT {
            credit.byte_credit = credit.byte_credit.saturating_add(bytes);
        }
        credit.blocked = false;
    }

    /// Drain whatever the available credit covers, then spend the rest in
    /// credit mode.
    pub fn flush(&self) {
        while self.queue.dispatch() {}
        let mut credit = self.credit.lock();
        if !credit.windowing {
            credit.msg_credit = 0;
            credit.byte_credit = 0;
        }
    }

    /// Halt delivery by zeroing all credit.
    pub fn stop(&self) {
        let mut credit = self.credit.lock();
        credit.msg_credit = 0;
        credit.byte_credit = 0;
    }

    pub fn is_blocked(&self) -> bool {
        self.credit.lock().blocked
    }

    pub fn is_windowing(&self) -> bool {
        self.credit.lock().windowing
    }

    pub fn msg_credit(&self) -> u32 {
        self.credit.lock().msg_credit
    }

    pub fn byte_credit(&self) -> u32 {
        self.credit.lock().byte_credit
    }

    pub fn enable_notify(&self) {
        self.credit.lock().notify_enabled = true;
    }

    pub fn disable_notify(&self) {
        self.credit.lock().notify_enabled = false;
    }

    /// Wake the connection's output loop if this slot may produce output.
    pub fn notify(&self) {
        if self.credit.lock().notify_enabled {
            self.outbound.activate_output();
        }
    }
}

/// Anything the connection's output loop can poll for work.
pub trait OutputTask: Send + Sync {
    fn has_output(&self) -> bool;

    /// Produce some output; true when progress was made.
    fn do_output(&self) -> bool;
}

impl OutputTask for ConsumerSlot {
    fn has_output(&self) -> bool {
        !self.is_blocked()
    }

    fn do_output(&self) -> bool {
        self.queue.dispatch()
    }
}

/// The session's output tasks, polled round-robin.
#[derive(Default)]
pub struct AggregateOutput {
    tasks: Vec<(String, Arc<dyn OutputTask>)>,
}

impl AggregateOutput {
    pub fn add(&mut self, name: impl Into<String>, task: Arc<dyn OutputTask>) {
        self.tasks.push((name.into(), task));
    }

    pub fn remove(&mut self, name: &str) {
        self.tasks.retain(|(n, _)| n != name);
    }

    pub fn has_output(&self) -> bool {
        self.tasks.iter().any(|(_, t)| t.has_output())
    }

    pub fn do_output(&self) -> bool {
        let mut produced = false;
        for (_, task) in &self.tasks {
            produced |= task.do_output();
        }
        produced
    }
}
