//! The semantic core of an open session: consumers, routing,
//! acknowledgement, transactions.
//!
//! Holds session state whether the session is attached to a channel or
//! suspended. All mutation happens on the I/O thread; the shared pieces
//! (consumer credit, the unacked list) carry their own locks because queue
//! dispatch reaches them through shared slots.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace};
use uuid::Uuid;

use crate::broker::{AclAction, BrokerContext, Deliverable, Exchange, MessageStore, Queue};
use crate::core::time::Clock;
use crate::protocol::error::{SessionError, SessionResult};
use crate::protocol::frame::{SessionId, Xid};
use crate::protocol::message::MessageRef;
use crate::protocol::sequence::{SequenceNumber, SequenceSet};
use crate::semantics::consumer::{AggregateOutput, ConsumerSlot};
use crate::semantics::delivery::{DeliveryId, DeliveryRecord, SharedUnacked};
use crate::semantics::dtx::{DtxBuffer, DtxState};
use crate::semantics::tx::{TxAccept, TxBuffer, TxOp, TxPublish};
use crate::session::outbound::SessionOutbound;

/// Generates unique consumer tags when the client leaves the tag empty.
struct NameGenerator {
    base: String,
    counter: u64,
}

impl NameGenerator {
    fn new() -> Self {
        Self {
            base: Uuid::new_v4().simple().to_string(),
            counter: 0,
        }
    }

    fn generate(&mut self) -> String {
        self.counter += 1;
        format!("{}-{}", self.base, self.counter)
    }
}

/// Immediate routing: enqueue into every matched queue, journalling durable
/// messages against the ingress completion.
struct ImmediateRouter<'a> {
    message: &'a MessageRef,
    store: Option<Arc<dyn MessageStore>>,
    routed: usize,
}

impl Deliverable for ImmediateRouter<'_> {
    fn deliver_to(&mut self, queue: Arc<dyn Queue>) {
        if self.message.is_durable() {
            if let Some(store) = &self.store {
                self.message.ingress().begin();
                let message = self.message.clone();
                store.enqueue(
                    self.message,
                    queue.name(),
                    Box::new(move || message.ingress().finish()),
                );
            }
        }
        queue.enqueue(self.message.clone());
        queue.dispatch();
        self.routed += 1;
    }
}

pub struct SemanticState {
    session: SessionId,
    broker: Arc<dyn BrokerContext>,
    outbound: Arc<SessionOutbound>,
    clock: Arc<dyn Clock>,
    dtx_default_timeout: Duration,
    consumers: HashMap<String, Arc<ConsumerSlot>>,
    tag_generator: NameGenerator,
    unacked: SharedUnacked,
    tx_buffer: Option<TxBuffer>,
    dtx_selected: bool,
    dtx_buffer: Option<DtxBuffer>,
    suspended_xids: HashMap<Xid, DtxBuffer>,
    ended_xids: HashMap<Xid, DtxBuffer>,
    cache_exchange: Option<Arc<dyn Exchange>>,
    output_tasks: AggregateOutput,
}

impl SemanticState {
    pub fn new(
        session: SessionId,
        broker: Arc<dyn BrokerContext>,
        outbound: Arc<SessionOutbound>,
        clock: Arc<dyn Clock>,
        dtx_default_timeout: Duration,
    ) -> Self {
        Self {
            session,
            broker,
            outbound,
            clock,
            dtx_default_timeout,
            consumers: HashMap::new(),
            tag_generator: NameGenerator::new(),
            unacked: SharedUnacked::default(),
            tx_buffer: None,
            dtx_selected: false,
            dtx_buffer: None,
            suspended_xids: HashMap::new(),
            ended_xids: HashMap::new(),
            cache_exchange: None,
            output_tasks: AggregateOutput::default(),
        }
    }

    // -----------------------------------------------------------------
    // Consumers
    // -----------------------------------------------------------------

    /// Register a subscription. An empty tag is replaced with a generated
    /// one; the resulting tag is returned either way.
    pub fn consume(
        &mut self,
        tag: Option<String>,
        queue_name: &str,
        no_local: bool,
        ack_expected: bool,
        acquire: bool,
        exclusive: bool,
    ) -> SessionResult<String> {
        if let Some(acl) = self.broker.acl() {
            if !acl.authorise(AclAction::Consume, queue_name) {
                return Err(SessionError::Unauthorized(format!(
                    "consume from queue {queue_name}"
                )));
            }
        }
        let queue = self
            .broker
            .queues()
            .get(queue_name)
            .ok_or_else(|| SessionError::NotFound(format!("no queue: {queue_name}")))?;
        let tag = match tag {
            Some(tag) if !tag.is_empty() => tag,
            _ => self.tag_generator.generate(),
        };
        if self.consumers.contains_key(&tag) {
            return Err(SessionError::NotAllowed(format!(
                "consumer tag {tag} already in use"
            )));
        }
        let slot = ConsumerSlot::new(
            tag.clone(),
            queue.clone(),
            self.outbound.clone(),
            self.unacked.clone(),
            ack_expected,
            no_local,
            acquire,
            exclusive,
        );
        queue.consume(slot.clone());
        self.output_tasks.add(tag.clone(), slot.clone());
        self.consumers.insert(tag.clone(), slot);
        debug!(session = %self.session, %tag, queue = queue_name, "consumer registered");
        Ok(tag)
    }

    /// Remove a subscription. Unsettled records for the consumer stay in
    /// the unacked list until the peer settles them.
    pub fn cancel(&mut self, tag: &str) -> SessionResult<()> {
        let slot = self
            .consumers
            .remove(tag)
            .ok_or_else(|| SessionError::NotFound(format!("unknown destination: {tag}")))?;
        slot.disable_notify();
        slot.queue().cancel(&slot);
        self.output_tasks.remove(tag);
        debug!(session = %self.session, %tag, "consumer cancelled");
        Ok(())
    }

    pub fn consumer(&self, tag: &str) -> Option<&Arc<ConsumerSlot>> {
        self.consumers.get(tag)
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    fn find(&self, destination: &str) -> SessionResult<&Arc<ConsumerSlot>> {
        self.consumers
            .get(destination)
            .ok_or_else(|| SessionError::NotFound(format!("unknown destination: {destination}")))
    }

    // -----------------------------------------------------------------
    // Credit control
    // -----------------------------------------------------------------

    pub fn set_window_mode(&self, destination: &str) -> SessionResult<()> {
        self.find(destination)?.set_window_mode();
        Ok(())
    }

    pub fn set_credit_mode(&self, destination: &str) -> SessionResult<()> {
        self.find(destination)?.set_credit_mode();
        Ok(())
    }

    pub fn add_message_credit(&self, destination: &str, value: u32) -> SessionResult<()> {
        let slot = self.find(destination)?;
        slot.add_message_credit(value);
        slot.notify();
        slot.queue().dispatch();
        Ok(())
    }

    pub fn add_byte_credit(&self, destination: &str, value: u32) -> SessionResult<()> {
        let slot = self.find(destination)?;
        slot.add_byte_credit(value);
        slot.notify();
        slot.queue().dispatch();
        Ok(())
    }

    pub fn flush(&self, destination: &str) -> SessionResult<()> {
        self.find(destination)?.flush();
        Ok(())
    }

    pub fn stop(&self, destination: &str) -> SessionResult<()> {
        self.find(destination)?.stop();
        Ok(())
    }

    // -----------------------------------------------------------------
    // Synchronous get
    // -----------------------------------------------------------------

    /// Pull one message off a queue. Returns false when the queue is empty.
    pub fn get(
        &mut self,
        destination: &str,
        queue_name: &str,
        ack_expected: bool,
    ) -> SessionResult<bool> {
        let queue = self
            .broker
            .queues()
            .get(queue_name)
            .ok_or_else(|| SessionError::NotFound(format!("no queue: {queue_name}")))?;
        let Some(queued) = queue.pop() else {
            return Ok(false);
        };
        let redelivered = queued.message.is_redelivered();
        let id = self
            .outbound
            .deliver_transfer(destination, &queued, redelivered);
        if ack_expected {
            use crate::semantics::delivery::DeliveryFlags;
            let mut flags = DeliveryFlags::ACQUIRED;
            if redelivered {
                flags.insert(DeliveryFlags::REDELIVERED);
            }
            self.unacked.lock().push(DeliveryRecord::new(
                id,
                destination,
                queue,
                queued,
                true,
                flags,
                0,
            ));
        } else {
            queue.dequeue(&queued);
        }
        Ok(true)
    }

    // -----------------------------------------------------------------
    // Routing
    // -----------------------------------------------------------------

    fn lookup_exchange(&mut self, name: &str) -> SessionResult<Arc<dyn Exchange>> {
        if let Some(cached) = &self.cache_exchange {
            if cached.name() == name {
                return Ok(cached.clone());
            }
        }
        let exchange = self
            .broker
            .exchanges()
            .get(name)
            .ok_or_else(|| SessionError::NotFound(format!("no exchange: {name}")))?;
        self.cache_exchange = Some(exchange.clone());
        Ok(exchange)
    }

    fn in_transaction(&self) -> bool {
        self.tx_buffer.is_some() || self.dtx_buffer.is_some()
    }

    fn enlist(&mut self, op: Box<dyn TxOp>) -> SessionResult<()> {
        if let Some(dtx) = &mut self.dtx_buffer {
            if dtx.is_expired(self.clock.now()) {
                dtx.mark_timed_out();
                return Err(SessionError::IllegalState(format!(
                    "xid {}: transaction timed out",
                    dtx.xid()
                )));
            }
            dtx.enlist(op)
        } else if let Some(tx) = &mut self.tx_buffer {
            tx.enlist(op);
            Ok(())
        } else {
            Err(SessionError::Internal(
                "enlist without an open transaction".into(),
            ))
        }
    }

    /// Route a published message. Under tx/dtx the routing result is
    /// enlisted instead of applied.
    pub fn handle(&mut self, message: MessageRef) -> SessionResult<()> {
        let exchange = self.lookup_exchange(message.exchange())?;
        if let Some(acl) = self.broker.acl() {
            if !acl.authorise(AclAction::Publish, exchange.name()) {
                return Err(SessionError::Unauthorized(format!(
                    "publish to exchange {}",
                    exchange.name()
                )));
            }
        }
        if self.in_transaction() {
            let mut publish = TxPublish::new(message.clone());
            exchange.route(&message, message.routing_key(), &mut publish);
            let matched = publish.queue_count();
            self.enlist(Box::new(publish))?;
            trace!(session = %self.session, matched, "publish enlisted");
        } else {
            let mut router = ImmediateRouter {
                message: &message,
                store: self.broker.store(),
                routed: 0,
            };
            exchange.route(&message, message.routing_key(), &mut router);
            if router.routed == 0 {
                trace!(session = %self.session, key = message.routing_key(), "message unrouted");
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Local transactions
    // -----------------------------------------------------------------

    pub fn start_tx(&mut self) -> SessionResult<()> {
        if self.dtx_selected {
            return Err(SessionError::NotAllowed(
                "session already selected for distributed transactions".into(),
            ));
        }
        self.tx_buffer = Some(TxBuffer::new());
        Ok(())
    }

    pub fn commit(&mut self) -> SessionResult<()> {
        let store = self.broker.store();
        let tx = self
            .tx_buffer
            .as_mut()
            .ok_or_else(|| SessionError::IllegalState("no transaction started".into()))?;
        if tx.commit_local(store.as_ref()) {
            Ok(())
        } else {
            Err(SessionError::PreconditionFailed(
                "transaction failed to prepare".into(),
            ))
        }
    }

    pub fn rollback(&mut self) -> SessionResult<()> {
        self.tx_buffer
            .as_mut()
            .ok_or_else(|| SessionError::IllegalState("no transaction started".into()))?
            .rollback();
        Ok(())
    }

    // -----------------------------------------------------------------
    // Distributed transactions
    // -----------------------------------------------------------------

    pub fn select_dtx(&mut self) -> SessionResult<()> {
        if self.tx_buffer.is_some() {
            return Err(SessionError::NotAllowed(
                "session already has a local transaction".into(),
            ));
        }
        self.dtx_selected = true;
        Ok(())
    }

    pub fn start_dtx(&mut self, xid: &str, join: bool) -> SessionResult<()> {
        if !self.dtx_selected {
            return Err(SessionError::IllegalState(
                "dtx.start before dtx.select".into(),
            ));
        }
        if let Some(current) = &self.dtx_buffer {
            return Err(SessionError::IllegalState(format!(
                "xid {} still associated with this session",
                current.xid()
            )));
        }
        if join {
            let mut buffer = self
                .ended_xids
                .remove(xid)
                .ok_or_else(|| SessionError::NotFound(format!("unknown xid: {xid}")))?;
            buffer.rejoin()?;
            self.dtx_buffer = Some(buffer);
        } else {
            if self.ended_xids.contains_key(xid) || self.suspended_xids.contains_key(xid) {
                return Err(SessionError::NotAllowed(format!("xid {xid} already known")));
            }
            let mut buffer = DtxBuffer::new(xid);
            buffer.set_timeout(self.clock.now() + self.dtx_default_timeout);
            self.dtx_buffer = Some(buffer);
        }
        debug!(session = %self.session, %xid, join, "dtx started");
        Ok(())
    }

    pub fn end_dtx(&mut self, xid: &str, fail: bool) -> SessionResult<()> {
        let mut buffer = self
            .dtx_buffer
            .take()
            .ok_or_else(|| SessionError::IllegalState("dtx.end without dtx work".into()))?;
        if buffer.xid() != xid {
            let current = buffer.xid().to_string();
            self.dtx_buffer = Some(buffer);
            return Err(SessionError::IllegalState(format!(
                "dtx.end for {xid} while {current} is current"
            )));
        }
        if buffer.is_expired(self.clock.now()) {
            buffer.mark_timed_out();
            self.ended_xids.insert(xid.to_string(), buffer);
            return Err(SessionError::IllegalState(format!(
                "xid {xid}: transaction timed out"
            )));
        }
        if let Err(err) = buffer.mark_ended(fail) {
            self.dtx_buffer = Some(buffer);
            return Err(err);
        }
        self.ended_xids.insert(xid.to_string(), buffer);
        debug!(session = %self.session, %xid, fail, "dtx ended");
        Ok(())
    }

    pub fn suspend_dtx(&mut self, xid: &str) -> SessionResult<()> {
        let mut buffer = self
            .dtx_buffer
            .take()
            .ok_or_else(|| SessionError::IllegalState("dtx.suspend without dtx work".into()))?;
        if buffer.xid() != xid {
            let current = buffer.xid().to_string();
            self.dtx_buffer = Some(buffer);
            return Err(SessionError::IllegalState(format!(
                "suspend of {xid} while {current} is current"
            )));
        }
        if let Err(err) = buffer.suspend() {
            self.dtx_buffer = Some(buffer);
            return Err(err);
        }
        self.suspended_xids.insert(xid.to_string(), buffer);
        Ok(())
    }

    pub fn resume_dtx(&mut self, xid: &str) -> SessionResult<()> {
        if let Some(current) = &self.dtx_buffer {
            return Err(SessionError::IllegalState(format!(
                "resume of {xid} while {} is current",
                current.xid()
            )));
        }
        let mut buffer = self
            .suspended_xids
            .remove(xid)
            .ok_or_else(|| SessionError::NotFound(format!("unknown xid: {xid}")))?;
        buffer.resume()?;
        self.dtx_buffer = Some(buffer);
        Ok(())
    }

    pub fn prepare_dtx(&mut self, xid: &str) -> SessionResult<bool> {
        let store = self.broker.store();
        let now = self.clock.now();
        let buffer = self
            .ended_xids
            .get_mut(xid)
            .ok_or_else(|| SessionError::NotFound(format!("unknown xid: {xid}")))?;
        if buffer.is_expired(now) {
            buffer.mark_timed_out();
            return Err(SessionError::IllegalState(format!(
                "xid {xid}: transaction timed out"
            )));
        }
        buffer.prepare(store.as_ref())
    }

    pub fn commit_dtx(&mut self, xid: &str, one_phase: bool) -> SessionResult<()> {
        let store = self.broker.store();
        let buffer = self
            .ended_xids
            .get_mut(xid)
            .ok_or_else(|| SessionError::NotFound(format!("unknown xid: {xid}")))?;
        buffer.commit(store.as_ref(), one_phase)?;
        self.ended_xids.remove(xid);
        Ok(())
    }

    pub fn rollback_dtx(&mut self, xid: &str) -> SessionResult<()> {
        let store = self.broker.store();
        let buffer = self
            .ended_xids
            .get_mut(xid)
            .ok_or_else(|| SessionError::NotFound(format!("unknown xid: {xid}")))?;
        buffer.rollback(store.as_ref())?;
        self.ended_xids.remove(xid);
        Ok(())
    }

    /// State of a known xid, wherever it currently lives.
    pub fn dtx_state(&self, xid: &str) -> Option<DtxState> {
        if let Some(current) = &self.dtx_buffer {
            if current.xid() == xid {
                return Some(current.state());
            }
        }
        self.suspended_xids
            .get(xid)
            .or_else(|| self.ended_xids.get(xid))
            .map(DtxBuffer::state)
    }

    pub fn has_current_dtx(&self) -> bool {
        self.dtx_buffer.is_some()
    }

    // -----------------------------------------------------------------
    // Acknowledgement
    // -----------------------------------------------------------------

    fn restore_window_credit(&self, record: &DeliveryRecord) {
        if record.is_windowing() {
            let (msg_charged, bytes) = record.charge();
            if let Some(slot) = self.consumers.get(record.tag()) {
                slot.restore_credit(msg_charged, bytes);
            }
        }
    }

    fn dispatch_consumers_of(&self, records: &[DeliveryRecord]) {
        let mut seen: Vec<&str> = Vec::new();
        for record in records {
            if seen.contains(&record.tag()) {
                continue;
            }
            seen.push(record.tag());
            if let Some(slot) = self.consumers.get(record.tag()) {
                slot.notify();
                slot.queue().dispatch();
            }
        }
    }

    /// The peer confirmed these outbound transfers complete; deliveries not
    /// requiring accept settle here.
    pub fn completed(&mut self, commands: &SequenceSet) {
        let store = self.broker.store();
        let settled = self
            .unacked
            .lock()
            .take_where(|r| commands.contains(r.id()) && !r.ack_expected());
        for record in &settled {
            self.restore_window_credit(record);
        }
        for mut record in settled {
            if record.is_acquired() {
                record.accept(store.as_ref());
            } else {
                record.mark_ended();
            }
        }
    }

    /// Range form of [`completed`](Self::completed).
    pub fn complete_range(&mut self, first: DeliveryId, last: DeliveryId) {
        let store = self.broker.store();
        let settled = self
            .unacked
            .lock()
            .extract(first, last, |r| !r.ack_expected());
        for record in &settled {
            self.restore_window_credit(record);
        }
        for mut record in settled {
            if record.is_acquired() {
                record.accept(store.as_ref());
            } else {
                record.mark_ended();
            }
        }
    }

    /// Settle accepted deliveries. Under tx/dtx the queue-side dequeue is
    /// enlisted; window credit is restored either way, since the client has
    /// freed its window. Idempotent over already-settled ids.
    pub fn accept_range(&mut self, first: DeliveryId, last: DeliveryId) -> SessionResult<()> {
        let store = self.broker.store();
        let records = self
            .unacked
            .lock()
            .extract(first, last, |r| r.is_acquired() && !r.is_ended());
        if records.is_empty() {
            return Ok(());
        }
        for record in &records {
            self.restore_window_credit(record);
        }
        self.dispatch_consumers_of(&records);
        if self.in_transaction() {
            self.enlist(Box::new(TxAccept::new(records)))?;
        } else {
            for mut record in records {
                record.accept(store.as_ref());
            }
        }
        Ok(())
    }

    /// Return deliveries to their queues. Browsed (never-acquired) records
    /// simply drop; the queue still owns those messages.
    pub fn release_range(
        &mut self,
        first: DeliveryId,
        last: DeliveryId,
        set_redelivered: bool,
    ) -> SessionResult<()> {
        let records = self.unacked.lock().extract(first, last, |r| !r.is_ended());
        let mut queues: Vec<Arc<dyn Queue>> = Vec::new();
        for record in &records {
            self.restore_window_credit(record);
        }
        for record in records {
            if record.is_acquired() {
                if !queues.iter().any(|q| q.name() == record.queue().name()) {
                    queues.push(record.queue().clone());
                }
                record.release(set_redelivered);
            }
        }
        for queue in queues {
            queue.dispatch();
        }
        Ok(())
    }

    /// Discard deliveries without requeueing.
    pub fn reject_range(&mut self, first: DeliveryId, last: DeliveryId) -> SessionResult<()> {
        let store = self.broker.store();
        let records = self.unacked.lock().extract(first, last, |r| !r.is_ended());
        for record in &records {
            self.restore_window_credit(record);
        }
        for mut record in records {
            if record.is_acquired() {
                record.reject(store.as_ref());
            }
        }
        Ok(())
    }

    /// Take ownership of previously browsed deliveries. Returns the ids
    /// actually acquired; messages gone from the queue are left out.
    pub fn acquire_range(
        &mut self,
        first: DeliveryId,
        last: DeliveryId,
    ) -> SessionResult<SequenceSet> {
        let mut acquired = SequenceSet::new();
        let mut unacked = self.unacked.lock();
        for record in unacked.span_mut(first, last) {
            if !record.is_acquired() && record.acquire() {
                acquired.add(record.id());
            }
        }
        Ok(acquired)
    }

    /// Recovery: requeue everything, or mark everything redelivered and
    /// transfer it again under fresh delivery ids.
    pub fn recover(&mut self, requeue: bool) -> SessionResult<()> {
        if requeue {
            // redelivery happens on the next output cycle; the list is
            // empty the moment this returns
            let records = self.unacked.lock().drain_all();
            for record in &records {
                self.restore_window_credit(record);
            }
            for record in records {
                if record.is_acquired() {
                    record.release(true);
                }
            }
        } else {
            let mut unacked = self.unacked.lock();
            for record in unacked.iter_mut() {
                record.mark_redelivered();
                let id = self
                    .outbound
                    .deliver_transfer(record.tag(), record.queued(), true);
                record.set_id(id);
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Lifecycle & output
    // -----------------------------------------------------------------

    pub fn attached(&self) {
        self.outbound.enable_output();
    }

    /// Prevents further output activations until reattached.
    pub fn detached(&self) {
        self.outbound.disable_output();
    }

    /// Final teardown: unhook every consumer from its queue. Unacked
    /// records drop; their messages remain on the queues.
    pub fn closed(&mut self) {
        for (tag, slot) in self.consumers.drain() {
            slot.disable_notify();
            slot.queue().cancel(&slot);
            trace!(session = %self.session, %tag, "consumer dropped at close");
        }
        self.output_tasks = AggregateOutput::default();
    }

    pub fn has_output(&self) -> bool {
        self.output_tasks.has_output()
    }

    pub fn do_output(&self) -> bool {
        self.output_tasks.do_output()
    }

    /// Shared unacked-list handle, for delivery bookkeeping and tests.
    pub fn unacked(&self) -> SharedUnacked {
        self.unacked.clone()
    }

    pub fn unacked_count(&self) -> usize {
        self.unacked.lock().len()
    }

    pub fn unacked_ids(&self) -> Vec<SequenceNumber> {
        self.unacked.lock().iter().map(DeliveryRecord::id).collect()
    }
}
