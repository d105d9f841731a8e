//! In-memory collaborator fakes shared by the integration tests.
//!
//! Everything the session engine consumes through its broker seams gets a
//! small deterministic stand-in here: a FIFO queue with round-robin
//! dispatch, a direct exchange, a journal with deferrable completions, a
//! hand-fired timer, and a transport that records every control frame.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use tachyon::broker::{
    AccessControl, AclAction, BrokerContext, CompletionHook, ConnectionContext, Exchange,
    ExchangeRegistry, IoTask, ManagementSink, MessageStore, Queue, QueueRegistry, QueuedMessage,
    Timer, TimerHandle, TransportHandler,
};
use tachyon::config::SessionConfig;
use tachyon::protocol::frame::{
    AcceptMode, AcquireMode, ConnectionId, Control, Frame, FramePayload, Header, Method,
};
use tachyon::protocol::message::MessageRef;
use tachyon::semantics::consumer::ConsumerSlot;
use tachyon::time::{Clock, ManualClock};
use tachyon::{SequenceNumber, SequenceSet, SessionCore, SessionId};

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

struct QueueInner {
    pending: VecDeque<QueuedMessage>,
    acquired: HashMap<u64, QueuedMessage>,
    consumers: Vec<Arc<ConsumerSlot>>,
    browse_cursors: HashMap<String, u64>,
}

pub struct TestQueue {
    name: String,
    next_position: AtomicU64,
    inner: Mutex<QueueInner>,
}

impl TestQueue {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            next_position: AtomicU64::new(1),
            inner: Mutex::new(QueueInner {
                pending: VecDeque::new(),
                acquired: HashMap::new(),
                consumers: Vec::new(),
                browse_cursors: HashMap::new(),
            }),
        })
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn acquired_len(&self) -> usize {
        self.inner.lock().acquired.len()
    }

    pub fn consumer_count(&self) -> usize {
        self.inner.lock().consumers.len()
    }
}

impl Queue for TestQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn consume(&self, slot: Arc<ConsumerSlot>) {
        self.inner.lock().consumers.push(slot);
    }

    fn cancel(&self, slot: &ConsumerSlot) {
        self.inner
            .lock()
            .consumers
            .retain(|c| c.name() != slot.name());
    }

    fn dispatch(&self) -> bool {
        let mut delivered = false;
        let consumers = self.inner.lock().consumers.clone();
        for slot in &consumers {
            loop {
                // pick the next message this consumer may see; the lock is
                // dropped before deliver() so the slot can re-enter the queue
                let candidate = {
                    let inner = self.inner.lock();
                    if slot.is_acquire() {
                        inner.pending.front().cloned()
                    } else {
                        let cursor = inner
                            .browse_cursors
                            .get(slot.name())
                            .copied()
                            .unwrap_or(0);
                        inner
                            .pending
                            .iter()
                            .find(|m| m.position >= cursor)
                            .cloned()
                    }
                };
                let Some(msg) = candidate else { break };
                if !slot.filter(&msg.message) {
                    if slot.is_acquire() {
                        // leave the message for another consumer
                        break;
                    }
                    self.inner
                        .lock()
                        .browse_cursors
                        .insert(slot.name().to_string(), msg.position + 1);
                    continue;
                }
                if !slot.deliver(&msg) {
                    break;
                }
                delivered = true;
                let mut inner = self.inner.lock();
                if slot.is_acquire() {
                    if let Some(idx) = inner.pending.iter().position(|m| m.position == msg.position)
                    {
                        let taken = inner.pending.remove(idx).unwrap();
                        inner.acquired.insert(msg.position, taken);
                    }
                } else {
                    inner
                        .browse_cursors
                        .insert(slot.name().to_string(), msg.position + 1);
                }
            }
        }
        delivered
    }

    fn pop(&self) -> Option<QueuedMessage> {
        let mut inner = self.inner.lock();
        let msg = inner.pending.pop_front()?;
        inner.acquired.insert(msg.position, msg.clone());
        Some(msg)
    }

    fn acquire(&self, msg: &QueuedMessage) -> bool {
        let mut inner = self.inner.lock();
        if let Some(idx) = inner.pending.iter().position(|m| m.position == msg.position) {
            let taken = inner.pending.remove(idx).unwrap();
            inner.acquired.insert(msg.position, taken);
            true
        } else {
            false
        }
    }

    fn enqueue(&self, message: MessageRef) {
        let position = self.next_position.fetch_add(1, Ordering::SeqCst);
        self.inner
            .lock()
            .pending
            .push_back(QueuedMessage::new(message, position));
    }

    fn dequeue(&self, msg: &QueuedMessage) {
        self.inner.lock().acquired.remove(&msg.position);
    }

    fn requeue(&self, msg: QueuedMessage) {
        let mut inner = self.inner.lock();
        inner.acquired.remove(&msg.position);
        let idx = inner
            .pending
            .iter()
            .position(|m| m.position > msg.position)
            .unwrap_or(inner.pending.len());
        inner.pending.insert(idx, msg);
    }
}

// ---------------------------------------------------------------------------
// Exchange
// ---------------------------------------------------------------------------

pub struct TestExchange {
    name: String,
    bindings: Mutex<Vec<(String, Arc<dyn Queue>)>>,
}

impl TestExchange {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            bindings: Mutex::new(Vec::new()),
        })
    }

    pub fn bind(&self, key: impl Into<String>, queue: Arc<dyn Queue>) {
        self.bindings.lock().push((key.into(), queue));
    }
}

impl Exchange for TestExchange {
    fn name(&self) -> &str {
        &self.name
    }

    fn route(
        &self,
        _message: &MessageRef,
        routing_key: &str,
        strategy: &mut dyn tachyon::broker::Deliverable,
    ) {
        for (key, queue) in self.bindings.lock().iter() {
            if key == routing_key {
                strategy.deliver_to(queue.clone());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    /// Journal writes land synchronously.
    Immediate,
    /// Writes wait for `flush` or `complete_all` (a pretend store thread).
    Manual,
}

struct StoreInner {
    pending: Vec<(usize, CompletionHook)>,
    enqueues: Vec<String>,
    dequeues: Vec<String>,
    flushes: usize,
    commits: usize,
    aborts: usize,
}

pub struct TestStore {
    mode: StoreMode,
    inner: Mutex<StoreInner>,
}

fn message_key(message: &MessageRef) -> usize {
    Arc::as_ptr(message) as usize
}

impl TestStore {
    pub fn new(mode: StoreMode) -> Arc<Self> {
        Arc::new(Self {
            mode,
            inner: Mutex::new(StoreInner {
                pending: Vec::new(),
                enqueues: Vec::new(),
                dequeues: Vec::new(),
                flushes: 0,
                commits: 0,
                aborts: 0,
            }),
        })
    }

    /// Run every deferred completion, as the store thread would.
    pub fn complete_all(&self) -> usize {
        let hooks: Vec<CompletionHook> = {
            let mut inner = self.inner.lock();
            inner.pending.drain(..).map(|(_, hook)| hook).collect()
        };
        let count = hooks.len();
        for hook in hooks {
            hook();
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn enqueue_count(&self) -> usize {
        self.inner.lock().enqueues.len()
    }

    pub fn dequeue_count(&self) -> usize {
        self.inner.lock().dequeues.len()
    }

    pub fn flush_count(&self) -> usize {
        self.inner.lock().flushes
    }

    pub fn commit_count(&self) -> usize {
        self.inner.lock().commits
    }

    pub fn abort_count(&self) -> usize {
        self.inner.lock().aborts
    }
}

impl MessageStore for TestStore {
    fn enqueue(&self, message: &MessageRef, queue: &str, done: CompletionHook) {
        let mut inner = self.inner.lock();
        inner.enqueues.push(queue.to_string());
        match self.mode {
            StoreMode::Immediate => {
                drop(inner);
                done();
            }
            StoreMode::Manual => {
                inner.pending.push((message_key(message), done));
            }
        }
    }

    fn dequeue(&self, _message: &MessageRef, queue: &str) {
        self.inner.lock().dequeues.push(queue.to_string());
    }

    fn flush(&self, message: &MessageRef) {
        let hooks: Vec<CompletionHook> = {
            let mut inner = self.inner.lock();
            inner.flushes += 1;
            let key = message_key(message);
            let mut matched = Vec::new();
            let mut idx = 0;
            while idx < inner.pending.len() {
                if inner.pending[idx].0 == key {
                    matched.push(inner.pending.remove(idx).1);
                } else {
                    idx += 1;
                }
            }
            matched
        };
        for hook in hooks {
            hook();
        }
    }

    fn commit(&self, _xid: Option<&str>) {
        self.inner.lock().commits += 1;
    }

    fn abort(&self, _xid: Option<&str>) {
        self.inner.lock().aborts += 1;
    }
}

// ---------------------------------------------------------------------------
// ACL
// ---------------------------------------------------------------------------

pub struct DenyAcl {
    denied: Mutex<Vec<(AclAction, String)>>,
}

impl DenyAcl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            denied: Mutex::new(Vec::new()),
        })
    }

    pub fn deny(&self, action: AclAction, name: impl Into<String>) {
        self.denied.lock().push((action, name.into()));
    }
}

impl AccessControl for DenyAcl {
    fn authorise(&self, action: AclAction, name: &str) -> bool {
        !self
            .denied
            .lock()
            .iter()
            .any(|(a, n)| *a == action && n == name)
    }
}

// ---------------------------------------------------------------------------
// Timer
// ---------------------------------------------------------------------------

struct ScheduledTask {
    delay: Duration,
    task: Box<dyn FnOnce() + Send>,
    handle: TimerHandle,
}

pub struct TestTimer {
    tasks: Mutex<Vec<ScheduledTask>>,
}

impl TestTimer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn scheduled_count(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn last_delay(&self) -> Option<Duration> {
        self.tasks.lock().last().map(|t| t.delay)
    }

    /// Fire everything currently scheduled; returns how many tasks ran.
    pub fn fire_all(&self) -> usize {
        let tasks: Vec<ScheduledTask> = self.tasks.lock().drain(..).collect();
        let mut fired = 0;
        for scheduled in tasks {
            if !scheduled.handle.is_cancelled() {
                (scheduled.task)();
                fired += 1;
            }
        }
        fired
    }
}

impl Timer for TestTimer {
    fn schedule(&self, delay: Duration, task: Box<dyn FnOnce() + Send>) -> TimerHandle {
        let handle = TimerHandle::new();
        self.tasks.lock().push(ScheduledTask {
            delay,
            task,
            handle: handle.clone(),
        });
        handle
    }
}

// ---------------------------------------------------------------------------
// Management
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct TestMgmt {
    pub attached: AtomicI64,
    pub client_credit: AtomicI64,
    pub max_rate: AtomicU64,
    pub connection: Mutex<Option<(u64, u16)>>,
}

impl TestMgmt {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl ManagementSink for TestMgmt {
    fn set_attached(&self, attached: bool) {
        self.attached.store(i64::from(attached), Ordering::SeqCst);
    }

    fn set_connection(&self, connection: ConnectionId, channel: u16) {
        *self.connection.lock() = Some((connection.0, channel));
    }

    fn set_max_client_rate(&self, rate: u32) {
        self.max_rate.store(u64::from(rate), Ordering::SeqCst);
    }

    fn adjust_client_credit(&self, delta: i64) {
        self.client_credit.fetch_add(delta, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Connection & transport
// ---------------------------------------------------------------------------

pub struct TestConnection {
    id: u64,
    throttling: bool,
    tasks: Mutex<Vec<IoTask>>,
    activations: AtomicUsize,
    aborts: AtomicUsize,
    read_credit: AtomicI64,
}

impl TestConnection {
    pub fn new(id: u64, throttling: bool) -> Arc<Self> {
        Arc::new(Self {
            id,
            throttling,
            tasks: Mutex::new(Vec::new()),
            activations: AtomicUsize::new(0),
            aborts: AtomicUsize::new(0),
            read_credit: AtomicI64::new(0),
        })
    }

    pub fn queued_tasks(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Play the part of the I/O thread: run every queued task against the
    /// session. Returns how many ran.
    pub fn run_io(&self, session: &mut SessionCore) -> usize {
        let mut ran = 0;
        loop {
            let tasks: Vec<IoTask> = self.tasks.lock().drain(..).collect();
            if tasks.is_empty() {
                break;
            }
            for task in tasks {
                task(session);
                ran += 1;
            }
        }
        ran
    }

    pub fn activations(&self) -> usize {
        self.activations.load(Ordering::SeqCst)
    }

    pub fn aborts(&self) -> usize {
        self.aborts.load(Ordering::SeqCst)
    }
}

impl ConnectionContext for TestConnection {
    fn id(&self) -> ConnectionId {
        ConnectionId(self.id)
    }

    fn frame_max(&self) -> u32 {
        65536
    }

    fn client_throttling(&self) -> bool {
        self.throttling
    }

    fn activate_output(&self) {
        self.activations.fetch_add(1, Ordering::SeqCst);
    }

    fn abort_output(&self) {
        self.aborts.fetch_add(1, Ordering::SeqCst);
    }

    fn give_read_credit(&self, credit: i32) {
        self.read_credit.fetch_add(i64::from(credit), Ordering::SeqCst);
    }

    fn request_io_processing(&self, task: IoTask) {
        self.tasks.lock().push(task);
    }
}

pub struct TestHandler {
    connection: Arc<TestConnection>,
    channel: u16,
    sent: Mutex<Vec<Control>>,
    cluster: Mutex<Vec<Control>>,
    detaches: AtomicUsize,
}

impl TestHandler {
    pub fn new(connection: Arc<TestConnection>, channel: u16) -> Arc<Self> {
        Arc::new(Self {
            connection,
            channel,
            sent: Mutex::new(Vec::new()),
            cluster: Mutex::new(Vec::new()),
            detaches: AtomicUsize::new(0),
        })
    }

    pub fn sent(&self) -> Vec<Control> {
        self.sent.lock().clone()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
        self.cluster.lock().clear();
    }

    pub fn detach_requests(&self) -> usize {
        self.detaches.load(Ordering::SeqCst)
    }

    /// (destination, delivery id, body, redelivered) for every transfer.
    pub fn transfers(&self) -> Vec<(String, u32, Bytes, bool)> {
        self.sent
            .lock()
            .iter()
            .filter_map(|c| match c {
                Control::MessageTransfer {
                    destination,
                    delivery_id,
                    message,
                    redelivered,
                } => Some((
                    destination.clone(),
                    delivery_id.value(),
                    message.body().clone(),
                    *redelivered,
                )),
                _ => None,
            })
            .collect()
    }

    /// Flattened id list of each session.completion, in order.
    pub fn completions(&self) -> Vec<Vec<u32>> {
        self.sent
            .lock()
            .iter()
            .filter_map(|c| match c {
                Control::SessionCompletion { commands } => {
                    Some(commands.iter().map(SequenceNumber::value).collect())
                }
                _ => None,
            })
            .collect()
    }

    /// Flattened id list of each message.accept, in order.
    pub fn accepts(&self) -> Vec<Vec<u32>> {
        self.sent
            .lock()
            .iter()
            .filter_map(|c| match c {
                Control::MessageAccept { transfers } => {
                    Some(transfers.iter().map(SequenceNumber::value).collect())
                }
                _ => None,
            })
            .collect()
    }

    pub fn results(&self) -> Vec<(u32, Bytes)> {
        self.sent
            .lock()
            .iter()
            .filter_map(|c| match c {
                Control::ExecutionResult { id, value } => Some((id.value(), value.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn exceptions(&self) -> Vec<(u32, u16)> {
        self.sent
            .lock()
            .iter()
            .filter_map(|c| match c {
                Control::ExecutionException { id, code, .. } => Some((id.value(), *code)),
                _ => None,
            })
            .collect()
    }

    /// Credit values granted on the cluster-order channel.
    pub fn cluster_flows(&self) -> Vec<u32> {
        self.cluster
            .lock()
            .iter()
            .filter_map(|c| match c {
                Control::MessageFlow { value, .. } => Some(*value),
                _ => None,
            })
            .collect()
    }

    pub fn cluster_stops(&self) -> usize {
        self.cluster
            .lock()
            .iter()
            .filter(|c| matches!(c, Control::MessageStop { .. }))
            .count()
    }
}

impl TransportHandler for TestHandler {
    fn send(&self, control: Control) {
        self.sent.lock().push(control);
    }

    fn send_cluster_order(&self, control: Control) {
        self.cluster.lock().push(control);
    }

    fn send_detach(&self) {
        self.detaches.fetch_add(1, Ordering::SeqCst);
    }

    fn channel(&self) -> u16 {
        self.channel
    }

    fn connection(&self) -> Arc<dyn ConnectionContext> {
        self.connection.clone()
    }
}

// ---------------------------------------------------------------------------
// Broker
// ---------------------------------------------------------------------------

pub struct TestBroker {
    queues: Mutex<HashMap<String, Arc<TestQueue>>>,
    exchanges: Mutex<HashMap<String, Arc<TestExchange>>>,
    store: Option<Arc<TestStore>>,
    acl: Option<Arc<DenyAcl>>,
    timer: Arc<TestTimer>,
    mgmt: Option<Arc<TestMgmt>>,
}

impl TestBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            queues: Mutex::new(HashMap::new()),
            exchanges: Mutex::new(HashMap::new()),
            store: None,
            acl: None,
            timer: TestTimer::new(),
            mgmt: None,
        })
    }

    pub fn with_parts(
        store: Option<Arc<TestStore>>,
        acl: Option<Arc<DenyAcl>>,
        mgmt: Option<Arc<TestMgmt>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            queues: Mutex::new(HashMap::new()),
            exchanges: Mutex::new(HashMap::new()),
            store,
            acl,
            timer: TestTimer::new(),
            mgmt,
        })
    }

    pub fn add_queue(&self, name: &str) -> Arc<TestQueue> {
        let queue = TestQueue::new(name);
        self.queues.lock().insert(name.to_string(), queue.clone());
        queue
    }

    /// Concrete handle to a registered queue; panics on unknown names.
    pub fn queue(&self, name: &str) -> Arc<TestQueue> {
        self.queues.lock().get(name).expect("queue registered").clone()
    }

    pub fn add_direct_exchange(&self, name: &str) -> Arc<TestExchange> {
        let exchange = TestExchange::new(name);
        self.exchanges
            .lock()
            .insert(name.to_string(), exchange.clone());
        exchange
    }

    pub fn timer(&self) -> &Arc<TestTimer> {
        &self.timer
    }
}

impl QueueRegistry for TestBroker {
    fn get(&self, name: &str) -> Option<Arc<dyn Queue>> {
        self.queues
            .lock()
            .get(name)
            .map(|q| q.clone() as Arc<dyn Queue>)
    }
}

impl ExchangeRegistry for TestBroker {
    fn get(&self, name: &str) -> Option<Arc<dyn Exchange>> {
        self.exchanges
            .lock()
            .get(name)
            .map(|e| e.clone() as Arc<dyn Exchange>)
    }
}

impl BrokerContext for TestBroker {
    fn queues(&self) -> &dyn QueueRegistry {
        self
    }

    fn exchanges(&self) -> &dyn ExchangeRegistry {
        self
    }

    fn store(&self) -> Option<Arc<dyn MessageStore>> {
        self.store.clone().map(|s| s as Arc<dyn MessageStore>)
    }

    fn acl(&self) -> Option<Arc<dyn AccessControl>> {
        self.acl.clone().map(|a| a as Arc<dyn AccessControl>)
    }

    fn timer(&self) -> Arc<dyn Timer> {
        self.timer.clone()
    }

    fn management(&self, _session: &SessionId) -> Option<Arc<dyn ManagementSink>> {
        self.mgmt.clone().map(|m| m as Arc<dyn ManagementSink>)
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub broker: Arc<TestBroker>,
    pub clock: Arc<ManualClock>,
    pub connection: Arc<TestConnection>,
    pub handler: Arc<TestHandler>,
    pub session: SessionCore,
}

impl Harness {
    /// A session attached and ready to send, on connection `conn_id`.
    pub fn attach(broker: Arc<TestBroker>, config: SessionConfig, conn_id: u64) -> Self {
        Self::attach_inner(broker, config, conn_id, true)
    }

    /// Client that never negotiated producer throttling support.
    pub fn attach_without_throttling(
        broker: Arc<TestBroker>,
        config: SessionConfig,
        conn_id: u64,
    ) -> Self {
        Self::attach_inner(broker, config, conn_id, false)
    }

    fn attach_inner(
        broker: Arc<TestBroker>,
        config: SessionConfig,
        conn_id: u64,
        throttling: bool,
    ) -> Self {
        let clock = Arc::new(ManualClock::new());
        let connection = TestConnection::new(conn_id, throttling);
        let handler = TestHandler::new(connection.clone(), 7);
        let mut session = SessionCore::new(
            SessionId::new(format!("session-{conn_id}")),
            broker.clone() as Arc<dyn BrokerContext>,
            config,
            clock.clone() as Arc<dyn Clock>,
        );
        session.attach(handler.clone());
        session.ready_to_send();
        Self {
            broker,
            clock,
            connection,
            handler,
            session,
        }
    }

    pub fn new(config: SessionConfig) -> Self {
        Self::attach(TestBroker::new(), config, 1)
    }

    /// Drain the fake I/O thread's task queue into the session.
    pub fn run_io(&mut self) -> usize {
        self.connection.run_io(&mut self.session)
    }

    pub fn handle_all(&mut self, frames: Vec<Frame>) {
        for frame in frames {
            self.session.handle_frame(frame).unwrap();
        }
    }
}

// ---------------------------------------------------------------------------
// Frame builders
// ---------------------------------------------------------------------------

/// The three frames of a published message: transfer method, header, body.
pub fn publish_frames(
    exchange: &str,
    key: &str,
    body: &[u8],
    durable: bool,
    sync: bool,
    accept_mode: AcceptMode,
) -> Vec<Frame> {
    vec![
        Frame {
            first_segment: true,
            last_segment: false,
            first_frame: true,
            last_frame: true,
            payload: FramePayload::Method {
                method: Method::MessageTransfer {
                    destination: exchange.to_string(),
                    accept_mode,
                    acquire_mode: AcquireMode::PreAcquired,
                },
                sync,
            },
        },
        Frame {
            first_segment: false,
            last_segment: false,
            first_frame: true,
            last_frame: true,
            payload: FramePayload::Header(Header {
                routing_key: key.to_string(),
                durable,
            }),
        },
        Frame {
            first_segment: false,
            last_segment: true,
            first_frame: true,
            last_frame: true,
            payload: FramePayload::Body(Bytes::copy_from_slice(body)),
        },
    ]
}

pub fn subscribe(queue: &str, destination: &str) -> Frame {
    Frame::command(
        Method::MessageSubscribe {
            queue: queue.to_string(),
            destination: destination.to_string(),
            accept_mode: AcceptMode::Explicit,
            acquire_mode: AcquireMode::PreAcquired,
            exclusive: false,
            no_local: false,
        },
        false,
    )
}

pub fn subscribe_no_local(queue: &str, destination: &str) -> Frame {
    Frame::command(
        Method::MessageSubscribe {
            queue: queue.to_string(),
            destination: destination.to_string(),
            accept_mode: AcceptMode::Explicit,
            acquire_mode: AcquireMode::PreAcquired,
            exclusive: false,
            no_local: true,
        },
        false,
    )
}

/// Subscription that never expects accepts (fire-and-forget with a window).
pub fn subscribe_unacked(queue: &str, destination: &str) -> Frame {
    Frame::command(
        Method::MessageSubscribe {
            queue: queue.to_string(),
            destination: destination.to_string(),
            accept_mode: AcceptMode::None,
            acquire_mode: AcquireMode::PreAcquired,
            exclusive: false,
            no_local: false,
        },
        false,
    )
}

pub fn subscribe_browse(queue: &str, destination: &str) -> Frame {
    Frame::command(
        Method::MessageSubscribe {
            queue: queue.to_string(),
            destination: destination.to_string(),
            accept_mode: AcceptMode::Explicit,
            acquire_mode: AcquireMode::NotAcquired,
            exclusive: false,
            no_local: false,
        },
        false,
    )
}

pub fn message_flow(destination: &str, value: u32) -> Frame {
    Frame::command(
        Method::MessageFlow {
            destination: destination.to_string(),
            unit: tachyon::protocol::frame::CreditUnit::Message,
            value,
        },
        false,
    )
}

pub fn byte_flow(destination: &str, value: u32) -> Frame {
    Frame::command(
        Method::MessageFlow {
            destination: destination.to_string(),
            unit: tachyon::protocol::frame::CreditUnit::Byte,
            value,
        },
        false,
    )
}

pub fn range_set(first: u32, last: u32) -> SequenceSet {
    let mut set = SequenceSet::new();
    set.add_range(SequenceNumber::new(first), SequenceNumber::new(last));
    set
}

pub fn accept(first: u32, last: u32) -> Frame {
    Frame::command(
        Method::MessageAccept {
            transfers: range_set(first, last),
        },
        false,
    )
}

pub fn rate_config(max_session_rate: u32) -> SessionConfig {
    SessionConfig {
        max_session_rate,
        ..SessionConfig::default()
    }
}
