//! Collaborator interfaces the session engine consumes.
//!
//! The engine never talks to sockets, queues or the journal directly; the
//! broker runtime supplies these traits. Everything here is object-safe so
//! runtimes (and tests) can mix implementations freely.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::protocol::frame::{ConnectionId, Control, SessionId};
use crate::protocol::message::MessageRef;
use crate::semantics::consumer::ConsumerSlot;
use crate::session::core::SessionCore;

/// Work scheduled back onto the session's I/O thread. The session is handed
/// in by the connection when the task runs, so worker threads never hold a
/// reference to it.
pub type IoTask = Box<dyn FnOnce(&mut SessionCore) + Send>;

/// Hook run when an asynchronous store operation lands.
pub type CompletionHook = Box<dyn FnOnce() + Send>;

/// Transport binding for an attached session.
pub trait TransportHandler: Send + Sync {
    fn send(&self, control: Control);

    /// Credit and stop frames go out on the cluster-order channel so a
    /// replicated broker emits them in deterministic order.
    fn send_cluster_order(&self, control: Control) {
        self.send(control);
    }

    fn send_detach(&self);

    fn channel(&self) -> u16;

    fn connection(&self) -> Arc<dyn ConnectionContext>;
}

/// Per-connection context shared by every session on the connection.
pub trait ConnectionContext: Send + Sync {
    fn id(&self) -> ConnectionId;

    fn frame_max(&self) -> u32;

    /// Whether the client negotiated producer throttling support.
    fn client_throttling(&self) -> bool {
        false
    }

    fn activate_output(&self);

    fn abort_output(&self);

    fn give_read_credit(&self, credit: i32);

    /// Schedule a task on the I/O thread owning this connection's sessions.
    fn request_io_processing(&self, task: IoTask);
}

/// A message as it sits on a queue.
#[derive(Clone)]
pub struct QueuedMessage {
    pub message: MessageRef,
    pub position: u64,
}

impl QueuedMessage {
    pub fn new(message: MessageRef, position: u64) -> Self {
        Self { message, position }
    }
}

/// Queue engine seam. Dispatch pushes queued messages into registered
/// consumer slots; the queue decides ordering and fairness.
pub trait Queue: Send + Sync {
    fn name(&self) -> &str;

    fn consume(&self, slot: Arc<ConsumerSlot>);

    fn cancel(&self, slot: &ConsumerSlot);

    /// Push pending messages to consumers; true when anything was delivered.
    fn dispatch(&self) -> bool;

    /// Synchronous pull-one; the popped message is acquired by the caller.
    fn pop(&self) -> Option<QueuedMessage>;

    /// Acquire a browsed message; false when it is no longer available.
    fn acquire(&self, msg: &QueuedMessage) -> bool;

    fn enqueue(&self, message: MessageRef);

    /// Finalize removal of an acquired message.
    fn dequeue(&self, msg: &QueuedMessage);

    /// Return an acquired message to the queue.
    fn requeue(&self, msg: QueuedMessage);
}

/// Routing target collector handed to [`Exchange::route`].
pub trait Deliverable {
    fn deliver_to(&mut self, queue: Arc<dyn Queue>);
}

/// Exchange engine seam.
pub trait Exchange: Send + Sync {
    fn name(&self) -> &str;

    fn route(&self, message: &MessageRef, routing_key: &str, strategy: &mut dyn Deliverable);
}

/// Journal seam. Enqueue is asynchronous: `done` may run on the store
/// thread at any later point. `flush` asks for the write covering the given
/// message to land promptly.
pub trait MessageStore: Send + Sync {
    fn enqueue(&self, message: &MessageRef, queue: &str, done: CompletionHook);

    fn dequeue(&self, message: &MessageRef, queue: &str);

    fn flush(&self, message: &MessageRef);

    fn commit(&self, xid: Option<&str>);

    fn abort(&self, xid: Option<&str>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AclAction {
    Consume,
    Publish,
    Access,
}

/// Policy seam; evaluation lives outside the engine.
pub trait AccessControl: Send + Sync {
    fn authorise(&self, action: AclAction, name: &str) -> bool;
}

/// Cooperative cancellation token for a scheduled task. A fired task must
/// check the handle before touching anything.
#[derive(Clone, Debug, Default)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Timer seam for delayed tasks (scheduled credit replenishment).
pub trait Timer: Send + Sync {
    fn schedule(&self, delay: Duration, task: Box<dyn FnOnce() + Send>) -> TimerHandle;
}

/// Tokio-backed timer; requires a running runtime.
#[derive(Clone)]
pub struct TokioTimer {
    handle: tokio::runtime::Handle,
}

impl TokioTimer {
    /// Capture the current runtime. Panics outside a runtime context.
    pub fn new() -> Self {
        Self {
            handle: tokio::runtime::Handle::current(),
        }
    }
}

impl Default for TokioTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer for TokioTimer {
    fn schedule(&self, delay: Duration, task: Box<dyn FnOnce() + Send>) -> TimerHandle {
        let handle = TimerHandle::new();
        let fired = handle.clone();
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if !fired.is_cancelled() {
                task();
            }
        });
        handle
    }
}

/// Management attribute sink for one session's published object.
pub trait ManagementSink: Send + Sync {
    fn set_attached(&self, attached: bool);

    fn set_connection(&self, connection: ConnectionId, channel: u16);

    fn set_max_client_rate(&self, rate: u32);

    fn adjust_client_credit(&self, delta: i64);
}

pub trait QueueRegistry: Send + Sync {
    fn get(&self, name: &str) -> Option<Arc<dyn Queue>>;
}

pub trait ExchangeRegistry: Send + Sync {
    fn get(&self, name: &str) -> Option<Arc<dyn Exchange>>;
}

/// Everything a session needs from the broker runtime it lives in.
pub trait BrokerContext: Send + Sync {
    fn queues(&self) -> &dyn QueueRegistry;

    fn exchanges(&self) -> &dyn ExchangeRegistry;

    fn store(&self) -> Option<Arc<dyn MessageStore>>;

    fn acl(&self) -> Option<Arc<dyn AccessControl>>;

    fn timer(&self) -> Arc<dyn Timer>;

    fn management(&self, _session: &SessionId) -> Option<Arc<dyn ManagementSink>> {
        None
    }
}
