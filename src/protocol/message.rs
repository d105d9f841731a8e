//! In-flight message representation and assembly.
//!
//! A published message is assembled from its method, header and body
//! segments, then routed by reference: queues, delivery records and the
//! store all share one [`MessageRef`]. Ingress completion is a refcount
//! over the asynchronous operations (journal writes) the routing started;
//! the transfer command completes only when the count drains.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use crate::protocol::error::{SessionError, SessionResult};
use crate::protocol::frame::{AcceptMode, ConnectionId, Frame, FramePayload, Header, Method};
use crate::protocol::sequence::SequenceNumber;

/// Shared handle to a routed message. Messages may outlive the session that
/// published them while queues still reference them.
pub type MessageRef = Arc<Message>;

pub struct Message {
    exchange: String,
    routing_key: String,
    durable: bool,
    body: Bytes,
    publisher: Option<ConnectionId>,
    requires_accept: bool,
    redelivered: AtomicBool,
    ingress: IngressCompletion,
}

impl Message {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>, body: Bytes) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            durable: false,
            body,
            publisher: None,
            requires_accept: false,
            redelivered: AtomicBool::new(false),
            ingress: IngressCompletion::new(),
        }
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn requiring_accept(mut self, requires_accept: bool) -> Self {
        self.requires_accept = requires_accept;
        self
    }

    /// Record the publishing connection; must happen before the message is
    /// shared.
    pub fn set_publisher(&mut self, publisher: ConnectionId) {
        self.publisher = Some(publisher);
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn content_size(&self) -> u32 {
        self.body.len() as u32
    }

    pub fn requires_accept(&self) -> bool {
        self.requires_accept
    }

    pub fn publisher(&self) -> Option<ConnectionId> {
        self.publisher
    }

    /// True when the message was published on the given connection.
    pub fn is_local_to(&self, connection: Option<ConnectionId>) -> bool {
        connection.is_some() && self.publisher == connection
    }

    pub fn is_redelivered(&self) -> bool {
        self.redelivered.load(Ordering::Relaxed)
    }

    pub fn mark_redelivered(&self) {
        self.redelivered.store(true, Ordering::Relaxed);
    }

    pub fn ingress(&self) -> &IngressCompletion {
        &self.ingress
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("durable", &self.durable)
            .field("size", &self.body.len())
            .field("publisher", &self.publisher)
            .finish()
    }
}

/// Refcount over the asynchronous operations pending on an ingress
/// transfer.
///
/// The ingress pipeline holds one reference from `begin` until `end`; the
/// store takes one per journal write and drops it from its own thread via
/// `finish`. Whichever drop reaches zero runs the deferred hook.
pub struct IngressCompletion {
    pending: AtomicUsize,
    deferred: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Default for IngressCompletion {
    fn default() -> Self {
        Self::new()
    }
}

impl IngressCompletion {
    pub fn new() -> Self {
        Self {
            pending: AtomicUsize::new(0),
            deferred: Mutex::new(None),
        }
    }

    /// Take a reference for an in-flight asynchronous operation.
    pub fn begin(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop a reference from any thread; runs the deferred hook at zero.
    pub fn finish(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            let hook = self.deferred.lock().take();
            if let Some(hook) = hook {
                hook();
            }
        }
    }

    /// Drop the pipeline's reference. Returns `true` when every operation
    /// already finished (the command completes inline). Otherwise `deferred`
    /// is invoked, under the hook lock, to register the pending completion
    /// and produce the hook run by the final [`finish`](Self::finish).
    pub fn end<F>(&self, deferred: F) -> bool
    where
        F: FnOnce() -> Box<dyn FnOnce() + Send>,
    {
        let mut slot = self.deferred.lock();
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            true
        } else {
            *slot = Some(deferred());
            false
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

/// A fully assembled transfer, ready for routing.
pub struct AssembledTransfer {
    pub id: SequenceNumber,
    pub message: Message,
    pub accept_required: bool,
    pub sync: bool,
}

struct PartialTransfer {
    id: SequenceNumber,
    destination: String,
    accept_mode: AcceptMode,
    sync: bool,
    header: Option<Header>,
    body: BytesMut,
}

/// Assembles content-bearing commands from their segment frames.
#[derive(Default)]
pub struct MessageBuilder {
    current: Option<PartialTransfer>,
}

impl MessageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_progress(&self) -> bool {
        self.current.is_some()
    }

    /// Begin assembling the command with the given id.
    pub fn start(&mut self, id: SequenceNumber) {
        self.current = Some(PartialTransfer {
            id,
            destination: String::new(),
            accept_mode: AcceptMode::default(),
            sync: false,
            header: None,
            body: BytesMut::new(),
        });
    }

    pub fn handle(&mut self, frame: &Frame) -> SessionResult<()> {
        let partial = self
            .current
            .as_mut()
            .ok_or_else(|| SessionError::Framing("content frame outside an assembly".into()))?;
        match &frame.payload {
            FramePayload::Method { method, sync } => match method {
                Method::MessageTransfer {
                    destination,
                    accept_mode,
                    ..
                } => {
                    partial.destination = destination.clone();
                    partial.accept_mode = *accept_mode;
                    partial.sync = *sync;
                }
                other => {
                    return Err(SessionError::Framing(format!(
                        "unexpected method {} inside a content assembly",
                        other.name()
                    )))
                }
            },
            FramePayload::Header(header) => {
                partial.header = Some(header.clone());
            }
            FramePayload::Body(chunk) => {
                partial.body.extend_from_slice(chunk);
            }
        }
        Ok(())
    }

    /// Finish the assembly and surrender the message.
    pub fn end(&mut self) -> SessionResult<AssembledTransfer> {
        let partial = self
            .current
            .take()
            .ok_or_else(|| SessionError::Framing("end of assembly without a start".into()))?;
        // a command-only transfer carries no header; defaults apply
        let header = partial.header.unwrap_or_default();
        let accept_required = partial.accept_mode == AcceptMode::Explicit;
        let message = Message::new(partial.destination, header.routing_key, partial.body.freeze())
            .durable(header.durable)
            .requiring_accept(accept_required);
        Ok(AssembledTransfer {
            id: partial.id,
            message,
            accept_required,
            sync: partial.sync,
        })
    }
}
