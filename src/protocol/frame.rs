//! Frames, session methods and outbound control commands.
//!
//! The frame codec itself lives with the transport; this module models the
//! decoded shape the session engine consumes (method/header/body payloads
//! with segment boundary flags) and the controls it emits back to the peer.

use std::fmt;

use bytes::Bytes;

use crate::protocol::message::MessageRef;
use crate::protocol::sequence::{SequenceNumber, SequenceSet};

/// Stable identifier of a logical session, distinct from the transport
/// channel it is currently attached to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of a transport connection; drives the noLocal filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Whether a transfer must be confirmed with `message.accept`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AcceptMode {
    #[default]
    Explicit,
    None,
}

/// Whether a transferred message is acquired by the receiver up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AcquireMode {
    #[default]
    PreAcquired,
    NotAcquired,
}

/// Credit accounting discipline for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowMode {
    /// Credit is consumed permanently.
    Credit,
    /// Credit is restored when the delivery is accepted.
    Window,
}

/// Unit of a `message.flow` grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditUnit {
    Message,
    Byte,
}

/// Distributed transaction identifier.
pub type Xid = String;

/// The session methods this engine dispatches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    /// Content-bearing publish; body arrives in subsequent segments.
    MessageTransfer {
        destination: String,
        accept_mode: AcceptMode,
        acquire_mode: AcquireMode,
    },
    MessageSubscribe {
        queue: String,
        destination: String,
        accept_mode: AcceptMode,
        acquire_mode: AcquireMode,
        exclusive: bool,
        no_local: bool,
    },
    MessageCancel {
        destination: String,
    },
    MessageAccept {
        transfers: SequenceSet,
    },
    MessageRelease {
        transfers: SequenceSet,
        set_redelivered: bool,
    },
    MessageReject {
        transfers: SequenceSet,
    },
    MessageAcquire {
        transfers: SequenceSet,
    },
    MessageSetFlowMode {
        destination: String,
        mode: FlowMode,
    },
    MessageFlow {
        destination: String,
        unit: CreditUnit,
        value: u32,
    },
    MessageFlush {
        destination: String,
    },
    MessageStop {
        destination: String,
    },
    ExecutionSync,
    TxSelect,
    TxCommit,
    TxRollback,
    DtxSelect,
    DtxStart {
        xid: Xid,
        join: bool,
        resume: bool,
    },
    DtxEnd {
        xid: Xid,
        fail: bool,
        suspend: bool,
    },
    /// A method this engine does not dispatch; reported as not-implemented.
    Unknown {
        class_code: u8,
        method_code: u8,
    },
}

impl Method {
    pub fn is_content_bearing(&self) -> bool {
        matches!(self, Method::MessageTransfer { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Method::MessageTransfer { .. } => "message.transfer",
            Method::MessageSubscribe { .. } => "message.subscribe",
            Method::MessageCancel { .. } => "message.cancel",
            Method::MessageAccept { .. } => "message.accept",
            Method::MessageRelease { .. } => "message.release",
            Method::MessageReject { .. } => "message.reject",
            Method::MessageAcquire { .. } => "message.acquire",
            Method::MessageSetFlowMode { .. } => "message.set-flow-mode",
            Method::MessageFlow { .. } => "message.flow",
            Method::MessageFlush { .. } => "message.flush",
            Method::MessageStop { .. } => "message.stop",
            Method::ExecutionSync => "execution.sync",
            Method::TxSelect => "tx.select",
            Method::TxCommit => "tx.commit",
            Method::TxRollback => "tx.rollback",
            Method::DtxSelect => "dtx.select",
            Method::DtxStart { .. } => "dtx.start",
            Method::DtxEnd { .. } => "dtx.end",
            Method::Unknown { .. } => "unknown",
        }
    }
}

/// Header segment of a content-bearing command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Header {
    pub routing_key: String,
    pub durable: bool,
}

/// Decoded frame payload.
#[derive(Debug, Clone)]
pub enum FramePayload {
    Method { method: Method, sync: bool },
    Header(Header),
    Body(Bytes),
}

/// A decoded frame plus its segment boundary flags.
///
/// `first_frame`/`last_frame` position the frame within its segment;
/// `first_segment`/`last_segment` position the segment within the command
/// assembly. A complete single-frame command has all four set.
#[derive(Debug, Clone)]
pub struct Frame {
    pub first_segment: bool,
    pub last_segment: bool,
    pub first_frame: bool,
    pub last_frame: bool,
    pub payload: FramePayload,
}

impl Frame {
    /// A complete single-frame method command.
    pub fn command(method: Method, sync: bool) -> Self {
        Self {
            first_segment: true,
            last_segment: true,
            first_frame: true,
            last_frame: true,
            payload: FramePayload::Method { method, sync },
        }
    }

    pub fn begins_assembly(&self) -> bool {
        self.first_frame && self.first_segment
    }

    pub fn ends_assembly(&self) -> bool {
        self.last_frame && self.last_segment
    }
}

/// Value returned by a dispatched command handler.
#[derive(Debug, Clone, Default)]
pub struct InvokeResult {
    pub value: Option<Bytes>,
}

impl InvokeResult {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_value(value: Bytes) -> Self {
        Self { value: Some(value) }
    }
}

/// Outbound control commands the session emits to its peer.
#[derive(Debug, Clone)]
pub enum Control {
    SessionCompletion {
        commands: SequenceSet,
    },
    MessageTransfer {
        destination: String,
        delivery_id: SequenceNumber,
        message: MessageRef,
        redelivered: bool,
    },
    MessageAccept {
        transfers: SequenceSet,
    },
    MessageSetFlowMode {
        destination: String,
        mode: FlowMode,
    },
    MessageFlow {
        destination: String,
        unit: CreditUnit,
        value: u32,
    },
    MessageStop {
        destination: String,
    },
    ExecutionResult {
        id: SequenceNumber,
        value: Bytes,
    },
    ExecutionException {
        id: SequenceNumber,
        code: u16,
        description: String,
    },
}
