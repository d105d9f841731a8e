//! Attachment-aware outbound channel.
//!
//! Both the session core and its consumer slots emit frames; this is the
//! one place that knows whether a transport is currently bound. Detaching
//! swaps the handler out while the rest of the session state stays put, so
//! every sender goes through here instead of holding the handler itself.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::trace;

use crate::broker::{ConnectionContext, QueuedMessage, TransportHandler};
use crate::protocol::frame::{ConnectionId, Control, SessionId};
use crate::protocol::sequence::SequenceNumber;

#[derive(Default)]
struct Attachment {
    handler: Option<Arc<dyn TransportHandler>>,
    connection: Option<Arc<dyn ConnectionContext>>,
    local: Option<ConnectionId>,
    output_enabled: bool,
}

pub struct SessionOutbound {
    session: SessionId,
    attachment: Mutex<Attachment>,
    // sender-side command point: next outbound transfer id
    next_transfer: Mutex<SequenceNumber>,
}

impl SessionOutbound {
    pub fn new(session: SessionId) -> Self {
        Self {
            session,
            attachment: Mutex::new(Attachment::default()),
            next_transfer: Mutex::new(SequenceNumber::default()),
        }
    }

    pub fn attach(&self, handler: Arc<dyn TransportHandler>) {
        let connection = handler.connection();
        let mut attachment = self.attachment.lock();
        attachment.local = Some(connection.id());
        attachment.connection = Some(connection);
        attachment.handler = Some(handler);
    }

    pub fn detach(&self) {
        let mut attachment = self.attachment.lock();
        attachment.handler = None;
        attachment.connection = None;
        attachment.output_enabled = false;
    }

    pub fn is_attached(&self) -> bool {
        self.attachment.lock().handler.is_some()
    }

    /// The connection currently publishing into this session, for the
    /// noLocal filter.
    pub fn local_connection(&self) -> Option<ConnectionId> {
        self.attachment.lock().local
    }

    pub fn connection(&self) -> Option<Arc<dyn ConnectionContext>> {
        self.attachment.lock().connection.clone()
    }

    pub fn enable_output(&self) {
        self.attachment.lock().output_enabled = true;
    }

    /// Forbids output activations until the session reattaches.
    pub fn disable_output(&self) {
        self.attachment.lock().output_enabled = false;
    }

    pub fn send(&self, control: Control) {
        let handler = self.attachment.lock().handler.clone();
        match handler {
            Some(handler) => handler.send(control),
            None => trace!(session = %self.session, "dropping control while detached"),
        }
    }

    pub fn send_cluster_order(&self, control: Control) {
        let handler = self.attachment.lock().handler.clone();
        match handler {
            Some(handler) => handler.send_cluster_order(control),
            None => trace!(session = %self.session, "dropping control while detached"),
        }
    }

    pub fn send_detach(&self) {
        if let Some(handler) = self.attachment.lock().handler.clone() {
            handler.send_detach();
        }
    }

    pub fn activate_output(&self) {
        let attachment = self.attachment.lock();
        if attachment.output_enabled {
            if let Some(connection) = attachment.connection.clone() {
                drop(attachment);
                connection.activate_output();
            }
        }
    }

    pub fn abort_output(&self) {
        if let Some(connection) = self.attachment.lock().connection.clone() {
            connection.abort_output();
        }
    }

    pub fn give_read_credit(&self, credit: i32) {
        if let Some(connection) = self.attachment.lock().connection.clone() {
            connection.give_read_credit(credit);
        }
    }

    /// Assign the next delivery id and emit the transfer. Returns the id
    /// charged to the delivery record.
    pub fn deliver_transfer(
        &self,
        destination: &str,
        msg: &QueuedMessage,
        redelivered: bool,
    ) -> SequenceNumber {
        let id = {
            let mut next = self.next_transfer.lock();
            let id = *next;
            *next = next.next();
            id
        };
        self.send(Control::MessageTransfer {
            destination: destination.to_string(),
            delivery_id: id,
            message: msg.message.clone(),
            redelivered,
        });
        id
    }
}
