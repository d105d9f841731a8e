//! Cross-thread command completion.
//!
//! Commands normally complete inline on the I/O thread, but store and
//! timer threads finish work later. Workers never touch the session:
//! they hand a [`CommandResult`] to the [`AsyncCommandManager`], which is
//! the only structure shared across threads. The 0→1 edge on the
//! completed list schedules one drain back onto the I/O thread, so a
//! burst of completions collapses into a single request.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, error, trace};

use crate::broker::ConnectionContext;
use crate::protocol::error::{SessionError, SessionResult};
use crate::protocol::sequence::SequenceNumber;

/// Outcome a worker reports for a deferred command. Errors recorded here
/// travel with the completion and surface on the I/O thread.
#[derive(Debug, Clone, Default)]
pub struct CommandResult {
    pub value: Option<Bytes>,
    pub error: Option<SessionError>,
}

impl CommandResult {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn with_value(value: Bytes) -> Self {
        Self {
            value: Some(value),
            error: None,
        }
    }

    pub fn with_error(error: SessionError) -> Self {
        Self {
            value: None,
            error: Some(error),
        }
    }
}

/// A command whose completion was deferred out of the ingress pipeline.
pub trait AsyncCommand: Send + Sync {
    /// Ask the backing work (typically a journal write) to land promptly.
    fn flush(&self);
}

struct PendingEntry {
    accept_required: bool,
    sync: bool,
    command: Arc<dyn AsyncCommand>,
}

/// A completion recorded by a worker, waiting for the I/O-thread drain.
pub struct CompletedCommand {
    pub id: SequenceNumber,
    pub result: CommandResult,
    pub accept_required: bool,
    pub sync: bool,
}

struct Completer {
    pending: HashMap<u32, PendingEntry>,
    completed: Vec<CompletedCommand>,
    attached: bool,
    /// Cleared at session destruction so late completions drop harmlessly.
    live: bool,
    io: Option<Arc<dyn ConnectionContext>>,
}

pub struct AsyncCommandManager {
    inner: Mutex<Completer>,
}

impl Default for AsyncCommandManager {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncCommandManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Completer {
                pending: HashMap::new(),
                completed: Vec::new(),
                attached: false,
                live: true,
                io: None,
            }),
        }
    }

    /// Register a deferred command. A duplicate id is a programmer error.
    pub fn add(
        &self,
        id: SequenceNumber,
        accept_required: bool,
        sync: bool,
        command: Arc<dyn AsyncCommand>,
    ) -> SessionResult<()> {
        let mut inner = self.inner.lock();
        let entry = PendingEntry {
            accept_required,
            sync,
            command,
        };
        if inner.pending.insert(id.value(), entry).is_some() {
            error!(%id, "duplicate pending command id");
            return Err(SessionError::Internal(format!(
                "duplicate pending command id {id}"
            )));
        }
        Ok(())
    }

    pub fn cancel(&self, id: SequenceNumber) {
        self.inner.lock().pending.remove(&id.value());
    }

    /// Record a completion for a registered command. Safe from any thread.
    /// The first completion recorded while the list is empty requests an
    /// I/O-thread drain.
    pub fn complete(&self, id: SequenceNumber, result: CommandResult) {
        let io = {
            let mut inner = self.inner.lock();
            let Some(entry) = inner.pending.remove(&id.value()) else {
                trace!(%id, "completion for unknown command dropped");
                return;
            };
            if !inner.live {
                trace!(%id, "completion after session destruction dropped");
                return;
            }
            inner.completed.push(CompletedCommand {
                id,
                result,
                accept_required: entry.accept_required,
                sync: entry.sync,
            });
            if inner.completed.len() == 1 && inner.attached {
                inner.io.clone()
            } else {
                None
            }
        };
        if let Some(io) = io {
            io.request_io_processing(Box::new(|session| session.process_completed_commands()));
        }
    }

    /// Take the recorded completions for processing on the I/O thread.
    /// While detached the buffer is preserved for the next attach.
    pub fn drain(&self) -> Vec<CompletedCommand> {
        let mut inner = self.inner.lock();
        if !inner.live || !inner.attached {
            return Vec::new();
        }
        std::mem::take(&mut inner.completed)
    }

    /// Ask every pending command to land; called when an execution.sync
    /// barrier is waiting on them. Runs the flushes outside the lock.
    pub fn flush_all(&self) {
        let commands: Vec<Arc<dyn AsyncCommand>> = {
            let inner = self.inner.lock();
            inner.pending.values().map(|e| e.command.clone()).collect()
        };
        for command in commands {
            command.flush();
        }
    }

    /// Session attached: completions may schedule drains again. Anything
    /// buffered while detached gets a drain immediately.
    pub fn attached(&self, io: Arc<dyn ConnectionContext>) {
        let backlog = {
            let mut inner = self.inner.lock();
            inner.attached = true;
            inner.io = Some(io.clone());
            !inner.completed.is_empty()
        };
        if backlog {
            debug!("draining completions buffered while detached");
            io.request_io_processing(Box::new(|session| session.process_completed_commands()));
        }
    }

    /// Session detached: suppress scheduling but keep recording.
    pub fn detached(&self) {
        self.inner.lock().attached = false;
    }

    /// Sever the session back-reference before the session is destroyed,
    /// so late worker completions cannot schedule against a dead session.
    pub fn cancel_session(&self) {
        let mut inner = self.inner.lock();
        inner.live = false;
        inner.io = None;
        inner.pending.clear();
        inner.completed.clear();
    }

    pub fn is_live(&self) -> bool {
        self.inner.lock().live
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn completed_count(&self) -> usize {
        self.inner.lock().completed.len()
    }
}
