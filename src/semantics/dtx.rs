//! Distributed transaction buffers.
//!
//! A [`DtxBuffer`] is a transaction buffer tagged with an xid and a state
//! machine. The session holds at most one active dtx buffer; suspended
//! buffers park in a map keyed by xid, ended buffers wait for the commit
//! path. `fail` on `dtx.end` poisons the branch: it can only roll back.

use std::sync::Arc;
use std::time::Instant;

use crate::broker::MessageStore;
use crate::protocol::error::{SessionError, SessionResult};
use crate::protocol::frame::Xid;
use crate::semantics::tx::{TxBuffer, TxOp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtxState {
    Active,
    Suspended,
    Ended,
    Prepared,
    Committed,
    RolledBack,
    TimedOut,
}

impl DtxState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DtxState::Committed | DtxState::RolledBack)
    }
}

pub struct DtxBuffer {
    xid: Xid,
    ops: TxBuffer,
    state: DtxState,
    rollback_only: bool,
    expires_at: Option<Instant>,
}

impl DtxBuffer {
    pub fn new(xid: impl Into<Xid>) -> Self {
        Self {
            xid: xid.into(),
            ops: TxBuffer::new(),
            state: DtxState::Active,
            rollback_only: false,
            expires_at: None,
        }
    }

    pub fn xid(&self) -> &str {
        &self.xid
    }

    pub fn state(&self) -> DtxState {
        self.state
    }

    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only
    }

    pub fn op_count(&self) -> usize {
        self.ops.len()
    }

    pub fn set_timeout(&mut self, deadline: Instant) {
        self.expires_at = Some(deadline);
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    /// Expiry noticed before a terminal transition; the branch can only
    /// roll back from here.
    pub fn mark_timed_out(&mut self) {
        if !self.state.is_terminal() {
            self.state = DtxState::TimedOut;
            self.rollback_only = true;
        }
    }

    fn transition(&mut self, from: &[DtxState], to: DtxState) -> SessionResult<()> {
        if from.contains(&self.state) {
            self.state = to;
            Ok(())
        } else {
            Err(SessionError::IllegalState(format!(
                "xid {}: cannot move from {:?} to {:?}",
                self.xid, self.state, to
            )))
        }
    }

    pub fn enlist(&mut self, op: Box<dyn TxOp>) -> SessionResult<()> {
        if self.state != DtxState::Active {
            return Err(SessionError::IllegalState(format!(
                "xid {}: work arrived while {:?}",
                self.xid, self.state
            )));
        }
        self.ops.enlist(op);
        Ok(())
    }

    pub fn suspend(&mut self) -> SessionResult<()> {
        self.transition(&[DtxState::Active], DtxState::Suspended)
    }

    pub fn resume(&mut self) -> SessionResult<()> {
        self.transition(&[DtxState::Suspended], DtxState::Active)
    }

    pub fn mark_ended(&mut self, fail: bool) -> SessionResult<()> {
        self.transition(&[DtxState::Active], DtxState::Ended)?;
        if fail {
            self.rollback_only = true;
        }
        Ok(())
    }

    /// Reopen an ended branch for more work (`dtx.start` with join).
    pub fn rejoin(&mut self) -> SessionResult<()> {
        self.transition(&[DtxState::Ended], DtxState::Active)
    }

    /// First phase. Returns whether every operation voted to commit; a
    /// refused vote leaves the branch Ended so it can roll back.
    pub fn prepare(&mut self, store: Option<&Arc<dyn MessageStore>>) -> SessionResult<bool> {
        if self.rollback_only {
            return Err(SessionError::IllegalState(format!(
                "xid {}: branch is rollback-only",
                self.xid
            )));
        }
        self.transition(&[DtxState::Ended], DtxState::Prepared)?;
        if self.ops.prepare(store) {
            Ok(true)
        } else {
            self.state = DtxState::Ended;
            Ok(false)
        }
    }

    pub fn commit(
        &mut self,
        store: Option<&Arc<dyn MessageStore>>,
        one_phase: bool,
    ) -> SessionResult<()> {
        if self.rollback_only {
            return Err(SessionError::IllegalState(format!(
                "xid {}: branch is rollback-only",
                self.xid
            )));
        }
        if one_phase {
            self.transition(&[DtxState::Ended], DtxState::Committed)?;
            if !self.ops.prepare(store) {
                self.state = DtxState::Ended;
                return Err(SessionError::PreconditionFailed(format!(
                    "xid {}: store refused one-phase commit",
                    self.xid
                )));
            }
        } else {
            self.transition(&[DtxState::Prepared], DtxState::Committed)?;
        }
        if let Some(store) = store {
            store.commit(Some(&self.xid));
        }
        self.ops.commit();
        Ok(())
    }

    pub fn rollback(&mut self, store: Option<&Arc<dyn MessageStore>>) -> SessionResult<()> {
        self.transition(
            &[DtxState::Ended, DtxState::Prepared, DtxState::TimedOut],
            DtxState::RolledBack,
        )?;
        if let Some(store) = store {
            store.abort(Some(&self.xid));
        }
        self.ops.rollback();
        Ok(())
    }
}
