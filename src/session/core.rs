//! Ingress command pipeline and completion tracking.
//!
//! [`SessionCore`] owns one session end to end: it classifies inbound
//! frames, assembles content-bearing commands, dispatches methods into the
//! semantic state, and reports completions back to the peer in receive
//! order. Commands that finish on other threads re-enter through the
//! [`AsyncCommandManager`]; `execution.sync` barriers hold their place in
//! the pending-sync queue until every earlier command has completed.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::broker::{BrokerContext, ManagementSink, MessageStore, TimerHandle, TransportHandler};
use crate::core::config::SessionConfig;
use crate::core::time::Clock;
use crate::protocol::error::{SessionError, SessionResult};
use crate::protocol::frame::{
    AcceptMode, AcquireMode, Control, CreditUnit, FlowMode, Frame, FramePayload, InvokeResult,
    Method, SessionId,
};
use crate::protocol::message::{AssembledTransfer, MessageBuilder, MessageRef};
use crate::protocol::sequence::{SequenceNumber, SequenceSet};
use crate::semantics::state::SemanticState;
use crate::session::completion::{AsyncCommand, AsyncCommandManager, CommandResult};
use crate::session::outbound::SessionOutbound;
use crate::session::rate::RateFlowControl;

/// Receiver-side command window: the next expected id plus the two sliding
/// sets (incomplete, and completed-but-unconfirmed-by-peer).
struct ReceiverWindow {
    next: SequenceNumber,
    incomplete: SequenceSet,
    completed: SequenceSet,
}

impl ReceiverWindow {
    fn new() -> Self {
        Self {
            next: SequenceNumber::default(),
            incomplete: SequenceSet::new(),
            completed: SequenceSet::new(),
        }
    }

    fn start_command(&mut self) -> SequenceNumber {
        let id = self.next;
        self.next = id.next();
        self.incomplete.add(id);
        id
    }

    fn completed(&mut self, id: SequenceNumber) {
        self.incomplete.remove(id);
        self.completed.add(id);
    }

    fn first_incomplete(&self) -> Option<SequenceNumber> {
        self.incomplete.first()
    }

    fn known_completed(&self) -> &SequenceSet {
        &self.completed
    }

    fn peer_confirmed(&mut self, commands: &SequenceSet) {
        for id in commands.iter() {
            self.completed.remove(id);
        }
    }
}

/// The command currently being handled by the ingress pipeline.
struct CurrentCommand {
    id: SequenceNumber,
    sync: bool,
    accept_required: bool,
    complete: bool,
}

/// A transfer whose ingress completion is waiting on the journal.
struct IngressTransfer {
    message: MessageRef,
    store: Option<Arc<dyn MessageStore>>,
}

impl AsyncCommand for IngressTransfer {
    fn flush(&self) {
        if let Some(store) = &self.store {
            store.flush(&self.message);
        }
    }
}

pub struct SessionCore {
    id: SessionId,
    broker: Arc<dyn BrokerContext>,
    config: SessionConfig,
    clock: Arc<dyn Clock>,
    receiver: ReceiverWindow,
    accepted: SequenceSet,
    pending_syncs: VecDeque<SequenceNumber>,
    current: Option<CurrentCommand>,
    builder: MessageBuilder,
    outbound: Arc<SessionOutbound>,
    semantics: SemanticState,
    async_commands: Arc<AsyncCommandManager>,
    rate_flow: Option<Mutex<RateFlowControl>>,
    credit_timer: Option<TimerHandle>,
    mgmt: Option<Arc<dyn ManagementSink>>,
    closed: bool,
}

impl SessionCore {
    pub fn new(
        id: SessionId,
        broker: Arc<dyn BrokerContext>,
        config: SessionConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let outbound = Arc::new(SessionOutbound::new(id.clone()));
        let semantics = SemanticState::new(
            id.clone(),
            broker.clone(),
            outbound.clone(),
            clock.clone(),
            Duration::from_secs(config.dtx_default_timeout_secs),
        );
        let mgmt = broker.management(&id);
        if let Some(mgmt) = &mgmt {
            if config.max_session_rate > 0 {
                mgmt.set_max_client_rate(config.max_session_rate);
            }
        }
        Self {
            id,
            broker,
            config,
            clock,
            receiver: ReceiverWindow::new(),
            accepted: SequenceSet::new(),
            pending_syncs: VecDeque::new(),
            current: None,
            builder: MessageBuilder::new(),
            outbound,
            semantics,
            async_commands: Arc::new(AsyncCommandManager::new()),
            rate_flow: None,
            credit_timer: None,
            mgmt,
            closed: false,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn is_attached(&self) -> bool {
        self.outbound.is_attached()
    }

    pub fn semantics(&self) -> &SemanticState {
        &self.semantics
    }

    pub fn semantics_mut(&mut self) -> &mut SemanticState {
        &mut self.semantics
    }

    pub fn async_commands(&self) -> &Arc<AsyncCommandManager> {
        &self.async_commands
    }

    // -----------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------

    /// Bind to a transport handler. State accumulated while detached (and
    /// completions buffered by the manager) become reachable again.
    pub fn attach(&mut self, handler: Arc<dyn TransportHandler>) {
        let connection = handler.connection();
        self.outbound.attach(handler.clone());
        if let Some(mgmt) = &self.mgmt {
            mgmt.set_attached(true);
            mgmt.set_connection(connection.id(), handler.channel());
        }
        if self.config.max_session_rate > 0 && self.rate_flow.is_none() {
            if connection.client_throttling() {
                self.rate_flow = Some(Mutex::new(RateFlowControl::new(
                    self.config.max_session_rate,
                    self.config.initial_credit_cap,
                    self.clock.now(),
                )));
            } else {
                warn!(session = %self.id, "unable to flow control client - client doesn't support");
            }
        }
        self.async_commands.attached(connection);
        debug!(session = %self.id, "attached on broker");
    }

    /// Unbind from the transport. Pending commands and unacked deliveries
    /// are retained for a later attach.
    pub fn detach(&mut self) {
        debug!(session = %self.id, "detached on broker");
        self.async_commands.detached();
        self.semantics.detached();
        self.outbound.detach();
        if let Some(mgmt) = &self.mgmt {
            mgmt.set_attached(false);
        }
    }

    /// The transport is writable: enable consumer output and issue the
    /// initial producer credit through the cluster-order channel.
    pub fn ready_to_send(&mut self) {
        debug!(session = %self.id, "ready to send, activating output");
        self.semantics.attached();
        if let Some(rate_flow) = &self.rate_flow {
            let mut flow = rate_flow.lock();
            let credit = flow.rate().min(self.config.initial_credit_cap);
            debug!(session = %self.id, credit, "issuing producer message credit");
            self.outbound.send_cluster_order(Control::MessageSetFlowMode {
                destination: String::new(),
                mode: FlowMode::Credit,
            });
            self.outbound.send_cluster_order(Control::MessageFlow {
                destination: String::new(),
                unit: CreditUnit::Message,
                value: credit,
            });
            flow.sent_credit(self.clock.now(), credit);
            if let Some(mgmt) = &self.mgmt {
                mgmt.adjust_client_credit(i64::from(credit));
            }
        }
    }

    /// Session resume is not implemented, so a non-zero timeout would only
    /// keep dead sessions around; the value is accepted and ignored.
    pub fn set_timeout(&mut self, _seconds: u32) {}

    pub fn abort(&self) {
        self.outbound.abort_output();
    }

    pub fn give_read_credit(&self, credit: i32) {
        self.outbound.give_read_credit(credit);
    }

    /// Teardown ordering matters: sever the manager's back-reference
    /// first, then cancel the flow timer, then drop consumer state.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.async_commands.cancel_session();
        if let Some(timer) = self.credit_timer.take() {
            timer.cancel();
        }
        self.semantics.closed();
        if let Some(mgmt) = &self.mgmt {
            mgmt.set_attached(false);
        }
    }

    // -----------------------------------------------------------------
    // Ingress
    // -----------------------------------------------------------------

    /// Classify and handle one inbound frame. Errors are transmitted to
    /// the peer as `execution.exception` before being returned; fatal ones
    /// also abort output and request a detach.
    pub fn handle_frame(&mut self, frame: Frame) -> SessionResult<()> {
        let outcome = self.handle_frame_inner(frame);
        if let Err(error) = &outcome {
            self.report_exception(error);
        }
        outcome
    }

    fn handle_frame_inner(&mut self, frame: Frame) -> SessionResult<()> {
        let content_bearing = match &frame.payload {
            FramePayload::Method { method, .. } => method.is_content_bearing(),
            FramePayload::Header(_) | FramePayload::Body(_) => true,
        };
        if content_bearing {
            self.handle_content(frame)
        } else if frame.begins_assembly() && frame.ends_assembly() {
            let FramePayload::Method { method, sync } = frame.payload else {
                unreachable!("non-method payloads are content-bearing");
            };
            self.handle_command(method, sync)
        } else {
            Err(SessionError::Internal(
                "multi-frame command segments unsupported".into(),
            ))
        }
    }

    fn report_exception(&mut self, error: &SessionError) {
        let id = self
            .current
            .as_ref()
            .map_or_else(SequenceNumber::default, |c| c.id);
        warn!(session = %self.id, %id, %error, "command failed");
        self.outbound.send(Control::ExecutionException {
            id,
            code: error.code(),
            description: error.to_string(),
        });
        if error.aborts_session() {
            self.outbound.abort_output();
            self.outbound.send_detach();
        }
    }

    fn handle_command(&mut self, method: Method, sync: bool) -> SessionResult<()> {
        let id = self.receiver.start_command();
        self.current = Some(CurrentCommand {
            id,
            sync,
            accept_required: false,
            complete: true,
        });
        let result = self.dispatch(method)?;
        if let Some(current) = self.current.take() {
            if current.complete {
                self.complete_command(
                    id,
                    CommandResult {
                        value: result.value,
                        error: None,
                    },
                    current.accept_required,
                    current.sync,
                );
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, method: Method) -> SessionResult<InvokeResult> {
        match method {
            Method::MessageTransfer { .. } => Err(SessionError::Internal(
                "content-bearing method dispatched as command".into(),
            )),
            Method::MessageSubscribe {
                queue,
                destination,
                accept_mode,
                acquire_mode,
                exclusive,
                no_local,
            } => {
                let tag = (!destination.is_empty()).then_some(destination);
                self.semantics.consume(
                    tag,
                    &queue,
                    no_local,
                    accept_mode == AcceptMode::Explicit,
                    acquire_mode == AcquireMode::PreAcquired,
                    exclusive,
                )?;
                Ok(InvokeResult::none())
            }
            Method::MessageCancel { destination } => {
                self.semantics.cancel(&destination)?;
                Ok(InvokeResult::none())
            }
            Method::MessageAccept { transfers } => {
                for (first, last) in transfers.ranges() {
                    self.semantics.accept_range(first, last)?;
                }
                Ok(InvokeResult::none())
            }
            Method::MessageRelease {
                transfers,
                set_redelivered,
            } => {
                for (first, last) in transfers.ranges() {
                    self.semantics.release_range(first, last, set_redelivered)?;
                }
                Ok(InvokeResult::none())
            }
            Method::MessageReject { transfers } => {
                for (first, last) in transfers.ranges() {
                    self.semantics.reject_range(first, last)?;
                }
                Ok(InvokeResult::none())
            }
            Method::MessageAcquire { transfers } => {
                let mut acquired = SequenceSet::new();
                for (first, last) in transfers.ranges() {
                    for (a, b) in self.semantics.acquire_range(first, last)?.ranges() {
                        acquired.add_range(a, b);
                    }
                }
                Ok(InvokeResult::with_value(acquired.encode()))
            }
            Method::MessageSetFlowMode { destination, mode } => {
                match mode {
                    FlowMode::Window => self.semantics.set_window_mode(&destination)?,
                    FlowMode::Credit => self.semantics.set_credit_mode(&destination)?,
                }
                Ok(InvokeResult::none())
            }
            Method::MessageFlow {
                destination,
                unit,
                value,
            } => {
                match unit {
                    CreditUnit::Message => self.semantics.add_message_credit(&destination, value)?,
                    CreditUnit::Byte => self.semantics.add_byte_credit(&destination, value)?,
                }
                Ok(InvokeResult::none())
            }
            Method::MessageFlush { destination } => {
                self.semantics.flush(&destination)?;
                Ok(InvokeResult::none())
            }
            Method::MessageStop { destination } => {
                self.semantics.stop(&destination)?;
                Ok(InvokeResult::none())
            }
            Method::ExecutionSync => {
                self.add_pending_execution_sync();
                Ok(InvokeResult::none())
            }
            Method::TxSelect => {
                self.semantics.start_tx()?;
                Ok(InvokeResult::none())
            }
            Method::TxCommit => {
                self.semantics.commit()?;
                Ok(InvokeResult::none())
            }
            Method::TxRollback => {
                self.semantics.rollback()?;
                Ok(InvokeResult::none())
            }
            Method::DtxSelect => {
                self.semantics.select_dtx()?;
                Ok(InvokeResult::none())
            }
            Method::DtxStart { xid, join, resume } => {
                if resume {
                    self.semantics.resume_dtx(&xid)?;
                } else {
                    self.semantics.start_dtx(&xid, join)?;
                }
                Ok(InvokeResult::none())
            }
            Method::DtxEnd { xid, fail, suspend } => {
                if suspend {
                    self.semantics.suspend_dtx(&xid)?;
                } else {
                    self.semantics.end_dtx(&xid, fail)?;
                }
                Ok(InvokeResult::none())
            }
            Method::Unknown {
                class_code,
                method_code,
            } => Err(SessionError::NotImplemented(format!(
                "method {class_code}.{method_code}"
            ))),
        }
    }

    /// The current command is an execution.sync: complete it only once all
    /// preceding commands have completed.
    fn add_pending_execution_sync(&mut self) {
        let Some(current) = self.current.as_mut() else {
            return;
        };
        let id = current.id;
        // the sync id itself sits in the incomplete window; anything
        // smaller is an earlier command still outstanding. A sync naming
        // an id past everything received completes immediately.
        if self.receiver.first_incomplete().is_some_and(|first| first < id) {
            current.complete = false;
            self.pending_syncs.push_back(id);
            self.async_commands.flush_all();
            debug!(session = %self.id, %id, "delaying completion of execution.sync");
        }
    }

    fn handle_content(&mut self, frame: Frame) -> SessionResult<()> {
        let starts = frame.begins_assembly();
        let ends = frame.ends_assembly();
        if starts {
            let id = self.receiver.start_command();
            self.current = Some(CurrentCommand {
                id,
                sync: false,
                accept_required: false,
                complete: true,
            });
            self.builder.start(id);
        }
        self.builder.handle(&frame)?;
        if ends {
            let AssembledTransfer {
                id,
                mut message,
                accept_required,
                sync,
            } = self.builder.end()?;
            if let Some(current) = &mut self.current {
                current.sync = sync;
                current.accept_required = accept_required;
            }
            if let Some(publisher) = self.outbound.local_connection() {
                message.set_publisher(publisher);
            }
            let message: MessageRef = Arc::new(message);
            message.ingress().begin();
            self.semantics.handle(message.clone())?;

            let manager = self.async_commands.clone();
            let store = self.broker.store();
            let inline = message.ingress().end(|| {
                let pending = Arc::new(IngressTransfer {
                    message: message.clone(),
                    store: store.clone(),
                });
                if let Err(dup) = manager.add(id, accept_required, sync, pending) {
                    error!(session = %self.id, %dup, "async registration failed");
                }
                let completer = manager.clone();
                Box::new(move || completer.complete(id, CommandResult::ok()))
            });
            self.current = None;
            if inline {
                self.complete_command(id, CommandResult::ok(), accept_required, sync);
            } else if sync {
                // the client is waiting on this transfer: push the journal
                // write out now rather than at the next natural flush
                if let Some(store) = &store {
                    store.flush(&message);
                }
            }
        }

        // producer flow control, charged once per frameset
        if starts && self.rate_flow.is_some() && !self.process_send_credit(1) {
            debug!(session = %self.id, "schedule sending credit");
            self.arm_credit_timer();
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Completion
    // -----------------------------------------------------------------

    /// Complete a received command: mark it in the receiver window, emit
    /// any result, batch its accept, drain satisfied sync barriers, and
    /// notify the peer when the sync bit (or a drained barrier) asks.
    pub fn complete_command(
        &mut self,
        id: SequenceNumber,
        result: CommandResult,
        accept_required: bool,
        sync: bool,
    ) {
        self.receiver.completed(id);

        if let Some(error) = result.error {
            warn!(session = %self.id, %id, %error, "asynchronous command failed");
            self.outbound.send(Control::ExecutionException {
                id,
                code: error.code(),
                description: error.to_string(),
            });
            if error.aborts_session() {
                self.outbound.abort_output();
                self.outbound.send_detach();
                return;
            }
        } else if let Some(value) = result.value {
            self.outbound.send(Control::ExecutionResult { id, value });
        }

        if accept_required {
            // the id appears in the next message.accept we send
            self.accepted.add(id);
        }

        let mut drained = false;
        while let Some(&head) = self.pending_syncs.front() {
            let barrier_clear = match self.receiver.first_incomplete() {
                None => true,
                Some(first) => first >= head,
            };
            if !barrier_clear {
                break;
            }
            self.pending_syncs.pop_front();
            debug!(session = %self.id, sync = %head, "delayed execution.sync completed");
            self.receiver.completed(head);
            drained = true;
        }

        if sync {
            self.send_accept_and_completion();
        } else if drained {
            self.send_completion();
        }
    }

    fn send_accept_and_completion(&mut self) {
        if !self.accepted.is_empty() {
            let transfers = std::mem::take(&mut self.accepted);
            self.outbound.send(Control::MessageAccept { transfers });
        }
        self.send_completion();
    }

    fn send_completion(&mut self) {
        self.outbound.send(Control::SessionCompletion {
            commands: self.receiver.known_completed().clone(),
        });
    }

    /// Run queued asynchronous completions. Scheduled onto the I/O thread
    /// by the manager; also callable directly by embedding runtimes.
    pub fn process_completed_commands(&mut self) {
        for completed in self.async_commands.drain() {
            self.complete_command(
                completed.id,
                completed.result,
                completed.accept_required,
                completed.sync,
            );
        }
    }

    /// The peer confirmed these outbound commands complete; deliveries not
    /// requiring accept release their resources.
    pub fn sender_completed(&mut self, commands: &SequenceSet) {
        self.semantics.completed(commands);
    }

    /// The peer acknowledged our session.completion up to these ids.
    pub fn known_completed(&mut self, commands: &SequenceSet) {
        self.receiver.peer_confirmed(commands);
    }

    // -----------------------------------------------------------------
    // Producer rate flow control
    // -----------------------------------------------------------------

    /// Account for received publishes and grant credit when due. Returns
    /// false when no credit could be granted and a retry should be
    /// scheduled.
    pub fn process_send_credit(&mut self, msgs: u32) -> bool {
        let Some(rate_flow) = &self.rate_flow else {
            return true;
        };
        let mut flow = rate_flow.lock();
        if msgs > 0 && flow.flow_stopped() {
            warn!(session = %self.id, "producer throttling violation");
            self.outbound.send_cluster_order(Control::MessageStop {
                destination: String::new(),
            });
            return true;
        }
        let now = self.clock.now();
        let grant = flow.received_message(now, msgs);
        if let Some(mgmt) = &self.mgmt {
            if msgs > 0 {
                mgmt.adjust_client_credit(-i64::from(msgs));
            }
        }
        if grant > 0 {
            debug!(session = %self.id, grant, "send producer credit");
            self.outbound.send_cluster_order(Control::MessageFlow {
                destination: String::new(),
                unit: CreditUnit::Message,
                value: grant,
            });
            flow.sent_credit(now, grant);
            if let Some(mgmt) = &self.mgmt {
                mgmt.adjust_client_credit(i64::from(grant));
            }
            true
        } else {
            !flow.flow_stopped()
        }
    }

    fn arm_credit_timer(&mut self) {
        let Some(rate_flow) = &self.rate_flow else {
            return;
        };
        let delay = rate_flow
            .lock()
            .retry_delay(Duration::from_millis(self.config.scheduled_credit_cap_ms));
        let Some(connection) = self.outbound.connection() else {
            return;
        };
        if let Some(stale) = self.credit_timer.take() {
            stale.cancel();
        }
        let manager = self.async_commands.clone();
        let handle = self.broker.timer().schedule(
            delay,
            Box::new(move || {
                // the session may be gone by the time the timer fires;
                // re-check liveness before hopping onto the I/O thread
                if manager.is_live() {
                    connection
                        .request_io_processing(Box::new(|session| session.scheduled_credit()));
                }
            }),
        );
        self.credit_timer = Some(handle);
    }

    /// Timer body, run on the I/O thread: retry the credit grant and
    /// re-arm if the bucket still cannot cover one.
    pub fn scheduled_credit(&mut self) {
        if self.process_send_credit(0) {
            self.credit_timer = None;
        } else {
            warn!(session = %self.id, "reschedule sending credit");
            self.arm_credit_timer();
        }
    }

    // -----------------------------------------------------------------
    // Embedding surface
    // -----------------------------------------------------------------

    /// Synchronous pull-one for management and embedding callers.
    pub fn get(&mut self, destination: &str, queue: &str, ack_expected: bool) -> SessionResult<bool> {
        self.semantics.get(destination, queue, ack_expected)
    }

    pub fn recover(&mut self, requeue: bool) -> SessionResult<()> {
        self.semantics.recover(requeue)
    }

    pub fn has_output(&self) -> bool {
        self.semantics.has_output()
    }

    pub fn do_output(&self) -> bool {
        self.semantics.do_output()
    }
}

impl Drop for SessionCore {
    fn drop(&mut self) {
        self.close();
    }
}
