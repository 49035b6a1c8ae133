//! Transaction state machines — one per protocol kind per endpoint.
//!
//! A transaction moves `PendingSend -> AwaitingResponse -> Completed`, or
//! ends `TimedOut`. The machines share a `TransactionTable` and differ in
//! ordering rules:
//!
//!   io    — responses to one address complete in issue order; an early
//!           response is held until its predecessors finish.
//!   cache — completion in any order, but a snoop stays `PendingSend` while
//!   mem     an earlier request on the same cache line is open.

use std::time::Duration;

use bytes::Bytes;
use cxlsim_core::config::TransactionSettings;
use cxlsim_core::{DeviceId, Opcode, Packet, ProtocolKind, Status, VhId, WireError};
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;
use tokio::time::Instant;

pub mod cache;
pub mod io;
pub mod mem;
pub mod table;

pub use cache::CacheMachine;
pub use io::IoMachine;
pub use mem::MemMachine;
pub use table::{Expired, Transaction, TransactionTable};

pub type TxnId = u16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    PendingSend,
    AwaitingResponse,
    Completed,
    TimedOut,
}

/// What a completed transaction got back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub opcode: Opcode,
    pub status: Status,
    pub data: Bytes,
}

/// Final result of a transaction. Exactly one is delivered per transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed(Response),
    TimedOut,
    RoutingFailed,
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Completed(_) => "completed",
            Outcome::TimedOut => "timed_out",
            Outcome::RoutingFailed => "routing_failed",
        }
    }

    fn from_response(packet: &Packet) -> Self {
        Self::from(Response {
            opcode: packet.opcode,
            status: packet.status,
            data: packet.data.clone(),
        })
    }
}

impl From<Response> for Outcome {
    fn from(response: Response) -> Self {
        match response.status {
            Status::Unreachable => Outcome::RoutingFailed,
            _ => Outcome::Completed(response),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IssueError {
    #[error("no free {0} transaction ids")]
    WindowFull(ProtocolKind),
    #[error("no {0} credits available")]
    Backpressure(ProtocolKind),
    #[error("{0} is not a request opcode")]
    NotARequest(Opcode),
    #[error("{opcode} issued on the {kind} state machine")]
    WrongKind { opcode: Opcode, kind: ProtocolKind },
    #[error("endpoint is no longer running")]
    Disconnected,
    #[error(transparent)]
    Wire(#[from] WireError),
}

/// Caller's side of an issued transaction.
///
/// Resolves once. If the owning endpoint goes away first the outcome is
/// `RoutingFailed`.
#[derive(Debug)]
pub struct TransactionHandle {
    id: TxnId,
    kind: ProtocolKind,
    rx: oneshot::Receiver<Outcome>,
    outcome: Option<Outcome>,
}

impl TransactionHandle {
    pub(crate) fn new(id: TxnId, kind: ProtocolKind, rx: oneshot::Receiver<Outcome>) -> Self {
        Self {
            id,
            kind,
            rx,
            outcome: None,
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn kind(&self) -> ProtocolKind {
        self.kind
    }

    /// Non-blocking check.
    pub fn try_outcome(&mut self) -> Option<Outcome> {
        if self.outcome.is_none() {
            self.outcome = match self.rx.try_recv() {
                Ok(outcome) => Some(outcome),
                Err(TryRecvError::Empty) => None,
                Err(TryRecvError::Closed) => Some(Outcome::RoutingFailed),
            };
        }
        self.outcome.clone()
    }

    pub async fn outcome(mut self) -> Outcome {
        match self.outcome.take() {
            Some(outcome) => outcome,
            None => self.rx.await.unwrap_or(Outcome::RoutingFailed),
        }
    }
}

/// How an inbound response was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseDisposition {
    /// This many transactions finished (more than one when held io
    /// responses were released behind it).
    Completed(usize),
    /// Stored until earlier io transactions to the same address finish.
    Held,
    /// Late response to a timed-out id. Discarded; the id is free again.
    Late,
    /// No matching transaction, or the opcode does not answer it.
    Stray(&'static str),
}

// ── State machine ────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum StateMachine {
    Io(IoMachine),
    Cache(CacheMachine),
    Mem(MemMachine),
}

impl StateMachine {
    pub fn new(kind: ProtocolKind, settings: &TransactionSettings) -> Self {
        let table = TransactionTable::new(
            kind,
            settings.window,
            Duration::from_millis(settings.timeout_ms),
            Duration::from_millis(settings.quarantine_ms()),
        );
        match kind {
            ProtocolKind::Io => StateMachine::Io(IoMachine::new(table)),
            ProtocolKind::Cache => StateMachine::Cache(CacheMachine::new(table)),
            ProtocolKind::Mem => StateMachine::Mem(MemMachine::new(table)),
        }
    }

    pub fn kind(&self) -> ProtocolKind {
        self.table().kind()
    }

    pub fn table(&self) -> &TransactionTable {
        match self {
            StateMachine::Io(m) => &m.table,
            StateMachine::Cache(m) => &m.table,
            StateMachine::Mem(m) => &m.table,
        }
    }

    fn table_mut(&mut self) -> &mut TransactionTable {
        match self {
            StateMachine::Io(m) => &mut m.table,
            StateMachine::Cache(m) => &mut m.table,
            StateMachine::Mem(m) => &mut m.table,
        }
    }

    /// `Idle -> PendingSend`.
    pub fn issue(
        &mut self,
        opcode: Opcode,
        address: u64,
        data: Bytes,
        now: Instant,
    ) -> Result<TransactionHandle, IssueError> {
        if opcode.kind() != self.kind() {
            return Err(IssueError::WrongKind {
                opcode,
                kind: self.kind(),
            });
        }
        if !opcode.is_request() {
            return Err(IssueError::NotARequest(opcode));
        }
        self.table_mut().open(opcode, address, data, now)
    }

    /// `PendingSend` transactions allowed to go out now, in issue order.
    pub fn sendable(&self) -> Vec<TxnId> {
        match self {
            StateMachine::Io(m) => m.sendable(),
            StateMachine::Cache(m) => m.sendable(),
            StateMachine::Mem(m) => m.sendable(),
        }
    }

    /// Wire packet for an open transaction.
    pub fn request_packet(&self, id: TxnId, vh: VhId, requester: DeviceId) -> Option<Packet> {
        self.table().get(id).map(|txn| {
            Packet::request(txn.opcode, vh, id, requester, txn.address, txn.data.clone())
        })
    }

    /// `PendingSend -> AwaitingResponse`, once the link accepted the packet.
    pub fn mark_sent(&mut self, id: TxnId) {
        self.table_mut().mark_sent(id);
    }

    pub fn on_response(&mut self, packet: &Packet) -> ResponseDisposition {
        match self {
            StateMachine::Io(m) => m.on_response(packet),
            StateMachine::Cache(m) => m.on_response(packet),
            StateMachine::Mem(m) => m.on_response(packet),
        }
    }

    pub fn expire(&mut self, now: Instant) -> Vec<Expired> {
        match self {
            StateMachine::Io(m) => m.expire(now),
            StateMachine::Cache(m) => m.table.expire(now),
            StateMachine::Mem(m) => m.table.expire(now),
        }
    }

    pub fn state(&self, id: TxnId) -> Option<TxnState> {
        self.table().get(id).map(|t| t.state)
    }

    pub fn open_count(&self) -> usize {
        self.table().len()
    }

    /// Transactions not yet handed to the link.
    pub fn pending_count(&self) -> usize {
        self.table()
            .iter()
            .filter(|t| t.state == TxnState::PendingSend)
            .count()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.table().next_deadline()
    }
}

// ── Shared helpers ───────────────────────────────────────────────────────────

/// Look up the transaction a response answers and check that it is waiting
/// and that `expects` accepts the opcode pair. Late responses to quarantined
/// ids free the id.
fn match_response(
    table: &mut TransactionTable,
    packet: &Packet,
    expects: fn(Opcode, Opcode) -> bool,
) -> Result<TxnId, ResponseDisposition> {
    let Some(txn) = table.get(packet.tag) else {
        return Err(if table.on_late_response(packet.tag) {
            ResponseDisposition::Late
        } else {
            ResponseDisposition::Stray("no open transaction")
        });
    };
    if txn.state != TxnState::AwaitingResponse || txn.held.is_some() {
        return Err(ResponseDisposition::Stray("transaction not awaiting a response"));
    }
    let accepted = if packet.status == Status::Ok {
        expects(txn.opcode, packet.opcode)
    } else {
        packet.opcode == txn.opcode.failure_response()
    };
    if !accepted {
        return Err(ResponseDisposition::Stray("opcode does not answer the request"));
    }
    Ok(txn.id)
}

/// Cache and mem completion: any order.
fn complete_unordered(
    table: &mut TransactionTable,
    packet: &Packet,
    expects: fn(Opcode, Opcode) -> bool,
) -> ResponseDisposition {
    match match_response(table, packet, expects) {
        Ok(id) => {
            table.finish(id, Outcome::from_response(packet));
            ResponseDisposition::Completed(1)
        }
        Err(disposition) => disposition,
    }
}

/// Cache and mem send gating: a snoop waits while any earlier non-snoop
/// transaction on its line is open.
fn sendable_line_ordered(table: &TransactionTable) -> Vec<TxnId> {
    table
        .iter()
        .filter(|txn| txn.state == TxnState::PendingSend)
        .filter(|txn| {
            !txn.opcode.is_snoop()
                || !table
                    .earlier(txn)
                    .any(|t| !t.opcode.is_snoop() && t.line() == txn.line())
        })
        .map(|txn| txn.id)
        .collect()
}
