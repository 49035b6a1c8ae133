//! Open-transaction table shared by every state machine variant.
//!
//! Owns id allocation, the open window, deadlines, the timed-out id
//! quarantine, and the one-shot completion notification.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use bytes::Bytes;
use cxlsim_core::{Opcode, ProtocolKind};
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::{IssueError, Outcome, Response, TransactionHandle, TxnId, TxnState};

/// One open transaction.
#[derive(Debug)]
pub struct Transaction {
    pub id: TxnId,
    pub opcode: Opcode,
    pub address: u64,
    pub data: Bytes,
    pub state: TxnState,
    pub issued_at: Instant,
    pub deadline: Instant,
    /// Response that arrived but may not complete yet (io ordering).
    pub held: Option<Response>,
    order: u64,
    notify: Option<oneshot::Sender<Outcome>>,
}

impl Transaction {
    pub fn line(&self) -> u64 {
        cxlsim_core::packet::cache_line(self.address)
    }
}

/// A transaction removed by expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expired {
    pub id: TxnId,
    pub opcode: Opcode,
    pub address: u64,
    /// True if it had been sent and so holds an outbound credit.
    pub was_sent: bool,
}

#[derive(Debug)]
pub struct TransactionTable {
    kind: ProtocolKind,
    open: HashMap<TxnId, Transaction>,
    /// issue order -> id
    order: BTreeMap<u64, TxnId>,
    quarantine: HashMap<TxnId, Instant>,
    next_id: TxnId,
    next_order: u64,
    window: usize,
    timeout: Duration,
    quarantine_for: Duration,
}

impl TransactionTable {
    pub fn new(kind: ProtocolKind, window: usize, timeout: Duration, quarantine_for: Duration) -> Self {
        Self {
            kind,
            open: HashMap::new(),
            order: BTreeMap::new(),
            quarantine: HashMap::new(),
            next_id: 0,
            next_order: 0,
            window: window.clamp(1, TxnId::MAX as usize + 1),
            timeout,
            quarantine_for,
        }
    }

    pub fn kind(&self) -> ProtocolKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }

    pub fn quarantined(&self) -> usize {
        self.quarantine.len()
    }

    /// Open a new `PendingSend` transaction.
    pub fn open(
        &mut self,
        opcode: Opcode,
        address: u64,
        data: Bytes,
        now: Instant,
    ) -> Result<TransactionHandle, IssueError> {
        self.quarantine.retain(|_, until| *until > now);
        if self.open.len() + self.quarantine.len() >= self.window {
            return Err(IssueError::WindowFull(self.kind));
        }

        let id = self.allocate_id().ok_or(IssueError::WindowFull(self.kind))?;
        let (tx, rx) = oneshot::channel();
        let order = self.next_order;
        self.next_order += 1;

        self.open.insert(
            id,
            Transaction {
                id,
                opcode,
                address,
                data,
                state: TxnState::PendingSend,
                issued_at: now,
                deadline: now + self.timeout,
                held: None,
                order,
                notify: Some(tx),
            },
        );
        self.order.insert(order, id);
        tracing::debug!(kind = %self.kind, id, opcode = %opcode, address = format_args!("{address:#x}"), "transaction issued");

        Ok(TransactionHandle::new(id, self.kind, rx))
    }

    /// Round-robin id allocation skipping open and quarantined ids.
    fn allocate_id(&mut self) -> Option<TxnId> {
        for _ in 0..=TxnId::MAX as u32 {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if !self.open.contains_key(&id) && !self.quarantine.contains_key(&id) {
                return Some(id);
            }
        }
        None
    }

    pub fn get(&self, id: TxnId) -> Option<&Transaction> {
        self.open.get(&id)
    }

    pub fn get_mut(&mut self, id: TxnId) -> Option<&mut Transaction> {
        self.open.get_mut(&id)
    }

    /// Open transactions in issue order.
    pub fn iter(&self) -> impl Iterator<Item = &Transaction> + '_ {
        self.order.values().filter_map(|id| self.open.get(id))
    }

    /// Open transactions issued before `txn`.
    pub fn earlier<'a>(&'a self, txn: &'a Transaction) -> impl Iterator<Item = &'a Transaction> + 'a {
        self.order
            .range(..txn.order)
            .filter_map(|(_, id)| self.open.get(id))
    }

    /// `PendingSend -> AwaitingResponse`.
    pub fn mark_sent(&mut self, id: TxnId) {
        if let Some(txn) = self.open.get_mut(&id) {
            if txn.state == TxnState::PendingSend {
                txn.state = TxnState::AwaitingResponse;
                tracing::debug!(kind = %self.kind, id, "transaction sent");
            }
        }
    }

    /// Remove `id` and deliver its outcome. The handle is notified exactly
    /// once; a dropped handle is not an error.
    pub fn finish(&mut self, id: TxnId, outcome: Outcome) -> Option<Transaction> {
        let mut txn = self.open.remove(&id)?;
        self.order.remove(&txn.order);
        txn.state = match outcome {
            Outcome::TimedOut => TxnState::TimedOut,
            _ => TxnState::Completed,
        };
        tracing::debug!(kind = %self.kind, id, outcome = outcome.label(), "transaction finished");
        if let Some(notify) = txn.notify.take() {
            let _ = notify.send(outcome);
        }
        Some(txn)
    }

    /// Time out every transaction past its deadline, except those already
    /// holding a response. Ids the peer has seen go into quarantine.
    pub fn expire(&mut self, now: Instant) -> Vec<Expired> {
        let due: Vec<(TxnId, bool)> = self
            .iter()
            .filter(|t| t.held.is_none() && t.deadline <= now)
            .map(|t| (t.id, t.state == TxnState::AwaitingResponse))
            .collect();

        let mut expired = Vec::with_capacity(due.len());
        for (id, was_sent) in due {
            if let Some(txn) = self.finish(id, Outcome::TimedOut) {
                tracing::warn!(kind = %self.kind, id, opcode = %txn.opcode, was_sent, "transaction timed out");
                if was_sent {
                    self.quarantine.insert(id, now + self.quarantine_for);
                }
                expired.push(Expired {
                    id,
                    opcode: txn.opcode,
                    address: txn.address,
                    was_sent,
                });
            }
        }
        expired
    }

    /// A response for an id that is not open. Returns true if it was a late
    /// response to a quarantined id, which frees the id.
    pub fn on_late_response(&mut self, id: TxnId) -> bool {
        self.quarantine.remove(&id).is_some()
    }

    /// Earliest deadline among transactions that can still time out.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.open
            .values()
            .filter(|t| t.held.is_none())
            .map(|t| t.deadline)
            .min()
    }
}
