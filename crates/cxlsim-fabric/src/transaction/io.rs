//! io state machine: per-address in-order completion.

use cxlsim_core::packet::IoOpcode;
use cxlsim_core::{Opcode, Packet};
use tokio::time::Instant;

use super::{
    match_response, Expired, Outcome, Response, ResponseDisposition, TransactionTable, TxnId,
    TxnState,
};

#[derive(Debug)]
pub struct IoMachine {
    pub(super) table: TransactionTable,
}

fn expects(request: Opcode, response: Opcode) -> bool {
    match (request, response) {
        (Opcode::Io(IoOpcode::MemRd | IoOpcode::CfgRd), Opcode::Io(IoOpcode::CplD)) => true,
        (Opcode::Io(IoOpcode::MemWr | IoOpcode::CfgWr), Opcode::Io(IoOpcode::Cpl)) => true,
        _ => false,
    }
}

impl IoMachine {
    pub fn new(table: TransactionTable) -> Self {
        Self { table }
    }

    /// Every pending io transaction, in issue order. The link keeps them in
    /// that order on the wire.
    pub fn sendable(&self) -> Vec<TxnId> {
        self.table
            .iter()
            .filter(|t| t.state == TxnState::PendingSend)
            .map(|t| t.id)
            .collect()
    }

    pub fn on_response(&mut self, packet: &Packet) -> ResponseDisposition {
        let id = match match_response(&mut self.table, packet, expects) {
            Ok(id) => id,
            Err(disposition) => return disposition,
        };

        let Some(txn) = self.table.get(id) else {
            return ResponseDisposition::Stray("no open transaction");
        };
        let address = txn.address;
        let blocked = self.table.earlier(txn).any(|t| t.address == address);
        let response = Response {
            opcode: packet.opcode,
            status: packet.status,
            data: packet.data.clone(),
        };

        if blocked {
            if let Some(txn) = self.table.get_mut(id) {
                tracing::debug!(id, address = format_args!("{address:#x}"), "io response held for ordering");
                txn.held = Some(response);
            }
            return ResponseDisposition::Held;
        }

        self.table.finish(id, Outcome::from(response));
        ResponseDisposition::Completed(1 + self.release_held(address))
    }

    pub fn expire(&mut self, now: Instant) -> Vec<Expired> {
        let expired = self.table.expire(now);
        let mut addresses: Vec<u64> = expired.iter().map(|e| e.address).collect();
        addresses.dedup();
        for address in addresses {
            self.release_held(address);
        }
        expired
    }

    /// Complete held responses at the head of `address`'s queue.
    fn release_held(&mut self, address: u64) -> usize {
        let mut released = 0;
        loop {
            let head = self
                .table
                .iter()
                .find(|t| t.address == address)
                .map(|t| t.id);
            let Some(id) = head else { break };
            let Some(response) = self.table.get_mut(id).and_then(|t| t.held.take()) else {
                break;
            };
            self.table.finish(id, Outcome::from(response));
            released += 1;
        }
        released
    }
}
