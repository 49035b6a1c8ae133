//! cache state machine: fetches, evictions, and snoops.
//!
//! Fetch responses carry the granted line state: `Go` with data for reads
//! and clean evictions, `GoWritePull` for dirty evictions. Snoops are
//! answered with one of the `Rsp*` opcodes.

use cxlsim_core::packet::CacheOpcode;
use cxlsim_core::{Opcode, Packet};

use super::{
    complete_unordered, sendable_line_ordered, ResponseDisposition, TransactionTable, TxnId,
};

#[derive(Debug)]
pub struct CacheMachine {
    pub(super) table: TransactionTable,
}

fn expects(request: Opcode, response: Opcode) -> bool {
    use CacheOpcode::*;
    let (Opcode::Cache(request), Opcode::Cache(response)) = (request, response) else {
        return false;
    };
    match request {
        RdCurr | RdOwn | RdShared | CleanEvict => response == Go,
        DirtyEvict => response == GoWritePull,
        SnpData | SnpInv | SnpCur => matches!(response, RspIHitI | RspSHitSE | RspIFwdM),
        _ => false,
    }
}

impl CacheMachine {
    pub fn new(table: TransactionTable) -> Self {
        Self { table }
    }

    pub fn sendable(&self) -> Vec<TxnId> {
        sendable_line_ordered(&self.table)
    }

    pub fn on_response(&mut self, packet: &Packet) -> ResponseDisposition {
        complete_unordered(&mut self.table, packet, expects)
    }
}
